//! The broker: connection lifecycle, authentication and routing.
//!
//! All mutable state lives in one [`EndpointRegistry`] behind a lock, so every
//! transport callback and every sweep is applied atomically with respect to
//! the others.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, TimeDelta, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::BrokerConfig;
use crate::handshake::{self, Authenticator, ChallengeEcho};
use crate::registry::{
    Endpoint, EndpointRegistry, EndpointSnapshot, EndpointStatus, Handle, RegistryError,
};
use crate::router::Router;
use crate::transport::{AcceptError, FailReason, ProtocolError, Transport, TransportHandler};
use crate::wire::{ClientPacket, EndpointName, Frame, Opcode, RetCode, ServerPacket};

/// What one sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub handshake_timeouts: usize,
    pub expired_calls: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.handshake_timeouts == 0 && self.expired_calls == 0
    }
}

pub struct Broker {
    config: BrokerConfig,
    registry: RwLock<EndpointRegistry>,
    router: Router,
    authenticator: Arc<dyn Authenticator>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_authenticator(config, Arc::new(ChallengeEcho))
    }

    pub fn with_authenticator(config: BrokerConfig, authenticator: Arc<dyn Authenticator>) -> Self {
        tracing::info!(
            host_name = %config.host_name,
            max_clients = config.max_clients,
            handshake_timeout = ?config.handshake_timeout,
            call_timeout = ?config.call_timeout,
            "Broker starting"
        );
        Self {
            registry: RwLock::new(EndpointRegistry::new(config.max_clients)),
            router: Router::new(config.clone()),
            config,
            authenticator,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    fn write_registry(&self) -> RwLockWriteGuard<'_, EndpointRegistry> {
        match self.registry.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Endpoint registry lock poisoned - continuing with inner state");
                poisoned.into_inner()
            }
        }
    }

    fn read_registry(&self) -> RwLockReadGuard<'_, EndpointRegistry> {
        match self.registry.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Endpoint registry lock poisoned - continuing with inner state");
                poisoned.into_inner()
            }
        }
    }

    /// Number of connected clients, authenticated or not.
    pub fn nr_endpoints(&self) -> usize {
        self.read_registry().len()
    }

    pub fn endpoint_handles(&self) -> Vec<Handle> {
        self.read_registry().client_handles()
    }

    pub fn status_of(&self, handle: Handle) -> Option<EndpointStatus> {
        self.read_registry().lookup_by_handle(handle).map(Endpoint::status)
    }

    pub fn endpoint(&self, handle: Handle) -> Option<EndpointSnapshot> {
        self.read_registry()
            .lookup_by_handle(handle)
            .map(Endpoint::snapshot)
    }

    pub fn handle_of(&self, name: &EndpointName) -> Option<Handle> {
        self.read_registry().handle_of(name)
    }

    pub fn endpoint_by_name(&self, name: &EndpointName) -> Option<EndpointSnapshot> {
        self.read_registry()
            .lookup_by_identity(name)
            .map(Endpoint::snapshot)
    }

    /// Authenticated endpoints in identity order.
    pub fn endpoints(&self) -> Vec<EndpointSnapshot> {
        self.read_registry().iter().map(Endpoint::snapshot).collect()
    }

    /// Drops connections whose handshake expired and fails calls past their deadline.
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut registry = self.write_registry();
        let mut report = SweepReport::default();

        for handle in registry.client_handles() {
            let Some(endpoint) = registry.lookup_by_handle_mut(handle) else {
                continue;
            };

            if endpoint.auth_expired(now) {
                tracing::warn!(%handle, "Handshake timed out");
                endpoint.send_packet(&ServerPacket::error(
                    RetCode::REQUEST_TIMEOUT,
                    "authentication timed out",
                ));
                self.evict_locked(&mut registry, handle, "handshake timeout");
                report.handshake_timeouts += 1;
                continue;
            }

            let expired = endpoint.expire_calls(now);
            if !expired.is_empty() {
                tracing::debug!(
                    callee = %endpoint.display_name(),
                    count = expired.len(),
                    "Pending calls expired"
                );
                report.expired_calls += expired.len();
                self.router
                    .fail_calls(&registry, expired, RetCode::CALLEE_TIMEOUT, "call timed out");
            }
        }
        report
    }

    /// Runs [`Broker::sweep`] every `sweep_interval` until `shutdown` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let broker = Arc::clone(self);
        let period = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = broker.sweep(Utc::now());
                        if !report.is_empty() {
                            tracing::debug!(?report, "Sweep finished");
                        }
                    }
                }
            }
            tracing::debug!("Sweeper stopped");
        })
    }

    /// Removes an endpoint and settles everything that referenced it.
    ///
    /// Idempotent: a second call for the same handle finds nothing.
    fn evict_locked(&self, registry: &mut EndpointRegistry, handle: Handle, reason: &str) {
        let Some(mut endpoint) = registry.evict(handle) else {
            return;
        };
        endpoint.transition(EndpointStatus::Closing);

        let orphans = endpoint.drain_calls();
        if !orphans.is_empty() {
            self.router
                .fail_calls(registry, orphans, RetCode::BAD_CALLEE, "callee disconnected");
        }

        endpoint.close();
        tracing::info!(
            %handle,
            session = %endpoint.session(),
            endpoint = %endpoint.display_name(),
            reason,
            nr_endpoints = registry.len(),
            "Endpoint evicted"
        );
    }

    fn handshake_deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + TimeDelta::milliseconds(self.config.handshake_timeout.as_millis() as i64)
    }
}

impl TransportHandler for Broker {
    fn on_accepted(&self, handle: Handle, transport: Transport) -> Result<(), AcceptError> {
        let now = Utc::now();
        let kind = transport.kind();
        let mut endpoint = Endpoint::new(transport, now);
        let challenge = handshake::generate_challenge();
        endpoint.begin_auth(challenge.clone(), self.handshake_deadline(now));

        let mut registry = self.write_registry();
        if let Err(e) = registry.can_admit(handle) {
            tracing::warn!(%handle, error = %e, "Refusing connection");
            endpoint.send_packet(&ServerPacket::error(RetCode::SERVICE_UNAVAILABLE, e.to_string()));
            return Err(e.into());
        }
        let session = registry.admit(handle, endpoint)?;

        if let Some(endpoint) = registry.lookup_by_handle(handle) {
            endpoint.send_packet(&ServerPacket::auth(challenge));
        }
        tracing::info!(%handle, %session, ?kind, "Endpoint accepted; challenge issued");
        Ok(())
    }

    fn on_got_data(&self, handle: Handle, frame: Frame) -> Result<(), ProtocolError> {
        let now = Utc::now();
        let mut registry = self.write_registry();
        let Some(endpoint) = registry.lookup_by_handle(handle) else {
            return Err(RegistryError::UnknownHandle(handle).into());
        };

        match frame.opcode() {
            Opcode::Text => {}
            Opcode::Ping => {
                endpoint.send(Frame::pong(frame.into_payload()));
                return Ok(());
            }
            Opcode::Pong | Opcode::Close => return Ok(()),
            Opcode::Bin => {
                endpoint.send_packet(&ServerPacket::error(
                    RetCode::NOT_ACCEPTABLE,
                    "binary frames are not supported",
                ));
                return Err(ProtocolError::UnsupportedOpcode(Opcode::Bin));
            }
        }

        let packet: ClientPacket = match frame.packet() {
            Ok(packet) => packet,
            Err(e) => {
                endpoint.send_packet(&ServerPacket::error(RetCode::BAD_REQUEST, e.to_string()));
                return Err(e.into());
            }
        };
        tracing::trace!(%handle, kind = packet.kind(), "Packet received");

        match endpoint.status() {
            EndpointStatus::Authing => {
                let name = handshake::accept_answer(
                    &mut registry,
                    self.authenticator.as_ref(),
                    handle,
                    packet,
                    &self.config.host_name,
                )?;
                tracing::info!(%handle, endpoint = %name, "Endpoint authenticated");
                Ok(())
            }
            EndpointStatus::Closing => {
                endpoint.send_packet(&ServerPacket::error(RetCode::UNAUTHORIZED, "endpoint is closing"));
                Err(ProtocolError::Closing)
            }
            EndpointStatus::Idle | EndpointStatus::Busy => {
                self.router.dispatch(&mut registry, handle, packet, now);
                Ok(())
            }
        }
    }

    fn on_closed(&self, handle: Handle) {
        let mut registry = self.write_registry();
        self.evict_locked(&mut registry, handle, "connection closed");
    }

    fn on_failed(&self, handle: Handle, reason: &FailReason) {
        tracing::warn!(%handle, %reason, "Connection failed");
        let mut registry = self.write_registry();
        self.evict_locked(&mut registry, handle, "connection failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use serde_json::{Value, json};

    #[test]
    fn accept_sends_auth_with_challenge() {
        let mut bus = Harness::new();
        let (handle, mut rx) = bus.connect();

        match rx.next() {
            ServerPacket::Auth {
                protocol_name,
                protocol_version,
                challenge_code,
            } => {
                assert_eq!(protocol_name, "HIBUS");
                assert_eq!(protocol_version, 90);
                assert_eq!(challenge_code.len(), 32);
            }
            other => panic!("unexpected packet: {other:?}"),
        }
        assert_eq!(bus.broker.status_of(handle), Some(EndpointStatus::Authing));
    }

    #[test]
    fn full_registry_refuses_connections() {
        let mut bus = Harness::with_config(BrokerConfig::new().with_max_clients(1));
        let (_first, _rx) = bus.connect();
        let err = bus.try_connect();
        assert!(matches!(
            err,
            Err((AcceptError::Registry(RegistryError::RegistryFull { .. }), _))
        ));
        if let Err((_, mut rx)) = err {
            assert!(matches!(
                rx.next(),
                ServerPacket::Error { ret_code: RetCode::SERVICE_UNAVAILABLE, .. }
            ));
        }
    }

    #[test]
    fn packets_before_auth_are_refused_and_fatal() {
        let mut bus = Harness::new();
        let (handle, mut rx) = bus.connect();
        rx.next();

        let err = bus
            .try_send(handle, &Harness::event("e", "TICK", Value::Null))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Unauthenticated));
        assert!(matches!(
            rx.next(),
            ServerPacket::Error { ret_code: RetCode::UNAUTHORIZED, .. }
        ));
    }

    #[test]
    fn ping_is_answered_with_pong() {
        let mut bus = Harness::new();
        let (handle, mut rx) = bus.client("cn.example.a", "main");

        bus.broker
            .on_got_data(handle, Frame::ping(&b"ka"[..]))
            .unwrap();

        let frame = rx.frame();
        assert_eq!(frame, Frame::pong(&b"ka"[..]));
    }

    #[test]
    fn binary_frames_are_fatal() {
        let mut bus = Harness::new();
        let (handle, _rx) = bus.client("cn.example.a", "main");

        let err = bus
            .broker
            .on_got_data(handle, Frame::new(Opcode::Bin, &b"\x00"[..]))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedOpcode(Opcode::Bin)));
    }

    #[test]
    fn invalid_json_is_fatal() {
        let mut bus = Harness::new();
        let (handle, mut rx) = bus.client("cn.example.a", "main");

        let err = bus
            .broker
            .on_got_data(handle, Frame::text("{not json"))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Packet(_)));
        assert!(matches!(
            rx.next(),
            ServerPacket::Error { ret_code: RetCode::BAD_REQUEST, .. }
        ));
    }

    #[test]
    fn handshake_timeout_evicts_silent_connections() {
        let mut bus = Harness::new();
        let (handle, mut rx) = bus.connect();
        let closer = rx.closer();
        rx.next();

        let report = bus.broker.sweep(Utc::now() + TimeDelta::seconds(11));

        assert_eq!(report.handshake_timeouts, 1);
        assert_eq!(bus.broker.status_of(handle), None);
        assert!(matches!(
            rx.next(),
            ServerPacket::Error { ret_code: RetCode::REQUEST_TIMEOUT, .. }
        ));
        assert!(closer.is_cancelled());
    }

    #[test]
    fn sweep_before_deadline_keeps_connection() {
        let mut bus = Harness::new();
        let (handle, _rx) = bus.connect();

        let report = bus.broker.sweep(Utc::now());

        assert!(report.is_empty());
        assert_eq!(bus.broker.status_of(handle), Some(EndpointStatus::Authing));
    }

    #[test]
    fn expired_call_fails_with_callee_timeout() {
        let mut bus = Harness::new();
        let (callee, mut callee_rx) = bus.client("cn.example.callee", "main");
        let (caller, mut caller_rx) = bus.client("cn.example.caller", "main");
        bus.register_method(callee, &mut callee_rx, "slow");

        bus.send(caller, &Harness::call("r1", "@localhost/cn.example.callee/main", "slow", json!(null)));
        let ServerPacket::Call { call_id, .. } = callee_rx.next() else {
            panic!("expected call");
        };

        let report = bus.broker.sweep(Utc::now() + TimeDelta::seconds(31));
        assert_eq!(report.expired_calls, 1);
        assert!(matches!(
            caller_rx.next(),
            ServerPacket::Error { ret_code: RetCode::CALLEE_TIMEOUT, request_id: Some(r), .. } if r == "r1"
        ));
        assert_eq!(bus.broker.status_of(callee), Some(EndpointStatus::Idle));

        // The late result is dropped.
        bus.send(
            callee,
            &ClientPacket::Result {
                call_id,
                ret_code: RetCode::OK,
                ret_msg: String::new(),
                ret_value: Value::Null,
            },
        );
        assert!(caller_rx.is_empty());
    }

    #[test]
    fn evicting_a_callee_fails_its_callers() {
        let mut bus = Harness::new();
        let (callee, mut callee_rx) = bus.client("cn.example.callee", "main");
        let (caller, mut caller_rx) = bus.client("cn.example.caller", "main");
        bus.register_method(callee, &mut callee_rx, "work");
        bus.send(caller, &Harness::call("r1", "@localhost/cn.example.callee/main", "work", json!(null)));

        bus.broker.on_closed(callee);

        assert!(matches!(
            caller_rx.next(),
            ServerPacket::Error { ret_code: RetCode::BAD_CALLEE, .. }
        ));
        let name = EndpointName::new("localhost", "cn.example.callee", "main").unwrap();
        assert!(bus.broker.endpoint_by_name(&name).is_none());
    }

    #[test]
    fn result_for_departed_caller_is_discarded() {
        let mut bus = Harness::new();
        let (callee, mut callee_rx) = bus.client("cn.example.callee", "main");
        let (caller, _caller_rx) = bus.client("cn.example.caller", "main");
        bus.register_method(callee, &mut callee_rx, "work");
        bus.send(caller, &Harness::call("r1", "@localhost/cn.example.callee/main", "work", json!(null)));
        let ServerPacket::Call { call_id, .. } = callee_rx.next() else {
            panic!("expected call");
        };

        bus.broker.on_closed(caller);
        // A new endpoint reuses the caller's handle.
        let (reused, mut reused_rx) = bus.client_at(caller, "cn.example.newcomer", "main");
        assert_eq!(reused, caller);

        bus.send(
            callee,
            &ClientPacket::Result {
                call_id,
                ret_code: RetCode::OK,
                ret_msg: String::new(),
                ret_value: json!("done"),
            },
        );
        assert!(reused_rx.is_empty());
        assert_eq!(bus.pending_on(callee), 0);
    }

    #[test]
    fn eviction_is_idempotent() {
        let mut bus = Harness::new();
        let (handle, _rx) = bus.client("cn.example.a", "main");

        bus.broker.on_closed(handle);
        bus.broker.on_failed(handle, &FailReason::Protocol(ProtocolError::Closing));

        assert_eq!(bus.broker.nr_endpoints(), 0);
    }

    #[test]
    fn identity_is_free_again_after_eviction() {
        let mut bus = Harness::new();
        let (first, _rx) = bus.client("cn.example.a", "main");
        bus.broker.on_closed(first);

        let (_second, _rx2) = bus.client("cn.example.a", "main");
        assert_eq!(bus.broker.endpoints().len(), 2);
    }

    #[test]
    fn rejecting_authenticator_refuses_clients() {
        struct Never;
        impl Authenticator for Never {
            fn prove(&self, challenge: &str, _: &str, _: &str) -> String {
                challenge.to_string()
            }
            fn verify(&self, _: &str, _: &str, _: &str, _: &str) -> bool {
                false
            }
        }

        let mut bus = Harness::with_broker(Broker::with_authenticator(BrokerConfig::new(), Arc::new(Never)));
        let (handle, mut rx) = bus.connect();
        let ServerPacket::Auth { challenge_code, .. } = rx.next() else {
            panic!("expected auth");
        };

        let err = bus
            .try_send(handle, &ClientPacket::auth("cn.example.a", "main", challenge_code))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::AuthFailed(_)));
        assert!(matches!(
            rx.next(),
            ServerPacket::Error { ret_code: RetCode::UNAUTHORIZED, .. }
        ));
    }
}
