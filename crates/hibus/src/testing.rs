//! In-process harness driving a [`Broker`] through its transport callbacks.

use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

use crate::broker::Broker;
use crate::config::BrokerConfig;
use crate::registry::Handle;
use crate::transport::{AcceptError, Outbox, ProtocolError, Transport, TransportHandler, UnixClient};
use crate::wire::{ClientPacket, EndpointName, Frame, ServerPacket};

/// Frames the broker queued for one fake connection.
pub(crate) struct PacketRx {
    rx: UnboundedReceiver<Frame>,
    closer: CancellationToken,
}

impl PacketRx {
    pub fn frame(&mut self) -> Frame {
        self.rx.try_recv().expect("no frame queued")
    }

    pub fn next(&mut self) -> ServerPacket {
        self.frame().packet().expect("frame is not a server packet")
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn closer(&self) -> CancellationToken {
        self.closer.clone()
    }
}

pub(crate) struct Harness {
    pub broker: Broker,
    next_handle: u32,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(BrokerConfig::new().with_max_clients(64))
    }

    pub fn with_config(config: BrokerConfig) -> Self {
        Self::with_broker(Broker::new(config))
    }

    pub fn with_broker(broker: Broker) -> Self {
        Self {
            broker,
            next_handle: 1,
        }
    }

    pub fn try_connect(&mut self) -> Result<(Handle, PacketRx), (AcceptError, PacketRx)> {
        let handle = Handle::new(self.next_handle);
        self.next_handle += 1;
        self.try_connect_at(handle)
    }

    fn try_connect_at(&mut self, handle: Handle) -> Result<(Handle, PacketRx), (AcceptError, PacketRx)> {
        let (outbox, rx) = Outbox::channel();
        let closer = outbox.closer().clone();
        let rx = PacketRx { rx, closer };
        match self
            .broker
            .on_accepted(handle, Transport::Unix(UnixClient::new(outbox, None, None)))
        {
            Ok(()) => Ok((handle, rx)),
            Err(e) => Err((e, rx)),
        }
    }

    /// Accepted but not yet authenticated; the `auth` packet is still queued.
    pub fn connect(&mut self) -> (Handle, PacketRx) {
        match self.try_connect() {
            Ok(connected) => connected,
            Err((e, _)) => panic!("connection refused: {e}"),
        }
    }

    /// Accepted and authenticated, with the handshake packets consumed.
    pub fn client(&mut self, app: &str, runner: &str) -> (Handle, PacketRx) {
        let connected = self.connect();
        self.authenticate(connected, app, runner)
    }

    pub fn client_at(&mut self, handle: Handle, app: &str, runner: &str) -> (Handle, PacketRx) {
        match self.try_connect_at(handle) {
            Ok(connected) => self.authenticate(connected, app, runner),
            Err((e, _)) => panic!("connection refused: {e}"),
        }
    }

    fn authenticate(&mut self, (handle, mut rx): (Handle, PacketRx), app: &str, runner: &str) -> (Handle, PacketRx) {
        let ServerPacket::Auth { challenge_code, .. } = rx.next() else {
            panic!("expected auth packet");
        };
        self.send(handle, &ClientPacket::auth(app, runner, challenge_code));
        assert!(matches!(rx.next(), ServerPacket::AuthPassed { .. }));
        (handle, rx)
    }

    pub fn try_send(&self, handle: Handle, packet: &ClientPacket) -> Result<(), ProtocolError> {
        let frame = Frame::from_packet(packet).expect("encode packet");
        self.broker.on_got_data(handle, frame)
    }

    pub fn send(&self, handle: Handle, packet: &ClientPacket) {
        if let Err(e) = self.try_send(handle, packet) {
            panic!("broker rejected packet: {e}");
        }
    }

    pub fn register_method(&self, handle: Handle, rx: &mut PacketRx, method: &str) {
        self.send(
            handle,
            &Self::call_builtin("reg", "registerMethod", serde_json::json!({ "methodName": method })),
        );
        assert!(matches!(rx.next(), ServerPacket::Result { .. }));
    }

    pub fn subscribe(&self, handle: Handle, rx: &mut PacketRx, bubble: &str) {
        self.send(
            handle,
            &Self::call_builtin("sub", "subscribeBubble", serde_json::json!({ "bubbleName": bubble })),
        );
        assert!(matches!(rx.next(), ServerPacket::Result { .. }));
    }

    /// Pending calls the endpoint at `handle` still has to answer.
    pub fn pending_on(&self, handle: Handle) -> usize {
        self.broker
            .endpoint(handle)
            .map_or(0, |e| e.pending_calls.len())
    }

    pub fn call(request_id: &str, to: &str, method: &str, parameter: Value) -> ClientPacket {
        ClientPacket::Call {
            request_id: request_id.to_string(),
            to_endpoint: to.to_string(),
            to_method: method.to_string(),
            timeout_ms: None,
            parameter,
        }
    }

    pub fn call_builtin(request_id: &str, method: &str, parameter: Value) -> ClientPacket {
        Self::call(
            request_id,
            &EndpointName::builtin().to_string(),
            method,
            parameter,
        )
    }

    pub fn event(event_id: &str, bubble: &str, data: Value) -> ClientPacket {
        ClientPacket::Event {
            event_id: event_id.to_string(),
            bubble_name: bubble.to_string(),
            bubble_data: data,
        }
    }
}
