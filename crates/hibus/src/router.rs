//! Routing of calls, results and events between authenticated endpoints.
//!
//! Routing failures are answered with an `error` packet to the sender and
//! never end the sender's connection.

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::{Value, json};

use crate::config::BrokerConfig;
use crate::registry::{
    BuiltinMethod, EndpointRegistry, Handle, MethodHandler, PendingCall,
};
use crate::wire::name::validate_token;
use crate::wire::{CallId, ClientPacket, EndpointName, Frame, RetCode, ServerPacket};

/// Failure of a builtin method.
#[derive(Debug)]
struct Refusal {
    code: RetCode,
    message: String,
}

impl Refusal {
    fn new(code: RetCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Router {
    config: BrokerConfig,
    builtin: EndpointName,
}

impl Router {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            builtin: EndpointName::builtin(),
        }
    }

    /// Encodes `packet` for delivery, refusing anything the recipient's codec
    /// would reject.
    fn encode(&self, packet: &ServerPacket) -> Result<Frame, Refusal> {
        let frame = Frame::from_packet(packet)
            .map_err(|e| Refusal::new(RetCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
        if frame.payload_len() > self.config.max_frame_size {
            return Err(Refusal::new(
                RetCode::PACKET_TOO_LARGE,
                format!(
                    "{} packet of {} bytes exceeds limit of {} bytes",
                    packet.kind(),
                    frame.payload_len(),
                    self.config.max_frame_size
                ),
            ));
        }
        Ok(frame)
    }

    /// Routes one packet from an authenticated endpoint.
    pub fn dispatch(&self, registry: &mut EndpointRegistry, from: Handle, packet: ClientPacket, now: DateTime<Utc>) {
        let Some(sender) = registry.lookup_by_handle(from) else {
            return;
        };
        if !sender.is_routable() {
            sender.send_packet(&ServerPacket::error(
                RetCode::UNAUTHORIZED,
                "endpoint is not authenticated",
            ));
            return;
        }

        match packet {
            ClientPacket::Auth { .. } => {
                sender.send_packet(&ServerPacket::error(
                    RetCode::BAD_REQUEST,
                    "endpoint is already authenticated",
                ));
            }
            ClientPacket::Call {
                request_id,
                to_endpoint,
                to_method,
                timeout_ms,
                parameter,
            } => self.route_call(
                registry,
                from,
                CallRequest {
                    request_id,
                    to_endpoint,
                    to_method,
                    timeout_ms,
                    parameter,
                },
                now,
            ),
            ClientPacket::Result {
                call_id,
                ret_code,
                ret_msg,
                ret_value,
            } => self.route_result(registry, from, call_id, ret_code, ret_msg, ret_value, now),
            ClientPacket::Event {
                event_id,
                bubble_name,
                bubble_data,
            } => self.publish(registry, from, event_id, bubble_name, bubble_data),
        }
    }

    fn route_call(&self, registry: &mut EndpointRegistry, from: Handle, call: CallRequest, now: DateTime<Utc>) {
        let Some((caller_name, caller_session)) = registry
            .lookup_by_handle(from)
            .and_then(|e| Some((e.name()?.clone(), e.session())))
        else {
            return;
        };

        let target: EndpointName = match call.to_endpoint.parse() {
            Ok(target) => target,
            Err(e) => {
                reply_error(registry, from, RetCode::BAD_REQUEST, e.to_string(), &call.request_id);
                return;
            }
        };

        if target == self.builtin {
            self.call_builtin(registry, from, call, now);
            return;
        }

        let Some(callee_handle) = registry.handle_of(&target) else {
            reply_error(
                registry,
                from,
                RetCode::NOT_FOUND,
                format!("endpoint {target} not found"),
                &call.request_id,
            );
            return;
        };
        let routable_method = registry
            .lookup_by_handle(callee_handle)
            .map(|callee| (callee.is_routable(), callee.has_method(&call.to_method)));
        match routable_method {
            Some((true, true)) => {}
            Some((true, false)) => {
                reply_error(
                    registry,
                    from,
                    RetCode::NOT_FOUND,
                    format!("method {} not found on {target}", call.to_method),
                    &call.request_id,
                );
                return;
            }
            _ => {
                reply_error(
                    registry,
                    from,
                    RetCode::NOT_FOUND,
                    format!("endpoint {target} is closing"),
                    &call.request_id,
                );
                return;
            }
        }

        let timeout = self.config.effective_call_timeout(call.timeout_ms);
        let call_id = CallId::new();
        let pending = PendingCall {
            call_id,
            request_id: call.request_id.clone(),
            caller: from,
            caller_session,
            caller_name: caller_name.clone(),
            method: call.to_method.clone(),
            issued_at: now,
            deadline: now + TimeDelta::milliseconds(timeout.as_millis() as i64),
        };
        let packet = ServerPacket::Call {
            call_id,
            from_endpoint: caller_name.to_string(),
            to_method: call.to_method.clone(),
            timeout_ms: timeout.as_millis() as u64,
            parameter: call.parameter,
        };
        let frame = match self.encode(&packet) {
            Ok(frame) => frame,
            Err(refusal) => {
                reply_error(registry, from, refusal.code, refusal.message, &call.request_id);
                return;
            }
        };

        let Some(callee) = registry.lookup_by_handle_mut(callee_handle) else {
            return;
        };
        callee.track_call(pending);
        if !callee.send(frame) {
            callee.resolve_call(call_id);
            reply_error(
                registry,
                from,
                RetCode::BAD_CALLEE,
                format!("endpoint {target} is unreachable"),
                &call.request_id,
            );
            return;
        }

        tracing::debug!(
            %call_id,
            caller = %caller_name,
            callee = %target,
            method = %call.to_method,
            timeout = ?timeout,
            "Call forwarded"
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn route_result(
        &self,
        registry: &mut EndpointRegistry,
        from: Handle,
        call_id: CallId,
        ret_code: RetCode,
        ret_msg: String,
        ret_value: Value,
        now: DateTime<Utc>,
    ) {
        let Some(callee) = registry.lookup_by_handle_mut(from) else {
            return;
        };
        let callee_name = callee.display_name();
        let Some(call) = callee.resolve_call(call_id) else {
            tracing::warn!(%call_id, callee = %callee_name, "Discarding result for unknown or expired call");
            return;
        };

        let packet = ServerPacket::Result {
            request_id: call.request_id.clone(),
            call_id: Some(call_id),
            from_endpoint: callee_name,
            from_method: call.method.clone(),
            ret_code,
            ret_msg: if ret_msg.is_empty() {
                ret_code.message().to_string()
            } else {
                ret_msg
            },
            time_consumed: call.elapsed_secs(now),
            ret_value,
        };
        let frame = match self.encode(&packet) {
            Ok(frame) => frame,
            Err(refusal) => {
                reply_error(registry, from, refusal.code, refusal.message.clone(), &call_id.to_string());
                self.fail_calls(registry, vec![call], refusal.code, &refusal.message);
                return;
            }
        };
        if deliver_to_caller(registry, &call, frame, packet.kind()) {
            tracing::debug!(%call_id, caller = %call.caller_name, %ret_code, "Result delivered");
        }
    }

    /// Answers every call in `calls` with an error packet to its caller.
    pub fn fail_calls(&self, registry: &EndpointRegistry, calls: Vec<PendingCall>, code: RetCode, reason: &str) {
        for call in calls {
            tracing::debug!(call_id = %call.call_id, caller = %call.caller_name, %code, reason, "Failing pending call");
            let packet = ServerPacket::Error {
                ret_code: code,
                ret_msg: reason.to_string(),
                request_id: Some(call.request_id.clone()),
                extra_info: Some(format!("method {}", call.method)),
            };
            match Frame::from_packet(&packet) {
                Ok(frame) => {
                    deliver_to_caller(registry, &call, frame, packet.kind());
                }
                Err(e) => tracing::error!(call_id = %call.call_id, error = %e, "Failed to encode error packet"),
            }
        }
    }

    fn publish(&self, registry: &mut EndpointRegistry, from: Handle, event_id: String, bubble_name: String, bubble_data: Value) {
        let Some(from_endpoint) = registry
            .lookup_by_handle(from)
            .and_then(|e| e.name())
            .map(ToString::to_string)
        else {
            return;
        };

        if let Err(e) = validate_token("bubble", &bubble_name) {
            reply_error(registry, from, RetCode::BAD_REQUEST, e.to_string(), &event_id);
            return;
        }

        let subscribers = registry.handles_subscribed_to(&bubble_name);
        if subscribers.is_empty() {
            reply_error(
                registry,
                from,
                RetCode::NOT_FOUND,
                format!("no subscribers for bubble {bubble_name}"),
                &event_id,
            );
            return;
        }

        let packet = ServerPacket::Event {
            event_id: event_id.clone(),
            from_endpoint: from_endpoint.clone(),
            bubble_name: bubble_name.clone(),
            bubble_data,
        };
        let frame = match self.encode(&packet) {
            Ok(frame) => frame,
            Err(refusal) => {
                reply_error(registry, from, refusal.code, refusal.message, &event_id);
                return;
            }
        };
        let nr_subscribers = subscribers
            .into_iter()
            .filter(|&handle| {
                registry
                    .lookup_by_handle(handle)
                    .is_some_and(|subscriber| subscriber.send(frame.clone()))
            })
            .count();

        tracing::debug!(%event_id, from = %from_endpoint, bubble = %bubble_name, nr_subscribers, "Event published");
        if let Some(sender) = registry.lookup_by_handle(from) {
            sender.send_packet(&ServerPacket::EventSent {
                event_id,
                nr_subscribers,
            });
        }
    }

    fn call_builtin(&self, registry: &mut EndpointRegistry, from: Handle, call: CallRequest, now: DateTime<Utc>) {
        let handler = registry
            .lookup_by_handle(Handle::BUILTIN)
            .and_then(|builtin| builtin.methods().get(&call.to_method).copied());
        let Some(MethodHandler::Builtin(method)) = handler else {
            reply_error(
                registry,
                from,
                RetCode::NOT_FOUND,
                format!("method {} not found on {}", call.to_method, self.builtin),
                &call.request_id,
            );
            return;
        };

        match run_builtin(registry, from, method, call.parameter, now) {
            Ok(ret_value) => {
                let packet = ServerPacket::Result {
                    request_id: call.request_id.clone(),
                    call_id: None,
                    from_endpoint: self.builtin.to_string(),
                    from_method: method.name().to_string(),
                    ret_code: RetCode::OK,
                    ret_msg: RetCode::OK.message().to_string(),
                    time_consumed: 0.0,
                    ret_value,
                };
                match self.encode(&packet) {
                    Ok(frame) => {
                        if let Some(sender) = registry.lookup_by_handle(from) {
                            sender.send(frame);
                        }
                    }
                    Err(refusal) => {
                        reply_error(registry, from, refusal.code, refusal.message, &call.request_id);
                    }
                }
            }
            Err(refusal) => {
                reply_error(registry, from, refusal.code, refusal.message, &call.request_id);
            }
        }
    }
}

#[derive(Debug)]
struct CallRequest {
    request_id: String,
    to_endpoint: String,
    to_method: String,
    timeout_ms: Option<u64>,
    parameter: Value,
}

fn run_builtin(
    registry: &mut EndpointRegistry,
    from: Handle,
    method: BuiltinMethod,
    parameter: Value,
    now: DateTime<Utc>,
) -> Result<Value, Refusal> {
    if method == BuiltinMethod::Echo {
        return Ok(parameter);
    }
    if method == BuiltinMethod::ListEndpoints {
        let snapshots: Vec<_> = registry.iter().map(|e| e.snapshot()).collect();
        return serde_json::to_value(snapshots)
            .map_err(|e| Refusal::new(RetCode::INTERNAL_SERVER_ERROR, e.to_string()));
    }

    let (field, kind) = match method {
        BuiltinMethod::RegisterMethod | BuiltinMethod::RevokeMethod => ("methodName", "method"),
        _ => ("bubbleName", "bubble"),
    };
    let name = parameter
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| Refusal::new(RetCode::BAD_REQUEST, format!("missing `{field}` parameter")))?
        .to_string();
    validate_token(kind, &name).map_err(|e| Refusal::new(RetCode::BAD_REQUEST, e.to_string()))?;

    let endpoint = registry
        .lookup_by_handle_mut(from)
        .ok_or_else(|| Refusal::new(RetCode::INTERNAL_SERVER_ERROR, "caller vanished"))?;
    let endpoint_name = endpoint.display_name();

    match method {
        BuiltinMethod::RegisterMethod => {
            if !endpoint.register_method(name.clone(), MethodHandler::Forward) {
                tracing::debug!(endpoint = %endpoint_name, method = %name, "Method re-registered");
            }
            tracing::info!(endpoint = %endpoint_name, method = %name, "Method registered");
        }
        BuiltinMethod::RevokeMethod => {
            if !endpoint.unregister_method(&name) {
                return Err(Refusal::new(RetCode::NOT_FOUND, format!("method {name} is not registered")));
            }
            tracing::info!(endpoint = %endpoint_name, method = %name, "Method revoked");
        }
        BuiltinMethod::SubscribeBubble => {
            endpoint.register_bubble(name.clone(), now);
            tracing::info!(endpoint = %endpoint_name, bubble = %name, "Bubble subscribed");
        }
        BuiltinMethod::UnsubscribeBubble => {
            if !endpoint.unregister_bubble(&name) {
                return Err(Refusal::new(RetCode::NOT_FOUND, format!("not subscribed to bubble {name}")));
            }
            tracing::info!(endpoint = %endpoint_name, bubble = %name, "Bubble unsubscribed");
        }
        BuiltinMethod::Echo | BuiltinMethod::ListEndpoints => {}
    }
    Ok(json!({ field: name }))
}

fn reply_error(registry: &EndpointRegistry, to: Handle, code: RetCode, message: String, request_id: &str) {
    tracing::debug!(handle = %to, %code, request_id, message = %message, "Routing error");
    if let Some(endpoint) = registry.lookup_by_handle(to) {
        endpoint.send_packet(&ServerPacket::error_for(code, message, request_id));
    }
}

/// Sends `frame` to the caller of `call` if it is still the same endpoint.
fn deliver_to_caller(registry: &EndpointRegistry, call: &PendingCall, frame: Frame, kind: &str) -> bool {
    match registry.lookup_by_handle(call.caller) {
        Some(caller) if caller.session() == call.caller_session && caller.is_routable() => {
            caller.send(frame)
        }
        _ => {
            tracing::warn!(
                call_id = %call.call_id,
                caller = %call.caller_name,
                kind,
                "Caller is gone; discarding"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::EndpointStatus;
    use crate::testing::Harness;

    #[test]
    fn echo_on_builtin_returns_parameter() {
        let mut bus = Harness::new();
        let (a, mut a_rx) = bus.client("cn.example.a", "main");

        bus.send(a, &Harness::call_builtin("r1", "echo", json!({"x": 1})));

        match a_rx.next() {
            ServerPacket::Result {
                request_id,
                call_id,
                from_endpoint,
                ret_code,
                ret_value,
                ..
            } => {
                assert_eq!(request_id, "r1");
                assert_eq!(call_id, None);
                assert_eq!(from_endpoint, "@localhost/cn.fmsoft.hybridos.hibus/builtin");
                assert_eq!(ret_code, RetCode::OK);
                assert_eq!(ret_value, json!({"x": 1}));
            }
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[test]
    fn unknown_builtin_method_is_not_found() {
        let mut bus = Harness::new();
        let (a, mut a_rx) = bus.client("cn.example.a", "main");

        bus.send(a, &Harness::call_builtin("r1", "reboot", Value::Null));

        assert!(matches!(
            a_rx.next(),
            ServerPacket::Error { ret_code: RetCode::NOT_FOUND, request_id: Some(r), .. } if r == "r1"
        ));
    }

    #[test]
    fn register_method_validates_name() {
        let mut bus = Harness::new();
        let (a, mut a_rx) = bus.client("cn.example.a", "main");

        bus.send(a, &Harness::call_builtin("r1", "registerMethod", json!({"methodName": "bad-name"})));
        assert!(matches!(a_rx.next(), ServerPacket::Error { ret_code: RetCode::BAD_REQUEST, .. }));

        bus.send(a, &Harness::call_builtin("r2", "registerMethod", json!({})));
        assert!(matches!(a_rx.next(), ServerPacket::Error { ret_code: RetCode::BAD_REQUEST, .. }));
    }

    #[test]
    fn call_is_forwarded_and_result_returned() {
        let mut bus = Harness::new();
        let (callee, mut callee_rx) = bus.client("cn.example.callee", "main");
        let (caller, mut caller_rx) = bus.client("cn.example.caller", "main");
        bus.register_method(callee, &mut callee_rx, "add");

        bus.send(caller, &Harness::call("req-7", "@localhost/cn.example.callee/main", "add", json!([1, 2])));

        let call_id = match callee_rx.next() {
            ServerPacket::Call {
                call_id,
                from_endpoint,
                to_method,
                parameter,
                timeout_ms,
            } => {
                assert_eq!(from_endpoint, "@localhost/cn.example.caller/main");
                assert_eq!(to_method, "add");
                assert_eq!(parameter, json!([1, 2]));
                assert_eq!(timeout_ms, 30_000);
                call_id
            }
            other => panic!("unexpected packet: {other:?}"),
        };
        assert_eq!(bus.pending_on(callee), 1);

        bus.send(
            callee,
            &ClientPacket::Result {
                call_id,
                ret_code: RetCode::OK,
                ret_msg: String::new(),
                ret_value: json!(3),
            },
        );

        match caller_rx.next() {
            ServerPacket::Result {
                request_id,
                from_endpoint,
                from_method,
                ret_msg,
                ret_value,
                ..
            } => {
                assert_eq!(request_id, "req-7");
                assert_eq!(from_endpoint, "@localhost/cn.example.callee/main");
                assert_eq!(from_method, "add");
                assert_eq!(ret_msg, "Ok");
                assert_eq!(ret_value, json!(3));
            }
            other => panic!("unexpected packet: {other:?}"),
        }
        assert_eq!(bus.pending_on(callee), 0);
    }

    #[test]
    fn call_to_unknown_endpoint_or_method_is_not_found() {
        let mut bus = Harness::new();
        let (callee, mut callee_rx) = bus.client("cn.example.callee", "main");
        let (caller, mut caller_rx) = bus.client("cn.example.caller", "main");
        bus.register_method(callee, &mut callee_rx, "add");

        bus.send(caller, &Harness::call("r1", "@localhost/cn.example.nobody/main", "add", Value::Null));
        assert!(matches!(caller_rx.next(), ServerPacket::Error { ret_code: RetCode::NOT_FOUND, .. }));

        bus.send(caller, &Harness::call("r2", "@localhost/cn.example.callee/main", "sub", Value::Null));
        assert!(matches!(caller_rx.next(), ServerPacket::Error { ret_code: RetCode::NOT_FOUND, .. }));

        bus.send(caller, &Harness::call("r3", "not-a-name", "add", Value::Null));
        assert!(matches!(caller_rx.next(), ServerPacket::Error { ret_code: RetCode::BAD_REQUEST, .. }));

        assert!(callee_rx.is_empty());
    }

    #[test]
    fn duplicate_result_is_discarded() {
        let mut bus = Harness::new();
        let (callee, mut callee_rx) = bus.client("cn.example.callee", "main");
        let (caller, mut caller_rx) = bus.client("cn.example.caller", "main");
        bus.register_method(callee, &mut callee_rx, "echo");

        bus.send(caller, &Harness::call("r1", "@localhost/cn.example.callee/main", "echo", json!("x")));
        let ServerPacket::Call { call_id, .. } = callee_rx.next() else {
            panic!("expected call");
        };
        let result = ClientPacket::Result {
            call_id,
            ret_code: RetCode::OK,
            ret_msg: String::new(),
            ret_value: json!("x"),
        };
        bus.send(callee, &result);
        bus.send(callee, &result);

        assert!(matches!(caller_rx.next(), ServerPacket::Result { .. }));
        assert!(caller_rx.is_empty());
        assert!(callee_rx.is_empty());
    }

    #[test]
    fn events_reach_only_subscribers() {
        let mut bus = Harness::new();
        let (publisher, mut pub_rx) = bus.client("cn.example.pub", "main");
        let (sub1, mut sub1_rx) = bus.client("cn.example.sub1", "main");
        let (sub2, mut sub2_rx) = bus.client("cn.example.sub2", "main");
        let (_other, mut other_rx) = bus.client("cn.example.other", "main");
        bus.subscribe(sub1, &mut sub1_rx, "NEW_DATA");
        bus.subscribe(sub2, &mut sub2_rx, "NEW_DATA");

        bus.send(publisher, &Harness::event("ev-1", "NEW_DATA", json!({"v": 42})));

        for rx in [&mut sub1_rx, &mut sub2_rx] {
            match rx.next() {
                ServerPacket::Event {
                    event_id,
                    from_endpoint,
                    bubble_name,
                    bubble_data,
                } => {
                    assert_eq!(event_id, "ev-1");
                    assert_eq!(from_endpoint, "@localhost/cn.example.pub/main");
                    assert_eq!(bubble_name, "NEW_DATA");
                    assert_eq!(bubble_data, json!({"v": 42}));
                }
                other => panic!("unexpected packet: {other:?}"),
            }
        }
        assert!(other_rx.is_empty());
        assert_eq!(
            pub_rx.next(),
            ServerPacket::EventSent {
                event_id: "ev-1".to_string(),
                nr_subscribers: 2
            }
        );
    }

    #[test]
    fn event_without_subscribers_is_reported() {
        let mut bus = Harness::new();
        let (publisher, mut pub_rx) = bus.client("cn.example.pub", "main");

        bus.send(publisher, &Harness::event("ev-2", "NOBODY", Value::Null));

        assert!(matches!(
            pub_rx.next(),
            ServerPacket::Error { ret_code: RetCode::NOT_FOUND, request_id: Some(id), .. } if id == "ev-2"
        ));
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let mut bus = Harness::new();
        let (publisher, mut pub_rx) = bus.client("cn.example.pub", "main");
        let (sub, mut sub_rx) = bus.client("cn.example.sub", "main");
        bus.subscribe(sub, &mut sub_rx, "TICK");

        bus.send(sub, &Harness::call_builtin("u1", "unsubscribeBubble", json!({"bubbleName": "TICK"})));
        assert!(matches!(sub_rx.next(), ServerPacket::Result { .. }));
        bus.send(sub, &Harness::call_builtin("u2", "unsubscribeBubble", json!({"bubbleName": "TICK"})));
        assert!(matches!(sub_rx.next(), ServerPacket::Error { ret_code: RetCode::NOT_FOUND, .. }));

        bus.send(publisher, &Harness::event("ev-3", "TICK", Value::Null));
        assert!(matches!(pub_rx.next(), ServerPacket::Error { ret_code: RetCode::NOT_FOUND, .. }));
        assert!(sub_rx.is_empty());
    }

    #[test]
    fn revoked_method_is_no_longer_callable() {
        let mut bus = Harness::new();
        let (callee, mut callee_rx) = bus.client("cn.example.callee", "main");
        let (caller, mut caller_rx) = bus.client("cn.example.caller", "main");
        bus.register_method(callee, &mut callee_rx, "echo");

        bus.send(callee, &Harness::call_builtin("r", "revokeMethod", json!({"methodName": "echo"})));
        assert!(matches!(callee_rx.next(), ServerPacket::Result { .. }));

        bus.send(caller, &Harness::call("r1", "@localhost/cn.example.callee/main", "echo", Value::Null));
        assert!(matches!(caller_rx.next(), ServerPacket::Error { ret_code: RetCode::NOT_FOUND, .. }));
    }

    #[test]
    fn list_endpoints_reports_identity_order() {
        let mut bus = Harness::new();
        let (b, mut b_rx) = bus.client("cn.example.b", "main");
        let (_a, _a_rx) = bus.client("cn.example.a", "main");
        bus.register_method(b, &mut b_rx, "work");

        bus.send(b, &Harness::call_builtin("l", "listEndpoints", Value::Null));
        let ServerPacket::Result { ret_value, .. } = b_rx.next() else {
            panic!("expected result");
        };
        let names: Vec<&str> = ret_value
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["name"].as_str().unwrap())
            .collect();
        assert_eq!(
            names,
            [
                "@localhost/cn.example.a/main",
                "@localhost/cn.example.b/main",
                "@localhost/cn.fmsoft.hybridos.hibus/builtin",
            ]
        );
        assert_eq!(ret_value[1]["methods"], json!(["work"]));
        assert_eq!(ret_value[1]["status"], json!("IDLE"));
    }

    fn small_frames(max_frame_size: usize) -> Harness {
        Harness::with_config(
            BrokerConfig::new()
                .with_max_clients(64)
                .with_max_frame_size(max_frame_size),
        )
    }

    #[test]
    fn oversized_call_is_refused_without_reaching_callee() {
        let mut bus = small_frames(512);
        let (callee, mut callee_rx) = bus.client("cn.example.callee", "main");
        let (caller, mut caller_rx) = bus.client("cn.example.caller", "main");
        bus.register_method(callee, &mut callee_rx, "add");

        bus.send(
            caller,
            &Harness::call("r1", "@localhost/cn.example.callee/main", "add", json!("x".repeat(500))),
        );

        assert!(matches!(
            caller_rx.next(),
            ServerPacket::Error { ret_code: RetCode::PACKET_TOO_LARGE, request_id: Some(r), .. } if r == "r1"
        ));
        assert!(callee_rx.is_empty());
        assert_eq!(bus.pending_on(callee), 0);
        assert_eq!(bus.broker.status_of(callee), Some(EndpointStatus::Idle));
    }

    #[test]
    fn oversized_event_is_refused_and_subscribers_keep_their_connection() {
        let mut bus = small_frames(512);
        let (publisher, mut pub_rx) = bus.client("cn.example.pub", "main");
        let (sub, mut sub_rx) = bus.client("cn.example.sub", "main");
        bus.subscribe(sub, &mut sub_rx, "BIG");

        bus.send(publisher, &Harness::event("ev-big", "BIG", json!("x".repeat(500))));

        assert!(matches!(
            pub_rx.next(),
            ServerPacket::Error { ret_code: RetCode::PACKET_TOO_LARGE, request_id: Some(id), .. } if id == "ev-big"
        ));
        assert!(sub_rx.is_empty());
        assert!(!sub_rx.closer().is_cancelled());

        bus.send(publisher, &Harness::event("ev-small", "BIG", json!(1)));
        assert!(matches!(sub_rx.next(), ServerPacket::Event { .. }));
        assert_eq!(
            pub_rx.next(),
            ServerPacket::EventSent {
                event_id: "ev-small".to_string(),
                nr_subscribers: 1
            }
        );
    }

    #[test]
    fn oversized_result_fails_the_call_for_both_sides() {
        let mut bus = small_frames(512);
        let (callee, mut callee_rx) = bus.client("cn.example.callee", "main");
        let (caller, mut caller_rx) = bus.client("cn.example.caller", "main");
        bus.register_method(callee, &mut callee_rx, "dump");

        bus.send(caller, &Harness::call("r1", "@localhost/cn.example.callee/main", "dump", Value::Null));
        let ServerPacket::Call { call_id, .. } = callee_rx.next() else {
            panic!("expected call");
        };
        bus.send(
            callee,
            &ClientPacket::Result {
                call_id,
                ret_code: RetCode::OK,
                ret_msg: String::new(),
                ret_value: json!("x".repeat(500)),
            },
        );

        let call_id = call_id.to_string();
        assert!(matches!(
            callee_rx.next(),
            ServerPacket::Error { ret_code: RetCode::PACKET_TOO_LARGE, request_id: Some(id), .. } if id == call_id
        ));
        assert!(matches!(
            caller_rx.next(),
            ServerPacket::Error { ret_code: RetCode::PACKET_TOO_LARGE, request_id: Some(r), .. } if r == "r1"
        ));
        assert_eq!(bus.pending_on(callee), 0);
        assert!(!caller_rx.closer().is_cancelled());
    }

    #[test]
    fn oversized_builtin_reply_is_refused() {
        let mut bus = small_frames(400);
        let (a, mut a_rx) = bus.client("cn.example.a", "main");

        bus.send(a, &Harness::call_builtin("l", "listEndpoints", Value::Null));
        assert!(matches!(
            a_rx.next(),
            ServerPacket::Error { ret_code: RetCode::PACKET_TOO_LARGE, request_id: Some(r), .. } if r == "l"
        ));

        bus.send(a, &Harness::call_builtin("e", "echo", json!("hi")));
        assert!(matches!(a_rx.next(), ServerPacket::Result { .. }));
    }

    #[test]
    fn requested_timeout_sets_deadline() {
        let mut bus = Harness::new();
        let (callee, mut callee_rx) = bus.client("cn.example.callee", "main");
        let (caller, _caller_rx) = bus.client("cn.example.caller", "main");
        bus.register_method(callee, &mut callee_rx, "slow");

        let mut packet = Harness::call("r", "@localhost/cn.example.callee/main", "slow", Value::Null);
        if let ClientPacket::Call { timeout_ms, .. } = &mut packet {
            *timeout_ms = Some(1500);
        }
        bus.send(caller, &packet);

        assert!(matches!(callee_rx.next(), ServerPacket::Call { timeout_ms: 1500, .. }));
    }
}
