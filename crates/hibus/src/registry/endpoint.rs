//! A single connected (or builtin) endpoint and its lifecycle.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::pending::{PendingCall, PendingCalls};
use super::tables::{BubbleTable, BuiltinMethod, MethodHandler, MethodTable};
use crate::transport::Transport;
use crate::wire::{CallId, EndpointName, Frame, ServerPacket};

/// Transport-level connection key. For Unix sockets this is the accepted fd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(u32);

impl Handle {
    /// Slot of the builtin endpoint.
    pub const BUILTIN: Handle = Handle(0);

    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn from_raw_fd(fd: i32) -> Option<Self> {
        u32::try_from(fd).ok().map(Self)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic id distinguishing successive endpoints that reuse one handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct SessionId(u64);

impl SessionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EndpointKind {
    Builtin,
    UnixSocket,
    WebSocket,
}

/// Lifecycle: `AUTHING -> IDLE <-> BUSY`, any state `-> CLOSING`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EndpointStatus {
    Authing,
    Idle,
    Busy,
    Closing,
}

impl EndpointStatus {
    pub fn can_transition_to(self, next: Self) -> bool {
        use EndpointStatus::*;
        match (self, next) {
            (Closing, _) => false,
            (_, Closing) => true,
            (Authing, Idle) | (Idle, Busy) | (Busy, Idle) => true,
            (current, next) => current == next,
        }
    }
}

#[derive(Debug)]
pub struct Endpoint {
    handle: Handle,
    session: SessionId,
    name: Option<EndpointName>,
    transport: Transport,
    status: EndpointStatus,
    challenge_code: Option<String>,
    auth_deadline: Option<DateTime<Utc>>,
    methods: MethodTable,
    bubbles: BubbleTable,
    pending: PendingCalls,
    accepted_at: DateTime<Utc>,
}

impl Endpoint {
    /// A freshly accepted connection, not yet authenticated.
    pub fn new(transport: Transport, now: DateTime<Utc>) -> Self {
        Self {
            handle: Handle::BUILTIN,
            session: SessionId::new(0),
            name: None,
            transport,
            status: EndpointStatus::Authing,
            challenge_code: None,
            auth_deadline: None,
            methods: MethodTable::default(),
            bubbles: BubbleTable::default(),
            pending: PendingCalls::default(),
            accepted_at: now,
        }
    }

    pub(crate) fn builtin(now: DateTime<Utc>) -> Self {
        let mut methods = MethodTable::default();
        for method in BuiltinMethod::ALL {
            methods.register(method.name(), MethodHandler::Builtin(method));
        }
        Self {
            name: Some(EndpointName::builtin()),
            status: EndpointStatus::Idle,
            methods,
            ..Self::new(Transport::Builtin, now)
        }
    }

    pub(crate) fn attach(&mut self, handle: Handle, session: SessionId) {
        self.handle = handle;
        self.session = session;
    }

    pub(crate) fn set_name(&mut self, name: EndpointName) -> Option<EndpointName> {
        self.name.replace(name)
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn name(&self) -> Option<&EndpointName> {
        self.name.as_ref()
    }

    /// Rendered name, or a placeholder for endpoints still authenticating.
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) => name.to_string(),
            None => format!("<authing #{}>", self.handle),
        }
    }

    pub fn kind(&self) -> EndpointKind {
        self.transport.kind()
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn status(&self) -> EndpointStatus {
        self.status
    }

    /// Authenticated and not closing.
    pub fn is_routable(&self) -> bool {
        matches!(self.status, EndpointStatus::Idle | EndpointStatus::Busy)
    }

    pub fn accepted_at(&self) -> DateTime<Utc> {
        self.accepted_at
    }

    pub fn challenge_code(&self) -> Option<&str> {
        self.challenge_code.as_deref()
    }

    /// Moves to `next` if the lifecycle allows it.
    pub fn transition(&mut self, next: EndpointStatus) -> bool {
        if !self.status.can_transition_to(next) {
            tracing::debug!(
                handle = %self.handle,
                from = ?self.status,
                to = ?next,
                "Ignoring invalid status transition"
            );
            return false;
        }
        self.status = next;
        true
    }

    pub fn begin_auth(&mut self, challenge: String, deadline: DateTime<Utc>) {
        self.challenge_code = Some(challenge);
        self.auth_deadline = Some(deadline);
    }

    pub fn auth_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == EndpointStatus::Authing && self.auth_deadline.is_some_and(|d| now > d)
    }

    pub fn mark_authenticated(&mut self) -> bool {
        if !self.transition(EndpointStatus::Idle) {
            return false;
        }
        self.challenge_code = None;
        self.auth_deadline = None;
        true
    }

    /// Queues a frame for the peer. Always false for the builtin endpoint.
    pub fn send(&self, frame: Frame) -> bool {
        self.transport
            .outbox()
            .is_some_and(|outbox| outbox.send(frame))
    }

    pub fn send_packet(&self, packet: &ServerPacket) -> bool {
        match Frame::from_packet(packet) {
            Ok(frame) => self.send(frame),
            Err(e) => {
                tracing::error!(handle = %self.handle, kind = packet.kind(), error = %e, "Failed to encode packet");
                false
            }
        }
    }

    /// Asks the transport to drop the connection.
    pub fn close(&self) {
        if let Some(outbox) = self.transport.outbox() {
            outbox.close();
        }
    }

    pub fn methods(&self) -> &MethodTable {
        &self.methods
    }

    pub fn register_method(&mut self, name: impl Into<String>, handler: MethodHandler) -> bool {
        self.methods.register(name, handler).is_none()
    }

    pub fn unregister_method(&mut self, name: &str) -> bool {
        self.methods.unregister(name).is_some()
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains(name)
    }

    pub fn bubbles(&self) -> &BubbleTable {
        &self.bubbles
    }

    pub fn register_bubble(&mut self, name: impl Into<String>, now: DateTime<Utc>) -> bool {
        self.bubbles.subscribe(name, now)
    }

    pub fn unregister_bubble(&mut self, name: &str) -> bool {
        self.bubbles.unsubscribe(name)
    }

    pub fn has_bubble(&self, name: &str) -> bool {
        self.bubbles.contains(name)
    }

    pub fn pending(&self) -> &PendingCalls {
        &self.pending
    }

    pub fn track_call(&mut self, call: PendingCall) {
        self.pending.track(call);
        if self.status == EndpointStatus::Idle {
            self.transition(EndpointStatus::Busy);
        }
    }

    pub fn resolve_call(&mut self, call_id: CallId) -> Option<PendingCall> {
        let call = self.pending.resolve(call_id)?;
        self.settle();
        Some(call)
    }

    pub fn expire_calls(&mut self, now: DateTime<Utc>) -> Vec<PendingCall> {
        let expired = self.pending.sweep(now);
        if !expired.is_empty() {
            self.settle();
        }
        expired
    }

    pub fn drain_calls(&mut self) -> Vec<PendingCall> {
        self.pending.drain()
    }

    fn settle(&mut self) {
        if self.pending.is_empty() && self.status == EndpointStatus::Busy {
            self.transition(EndpointStatus::Idle);
        }
    }

    pub fn snapshot(&self) -> EndpointSnapshot {
        EndpointSnapshot {
            name: self.display_name(),
            kind: self.kind(),
            status: self.status,
            session: self.session,
            methods: self.methods.names().into_iter().map(String::from).collect(),
            bubbles: self.bubbles.names().into_iter().map(String::from).collect(),
            pending_calls: self
                .pending
                .iter()
                .map(|call| PendingSnapshot {
                    call_id: call.call_id,
                    caller: call.caller_name.to_string(),
                    method: call.method.clone(),
                    deadline: call.deadline,
                })
                .collect(),
            accepted_at: self.accepted_at,
        }
    }
}

/// Point-in-time view of an endpoint, as reported by `listEndpoints`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSnapshot {
    pub name: String,
    pub kind: EndpointKind,
    pub status: EndpointStatus,
    pub session: SessionId,
    pub methods: Vec<String>,
    pub bubbles: Vec<String>,
    pub pending_calls: Vec<PendingSnapshot>,
    pub accepted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSnapshot {
    pub call_id: CallId,
    pub caller: String,
    pub method: String,
    pub deadline: DateTime<Utc>,
}
