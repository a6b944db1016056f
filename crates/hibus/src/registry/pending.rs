//! Calls forwarded to a callee that have not been answered yet.
//!
//! Each callee owns the list of calls it must answer. An entry is created when
//! the broker forwards a call and removed exactly once: by the callee's result,
//! by deadline expiry, or by the callee's eviction.

use chrono::{DateTime, Utc};

use super::endpoint::{Handle, SessionId};
use crate::wire::{CallId, EndpointName};

#[derive(Debug, Clone, PartialEq)]
pub struct PendingCall {
    pub call_id: CallId,
    /// The caller's own correlation id, echoed back in the result.
    pub request_id: String,
    pub caller: Handle,
    /// Guards against delivering to a different endpoint that reused the handle.
    pub caller_session: SessionId,
    pub caller_name: EndpointName,
    pub method: String,
    pub issued_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

impl PendingCall {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.deadline
    }

    /// Seconds since the call was forwarded.
    pub fn elapsed_secs(&self, now: DateTime<Utc>) -> f64 {
        let elapsed = now.signed_duration_since(self.issued_at);
        elapsed.num_microseconds().unwrap_or(i64::MAX) as f64 / 1_000_000.0
    }
}

/// Issue-ordered list of a callee's pending calls.
#[derive(Debug, Default)]
pub struct PendingCalls {
    calls: Vec<PendingCall>,
}

impl PendingCalls {
    pub fn track(&mut self, call: PendingCall) {
        self.calls.push(call);
    }

    /// Removes and returns the entry for `call_id`, if still pending.
    pub fn resolve(&mut self, call_id: CallId) -> Option<PendingCall> {
        let index = self.calls.iter().position(|c| c.call_id == call_id)?;
        Some(self.calls.remove(index))
    }

    /// Removes and returns every entry whose deadline has passed.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<PendingCall> {
        let (expired, live): (Vec<_>, Vec<_>) = std::mem::take(&mut self.calls)
            .into_iter()
            .partition(|c| c.is_expired(now));
        self.calls = live;
        expired
    }

    pub fn drain(&mut self) -> Vec<PendingCall> {
        std::mem::take(&mut self.calls)
    }

    pub fn get(&self, call_id: CallId) -> Option<&PendingCall> {
        self.calls.iter().find(|c| c.call_id == call_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingCall> {
        self.calls.iter()
    }

    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.calls.iter().map(|c| c.deadline).min()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}
