//! Per-endpoint method and bubble tables.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

/// Methods the broker answers itself on its builtin endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinMethod {
    RegisterMethod,
    RevokeMethod,
    SubscribeBubble,
    UnsubscribeBubble,
    ListEndpoints,
    Echo,
}

impl BuiltinMethod {
    pub const ALL: [Self; 6] = [
        Self::RegisterMethod,
        Self::RevokeMethod,
        Self::SubscribeBubble,
        Self::UnsubscribeBubble,
        Self::ListEndpoints,
        Self::Echo,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::RegisterMethod => "registerMethod",
            Self::RevokeMethod => "revokeMethod",
            Self::SubscribeBubble => "subscribeBubble",
            Self::UnsubscribeBubble => "unsubscribeBubble",
            Self::ListEndpoints => "listEndpoints",
            Self::Echo => "echo",
        }
    }
}

/// What happens when a method is called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodHandler {
    Builtin(BuiltinMethod),
    /// Forward the call to the owning endpoint.
    Forward,
}

#[derive(Debug, Default)]
pub struct MethodTable {
    methods: HashMap<String, MethodHandler>,
}

impl MethodTable {
    /// Returns the handler previously registered under `name`, if any.
    pub fn register(&mut self, name: impl Into<String>, handler: MethodHandler) -> Option<MethodHandler> {
        self.methods.insert(name.into(), handler)
    }

    pub fn unregister(&mut self, name: &str) -> Option<MethodHandler> {
        self.methods.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&MethodHandler> {
        self.methods.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Method names in lexical order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// Bubbles an endpoint has subscribed to.
#[derive(Debug, Default)]
pub struct BubbleTable {
    bubbles: HashMap<String, DateTime<Utc>>,
}

impl BubbleTable {
    /// Returns false if the subscription already existed.
    pub fn subscribe(&mut self, name: impl Into<String>, at: DateTime<Utc>) -> bool {
        let name = name.into();
        if self.bubbles.contains_key(&name) {
            return false;
        }
        self.bubbles.insert(name, at);
        true
    }

    pub fn unsubscribe(&mut self, name: &str) -> bool {
        self.bubbles.remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bubbles.contains_key(name)
    }

    pub fn subscribed_at(&self, name: &str) -> Option<DateTime<Utc>> {
        self.bubbles.get(name).copied()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.bubbles.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.bubbles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bubbles.is_empty()
    }
}
