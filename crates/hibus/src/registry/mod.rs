//! Broker state: endpoints, their method and bubble tables, and pending calls.

pub mod endpoint;
pub mod endpoints;
pub mod pending;
pub mod tables;

pub use endpoint::{
    Endpoint, EndpointKind, EndpointSnapshot, EndpointStatus, Handle, PendingSnapshot, SessionId,
};
pub use endpoints::{DEFAULT_MAX_CLIENTS, EndpointRegistry, RegistryError};
pub use pending::{PendingCall, PendingCalls};
pub use tables::{BubbleTable, BuiltinMethod, MethodHandler, MethodTable};
