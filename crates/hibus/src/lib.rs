//! hibus: local message bus for cooperating processes.

mod handshake;
mod router;

pub mod broker;
pub mod client;
pub mod config;
pub mod registry;
pub mod transport;
pub mod wire;

#[cfg(test)]
mod testing;

pub use broker::{Broker, SweepReport};
pub use client::{CallReply, ClientError, ConnectError, ConnectOptions, Connection};
pub use config::BrokerConfig;
pub use handshake::{
    Authenticator, CHALLENGE_LEN, ChallengeEcho, HandshakeError, client_bind_path, generate_challenge,
    peer_name,
};
pub use registry::{EndpointKind, EndpointSnapshot, EndpointStatus, Handle, PendingSnapshot, SessionId};
pub use transport::{
    AcceptError, FailReason, Outbox, ProtocolError, Transport, TransportHandler, UnixSocketServer,
};
pub use wire::{CallId, ClientPacket, EndpointName, Frame, FrameCodec, Opcode, RetCode, ServerPacket};
