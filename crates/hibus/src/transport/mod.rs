//! Transport adapters and the callback contract between them and the broker.
//!
//! An adapter owns the sockets. It reports four events to a [`TransportHandler`]:
//! a connection was accepted, a frame arrived, the peer closed, or the
//! connection failed. The handler never touches sockets directly; it sends
//! frames through the endpoint's [`Outbox`] and asks the adapter to drop the
//! connection by closing it.

pub mod unix;
pub mod websocket;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use unix::{UnixClient, UnixSocketServer};
pub use websocket::WebClient;

use crate::registry::{EndpointKind, Handle, RegistryError};
use crate::wire::{Frame, FrameError, Opcode, PacketError};

/// Outgoing frame queue of one connection.
///
/// Dropping the outbox lets the writer drain what is queued and then shut the
/// connection down; [`Outbox::close`] additionally stops the reader.
#[derive(Debug)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Frame>,
    closer: CancellationToken,
}

impl Outbox {
    pub fn new(tx: mpsc::UnboundedSender<Frame>, closer: CancellationToken) -> Self {
        Self { tx, closer }
    }

    /// An outbox with a fresh close token, plus the receiving end for the writer.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx, CancellationToken::new()), rx)
    }

    /// Queues a frame. Returns false if the writer is gone.
    pub fn send(&self, frame: Frame) -> bool {
        self.tx.send(frame).is_ok()
    }

    pub fn close(&self) {
        self.closer.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_cancelled() || self.tx.is_closed()
    }

    pub fn closer(&self) -> &CancellationToken {
        &self.closer
    }
}

/// Transport-specific payload of an endpoint.
#[derive(Debug)]
pub enum Transport {
    /// The broker's own endpoint; it has no connection.
    Builtin,
    Unix(UnixClient),
    Web(WebClient),
}

impl Transport {
    pub fn kind(&self) -> EndpointKind {
        match self {
            Self::Builtin => EndpointKind::Builtin,
            Self::Unix(_) => EndpointKind::UnixSocket,
            Self::Web(_) => EndpointKind::WebSocket,
        }
    }

    pub fn outbox(&self) -> Option<&Outbox> {
        match self {
            Self::Builtin => None,
            Self::Unix(client) => Some(&client.outbox),
            Self::Web(client) => Some(&client.outbox),
        }
    }
}

/// Errors that make the broker drop a connection after a frame.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error("endpoint has not authenticated")]
    Unauthenticated,
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("endpoint is closing")]
    Closing,
    #[error("unsupported opcode {0:?}")]
    UnsupportedOpcode(Opcode),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, thiserror::Error)]
pub enum AcceptError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("connection rejected: {0}")]
    Rejected(String),
}

/// Why a connection ended abnormally.
#[derive(Debug, thiserror::Error)]
pub enum FailReason {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Receives connection events from a transport adapter.
///
/// Callbacks for one connection are never issued concurrently, and
/// `on_closed`/`on_failed` may be delivered for a handle that the handler has
/// already evicted.
pub trait TransportHandler: Send + Sync + 'static {
    fn on_accepted(&self, handle: Handle, transport: Transport) -> Result<(), AcceptError>;

    /// CLOSE frames are consumed by the adapter and reported as `on_closed`.
    fn on_got_data(&self, handle: Handle, frame: Frame) -> Result<(), ProtocolError>;

    fn on_closed(&self, handle: Handle);

    fn on_failed(&self, handle: Handle, reason: &FailReason);
}
