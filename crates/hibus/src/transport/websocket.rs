//! WebSocket endpoints.
//!
//! Only the endpoint payload exists: endpoints of this kind carry their remote
//! address and the broker reassigns their host name from it. There is no
//! WebSocket listener, and clients get `ConnectError::NotImplemented`.

use std::net::SocketAddr;

use super::Outbox;

pub const DEFAULT_WEB_SOCKET_PORT: u16 = 7700;

#[derive(Debug)]
pub struct WebClient {
    pub(crate) outbox: Outbox,
    peer: SocketAddr,
}

impl WebClient {
    pub fn new(outbox: Outbox, peer: SocketAddr) -> Self {
        Self { outbox, peer }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Host name assigned to the endpoint during authentication.
    pub fn host_name(&self) -> String {
        self.peer.ip().to_string()
    }
}
