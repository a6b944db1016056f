//! Broker configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::registry::DEFAULT_MAX_CLIENTS;
use crate::wire::DEFAULT_MAX_FRAME_SIZE;
use crate::wire::name::LOCALHOST;

pub const DEFAULT_SOCKET_PATH: &str = "/var/tmp/hibus.sock";
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_CALL_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub socket_path: PathBuf,
    /// Reported to clients as `serverHostName`.
    pub host_name: String,
    pub max_clients: usize,
    pub max_frame_size: usize,
    /// Connections that have not authenticated by then are dropped.
    pub handshake_timeout: Duration,
    /// Used when a call does not ask for a timeout.
    pub call_timeout: Duration,
    /// Upper bound on any requested call timeout.
    pub max_call_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerConfig {
    pub fn new() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            host_name: LOCALHOST.to_string(),
            max_clients: DEFAULT_MAX_CLIENTS,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            max_call_timeout: DEFAULT_MAX_CALL_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }

    pub fn with_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = path.into();
        self
    }

    pub fn with_host_name(mut self, host_name: impl Into<String>) -> Self {
        self.host_name = host_name.into();
        self
    }

    pub fn with_max_clients(mut self, n: usize) -> Self {
        self.max_clients = n;
        self
    }

    pub fn with_max_frame_size(mut self, bytes: usize) -> Self {
        self.max_frame_size = bytes;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_max_call_timeout(mut self, timeout: Duration) -> Self {
        self.max_call_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Timeout applied to a call that requested `requested_ms`.
    pub fn effective_call_timeout(&self, requested_ms: Option<u64>) -> Duration {
        match requested_ms {
            Some(ms) if ms > 0 => Duration::from_millis(ms).min(self.max_call_timeout),
            _ => self.call_timeout.min(self.max_call_timeout),
        }
    }
}
