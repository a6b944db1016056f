//! Client side of the bus.
//!
//! A [`Connection`] binds its own socket path (derived from its identity and
//! pid) before connecting, so the broker side sees a named peer. The path is
//! removed again when the connection is dropped.

use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::handshake::{self, Authenticator, ChallengeEcho, HandshakeError};
use crate::registry::BuiltinMethod;
use crate::wire::name::LOCALHOST;
use crate::wire::protocol::{PROTOCOL_NAME, PROTOCOL_VERSION};
use crate::wire::{
    CallId, ClientPacket, DEFAULT_MAX_FRAME_SIZE, EndpointName, Frame, FrameCodec, FrameError,
    Opcode, PacketError, RetCode, ServerPacket,
};

pub const DEFAULT_BIND_DIR: &str = "/var/tmp";
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const CLIENT_SOCKET_MODE: u32 = 0o700;

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("failed to create socket: {0}")]
    Socket(#[source] io::Error),
    #[error("failed to bind {}: {source}", path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to set permissions on {}: {source}", path.display())]
    Permission {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to connect to {}: {source}", path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("{0} transport is not implemented")]
    NotImplemented(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error("connection closed by broker")]
    Closed,
    #[error("request {request_id} failed ({code}): {message}")]
    CallFailed {
        request_id: String,
        code: RetCode,
        message: String,
    },
    #[error("timed out waiting for {0}")]
    Timeout(String),
}

/// Answer to a call made with [`Connection::call_and_wait`].
#[derive(Debug, Clone, PartialEq)]
pub struct CallReply {
    pub from_endpoint: String,
    pub from_method: String,
    pub ret_code: RetCode,
    pub ret_msg: String,
    pub time_consumed: f64,
    pub ret_value: Value,
}

pub struct ConnectOptions {
    app_name: String,
    runner_name: String,
    bind_dir: PathBuf,
    authenticator: Arc<dyn Authenticator>,
    handshake_timeout: Duration,
    max_frame_size: usize,
}

impl ConnectOptions {
    pub fn new(app_name: impl Into<String>, runner_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            runner_name: runner_name.into(),
            bind_dir: PathBuf::from(DEFAULT_BIND_DIR),
            authenticator: Arc::new(ChallengeEcho),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn with_bind_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.bind_dir = dir.into();
        self
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_max_frame_size(mut self, bytes: usize) -> Self {
        self.max_frame_size = bytes;
        self
    }

    /// Connects to the broker socket at `path` and authenticates.
    pub async fn connect_via_unix_socket(self, path: impl AsRef<Path>) -> Result<Connection, ConnectError> {
        let server_path = path.as_ref().to_path_buf();
        let bind_path = handshake::client_bind_path(
            &self.bind_dir,
            &self.app_name,
            &self.runner_name,
            std::process::id(),
        );

        let std_stream = {
            let bind_path = bind_path.clone();
            let server_path = server_path.clone();
            tokio::task::spawn_blocking(move || bind_and_connect(&bind_path, &server_path))
                .await
                .map_err(|e| ConnectError::Socket(io::Error::other(e)))??
        };

        match self.authenticate(std_stream, &bind_path).await {
            Ok(connection) => {
                tracing::debug!(
                    server = %server_path.display(),
                    endpoint = %connection.endpoint_name_string(),
                    "Connected to broker"
                );
                Ok(connection)
            }
            Err(e) => {
                remove_bind_path(&bind_path);
                Err(e)
            }
        }
    }

    async fn authenticate(
        self,
        std_stream: std::os::unix::net::UnixStream,
        bind_path: &Path,
    ) -> Result<Connection, ConnectError> {
        let stream = UnixStream::from_std(std_stream).map_err(ConnectError::Socket)?;
        let fd = stream.as_raw_fd();
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, FrameCodec::with_max_frame_size(self.max_frame_size));
        let mut writer = FramedWrite::new(write_half, FrameCodec::with_max_frame_size(self.max_frame_size));

        let exchange = async {
            let challenge = handshake::read_challenge(&mut reader).await?;
            let signature = self
                .authenticator
                .prove(&challenge, &self.app_name, &self.runner_name);
            let answer = ClientPacket::Auth {
                protocol_name: PROTOCOL_NAME.to_string(),
                protocol_version: PROTOCOL_VERSION,
                host_name: Some(LOCALHOST.to_string()),
                app_name: self.app_name.clone(),
                runner_name: self.runner_name.clone(),
                signature,
            };
            writer
                .send(Frame::from_packet(&answer)?)
                .await
                .map_err(HandshakeError::Frame)?;
            handshake::read_verdict(&mut reader).await
        };

        let (srv_host_name, own_host_name) = tokio::time::timeout(self.handshake_timeout, exchange)
            .await
            .map_err(|_| HandshakeError::Timeout)??;

        Ok(Connection {
            srv_host_name,
            own_host_name,
            app_name: self.app_name,
            runner_name: self.runner_name,
            bind_path: bind_path.to_path_buf(),
            fd,
            reader,
            writer,
            backlog: VecDeque::new(),
        })
    }

    pub async fn connect_via_web_socket(self, _host: &str, _port: u16) -> Result<Connection, ConnectError> {
        Err(ConnectError::NotImplemented("WebSocket"))
    }
}

fn bind_and_connect(
    bind_path: &Path,
    server_path: &Path,
) -> Result<std::os::unix::net::UnixStream, ConnectError> {
    use nix::sys::socket::{AddressFamily, SockFlag, SockType, UnixAddr, bind, connect, socket};
    use std::os::unix::fs::PermissionsExt;

    let fd = socket(AddressFamily::Unix, SockType::Stream, SockFlag::empty(), None)
        .map_err(|e| ConnectError::Socket(e.into()))?;

    let bind_err = |source: io::Error| ConnectError::Bind {
        path: bind_path.to_path_buf(),
        source,
    };
    match std::fs::remove_file(bind_path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(bind_err(e)),
        _ => {}
    }
    let local = UnixAddr::new(bind_path).map_err(|e| bind_err(e.into()))?;
    bind(fd.as_raw_fd(), &local).map_err(|e| bind_err(e.into()))?;

    let connected = (|| {
        std::fs::set_permissions(bind_path, std::fs::Permissions::from_mode(CLIENT_SOCKET_MODE)).map_err(
            |source| ConnectError::Permission {
                path: bind_path.to_path_buf(),
                source,
            },
        )?;
        let connect_err = |source: io::Error| ConnectError::Connect {
            path: server_path.to_path_buf(),
            source,
        };
        let remote = UnixAddr::new(server_path).map_err(|e| connect_err(e.into()))?;
        connect(fd.as_raw_fd(), &remote).map_err(|e| connect_err(e.into()))?;
        Ok(())
    })();
    if let Err(e) = connected {
        remove_bind_path(bind_path);
        return Err(e);
    }

    let stream = std::os::unix::net::UnixStream::from(fd);
    stream.set_nonblocking(true).map_err(ConnectError::Socket)?;
    Ok(stream)
}

fn remove_bind_path(path: &Path) {
    if let Err(e) = std::fs::remove_file(path)
        && e.kind() != io::ErrorKind::NotFound
    {
        tracing::warn!(path = %path.display(), error = %e, "Failed to remove client socket path");
    }
}

/// An authenticated connection to the broker.
pub struct Connection {
    srv_host_name: String,
    own_host_name: String,
    app_name: String,
    runner_name: String,
    bind_path: PathBuf,
    fd: RawFd,
    reader: FramedRead<OwnedReadHalf, FrameCodec>,
    writer: FramedWrite<OwnedWriteHalf, FrameCodec>,
    /// Packets read while waiting for a specific answer.
    backlog: VecDeque<ServerPacket>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("srv_host_name", &self.srv_host_name)
            .field("own_host_name", &self.own_host_name)
            .field("app_name", &self.app_name)
            .field("runner_name", &self.runner_name)
            .field("bind_path", &self.bind_path)
            .field("fd", &self.fd)
            .field("backlog", &self.backlog.len())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Connects with default [`ConnectOptions`].
    pub async fn connect_via_unix_socket(
        path: impl AsRef<Path>,
        app_name: &str,
        runner_name: &str,
    ) -> Result<Self, ConnectError> {
        ConnectOptions::new(app_name, runner_name)
            .connect_via_unix_socket(path)
            .await
    }

    pub async fn connect_via_web_socket(
        host: &str,
        port: u16,
        app_name: &str,
        runner_name: &str,
    ) -> Result<Self, ConnectError> {
        ConnectOptions::new(app_name, runner_name)
            .connect_via_web_socket(host, port)
            .await
    }

    pub fn srv_host_name(&self) -> &str {
        &self.srv_host_name
    }

    pub fn own_host_name(&self) -> &str {
        &self.own_host_name
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn runner_name(&self) -> &str {
        &self.runner_name
    }

    pub fn socket_fd(&self) -> RawFd {
        self.fd
    }

    pub fn bind_path(&self) -> &Path {
        &self.bind_path
    }

    /// Our identity as the broker knows it.
    pub fn endpoint_name(&self) -> Result<EndpointName, crate::wire::NameError> {
        EndpointName::new(&self.own_host_name, &self.app_name, &self.runner_name)
    }

    fn endpoint_name_string(&self) -> String {
        format!("@{}/{}/{}", self.own_host_name, self.app_name, self.runner_name)
    }

    pub async fn send_packet(&mut self, packet: &ClientPacket) -> Result<(), ClientError> {
        self.writer.send(Frame::from_packet(packet)?).await?;
        Ok(())
    }

    /// Next packet from the broker, answering PINGs along the way.
    pub async fn read_packet(&mut self) -> Result<ServerPacket, ClientError> {
        if let Some(packet) = self.backlog.pop_front() {
            return Ok(packet);
        }
        self.read_from_socket().await
    }

    async fn read_from_socket(&mut self) -> Result<ServerPacket, ClientError> {
        loop {
            let frame = match self.reader.next().await {
                Some(frame) => frame?,
                None => return Err(ClientError::Closed),
            };
            match frame.opcode() {
                Opcode::Text => return Ok(frame.packet()?),
                Opcode::Ping => self.writer.send(Frame::pong(frame.into_payload())).await?,
                Opcode::Pong => tracing::trace!("Received PONG"),
                Opcode::Close => return Err(ClientError::Closed),
                Opcode::Bin => return Err(PacketError::NotText(Opcode::Bin).into()),
            }
        }
    }

    /// Sends a call and returns its request id without waiting for the answer.
    pub async fn call(
        &mut self,
        to: &EndpointName,
        method: &str,
        parameter: Value,
        timeout: Option<Duration>,
    ) -> Result<String, ClientError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        self.send_packet(&ClientPacket::Call {
            request_id: request_id.clone(),
            to_endpoint: to.to_string(),
            to_method: method.to_string(),
            timeout_ms: timeout.map(|t| t.as_millis() as u64),
            parameter,
        })
        .await?;
        Ok(request_id)
    }

    /// Calls a method and waits for its result. Unrelated packets received
    /// meanwhile are kept for [`Connection::read_packet`].
    pub async fn call_and_wait(
        &mut self,
        to: &EndpointName,
        method: &str,
        parameter: Value,
        timeout: Duration,
    ) -> Result<CallReply, ClientError> {
        let request_id = self.call(to, method, parameter, Some(timeout)).await?;
        let wait = async {
            loop {
                match self.read_from_socket().await? {
                    ServerPacket::Result {
                        request_id: id,
                        from_endpoint,
                        from_method,
                        ret_code,
                        ret_msg,
                        time_consumed,
                        ret_value,
                        ..
                    } if id == request_id => {
                        return Ok(CallReply {
                            from_endpoint,
                            from_method,
                            ret_code,
                            ret_msg,
                            time_consumed,
                            ret_value,
                        });
                    }
                    ServerPacket::Error {
                        ret_code,
                        ret_msg,
                        request_id: Some(id),
                        ..
                    } if id == request_id => {
                        return Err(ClientError::CallFailed {
                            request_id: id,
                            code: ret_code,
                            message: ret_msg,
                        });
                    }
                    other => self.backlog.push_back(other),
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout(format!("{method} on {to}"))),
        }
    }

    async fn call_builtin(&mut self, method: BuiltinMethod, parameter: Value) -> Result<CallReply, ClientError> {
        self.call_and_wait(
            &EndpointName::builtin(),
            method.name(),
            parameter,
            DEFAULT_HANDSHAKE_TIMEOUT,
        )
        .await
    }

    pub async fn register_method(&mut self, method: &str) -> Result<(), ClientError> {
        self.call_builtin(BuiltinMethod::RegisterMethod, json!({ "methodName": method }))
            .await
            .map(drop)
    }

    pub async fn revoke_method(&mut self, method: &str) -> Result<(), ClientError> {
        self.call_builtin(BuiltinMethod::RevokeMethod, json!({ "methodName": method }))
            .await
            .map(drop)
    }

    pub async fn subscribe_bubble(&mut self, bubble: &str) -> Result<(), ClientError> {
        self.call_builtin(BuiltinMethod::SubscribeBubble, json!({ "bubbleName": bubble }))
            .await
            .map(drop)
    }

    pub async fn unsubscribe_bubble(&mut self, bubble: &str) -> Result<(), ClientError> {
        self.call_builtin(BuiltinMethod::UnsubscribeBubble, json!({ "bubbleName": bubble }))
            .await
            .map(drop)
    }

    pub async fn list_endpoints(&mut self) -> Result<Value, ClientError> {
        self.call_builtin(BuiltinMethod::ListEndpoints, Value::Null)
            .await
            .map(|reply| reply.ret_value)
    }

    /// Publishes an event and returns its id. The broker answers with
    /// `eventSent`, or an `error` carrying the id if nobody is subscribed.
    pub async fn publish_event(&mut self, bubble: &str, data: Value) -> Result<String, ClientError> {
        let event_id = uuid::Uuid::new_v4().to_string();
        self.send_packet(&ClientPacket::Event {
            event_id: event_id.clone(),
            bubble_name: bubble.to_string(),
            bubble_data: data,
        })
        .await?;
        Ok(event_id)
    }

    /// Answers a call forwarded by the broker.
    pub async fn send_result(&mut self, call_id: CallId, ret_code: RetCode, ret_value: Value) -> Result<(), ClientError> {
        self.send_packet(&ClientPacket::Result {
            call_id,
            ret_code,
            ret_msg: ret_code.message().to_string(),
            ret_value,
        })
        .await
    }

    pub async fn ping(&mut self) -> Result<(), ClientError> {
        self.writer.send(Frame::ping(&b"ping"[..])).await?;
        Ok(())
    }

    /// Sends CLOSE and releases the connection.
    pub async fn disconnect(mut self) -> Result<(), ClientError> {
        self.writer.send(Frame::close("bye")).await?;
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        remove_bind_path(&self.bind_path);
    }
}
