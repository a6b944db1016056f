//! Unix-domain socket transport.
//!
//! Each accepted connection gets a reader task that feeds decoded frames to
//! the handler and a writer task that drains the endpoint's outbox. The
//! reader keeps its half of the socket until the handler has been told the
//! connection ended, so a handle (the accepted fd) is never reused while the
//! broker still knows it.

use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use super::{FailReason, Outbox, Transport, TransportHandler};
use crate::registry::Handle;
use crate::wire::{Frame, FrameCodec, Opcode};

const SOCKET_MODE: u32 = 0o666;
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Transport payload of a Unix-socket endpoint.
#[derive(Debug)]
pub struct UnixClient {
    pub(crate) outbox: Outbox,
    pid: Option<i32>,
    uid: Option<u32>,
}

impl UnixClient {
    pub fn new(outbox: Outbox, pid: Option<i32>, uid: Option<u32>) -> Self {
        Self { outbox, pid, uid }
    }

    /// Peer process id, when the platform reports it.
    pub fn pid(&self) -> Option<i32> {
        self.pid
    }

    pub fn uid(&self) -> Option<u32> {
        self.uid
    }
}

/// Listening socket of the broker.
pub struct UnixSocketServer {
    listener: UnixListener,
    path: PathBuf,
    max_frame_size: usize,
}

impl UnixSocketServer {
    /// Binds the listening socket, replacing a stale socket file at `path`.
    pub fn bind(path: impl Into<PathBuf>, max_frame_size: usize) -> io::Result<Self> {
        use std::os::unix::fs::PermissionsExt;
        use std::os::unix::net::UnixListener as StdUnixListener;

        let path = path.into();
        if path.exists() {
            tracing::debug!(path = %path.display(), "Removing stale socket file");
            std::fs::remove_file(&path)?;
        }

        let std_listener = StdUnixListener::bind(&path)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(SOCKET_MODE))?;
        std_listener.set_nonblocking(true)?;
        let listener = UnixListener::from_std(std_listener)?;

        tracing::info!(path = %path.display(), max_frame_size, "Listening on Unix socket");
        Ok(Self {
            listener,
            path,
            max_frame_size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accepts connections until `shutdown` fires.
    ///
    /// Cancelling `shutdown` also closes every connection accepted here.
    pub async fn serve<H: TransportHandler>(
        self,
        handler: Arc<H>,
        shutdown: CancellationToken,
    ) -> io::Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(path = %self.path.display(), "Unix socket server shutting down");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        spawn_connection(stream, Arc::clone(&handler), self.max_frame_size, &shutdown);
                    }
                    Err(e) => {
                        // Usually fd exhaustion; give connections a chance to close.
                        tracing::warn!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }
        Ok(())
    }
}

impl Drop for UnixSocketServer {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != io::ErrorKind::NotFound
        {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove socket file");
        }
    }
}

fn spawn_connection<H: TransportHandler>(
    stream: UnixStream,
    handler: Arc<H>,
    max_frame_size: usize,
    shutdown: &CancellationToken,
) {
    let Some(handle) = Handle::from_raw_fd(stream.as_raw_fd()) else {
        tracing::error!(fd = stream.as_raw_fd(), "Accepted socket has an invalid fd");
        return;
    };
    let cred = match stream.peer_cred() {
        Ok(cred) => Some(cred),
        Err(e) => {
            tracing::debug!(%handle, error = %e, "Peer credentials unavailable");
            None
        }
    };

    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let closer = shutdown.child_token();

    tokio::spawn(run_writer(
        handle,
        FramedWrite::new(write_half, FrameCodec::with_max_frame_size(max_frame_size)),
        rx,
        closer.clone(),
    ));

    let client = UnixClient::new(
        Outbox::new(tx, closer.clone()),
        cred.and_then(|c| c.pid()),
        cred.map(|c| c.uid()),
    );
    tracing::debug!(%handle, pid = ?client.pid(), uid = ?client.uid(), "Accepted Unix socket connection");

    if let Err(e) = handler.on_accepted(handle, Transport::Unix(client)) {
        tracing::info!(%handle, error = %e, "Connection rejected");
        return;
    }

    tokio::spawn(run_reader(
        handle,
        FramedRead::new(read_half, FrameCodec::with_max_frame_size(max_frame_size)),
        handler,
        closer,
    ));
}

async fn run_reader<H: TransportHandler>(
    handle: Handle,
    mut reader: FramedRead<OwnedReadHalf, FrameCodec>,
    handler: Arc<H>,
    closer: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = closer.cancelled() => {
                handler.on_closed(handle);
                break;
            }
            next = reader.next() => next,
        };

        match next {
            Some(Ok(frame)) if frame.opcode() == Opcode::Close => {
                tracing::debug!(%handle, "Peer sent CLOSE");
                handler.on_closed(handle);
                break;
            }
            Some(Ok(frame)) => {
                if let Err(e) = handler.on_got_data(handle, frame) {
                    handler.on_failed(handle, &FailReason::Protocol(e));
                    break;
                }
            }
            Some(Err(e)) => {
                handler.on_failed(handle, &FailReason::Frame(e));
                break;
            }
            None => {
                tracing::debug!(%handle, "Peer closed connection");
                handler.on_closed(handle);
                break;
            }
        }
    }
    tracing::trace!(%handle, "Connection reader exiting");
}

async fn run_writer(
    handle: Handle,
    mut writer: FramedWrite<OwnedWriteHalf, FrameCodec>,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    closer: CancellationToken,
) {
    while let Some(frame) = rx.recv().await {
        match tokio::time::timeout(WRITE_TIMEOUT, writer.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(%handle, error = %e, "Failed to write frame");
                closer.cancel();
                break;
            }
            Err(_) => {
                tracing::warn!(%handle, timeout = ?WRITE_TIMEOUT, "Timed out writing frame");
                closer.cancel();
                break;
            }
        }
    }
    tracing::trace!(%handle, "Connection writer exiting");
}
