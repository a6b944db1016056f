//! Challenge-response authentication.
//!
//! The broker opens every connection with an `auth` packet carrying a fresh
//! challenge. The client answers with its app and runner names plus a
//! signature over the challenge; the broker verifies it, binds the identity
//! and replies `authPassed`, or replies `error` and drops the connection.

use std::path::{Path, PathBuf};

use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;

use crate::registry::{EndpointRegistry, Handle, RegistryError};
use crate::transport::{ProtocolError, Transport};
use crate::wire::name::LOCALHOST;
use crate::wire::protocol::{PROTOCOL_NAME, PROTOCOL_VERSION};
use crate::wire::{
    ClientPacket, EndpointName, FrameCodec, FrameError, Opcode, PacketError, RetCode, ServerPacket,
};

/// Random bytes in a challenge, rendered as hex.
pub const CHALLENGE_LEN: usize = 16;

/// Produces and checks challenge signatures.
pub trait Authenticator: Send + Sync + 'static {
    fn prove(&self, challenge: &str, app: &str, runner: &str) -> String;

    fn verify(&self, challenge: &str, app: &str, runner: &str, signature: &str) -> bool;
}

/// Accepts a signature equal to the challenge itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChallengeEcho;

impl Authenticator for ChallengeEcho {
    fn prove(&self, challenge: &str, _app: &str, _runner: &str) -> String {
        challenge.to_string()
    }

    fn verify(&self, challenge: &str, _app: &str, _runner: &str, signature: &str) -> bool {
        !challenge.is_empty() && signature == challenge
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("refused by broker ({code}): {message}")]
    AuthRefused { code: RetCode, message: String },
    #[error("unexpected `{0}` packet during handshake")]
    UnexpectedPacket(&'static str),
    #[error("auth packet carries no challenge code")]
    MissingChallenge,
    #[error("connection closed during handshake")]
    ConnectionClosed,
    #[error("handshake timed out")]
    Timeout,
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Packet(#[from] PacketError),
}

pub fn generate_challenge() -> String {
    let bytes: [u8; CHALLENGE_LEN] = rand::random();
    hex::encode(bytes)
}

/// Stable per-identity name used for client bind paths.
pub fn peer_name(app: &str, runner: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(app.as_bytes());
    hasher.update(b"/");
    hasher.update(runner.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

/// Path a client binds before connecting: `<dir>/<peer_name>-<pid>`.
pub fn client_bind_path(dir: &Path, app: &str, runner: &str, pid: u32) -> PathBuf {
    dir.join(format!("{}-{:05}", peer_name(app, runner), pid))
}

/// Handles the client's answer to the challenge on the broker side.
///
/// On failure an `error` packet has already been queued for the peer, and the
/// caller is expected to evict the endpoint.
pub(crate) fn accept_answer(
    registry: &mut EndpointRegistry,
    authenticator: &dyn Authenticator,
    handle: Handle,
    packet: ClientPacket,
    server_host_name: &str,
) -> Result<EndpointName, ProtocolError> {
    let endpoint = registry
        .lookup_by_handle(handle)
        .ok_or(RegistryError::UnknownHandle(handle))?;

    let kind = packet.kind();
    let ClientPacket::Auth {
        protocol_name,
        protocol_version,
        app_name,
        runner_name,
        signature,
        ..
    } = packet
    else {
        endpoint.send_packet(&ServerPacket::error(
            RetCode::UNAUTHORIZED,
            format!("expected auth packet, got `{kind}`"),
        ));
        return Err(ProtocolError::Unauthenticated);
    };

    if protocol_name != PROTOCOL_NAME || protocol_version < PROTOCOL_VERSION {
        let message = format!("unsupported protocol {protocol_name} v{protocol_version}");
        endpoint.send_packet(&ServerPacket::error(RetCode::NOT_ACCEPTABLE, &message));
        return Err(ProtocolError::AuthFailed(message));
    }

    let host = match endpoint.transport() {
        Transport::Web(client) => client.host_name(),
        Transport::Unix(_) | Transport::Builtin => LOCALHOST.to_string(),
    };
    let name = match EndpointName::new(host, &app_name, &runner_name) {
        Ok(name) => name,
        Err(e) => {
            endpoint.send_packet(&ServerPacket::error(RetCode::BAD_REQUEST, e.to_string()));
            return Err(ProtocolError::AuthFailed(e.to_string()));
        }
    };

    let challenge = endpoint.challenge_code().unwrap_or_default();
    if !authenticator.verify(challenge, &app_name, &runner_name, &signature) {
        endpoint.send_packet(&ServerPacket::error(
            RetCode::UNAUTHORIZED,
            "signature verification failed",
        ));
        return Err(ProtocolError::AuthFailed(format!("bad signature from {name}")));
    }

    if let Err(e) = registry.bind_identity(handle, name.clone()) {
        if let Some(endpoint) = registry.lookup_by_handle(handle) {
            let code = match e {
                RegistryError::DuplicateIdentity(_) => RetCode::CONFLICT,
                _ => RetCode::INTERNAL_SERVER_ERROR,
            };
            endpoint.send_packet(&ServerPacket::error(code, e.to_string()));
        }
        return Err(e.into());
    }

    let endpoint = registry
        .lookup_by_handle_mut(handle)
        .ok_or(RegistryError::UnknownHandle(handle))?;
    endpoint.mark_authenticated();
    endpoint.send_packet(&ServerPacket::AuthPassed {
        server_host_name: server_host_name.to_string(),
        reassigned_host_name: name.host().to_string(),
    });
    Ok(name)
}

/// Reads the broker's opening packet and returns the challenge.
pub async fn read_challenge<R>(reader: &mut FramedRead<R, FrameCodec>) -> Result<String, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    match next_packet(reader).await? {
        ServerPacket::Auth { challenge_code, .. } if challenge_code.is_empty() => {
            Err(HandshakeError::MissingChallenge)
        }
        ServerPacket::Auth { challenge_code, .. } => Ok(challenge_code),
        ServerPacket::Error {
            ret_code, ret_msg, ..
        } => Err(HandshakeError::AuthRefused {
            code: ret_code,
            message: ret_msg,
        }),
        other => Err(HandshakeError::UnexpectedPacket(other.kind())),
    }
}

/// Waits for the verdict on our answer; returns `(server_host, own_host)`.
pub async fn read_verdict<R>(
    reader: &mut FramedRead<R, FrameCodec>,
) -> Result<(String, String), HandshakeError>
where
    R: AsyncRead + Unpin,
{
    match next_packet(reader).await? {
        ServerPacket::AuthPassed {
            server_host_name,
            reassigned_host_name,
        } => Ok((server_host_name, reassigned_host_name)),
        ServerPacket::Error {
            ret_code, ret_msg, ..
        } => Err(HandshakeError::AuthRefused {
            code: ret_code,
            message: ret_msg,
        }),
        other => Err(HandshakeError::UnexpectedPacket(other.kind())),
    }
}

async fn next_packet<R>(reader: &mut FramedRead<R, FrameCodec>) -> Result<ServerPacket, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = match reader.next().await {
            Some(frame) => frame?,
            None => return Err(HandshakeError::ConnectionClosed),
        };
        match frame.opcode() {
            Opcode::Text => return Ok(frame.packet()?),
            Opcode::Close => return Err(HandshakeError::ConnectionClosed),
            Opcode::Ping | Opcode::Pong => continue,
            Opcode::Bin => return Err(PacketError::NotText(Opcode::Bin).into()),
        }
    }
}
