//! Framed codec for the stream transport.
//!
//! A frame is an 8-byte header (little-endian `u32` opcode, little-endian `u32`
//! payload length) followed by exactly `payload_len` bytes. The header is
//! validated before anything is reserved, so a hostile length field can never
//! force an allocation above `max_frame_size`.

use std::io;

use tokio_util::bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

pub const HEADER_LEN: usize = 8;

pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Frame opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// UTF-8 JSON packet.
    Text,
    Bin,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0x01 => Some(Self::Text),
            0x02 => Some(Self::Bin),
            0x08 => Some(Self::Close),
            0x09 => Some(Self::Ping),
            0x0A => Some(Self::Pong),
            _ => None,
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            Self::Text => 0x01,
            Self::Bin => 0x02,
            Self::Close => 0x08,
            Self::Ping => 0x09,
            Self::Pong => 0x0A,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

/// One wire message. The payload length is always the payload's true size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    opcode: Opcode,
    payload: Bytes,
}

impl Frame {
    pub fn new(opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            payload: payload.into(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Opcode::Text, text.into())
    }

    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Ping, payload)
    }

    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Pong, payload)
    }

    /// Close frames carry a short human-readable reason.
    pub fn close(reason: &str) -> Self {
        let reason = if reason.is_empty() { "bye" } else { reason };
        Self::new(Opcode::Close, reason.to_string())
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("truncated payload: expected {expected} bytes, got {actual}")]
    TruncatedPayload { expected: usize, actual: usize },
    #[error("frame i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Codec for [`Frame`]s with a bounded payload size.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
    /// Header of a frame whose payload has not fully arrived yet.
    pending: Option<(Opcode, usize)>,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            pending: None,
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    fn check_len(&self, len: usize) -> Result<(), FrameError> {
        if len == 0 {
            return Err(FrameError::MalformedFrame("zero-length payload".to_string()));
        }
        if len > self.max_frame_size {
            return Err(FrameError::MalformedFrame(format!(
                "payload of {} bytes exceeds limit of {} bytes",
                len, self.max_frame_size
            )));
        }
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let (opcode, len) = match self.pending {
            Some(header) => header,
            None => {
                if src.len() < HEADER_LEN {
                    return Ok(None);
                }

                let mut header = &src[..HEADER_LEN];
                let raw_opcode = header.get_u32_le();
                let len = header.get_u32_le() as usize;

                let opcode = Opcode::from_u32(raw_opcode).ok_or_else(|| {
                    FrameError::MalformedFrame(format!("unknown opcode {:#x}", raw_opcode))
                })?;
                self.check_len(len)?;

                src.advance(HEADER_LEN);
                src.reserve(len.saturating_sub(src.len()));
                self.pending = Some((opcode, len));
                (opcode, len)
            }
        };

        if src.len() < len {
            return Ok(None);
        }

        self.pending = None;
        let payload = src.split_to(len).freeze();
        tracing::trace!(?opcode, payload_len = len, "Decoded frame");
        Ok(Some(Frame { opcode, payload }))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }

        match self.pending.take() {
            Some((_, expected)) => Err(FrameError::TruncatedPayload {
                expected,
                actual: buf.len(),
            }),
            None if buf.is_empty() => Ok(None),
            None => Err(FrameError::TruncatedPayload {
                expected: HEADER_LEN,
                actual: buf.len(),
            }),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = frame.payload.len();
        self.check_len(len)?;
        let len32 = u32::try_from(len)
            .map_err(|_| FrameError::MalformedFrame(format!("payload of {} bytes", len)))?;

        tracing::trace!(opcode = ?frame.opcode, payload_len = len, "Encoding frame");
        dst.reserve(HEADER_LEN + len);
        dst.put_u32_le(frame.opcode.as_u32());
        dst.put_u32_le(len32);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}
