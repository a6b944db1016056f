//! Wire format for broker/client communication.
//!
//! # Architecture
//!
//! - **codec**: fixed-header frames over any AsyncRead/AsyncWrite
//! - **protocol**: JSON packets carried inside TEXT frames
//! - **name**: endpoint names (`@host/app/runner`) and method/bubble names

pub mod codec;
pub mod name;
pub mod protocol;

pub use codec::{DEFAULT_MAX_FRAME_SIZE, Frame, FrameCodec, FrameError, HEADER_LEN, Opcode};
pub use name::{EndpointName, NameError};
pub use protocol::{CallId, ClientPacket, PacketError, RetCode, ServerPacket};
