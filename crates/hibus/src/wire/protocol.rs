//! JSON packets carried in TEXT frames.
//!
//! Every packet is an object discriminated by `packageType`. Packets the broker
//! sends are [`ServerPacket`]s; packets clients send are [`ClientPacket`]s.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::codec::{Frame, Opcode};

pub const PROTOCOL_NAME: &str = "HIBUS";
pub const PROTOCOL_VERSION: u32 = 90;

/// Status code carried in `error` and `result` packets (HTTP-like).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RetCode(pub u16);

impl RetCode {
    pub const OK: Self = Self(200);
    pub const ACCEPTED: Self = Self(202);
    pub const BAD_REQUEST: Self = Self(400);
    pub const UNAUTHORIZED: Self = Self(401);
    pub const NOT_FOUND: Self = Self(404);
    pub const NOT_ACCEPTABLE: Self = Self(406);
    pub const REQUEST_TIMEOUT: Self = Self(408);
    pub const CONFLICT: Self = Self(409);
    pub const PACKET_TOO_LARGE: Self = Self(413);
    pub const INTERNAL_SERVER_ERROR: Self = Self(500);
    pub const NOT_IMPLEMENTED: Self = Self(501);
    pub const BAD_CALLEE: Self = Self(502);
    pub const SERVICE_UNAVAILABLE: Self = Self(503);
    pub const CALLEE_TIMEOUT: Self = Self(504);

    pub fn message(self) -> &'static str {
        match self.0 {
            200 => "Ok",
            202 => "Accepted",
            400 => "Bad Request",
            401 => "Unauthorized",
            404 => "Not Found",
            406 => "Not Acceptable",
            408 => "Request Timeout",
            409 => "Conflict",
            413 => "Packet Too Large",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            502 => "Bad Callee",
            503 => "Service Unavailable",
            504 => "Callee Timeout",
            _ => "Unknown",
        }
    }

    pub fn is_success(self) -> bool {
        (200..300).contains(&self.0)
    }
}

impl fmt::Display for RetCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.0, self.message())
    }
}

/// Broker-assigned identifier of one forwarded call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(uuid::Uuid);

impl CallId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(uuid::Uuid::parse_str(s)?))
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Packets sent by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "packageType",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerPacket {
    /// First packet on every connection.
    Auth {
        protocol_name: String,
        protocol_version: u32,
        #[serde(default)]
        challenge_code: String,
    },

    AuthPassed {
        server_host_name: String,
        reassigned_host_name: String,
    },

    Error {
        ret_code: RetCode,
        ret_msg: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        extra_info: Option<String>,
    },

    /// A call forwarded to the callee.
    Call {
        call_id: CallId,
        from_endpoint: String,
        to_method: String,
        timeout_ms: u64,
        #[serde(default)]
        parameter: Value,
    },

    /// A callee's answer delivered to the caller.
    Result {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<CallId>,
        from_endpoint: String,
        from_method: String,
        ret_code: RetCode,
        ret_msg: String,
        /// Seconds between forwarding the call and receiving the result.
        time_consumed: f64,
        #[serde(default)]
        ret_value: Value,
    },

    Event {
        event_id: String,
        from_endpoint: String,
        bubble_name: String,
        #[serde(default)]
        bubble_data: Value,
    },

    EventSent {
        event_id: String,
        nr_subscribers: usize,
    },
}

impl ServerPacket {
    pub fn auth(challenge_code: impl Into<String>) -> Self {
        Self::Auth {
            protocol_name: PROTOCOL_NAME.to_string(),
            protocol_version: PROTOCOL_VERSION,
            challenge_code: challenge_code.into(),
        }
    }

    pub fn error(ret_code: RetCode, ret_msg: impl Into<String>) -> Self {
        Self::Error {
            ret_code,
            ret_msg: ret_msg.into(),
            request_id: None,
            extra_info: None,
        }
    }

    pub fn error_for(
        ret_code: RetCode,
        ret_msg: impl Into<String>,
        request_id: impl Into<String>,
    ) -> Self {
        Self::Error {
            ret_code,
            ret_msg: ret_msg.into(),
            request_id: Some(request_id.into()),
            extra_info: None,
        }
    }

    /// The `packageType` discriminator.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "auth",
            Self::AuthPassed { .. } => "authPassed",
            Self::Error { .. } => "error",
            Self::Call { .. } => "call",
            Self::Result { .. } => "result",
            Self::Event { .. } => "event",
            Self::EventSent { .. } => "eventSent",
        }
    }
}

/// Packets sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "packageType",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientPacket {
    /// Answer to the broker's challenge.
    Auth {
        protocol_name: String,
        protocol_version: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        host_name: Option<String>,
        app_name: String,
        runner_name: String,
        signature: String,
    },

    Call {
        request_id: String,
        to_endpoint: String,
        to_method: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
        #[serde(default)]
        parameter: Value,
    },

    Result {
        call_id: CallId,
        ret_code: RetCode,
        #[serde(default)]
        ret_msg: String,
        #[serde(default)]
        ret_value: Value,
    },

    Event {
        event_id: String,
        bubble_name: String,
        #[serde(default)]
        bubble_data: Value,
    },
}

impl ClientPacket {
    pub fn auth(
        app_name: impl Into<String>,
        runner_name: impl Into<String>,
        signature: impl Into<String>,
    ) -> Self {
        Self::Auth {
            protocol_name: PROTOCOL_NAME.to_string(),
            protocol_version: PROTOCOL_VERSION,
            host_name: None,
            app_name: app_name.into(),
            runner_name: runner_name.into(),
            signature: signature.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "auth",
            Self::Call { .. } => "call",
            Self::Result { .. } => "result",
            Self::Event { .. } => "event",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("expected a TEXT frame, got {0:?}")]
    NotText(Opcode),
    #[error("packet is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("invalid packet: {0}")]
    Json(#[from] serde_json::Error),
}

impl Frame {
    /// Serializes a packet into a TEXT frame.
    pub fn from_packet<T: Serialize>(packet: &T) -> Result<Self, PacketError> {
        Ok(Frame::text(serde_json::to_string(packet)?))
    }

    /// Parses the payload of a TEXT frame as a packet.
    pub fn packet<T: DeserializeOwned>(&self) -> Result<T, PacketError> {
        if self.opcode() != Opcode::Text {
            return Err(PacketError::NotText(self.opcode()));
        }
        let text = std::str::from_utf8(self.payload())?;
        Ok(serde_json::from_str(text)?)
    }
}
