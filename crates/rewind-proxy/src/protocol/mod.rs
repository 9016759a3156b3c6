//! Protocol Detection and Decoding for Rewind
//!
//! This module classifies and frames the raw bytes captured on a
//! connection:
//!
//! - PostgreSQL (wire protocol v3.0), including authentication negotiation
//! - HTTP/1.x requests and responses
//!
//! ## Detection Strategy
//!
//! The first bytes the monitored peer receives decide the protocol:
//!
//! - HTTP/1.x: starts with a method token (`GET `, `POST `, ...)
//! - PostgreSQL: starts with length (4 bytes) + protocol version or a
//!   known frontend message type

pub mod auth;
pub mod http;
pub mod postgres;

pub use auth::AuthType;

use std::fmt;

/// Errors raised while decoding captured bytes
///
/// All of these are local to one packet or one connection; callers log
/// them and drop the affected data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("buffer too short: need at least 4 bytes, have {have}")]
    ShortBuffer { have: usize },

    #[error("unknown packet type or data too short for declared length")]
    UnknownOrShortPacket,

    #[error("authentication message too short")]
    ShortAuthMessage,

    #[error("unknown authentication type: {0}")]
    UnknownAuthType(u32),

    #[error("{0} is unimplemented")]
    Unimplemented(AuthType),

    #[error("bad auth type: expected SASL, got {0}")]
    BadAuthType(u32),

    #[error("invalid message length: {0}")]
    InvalidLength(u32),

    #[error("unknown startup code: 0x{0:08x}")]
    UnknownStartupCode(u32),

    #[error("incomplete message, need {needed} more bytes")]
    Incomplete { needed: usize },

    #[error("invalid UTF-8 in message")]
    InvalidUtf8,

    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("HTTP parse error: {0}")]
    Http(String),
}

impl DecodeError {
    /// Whether more bytes could turn this error into a successful decode
    pub fn is_incomplete(&self) -> bool {
        matches!(
            self,
            DecodeError::Incomplete { .. }
                | DecodeError::ShortBuffer { .. }
                | DecodeError::UnknownOrShortPacket
        )
    }
}

/// Detected protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// PostgreSQL wire protocol (v3.0)
    PostgreSQL,
    /// HTTP/1.0 or HTTP/1.1
    Http1,
    /// Unknown/unrecognized protocol
    Unknown,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::PostgreSQL => write!(f, "PostgreSQL"),
            Protocol::Http1 => write!(f, "HTTP/1.x"),
            Protocol::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Detect the protocol from the first bytes a client sent
///
/// HTTP is recognised from its method token, so it only needs a few bytes.
/// PostgreSQL needs at least 8 bytes; anything shorter is `Unknown`.
pub fn detect_protocol(data: &[u8]) -> Protocol {
    if http::is_http1_request(data) {
        return Protocol::Http1;
    }

    if postgres::is_postgres_protocol(data) {
        return Protocol::PostgreSQL;
    }

    Protocol::Unknown
}
