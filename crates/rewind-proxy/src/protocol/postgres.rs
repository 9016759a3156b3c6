//! PostgreSQL Wire Protocol Framing
//!
//! Just enough of the PostgreSQL wire protocol (v3.0) to find message
//! boundaries in captured byte streams and to classify the frames that
//! matter for replay.
//!
//! ## Protocol Overview
//!
//! PostgreSQL uses a message-based protocol where each message has:
//! - For startup: length (4 bytes) + protocol version + parameters
//! - For regular messages: type (1 byte) + length (4 bytes) + payload
//!
//! The server answers an SSL request with a single unframed byte
//! (`S` or `N`), which the backend splitter accounts for.
//!
//! ## References
//! - https://www.postgresql.org/docs/current/protocol-message-formats.html

use super::DecodeError;
use base64::{engine::general_purpose::STANDARD, Engine};

/// PostgreSQL protocol version 3.0 as a 32-bit integer
pub const PROTOCOL_VERSION_3: u32 = 0x0003_0000;

/// SSL request code
pub const SSL_REQUEST_CODE: u32 = 80877103;

/// GSSAPI encryption request code
pub const GSSENC_REQUEST_CODE: u32 = 80877104;

/// Cancel request code
pub const CANCEL_REQUEST_CODE: u32 = 80877102;

/// Maximum reasonable message size (256 MB)
const MAX_MESSAGE_SIZE: u32 = 256 * 1024 * 1024;

/// PostgreSQL frontend (client) message types the engine cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrontendMessageType {
    /// Close a prepared statement or portal
    Close = b'C',
    /// Describe a prepared statement or portal
    Describe = b'D',
    /// Execute a bound portal
    Execute = b'E',
    /// Parse a query into a prepared statement
    Parse = b'P',
    /// Simple query
    Query = b'Q',
    /// Password message (during authentication)
    Password = b'p',
}

impl FrontendMessageType {
    pub const fn tag(self) -> u8 {
        self as u8
    }
}

/// PostgreSQL backend (server) message types the engine cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BackendMessageType {
    /// Authentication request
    Authentication = b'R',
    /// Notice response
    NoticeResponse = b'N',
    /// Ready for query
    ReadyForQuery = b'Z',
}

impl BackendMessageType {
    pub const fn tag(self) -> u8 {
        self as u8
    }
}

/// Coarse classification of a packet, see [`identify_packet`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet<'a> {
    /// Startup message announcing protocol version 3.0
    Startup { length: u32, protocol_version: u32 },
    /// Anything else: an identifier byte and its payload
    Regular {
        identifier: u8,
        length: u32,
        payload: &'a [u8],
    },
}

/// Classify a buffer as a startup packet or a regular packet.
///
/// The first four bytes are always read as the big-endian length. A
/// regular packet takes its identifier from byte 4 and its payload from the
/// `length` bytes that follow.
pub fn identify_packet(data: &[u8]) -> Result<Packet<'_>, DecodeError> {
    if data.len() < 4 {
        return Err(DecodeError::ShortBuffer { have: data.len() });
    }

    let length = read_u32(data, 0);

    if data.len() >= 8
        && length >= 8
        && data.len() >= length as usize
        && read_u32(data, 4) == PROTOCOL_VERSION_3
    {
        return Ok(Packet::Startup {
            length,
            protocol_version: PROTOCOL_VERSION_3,
        });
    }

    let end = 5usize.saturating_add(length as usize);
    if data.len() >= 5 && data.len() >= end {
        return Ok(Packet::Regular {
            identifier: data[4],
            length,
            payload: &data[5..end],
        });
    }

    Err(DecodeError::UnknownOrShortPacket)
}

/// Whether the buffer carries the v3.0 protocol version at offset 4
pub fn is_startup_packet(data: &[u8]) -> bool {
    data.len() >= 8 && read_u32(data, 4) == PROTOCOL_VERSION_3
}

/// Whether the buffer starts with a query-cycle message tag
pub fn is_regular_packet(data: &[u8]) -> bool {
    const QUERY_CYCLE: [FrontendMessageType; 5] = [
        FrontendMessageType::Query,
        FrontendMessageType::Parse,
        FrontendMessageType::Describe,
        FrontendMessageType::Close,
        FrontendMessageType::Execute,
    ];

    match data.first() {
        Some(&tag) => QUERY_CYCLE.iter().any(|t| t.tag() == tag),
        None => false,
    }
}

/// Check if the given bytes look like PostgreSQL protocol
pub fn is_postgres_protocol(data: &[u8]) -> bool {
    if data.len() < 8 {
        return false;
    }

    // Startup message has format: length (4) + protocol version (4) + params
    let length = read_u32(data, 0);
    if (8..MAX_MESSAGE_SIZE).contains(&length) {
        let code = read_u32(data, 4);
        if matches!(
            code,
            PROTOCOL_VERSION_3 | SSL_REQUEST_CODE | GSSENC_REQUEST_CODE | CANCEL_REQUEST_CODE
        ) {
            return true;
        }
    }

    // Regular message format: type (1) + length (4) + payload
    let msg_type = data[0];
    let msg_length = read_u32(data, 1);

    if (4..MAX_MESSAGE_SIZE).contains(&msg_length) {
        matches!(
            msg_type,
            b'Q' | b'P' | b'B' | b'E' | b'D' | b'C' | b'H' | b'S' | b'X' | b'p'
        )
    } else {
        false
    }
}

/// A message as it appears on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame<'a> {
    /// Startup message sent at connection start
    Startup {
        protocol_version: u32,
        parameters: Vec<(String, String)>,
    },
    /// SSL negotiation request
    SslRequest,
    /// GSSAPI encryption request
    GssEncRequest,
    /// Cancel request
    CancelRequest { pid: u32, secret_key: u32 },
    /// Single-byte answer to an SSL request (`S` or `N`)
    SslResponse(u8),
    /// Tagged message
    Regular { tag: u8, body: &'a [u8] },
}

impl Frame<'_> {
    /// Whether a backend frame ends the server's turn in the conversation
    ///
    /// The server hands control back to the client with ReadyForQuery, with
    /// any authentication request other than AuthenticationOk, and with the
    /// SSL negotiation byte.
    pub fn ends_backend_turn(&self) -> bool {
        match self {
            Frame::SslResponse(_) => true,
            Frame::Regular { tag, .. } if *tag == BackendMessageType::ReadyForQuery.tag() => true,
            Frame::Regular { tag, body } if *tag == BackendMessageType::Authentication.tag() => {
                body.len() >= 4 && read_u32(body, 0) != 0
            }
            _ => false,
        }
    }
}

/// Parse one frame sent by a client
///
/// Returns the frame and the number of bytes consumed.
pub fn parse_frontend_frame(data: &[u8]) -> Result<(Frame<'_>, usize), DecodeError> {
    match data.first() {
        None => Err(DecodeError::Incomplete { needed: 1 }),
        // Untagged startup-phase messages begin with a length far below 2^24
        Some(0) => parse_startup_frame(data),
        Some(_) => parse_regular_frame(data),
    }
}

/// Parse one frame sent by a server
///
/// `expect_ssl_response` is set when the client's previous message was an
/// SSL request, in which case a leading `S`/`N` is the one-byte answer.
pub fn parse_backend_frame(
    data: &[u8],
    expect_ssl_response: bool,
) -> Result<(Frame<'_>, usize), DecodeError> {
    match data.first() {
        None => Err(DecodeError::Incomplete { needed: 1 }),
        Some(&b) if expect_ssl_response && (b == b'S' || b == b'N') => {
            Ok((Frame::SslResponse(b), 1))
        }
        Some(_) => parse_regular_frame(data),
    }
}

/// Split a client buffer into raw frames
pub fn split_frontend(data: &[u8]) -> Result<Vec<&[u8]>, DecodeError> {
    let mut frames = Vec::new();
    let mut offset = 0;

    while offset < data.len() {
        let (_, consumed) = parse_frontend_frame(&data[offset..])?;
        frames.push(&data[offset..offset + consumed]);
        offset += consumed;
    }

    Ok(frames)
}

/// Split a server buffer into raw frames
pub fn split_backend(data: &[u8], expect_ssl_response: bool) -> Result<Vec<&[u8]>, DecodeError> {
    let mut frames = Vec::new();
    let mut offset = 0;
    let mut expect_ssl = expect_ssl_response;

    while offset < data.len() {
        let (_, consumed) = parse_backend_frame(&data[offset..], expect_ssl)?;
        frames.push(&data[offset..offset + consumed]);
        offset += consumed;
        expect_ssl = false;
    }

    Ok(frames)
}

fn parse_startup_frame(data: &[u8]) -> Result<(Frame<'_>, usize), DecodeError> {
    if data.len() < 8 {
        return Err(DecodeError::Incomplete {
            needed: 8 - data.len(),
        });
    }

    let length = read_u32(data, 0);
    if !(8..MAX_MESSAGE_SIZE).contains(&length) {
        return Err(DecodeError::InvalidLength(length));
    }

    let length = length as usize;
    if data.len() < length {
        return Err(DecodeError::Incomplete {
            needed: length - data.len(),
        });
    }

    let code = read_u32(data, 4);
    let frame = match code {
        SSL_REQUEST_CODE => Frame::SslRequest,
        GSSENC_REQUEST_CODE => Frame::GssEncRequest,
        CANCEL_REQUEST_CODE => {
            if length < 16 {
                return Err(DecodeError::InvalidLength(length as u32));
            }
            Frame::CancelRequest {
                pid: read_u32(data, 8),
                secret_key: read_u32(data, 12),
            }
        }
        PROTOCOL_VERSION_3 => Frame::Startup {
            protocol_version: code,
            parameters: parse_startup_parameters(&data[8..length])?,
        },
        other => return Err(DecodeError::UnknownStartupCode(other)),
    };

    Ok((frame, length))
}

fn parse_regular_frame(data: &[u8]) -> Result<(Frame<'_>, usize), DecodeError> {
    if data.len() < 5 {
        return Err(DecodeError::Incomplete {
            needed: 5 - data.len(),
        });
    }

    let tag = data[0];
    let length = read_u32(data, 1);

    if !(4..MAX_MESSAGE_SIZE).contains(&length) {
        return Err(DecodeError::InvalidLength(length));
    }

    // type byte + length field value
    let total_length = length as usize + 1;
    if data.len() < total_length {
        return Err(DecodeError::Incomplete {
            needed: total_length - data.len(),
        });
    }

    Ok((
        Frame::Regular {
            tag,
            body: &data[5..total_length],
        },
        total_length,
    ))
}

/// Null-terminated key/value pairs, ended by an empty key
fn parse_startup_parameters(body: &[u8]) -> Result<Vec<(String, String)>, DecodeError> {
    let mut parameters = Vec::new();
    let mut fields = body.split(|&b| b == 0);

    while let Some(key) = fields.next() {
        if key.is_empty() {
            break;
        }
        let value = fields.next().unwrap_or(&[]);
        parameters.push((utf8(key)?, utf8(value)?));
    }

    Ok(parameters)
}

fn utf8(bytes: &[u8]) -> Result<String, DecodeError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8)
}

/// Read a big-endian u32; the caller guarantees `offset + 4 <= data.len()`
pub(crate) fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// Encode a raw message as standard base64
pub fn encode_payload(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Decode a standard base64 payload back into raw bytes
pub fn decode_payload(encoded: &str) -> Result<Vec<u8>, DecodeError> {
    Ok(STANDARD.decode(encoded)?)
}
