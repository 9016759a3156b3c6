//! PostgreSQL authentication negotiation
//!
//! Decodes the body of an `R` (Authentication) backend message. Replay only
//! needs to know which mechanism the server asked for, and whether a
//! recorded exchange is SCRAM, since SCRAM nonces make those exchanges
//! impossible to replay verbatim.

use std::fmt;

use tracing::{debug, error};

use super::postgres::{decode_payload, read_u32, BackendMessageType};
use super::DecodeError;

/// Marker that identifies a SCRAM mechanism list
const SCRAM_MARKER: &str = "SCRAM-SHA";

/// Authentication request sent by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthType {
    Ok,
    CleartextPassword,
    Md5Password,
    ScmCreds,
    Gss,
    GssContinue,
    Sspi,
    Sasl,
    SaslContinue,
    SaslFinal,
}

impl AuthType {
    /// Map a wire code to an auth type
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(AuthType::Ok),
            3 => Some(AuthType::CleartextPassword),
            5 => Some(AuthType::Md5Password),
            6 => Some(AuthType::ScmCreds),
            7 => Some(AuthType::Gss),
            8 => Some(AuthType::GssContinue),
            9 => Some(AuthType::Sspi),
            10 => Some(AuthType::Sasl),
            11 => Some(AuthType::SaslContinue),
            12 => Some(AuthType::SaslFinal),
            _ => None,
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            AuthType::Ok => 0,
            AuthType::CleartextPassword => 3,
            AuthType::Md5Password => 5,
            AuthType::ScmCreds => 6,
            AuthType::Gss => 7,
            AuthType::GssContinue => 8,
            AuthType::Sspi => 9,
            AuthType::Sasl => 10,
            AuthType::SaslContinue => 11,
            AuthType::SaslFinal => 12,
        }
    }
}

impl fmt::Display for AuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuthType::Ok => "AuthenticationOk",
            AuthType::CleartextPassword => "AuthenticationCleartextPassword",
            AuthType::Md5Password => "AuthenticationMD5Password",
            AuthType::ScmCreds => "AuthenticationSCMCredential",
            AuthType::Gss => "AuthenticationGSS",
            AuthType::GssContinue => "AuthenticationGSSContinue",
            AuthType::Sspi => "AuthenticationSSPI",
            AuthType::Sasl => "AuthenticationSASL",
            AuthType::SaslContinue => "AuthenticationSASLContinue",
            AuthType::SaslFinal => "AuthenticationSASLFinal",
        };
        write!(f, "{}", name)
    }
}

/// A decoded authentication request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticationMessage {
    pub auth_type: AuthType,
    /// Offered mechanisms, only populated for SASL
    pub mechanisms: Vec<String>,
}

/// Decode the auth type code at the start of an authentication body
///
/// For SASL the mechanism list is decoded as well.
pub fn decode_authentication_type(payload: &[u8]) -> Result<AuthenticationMessage, DecodeError> {
    if payload.len() < 4 {
        return Err(DecodeError::ShortAuthMessage);
    }

    let code = read_u32(payload, 0);
    let auth_type = AuthType::from_code(code).ok_or(DecodeError::UnknownAuthType(code))?;
    debug!(auth_type = %auth_type, "Decoded authentication request");

    match auth_type {
        AuthType::ScmCreds | AuthType::Sspi => Err(DecodeError::Unimplemented(auth_type)),
        AuthType::Sasl => Ok(AuthenticationMessage {
            auth_type,
            mechanisms: decode_sasl_mechanisms(payload)?,
        }),
        _ => Ok(AuthenticationMessage {
            auth_type,
            mechanisms: Vec::new(),
        }),
    }
}

/// Decode the NUL-terminated mechanism names of an AuthenticationSASL body
pub fn decode_sasl_mechanisms(payload: &[u8]) -> Result<Vec<String>, DecodeError> {
    if payload.len() < 4 {
        return Err(DecodeError::ShortAuthMessage);
    }

    let code = read_u32(payload, 0);
    if code != AuthType::Sasl.code() {
        return Err(DecodeError::BadAuthType(code));
    }

    let mut mechanisms = Vec::new();
    let mut rest = &payload[4..];

    while rest.len() >= 2 {
        match rest.iter().position(|&b| b == 0) {
            // Empty name is the list terminator
            Some(0) => break,
            Some(idx) => {
                mechanisms.push(String::from_utf8_lossy(&rest[..idx]).into_owned());
                rest = &rest[idx + 1..];
            }
            None => {
                mechanisms.push(String::from_utf8_lossy(rest).into_owned());
                break;
            }
        }
    }

    Ok(mechanisms)
}

/// Whether a base64-encoded backend message is a SCRAM authentication request
pub fn detect_scram(encoded: &str) -> bool {
    let packet = match decode_payload(encoded) {
        Ok(packet) => packet,
        Err(e) => {
            error!(error = %e, "Failed to decode packet while checking for SCRAM");
            return false;
        }
    };

    if packet.len() < 5 {
        return false;
    }

    let tag = packet[0];
    if tag == BackendMessageType::NoticeResponse.tag() {
        return false;
    }
    if tag != BackendMessageType::Authentication.tag() {
        return false;
    }

    let body = &packet[5..];
    if let Err(e) = decode_authentication_type(body) {
        error!(error = %e, "Failed to decode authentication request");
        return false;
    }

    String::from_utf8_lossy(body).contains(SCRAM_MARKER)
}
