//! Authentication rewrite for deterministic replay
//!
//! SCRAM exchanges carry a fresh nonce and salt per session, so a recorded
//! SCRAM conversation can never match a live client. Before replay every
//! generic mock is rewritten to a fixed MD5 password exchange instead.

use rewind_core::{Mock, MockSpec};
use tracing::debug;

use crate::protocol::auth::detect_scram;
use crate::protocol::postgres::{decode_payload, is_startup_packet, FrontendMessageType};

/// AuthenticationMD5Password request with a fixed salt
pub const MD5_AUTH_REQUEST: &str = "UgAAAAwAAAAF4I8BHg==";

/// PasswordMessage answering [`MD5_AUTH_REQUEST`]
pub const MD5_PASSWORD_MESSAGE: &str = "cAAAAChtZDUzNTc3MWY3N2YxMDA4YmEzMDRkYjlkMmJmODM3YmZlOQA=";

/// AuthenticationOk followed by the server's parameter status, backend key
/// data and ReadyForQuery
pub const MD5_AUTH_OK_RESPONSE: &str = "UgAAAAgAAAAAUwAAABZhcHBsaWNhdGlvbl9uYW1lAABTAAAAGWNsaWVudF9lbmNvZGluZwBVVEY4AFMAAAAXRGF0ZVN0eWxlAElTTywgTURZAFMAAAAZaW50ZWdlcl9kYXRldGltZXMAb24AUwAAABtJbnRlcnZhbFN0eWxlAHBvc3RncmVzAFMAAAAUaXNfc3VwZXJ1c2VyAG9uAFMAAAAZc2VydmVyX2VuY29kaW5nAFVURjgAUwAAADJzZXJ2ZXJfdmVyc2lvbgAxMy41IChEZWJpYW4gMTMuNS0xLnBnZGcxMTArMSkAUwAAACNzZXNzaW9uX2F1dGhvcml6YXRpb24AcG9zdGdyZXMAUwAAACNzdGFuZGFyZF9jb25mb3JtaW5nX3N0cmluZ3MAb24AUwAAABVUaW1lWm9uZQBFdGMvVVRDAEsAAAAMAAAAX09sZl9aAAAABUk=";

/// Rewrite authentication steps of every generic mock to the fixed MD5
/// exchange. Returns the number of request/response pairs touched.
///
/// Applying it twice gives the same result as applying it once.
pub fn normalize_auth_for_replay(mocks: &mut [Mock]) -> usize {
    let mut rewritten = 0;

    for mock in mocks.iter_mut() {
        let MockSpec::Generic {
            requests,
            responses,
        } = &mut mock.spec
        else {
            continue;
        };

        for (index, request) in requests.iter_mut().enumerate() {
            let Some(response) = responses.get_mut(index) else {
                break;
            };

            let decoded = match request.first_data().map(decode_payload) {
                Some(Ok(decoded)) if !decoded.is_empty() => decoded,
                _ => continue,
            };

            // A password step always ends as PasswordMessage + AuthenticationOk,
            // whatever the server answered, so a second pass changes nothing
            if decoded[0] == FrontendMessageType::Password.tag() {
                debug!(mock = %mock.name, index, "Rewriting password exchange to MD5");
                request.set_first_data(MD5_PASSWORD_MESSAGE);
                response.set_first_data(MD5_AUTH_OK_RESPONSE);
                rewritten += 1;
                continue;
            }

            let response_is_scram = response.first_data().map(detect_scram).unwrap_or(false);

            if is_startup_packet(&decoded) || response_is_scram {
                debug!(mock = %mock.name, index, "Rewriting auth response to MD5");
                response.set_first_data(MD5_AUTH_REQUEST);
                rewritten += 1;
            }
        }
    }

    rewritten
}
