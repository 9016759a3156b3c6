//! HTTP/1.x request and response parsing
//!
//! Turns the raw bytes of a captured exchange into [`HttpReq`] and
//! [`HttpResp`]. Headers are parsed with `httparse`; bodies are framed by
//! Content-Length or chunked transfer encoding.

use std::str::FromStr;

use rewind_core::{HttpHeader, HttpMethod, HttpReq, HttpResp};

use super::DecodeError;

/// Maximum number of headers accepted in one message
const MAX_HEADERS: usize = 64;

/// Check if data starts with an HTTP/1.x request
pub fn is_http1_request(data: &[u8]) -> bool {
    const METHODS: [&[u8]; 9] = [
        b"GET ",
        b"POST ",
        b"PUT ",
        b"DELETE ",
        b"HEAD ",
        b"OPTIONS ",
        b"PATCH ",
        b"CONNECT ",
        b"TRACE ",
    ];
    METHODS.iter().any(|m| data.starts_with(m))
}

/// Try to parse a complete HTTP/1.x request.
///
/// `Ok(None)` means more bytes are needed. An error means the request head
/// can never parse, whatever follows.
pub fn try_parse_request(data: &[u8]) -> Result<Option<HttpReq>, DecodeError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    let body_offset = match req.parse(data) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(DecodeError::Http(e.to_string())),
    };

    let body = match determine_body(req.headers, &data[body_offset..], None)? {
        Some(body) => body,
        None => return Ok(None),
    };

    let method_token = req.method.unwrap_or_default();
    let method = HttpMethod::from_str(method_token).map_err(DecodeError::Http)?;
    let target = req.path.unwrap_or("/");
    let headers = collect_headers(req.headers);

    let url = match find_header(&headers, "Host") {
        Some(host) if target.starts_with('/') => format!("http://{}{}", host, target),
        _ => target.to_string(),
    };
    let url_params = query_params(&url);

    Ok(Some(HttpReq {
        method,
        proto_major: 1,
        proto_minor: req.version.unwrap_or(1),
        url,
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
        url_params,
    }))
}

/// Try to parse a complete HTTP/1.x response.
///
/// Responses without Content-Length or chunked framing run until the
/// connection closes, so they stay incomplete here; see [`parse_response`].
pub fn try_parse_response(data: &[u8]) -> Result<Option<HttpResp>, DecodeError> {
    parse_response_inner(data, false)
}

/// Parse a request that is expected to be complete
pub fn parse_request(data: &[u8]) -> Result<HttpReq, DecodeError> {
    try_parse_request(data)?.ok_or_else(|| DecodeError::Http("incomplete request".to_string()))
}

/// Parse a response that is expected to be complete
///
/// A body-bearing response without explicit framing takes every remaining
/// byte as its body.
pub fn parse_response(data: &[u8]) -> Result<HttpResp, DecodeError> {
    parse_response_inner(data, true)?
        .ok_or_else(|| DecodeError::Http("incomplete response".to_string()))
}

fn parse_response_inner(data: &[u8], until_close: bool) -> Result<Option<HttpResp>, DecodeError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut res = httparse::Response::new(&mut headers);

    let body_offset = match res.parse(data) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(DecodeError::Http(e.to_string())),
    };

    let status_code = res.code.unwrap_or_default();
    let body_data = &data[body_offset..];
    let body = match determine_body(res.headers, body_data, Some(status_code))? {
        Some(body) => body,
        None if until_close && !has_framing(res.headers) => body_data.to_vec(),
        None => return Ok(None),
    };

    Ok(Some(HttpResp {
        status_code,
        headers: collect_headers(res.headers),
        body: String::from_utf8_lossy(&body).into_owned(),
    }))
}

/// Body of a message, `None` while incomplete
///
/// `response_status` is `None` for requests.
fn determine_body(
    headers: &[httparse::Header<'_>],
    body_data: &[u8],
    response_status: Option<u16>,
) -> Result<Option<Vec<u8>>, DecodeError> {
    if let Some(h) = headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("Content-Length"))
    {
        let content_length = std::str::from_utf8(h.value)
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .ok_or_else(|| DecodeError::Http("invalid Content-Length".to_string()))?;

        if body_data.len() >= content_length {
            return Ok(Some(body_data[..content_length].to_vec()));
        }
        return Ok(None);
    }

    if is_chunked(headers) {
        return decode_chunked_body(body_data);
    }

    match response_status {
        // Requests have no body by default
        None => Ok(Some(Vec::new())),
        // 1xx, 204 and 304 never carry a body
        Some(code) if (100..200).contains(&code) || code == 204 || code == 304 => {
            Ok(Some(Vec::new()))
        }
        Some(_) => Ok(None),
    }
}

fn is_chunked(headers: &[httparse::Header<'_>]) -> bool {
    headers.iter().any(|h| {
        h.name.eq_ignore_ascii_case("Transfer-Encoding")
            && std::str::from_utf8(h.value)
                .map(|v| v.to_ascii_lowercase().contains("chunked"))
                .unwrap_or(false)
    })
}

fn has_framing(headers: &[httparse::Header<'_>]) -> bool {
    is_chunked(headers)
        || headers
            .iter()
            .any(|h| h.name.eq_ignore_ascii_case("Content-Length"))
}

/// Walk chunk boundaries: `[hex-size][;ext]\r\n[data]\r\n` until `0\r\n\r\n`
fn decode_chunked_body(data: &[u8]) -> Result<Option<Vec<u8>>, DecodeError> {
    let mut decoded = Vec::new();
    let mut pos = 0;

    loop {
        let line_end = match find_crlf(data, pos) {
            Some(idx) => idx,
            None => return Ok(None),
        };

        let size_line = &data[pos..line_end];
        let size_part = match size_line.iter().position(|&b| b == b';') {
            Some(semi) => &size_line[..semi],
            None => size_line,
        };
        let chunk_size = std::str::from_utf8(size_part)
            .ok()
            .and_then(|s| usize::from_str_radix(s.trim(), 16).ok())
            .ok_or_else(|| DecodeError::Http("invalid chunk size".to_string()))?;

        pos = line_end + 2;

        if chunk_size == 0 {
            // Trailers, if any, end with an empty line
            if data.len() >= pos + 2 && data[pos..pos + 2] == *b"\r\n" {
                return Ok(Some(decoded));
            }
            return Ok(find_crlf_crlf(data, pos).map(|_| decoded));
        }

        let chunk_end = pos
            .checked_add(chunk_size)
            .and_then(|end| end.checked_add(2))
            .ok_or_else(|| DecodeError::Http("invalid chunk size".to_string()))?;
        if data.len() < chunk_end {
            return Ok(None);
        }
        decoded.extend_from_slice(&data[pos..pos + chunk_size]);
        pos += chunk_size;

        if data[pos..pos + 2] != *b"\r\n" {
            return Err(DecodeError::Http("missing CRLF after chunk".to_string()));
        }
        pos += 2;
    }
}

fn find_crlf(data: &[u8], from: usize) -> Option<usize> {
    data.get(from..)?
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|p| from + p)
}

fn find_crlf_crlf(data: &[u8], from: usize) -> Option<usize> {
    data.get(from..)?
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| from + p)
}

fn collect_headers(headers: &[httparse::Header<'_>]) -> Vec<HttpHeader> {
    headers
        .iter()
        .map(|h| HttpHeader {
            name: h.name.to_string(),
            value: String::from_utf8_lossy(h.value).into_owned(),
        })
        .collect()
}

fn find_header<'a>(headers: &'a [HttpHeader], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

fn query_params(url: &str) -> std::collections::BTreeMap<String, String> {
    url::Url::parse(url)
        .map(|u| {
            u.query_pairs()
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect()
        })
        .unwrap_or_default()
}
