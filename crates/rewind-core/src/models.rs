//! Recorded exchange models for Rewind
//!
//! These types represent traffic captured in record mode and the mocks
//! served back in test mode. Every payload that crosses the wire is kept as
//! standard base64 text so binary protocols survive serialization.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Current schema version written into mocks and test cases
pub const SCHEMA_VERSION: &str = "api.rewind.io/v1";

/// Operating mode of the capture/replay engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Completed exchanges are persisted as test cases
    Record,
    /// Requests are answered from the mock pool
    Test,
    /// Nothing has been selected yet
    #[default]
    Unset,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Record => write!(f, "record"),
            Mode::Test => write!(f, "test"),
            Mode::Unset => write!(f, "unset"),
        }
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "record" => Ok(Mode::Record),
            "test" => Ok(Mode::Test),
            "unset" | "" => Ok(Mode::Unset),
            other => Err(format!("unknown mode: {}", other)),
        }
    }
}

/// Kind of a recorded exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MockKind {
    /// HTTP/1.x request/response pair
    Http,
    /// Single Postgres request message and its response
    Postgres,
    /// Ordered sequence of raw request/response messages
    Generic,
}

impl fmt::Display for MockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MockKind::Http => write!(f, "Http"),
            MockKind::Postgres => write!(f, "Postgres"),
            MockKind::Generic => write!(f, "Generic"),
        }
    }
}

/// HTTP method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
    Connect,
    Trace,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpMethod::Get => write!(f, "GET"),
            HttpMethod::Post => write!(f, "POST"),
            HttpMethod::Put => write!(f, "PUT"),
            HttpMethod::Delete => write!(f, "DELETE"),
            HttpMethod::Patch => write!(f, "PATCH"),
            HttpMethod::Head => write!(f, "HEAD"),
            HttpMethod::Options => write!(f, "OPTIONS"),
            HttpMethod::Connect => write!(f, "CONNECT"),
            HttpMethod::Trace => write!(f, "TRACE"),
        }
    }
}

impl FromStr for HttpMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "DELETE" => Ok(HttpMethod::Delete),
            "PATCH" => Ok(HttpMethod::Patch),
            "HEAD" => Ok(HttpMethod::Head),
            "OPTIONS" => Ok(HttpMethod::Options),
            "CONNECT" => Ok(HttpMethod::Connect),
            "TRACE" => Ok(HttpMethod::Trace),
            other => Err(format!("unsupported HTTP method: {}", other)),
        }
    }
}

/// An HTTP header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpHeader {
    pub name: String,
    pub value: String,
}

/// HTTP request as recorded from the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpReq {
    /// HTTP method
    pub method: HttpMethod,

    /// Major protocol version (1 for HTTP/1.x)
    pub proto_major: u8,

    /// Minor protocol version
    pub proto_minor: u8,

    /// Absolute URL rebuilt from the Host header and request target
    pub url: String,

    /// Request headers in wire order
    pub headers: Vec<HttpHeader>,

    /// Request body (lossy UTF-8)
    pub body: String,

    /// Decoded query parameters
    #[serde(default)]
    pub url_params: BTreeMap<String, String>,
}

impl HttpReq {
    /// Look up a header value, case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// HTTP response as recorded from the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResp {
    /// HTTP status code
    pub status_code: u16,

    /// Response headers in wire order
    pub headers: Vec<HttpHeader>,

    /// Response body (lossy UTF-8)
    pub body: String,
}

impl HttpResp {
    /// Look up a header value, case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

fn find_header<'a>(headers: &'a [HttpHeader], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

/// Which side of the connection produced a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Client,
    Server,
}

/// A single encoded message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Encoding of `data` ("binary" for base64)
    #[serde(rename = "type", default = "default_message_type")]
    pub kind: String,

    /// Base64 encoded payload
    pub data: String,
}

fn default_message_type() -> String {
    "binary".to_string()
}

impl Message {
    /// Wrap an already encoded payload
    pub fn binary(data: impl Into<String>) -> Self {
        Self {
            kind: default_message_type(),
            data: data.into(),
        }
    }
}

/// One side of a generic exchange step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericPayload {
    /// Side that sent the message
    pub origin: Origin,

    /// Messages sent in this step; matching only looks at the first one
    pub message: Vec<Message>,
}

impl GenericPayload {
    /// Build a payload holding one encoded message
    pub fn single(origin: Origin, data: impl Into<String>) -> Self {
        Self {
            origin,
            message: vec![Message::binary(data)],
        }
    }

    /// Encoded data of the first message, if any
    pub fn first_data(&self) -> Option<&str> {
        self.message.first().map(|m| m.data.as_str())
    }

    /// Replace the data of the first message, creating it if needed
    pub fn set_first_data(&mut self, data: &str) {
        match self.message.first_mut() {
            Some(m) => m.data = data.to_string(),
            None => self.message.push(Message::binary(data)),
        }
    }
}

/// Recorded content of a mock or test case
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MockSpec {
    /// HTTP request and response
    Http { request: HttpReq, response: HttpResp },
    /// One Postgres message each way, base64 encoded
    Postgres { request: String, response: String },
    /// Ordered request/response messages; `requests[i]` pairs with `responses[i]`
    Generic {
        requests: Vec<GenericPayload>,
        responses: Vec<GenericPayload>,
    },
}

/// A recorded exchange usable as a canned reply during replay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mock {
    pub version: String,
    pub name: String,
    pub kind: MockKind,
    pub spec: MockSpec,
}

impl Mock {
    /// Create a single-message Postgres mock from base64 payloads
    pub fn postgres(name: impl Into<String>, request: String, response: String) -> Self {
        Self {
            version: SCHEMA_VERSION.to_string(),
            name: name.into(),
            kind: MockKind::Postgres,
            spec: MockSpec::Postgres { request, response },
        }
    }

    /// Create a generic mock from paired request/response payloads
    pub fn generic(
        name: impl Into<String>,
        requests: Vec<GenericPayload>,
        responses: Vec<GenericPayload>,
    ) -> Self {
        Self {
            version: SCHEMA_VERSION.to_string(),
            name: name.into(),
            kind: MockKind::Generic,
            spec: MockSpec::Generic {
                requests,
                responses,
            },
        }
    }
}

/// A captured exchange written out in record mode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    /// Unique identifier for this test case
    pub id: Uuid,

    pub version: String,

    /// Human readable name (empty until the storage layer assigns one)
    #[serde(default)]
    pub name: String,

    pub kind: MockKind,

    /// Creation time, unix seconds
    pub created: i64,

    pub spec: MockSpec,
}

impl TestCase {
    /// Create a new test case stamped with the current time
    pub fn new(kind: MockKind, spec: MockSpec) -> Self {
        Self {
            id: Uuid::new_v4(),
            version: SCHEMA_VERSION.to_string(),
            name: String::new(),
            kind,
            created: Utc::now().timestamp(),
            spec,
        }
    }
}
