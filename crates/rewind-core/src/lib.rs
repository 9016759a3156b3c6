//! Rewind Core - Shared types for the Rewind capture and replay engine
//!
//! This crate provides common types used across the capture and replay
//! components, including:
//! - Recorded exchange models (mocks, test cases, HTTP request/response)
//! - Configuration management
//! - The test case persistence seam

pub mod config;
pub mod models;
pub mod store;

pub use config::{CaptureSettings, ReplaySettings, RewindConfig, ShingleSettings};

pub use models::{
    GenericPayload, HttpHeader, HttpMethod, HttpReq, HttpResp, Message, Mock, MockKind, MockSpec,
    Mode, Origin, TestCase, SCHEMA_VERSION,
};

pub use store::{JsonLinesWriter, PersistenceError, TestCaseWriter};
