//! Record-mode capture
//!
//! Bytes observed on each connection are accumulated in a [`Tracker`]; the
//! [`TrackerFactory`] sweep turns finished exchanges into test cases.

pub mod factory;
pub mod tracker;
pub mod tunnel;

pub use factory::{build_test_case, run_sweeper, SweepReport, TrackerFactory, TrackerHandle};
pub use tracker::{ConnId, Tracker};
pub use tunnel::run_capture_tunnel;
