//! Test-mode replay
//!
//! Recorded exchanges are loaded into a [`MockStore`], normalized for
//! deterministic authentication, and served back by the replay listener.

pub mod listener;
pub mod normalize;
pub mod similarity;
pub mod store;

pub use listener::{respond, run_replay_listener};
pub use normalize::normalize_auth_for_replay;
pub use store::{MatchTier, MockStore, Reply};
