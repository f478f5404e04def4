//! Connection utilities shared by the broker and the agent.
//!
//! [`splice`] moves bytes between two established sockets until either side
//! closes; [`reconnect`] provides the retry pacing used by the agent when a
//! control session fails.

pub mod reconnect;
pub mod splice;

pub use reconnect::{RetryConfig, RetryDelay, RetryError};
pub use splice::{is_benign_close, splice, SpliceSummary};
