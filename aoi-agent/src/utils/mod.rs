//! Utility modules for aoi-agent

pub mod retry;

pub use retry::{RecordingSleeper, RetryError, RetryPolicy, Sleeper, TokioSleeper};
