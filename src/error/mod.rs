use thiserror::Error;

use crate::stats::Counter;

/// Failures a session or driver can hit while talking to the backend.
///
/// None of these are fatal to a run. Each one is recovered where it happens:
/// the matching counter is bumped and the caller either retries against its
/// budget or moves on to the next message.
#[derive(Debug, Error)]
pub enum StressError {
    #[error("token request failed: {0}")]
    Auth(String),

    #[error("transport connect failed: {0}")]
    Connect(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transport closed: {0}")]
    TransportClosed(String),

    #[error("chat submission failed: {0}")]
    Submission(String),
}

impl StressError {
    /// Counter this failure is recorded under.
    pub fn counter(&self) -> Counter {
        match self {
            StressError::TransportClosed(_) => Counter::Reconnections,
            _ => Counter::Errors,
        }
    }
}

pub type Result<T> = std::result::Result<T, StressError>;
