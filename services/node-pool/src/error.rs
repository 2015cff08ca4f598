//! Error types for the node pool.
//!
//! None of these reach HTTP callers: every component logs and degrades to
//! "no change this cycle", so the variants exist for logging and tests.

use thiserror::Error;

/// Result type for node pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors raised by node pool components.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Transport-level failure talking to the render service or management API.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The remote answered with a non-success status.
    #[error("{endpoint} returned status {status}")]
    UnexpectedStatus { endpoint: String, status: u16 },

    /// The remote answered with a body of the wrong shape.
    #[error("unexpected payload from {endpoint}: {detail}")]
    UnexpectedPayload { endpoint: String, detail: String },

    /// Session creation or teardown failed.
    #[error("session error: {0}")]
    Session(String),

    /// Snapshot could not be read or written.
    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PoolError {
    pub fn unexpected_payload(endpoint: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::UnexpectedPayload {
            endpoint: endpoint.into(),
            detail: detail.into(),
        }
    }

    /// Returns true for failures that a later poll may not hit again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Http(_) | Self::UnexpectedStatus { .. } | Self::Session(_)
        )
    }
}
