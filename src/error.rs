//! Error taxonomy for provider calls, store access and periodic tasks.
//!
//! Per-item failures (transient provider errors, malformed payloads, single
//! failed writes) never abort a cycle. Only systemic failures, such as an
//! unreachable store or rejected credentials, stop a worker.

use std::time::Duration;
use thiserror::Error;

/// Failure of a call to an upstream provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// HTTP 429 or an equivalent throttling signal
    #[error("rate limited by upstream (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// The call did not complete within its bound
    #[error("upstream call timed out after {0:?}")]
    Timeout(Duration),

    /// Non-success status other than throttling or auth
    #[error("upstream returned status {0}")]
    Status(u16),

    /// Connection-level failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Payload did not have the expected shape
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// Credentials were rejected
    #[error("credentials rejected with status {0}")]
    Unauthorized(u16),
}

impl ProviderError {
    /// True for failures the next scheduled cycle retries implicitly.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::RateLimited { .. }
            | ProviderError::Timeout(_)
            | ProviderError::Transport(_) => true,
            ProviderError::Status(code) => *code >= 500,
            ProviderError::Malformed(_) | ProviderError::Unauthorized(_) => false,
        }
    }

    /// True for failures that make every further call pointless.
    pub fn is_systemic(&self) -> bool {
        matches!(self, ProviderError::Unauthorized(_))
    }
}

/// Failure of a store operation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store cannot be reached or opened at all
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A single query or write failed
    #[error("store query failed: {0}")]
    Query(String),

    #[error("document serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl StoreError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Failure to load a rotation checkpoint.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// A stored cursor exists but cannot be decoded
    #[error("checkpoint corrupt: {0}")]
    Corrupt(String),

    /// The backing storage could not be read; the stored cursor is untouched
    #[error("checkpoint unreadable: {0}")]
    Unreadable(String),
}

/// Outcome of a periodic task run that did not complete normally.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Systemic failure; the task's scheduler stops
    #[error("fatal: {0}")]
    Fatal(String),

    /// The run failed but the next tick may succeed
    #[error("run failed: {0}")]
    Failed(String),
}

impl From<StoreError> for TaskError {
    fn from(err: StoreError) -> Self {
        if err.is_fatal() {
            TaskError::Fatal(err.to_string())
        } else {
            TaskError::Failed(err.to_string())
        }
    }
}

impl TaskError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, TaskError::Fatal(_))
    }
}
