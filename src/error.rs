//! Error kinds shared by the sync pipeline
//!
//! Network and storage failures are classified once, at the boundary where they
//! happen, so the retry layer and the orchestrators can branch on the kind
//! instead of inspecting message strings.

use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Timeouts, connection resets, 5xx. Safe to retry.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The remote asked us to back off until `reset_at`.
    #[error("rate limited until {reset_at}")]
    RateLimited { reset_at: DateTime<Utc> },

    /// Malformed responses, auth errors, bad requests. Never retried.
    #[error("fatal failure: {0}")]
    Fatal(String),

    #[error("{label}: gave up after {attempts} attempts ({last})")]
    RetryExceeded {
        label: String,
        attempts: u32,
        last: String,
    },

    #[error("write verification failed for skill {skill_id}: {detail}")]
    Verification { skill_id: i64, detail: String },

    #[error("{0} timed out")]
    Timeout(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("writer `{0}` is closed")]
    WriterClosed(String),

    #[error(transparent)]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Whether the retry layer should try the call again after a backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Transient(_) | SyncError::Timeout(_))
    }

    /// Short kind tag for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Transient(_) => "transient",
            SyncError::RateLimited { .. } => "rate_limited",
            SyncError::Fatal(_) => "fatal",
            SyncError::RetryExceeded { .. } => "retry_exceeded",
            SyncError::Verification { .. } => "verification",
            SyncError::Timeout(_) => "timeout",
            SyncError::NotFound(_) => "not_found",
            SyncError::Unauthorized(_) => "unauthorized",
            SyncError::WriterClosed(_) => "writer_closed",
            SyncError::Database(_) => "database",
            SyncError::Io(_) => "io",
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            SyncError::Transient(err.to_string())
        } else if err.is_decode() {
            SyncError::Fatal(format!("malformed response: {}", err))
        } else {
            SyncError::Transient(err.to_string())
        }
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
