//! Error taxonomy for the data plane.
//!
//! Components return these kinds instead of using errors for control flow.
//! The HTTP layer maps them onto status codes; the fetch coordinator maps
//! adapter kinds onto its retry/fallback policy.

use std::time::Duration;
use thiserror::Error;

/// Upstream adapter failure classes.
#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    /// Network-level failure or upstream 5xx; safe to retry.
    #[error("upstream transport error: {0}")]
    Transport(String),

    /// Payload arrived but does not parse or violates the source schema.
    #[error("malformed upstream payload: {0}")]
    Malformed(String),

    /// Upstream asked us to back off.
    #[error("upstream throttled")]
    Throttled { retry_after: Option<Duration> },
}

impl AdapterError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AdapterError::Transport(_) | AdapterError::Throttled { .. })
    }
}

impl From<reqwest::Error> for AdapterError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            AdapterError::Malformed(e.to_string())
        } else {
            AdapterError::Transport(e.to_string())
        }
    }
}

/// Failures surfaced by the fetch coordinator to its callers.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Unresolvable symbol, malformed topic or unsupported interval.
    #[error("invalid input: {0}")]
    InputInvalid(String),

    /// The relational store is unreachable or erroring.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Conflicting concurrent write the store could not resolve.
    #[error("store conflict: {0}")]
    StoreConflict(String),

    /// The shared L2 cache is unreachable; callers degrade to bypass.
    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),

    /// Circuit breaker is open for this symbol.
    #[error("circuit open for {symbol}")]
    CircuitOpen { symbol: String },

    /// Upstream failed after retries and no stored fallback exists.
    #[error("upstream failed: {0}")]
    Upstream(#[from] AdapterError),

    /// A bug, not an operational condition. Logged, never shown to clients.
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl From<rusqlite::Error> for FetchError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::SqliteFailure(ref code, _)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                FetchError::StoreConflict(e.to_string())
            }
            other => FetchError::StoreUnavailable(other.to_string()),
        }
    }
}

pub type FetchResult<T> = Result<T, FetchError>;
