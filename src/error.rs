//! Error taxonomy for the collector.
//!
//! Transient failures are recovered locally with retry/backoff and never
//! propagate past the component that owns the retry loop. Permanent failures
//! skip the offending unit (row, frame, request), increment a counter, and
//! never kill the process. Configuration failures surface at startup and
//! cause a non-zero exit.

use thiserror::Error;

/// Failures from the exchange request/response API.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Network resets, timeouts, 5xx, 429. The caller retries on its next tick.
    #[error("transient catalog failure: {0}")]
    Transient(String),

    /// Malformed response or client-side bug. Retrying will not help.
    #[error("permanent catalog failure: {0}")]
    Permanent(String),

    /// The instrument expired between listing and this call. Not fatal.
    #[error("instrument not found: {0}")]
    NotFound(String),
}

impl CatalogError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CatalogError::Transient(_))
    }
}

/// Failures from the time-series store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection resets, pool/statement timeouts, serialization failures.
    #[error("transient store failure: {0}")]
    Transient(String),

    /// Constraint violations (other than the idempotency conflict), malformed rows.
    #[error("permanent store failure: {0}")]
    Permanent(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }

    /// Classify a driver error into the retryable/terminal split the batch
    /// writer acts on.
    pub fn from_sqlx(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Transient(err.to_string()),
            sqlx::Error::Database(db) => {
                let code = db.code().map(|c| c.to_string()).unwrap_or_default();
                // 40001 serialization_failure, 40P01 deadlock_detected,
                // 57014 query_canceled (statement timeout), 08xxx connection errors.
                if code == "40001" || code == "40P01" || code == "57014" || code.starts_with("08") {
                    StoreError::Transient(err.to_string())
                } else {
                    StoreError::Permanent(err.to_string())
                }
            }
            _ => StoreError::Permanent(err.to_string()),
        }
    }
}

/// An undecodable stream frame. Frame-scoped and always permanent: the
/// caller counts it and moves on to the next frame.
#[derive(Debug, Error)]
#[error("undecodable frame: {reason}")]
pub struct DecodeError {
    pub reason: String,
}

impl DecodeError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Subscription mutations that the pool refuses.
#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error("session {session_id} at capacity ({channels}/{cap} channels)")]
    CapacityExceeded {
        session_id: usize,
        channels: usize,
        cap: usize,
    },

    #[error("unknown session {0}")]
    UnknownSession(usize),
}

/// Startup-only failures. The orchestrator restarts the process.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),

    #[error("invalid value for {var}: {value}")]
    InvalidVar { var: &'static str, value: String },

    #[error("store unreachable at startup: {0}")]
    StoreUnreachable(String),
}
