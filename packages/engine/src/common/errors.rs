use thiserror::Error;

/// Errors surfaced by the execution dispatch core.
///
/// Four kinds matter to callers: validation (never retried), lease (slot
/// bodies abandon silently), concurrency (retry once), and transient
/// runtime (finalised FAILED, re-queued with backoff). The remaining
/// variants carry persistence detail.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Caller-supplied input violates a contract. Never retried.
    #[error("{0}")]
    Validation(String),

    /// Illegal state transition attempted.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Lease missing, expired, or owned by another worker.
    #[error("lease error: {0}")]
    Lease(String),

    /// Optimistic-concurrency loser (version mismatch).
    #[error("concurrency conflict: {0}")]
    Concurrency(String),

    /// Duplicate create.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Failure talking to the runtime agent.
    #[error("{0}")]
    Runtime(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl EngineError {
    /// True when the error means this worker no longer owns the execution.
    pub fn is_lease(&self) -> bool {
        matches!(self, EngineError::Lease(_))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
