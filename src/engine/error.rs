use ulid::Ulid;

use crate::model::{CoachId, Instant};

/// The three kinds a caller ever sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Malformed input or a violated domain precondition.
    BadRequest(String),
    /// The (coach, start time) pair is already booked.
    Conflict(String),
    /// Anything unexpected from the store, including lookups that found nothing.
    Internal(String),
}

impl EngineError {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::BadRequest(_) => "bad_request",
            EngineError::Conflict(_) => "conflict",
            EngineError::Internal(_) => "internal_error",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            EngineError::BadRequest(m) | EngineError::Conflict(m) | EngineError::Internal(m) => m,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind(), self.message())
    }
}

impl std::error::Error for EngineError {}

/// Failures of the persistence collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Unique key `(coach_id, start_time)` already taken.
    DuplicateKey { coach_id: CoachId, start_time: Instant },
    NotFound(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DuplicateKey { coach_id, start_time } => write!(
                f,
                "duplicate key (coach_id, start_time) = ({coach_id}, {})",
                start_time.to_rfc3339()
            ),
            StoreError::NotFound(id) => write!(f, "not found: {id}"),
            StoreError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            StoreError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}
