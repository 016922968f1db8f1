use thiserror::Error;

use crate::{dao::storage::StorageError, state::state_machine::InvalidTransition};

/// Errors that can occur while handling a player command or a timer tick.
///
/// Every variant is converted to a structured ack at the command boundary;
/// none of them ever propagates as an unhandled fault.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Storage backend failed mid-operation.
    #[error("storage unavailable")]
    Unavailable(#[source] StorageError),
    /// Application is running in degraded mode without storage.
    #[error("storage unavailable (degraded mode)")]
    Degraded,
    /// Missing or invalid session token.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// The round already has the maximum number of players.
    #[error("player limit reached")]
    Capacity,
    /// Requested slots are held by another identity; nothing was applied.
    #[error("slots already taken: {blocked:?}")]
    Conflict {
        /// Exactly the requested slot indices held by someone else.
        blocked: Vec<u8>,
    },
    /// Command is not valid for the current phase or targets invalid state.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// The actor exceeded the command-rate window.
    #[error("too many commands, retry later")]
    RateLimited,
    /// Optimistic concurrency retries were exhausted; safe to retry.
    #[error("storage conflict, retry")]
    StoreConflict,
}

impl ServiceError {
    /// Stable machine-readable code carried in the ack envelope.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Unavailable(_) | ServiceError::Degraded => "STORE_UNAVAILABLE",
            ServiceError::Unauthorized(_) => "UNAUTHORIZED",
            ServiceError::Capacity => "CAPACITY",
            ServiceError::Conflict { .. } => "CONFLICT",
            ServiceError::InvalidState(_) => "INVALID_STATE",
            ServiceError::RateLimited => "RATE_LIMITED",
            ServiceError::StoreConflict => "STORE_CONFLICT",
        }
    }
}

impl From<StorageError> for ServiceError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Conflict { .. } => ServiceError::StoreConflict,
            other => ServiceError::Unavailable(other),
        }
    }
}

impl From<InvalidTransition> for ServiceError {
    fn from(err: InvalidTransition) -> Self {
        ServiceError::InvalidState(err.to_string())
    }
}
