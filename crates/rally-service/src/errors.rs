//! Rally service error types.
//!
//! Error types map to client-visible error codes for relay responses.
//! Internal details are logged server-side but not exposed to clients.

use thiserror::Error;

/// Rally service error type.
///
/// Client-visible code mapping:
/// - `NotOwner`: `FORBIDDEN` (3)
/// - `ParticipantNotFound`: `NOT_FOUND` (4)
/// - `LockLost`: `CONFLICT` (5)
/// - `Database`, `Config`, `Internal`: `INTERNAL_ERROR` (6)
#[derive(Debug, Error)]
pub enum RallyError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A lease renewal matched zero documents: the lock was preempted out
    /// from under its holder. The caller no longer has exclusivity and must
    /// abort its critical section.
    #[error("Lock lease lost: {0}")]
    LockLost(String),

    /// Call participant not found.
    #[error("Participant not found: {0}")]
    ParticipantNotFound(String),

    /// Caller is not the creator of the participant it is acting as.
    #[error("Not the owner of participant: {0}")]
    NotOwner(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RallyError {
    /// Returns the client-visible error code for this error.
    #[must_use]
    pub fn error_code(&self) -> i32 {
        match self {
            RallyError::Database(_) | RallyError::Config(_) | RallyError::Internal(_) => 6,
            RallyError::NotOwner(_) => 3,
            RallyError::ParticipantNotFound(_) => 4,
            RallyError::LockLost(_) => 5,
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            RallyError::Database(_) | RallyError::Config(_) | RallyError::Internal(_) => {
                "An internal error occurred".to_string()
            }
            RallyError::NotOwner(_) => "Not your call participant".to_string(),
            RallyError::ParticipantNotFound(_) => "Participant not found".to_string(),
            RallyError::LockLost(name) => format!("Lock lease lost: {name}"),
        }
    }
}

impl From<mongodb::error::Error> for RallyError {
    fn from(err: mongodb::error::Error) -> Self {
        RallyError::Database(err.to_string())
    }
}
