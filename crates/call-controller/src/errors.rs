//! Call Controller error types.
//!
//! Error types map to signaling `ErrorCode` values returned to the gateway.
//! Internal details are logged server-side but not exposed to clients.

use crate::media::MediaError;
use crate::store::PersistenceError;
use thiserror::Error;

/// Call Controller error type.
///
/// Maps to signaling `ErrorCode` values:
/// - `InvalidParticipants`: `INVALID_REQUEST` (1)
/// - `CallNotFound`, `ParticipantNotFound`: `NOT_FOUND` (4)
/// - `InvalidTransition`: `CONFLICT` (5)
/// - Media, Persistence, Internal: `INTERNAL_ERROR` (6)
/// - `ResourceExhausted`, `CapacityExceeded`, `Draining`: `CAPACITY_EXCEEDED` (7)
#[derive(Debug, Error)]
pub enum CallError {
    /// Malformed initiate request (empty receivers, initiator among receivers, duplicates).
    #[error("Invalid participants: {0}")]
    InvalidParticipants(String),

    /// Stale or duplicate signaling; the caller should re-fetch the call snapshot.
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// No media worker can host the call.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The call record could not be saved.
    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    /// Call not found (never existed or already ended).
    #[error("Call not found: {0}")]
    CallNotFound(String),

    /// User is not a participant of the call.
    #[error("Participant not found: {0}")]
    ParticipantNotFound(String),

    /// Controller is at its configured call capacity.
    #[error("Call controller at capacity")]
    CapacityExceeded,

    /// Controller is draining (graceful shutdown).
    #[error("Call controller is draining")]
    Draining,

    /// Media engine operation failed.
    #[error("Media error: {0}")]
    Media(String),

    /// Internal error with context.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CallError {
    /// Returns the signaling `ErrorCode` value for this error.
    pub fn error_code(&self) -> i32 {
        match self {
            CallError::InvalidParticipants(_) => 1, // INVALID_REQUEST
            CallError::CallNotFound(_) | CallError::ParticipantNotFound(_) => 4, // NOT_FOUND
            CallError::InvalidTransition(_) => 5,   // CONFLICT
            CallError::PersistenceFailure(_)
            | CallError::Media(_)
            | CallError::Internal(_) => 6, // INTERNAL_ERROR
            CallError::ResourceExhausted(_) | CallError::CapacityExceeded | CallError::Draining => {
                7 // CAPACITY_EXCEEDED
            }
        }
    }

    /// Returns a client-safe error message (no internal details).
    pub fn client_message(&self) -> String {
        match self {
            CallError::PersistenceFailure(_)
            | CallError::Media(_)
            | CallError::Internal(_) => "An internal error occurred".to_string(),
            CallError::ResourceExhausted(_) | CallError::CapacityExceeded => {
                "No capacity to start the call, please try again".to_string()
            }
            CallError::Draining => "Server is shutting down, please retry".to_string(),
            CallError::CallNotFound(_) => "Call not found".to_string(),
            CallError::ParticipantNotFound(_) => "Participant not found".to_string(),
            CallError::InvalidParticipants(msg) | CallError::InvalidTransition(msg) => msg.clone(),
        }
    }

    /// Bounded label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            CallError::InvalidParticipants(_) => "invalid_participants",
            CallError::InvalidTransition(_) => "invalid_transition",
            CallError::ResourceExhausted(_) => "resource_exhausted",
            CallError::PersistenceFailure(_) => "persistence_failure",
            CallError::CallNotFound(_) => "call_not_found",
            CallError::ParticipantNotFound(_) => "participant_not_found",
            CallError::CapacityExceeded => "capacity_exceeded",
            CallError::Draining => "draining",
            CallError::Media(_) => "media",
            CallError::Internal(_) => "internal",
        }
    }
}

impl From<MediaError> for CallError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::NoWorkerAvailable => {
                CallError::ResourceExhausted("no media worker available".to_string())
            }
            other => CallError::Media(other.to_string()),
        }
    }
}

impl From<PersistenceError> for CallError {
    fn from(err: PersistenceError) -> Self {
        CallError::PersistenceFailure(err.to_string())
    }
}
