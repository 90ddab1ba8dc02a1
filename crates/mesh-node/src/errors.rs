//! Mesh node error types.
//!
//! Only admission and media errors are surfaced to the application. Transport
//! and signaling failures are absorbed by the coordinator and show up as link
//! state (quality tier, reconnecting flag) instead.

use thiserror::Error;

/// Mesh node error type.
///
/// Maps to a stable `error_code()` for the application layer:
/// - `CapacityExceeded`: `FULL` (1)
/// - `MediaUnavailable`: `MEDIA_UNAVAILABLE` (2)
/// - `SessionClosed`: `NOT_JOINED` (3)
/// - `TransientLinkFailure`, `SignalingWrite`, `Contention`: `RETRYABLE` (4)
/// - Store, Transport, Config, Internal: `INTERNAL_ERROR` (5)
#[derive(Debug, Error)]
pub enum MeshError {
    /// Room is at capacity; the join had no side effects.
    #[error("Room at capacity: {capacity} members")]
    CapacityExceeded { capacity: u32 },

    /// Capture device denied or missing.
    #[error("Media unavailable: {0}")]
    MediaUnavailable(String),

    /// Transport reported a transient link state.
    #[error("Transient link failure: {0}")]
    TransientLinkFailure(String),

    /// A signal envelope write or delete failed after retries.
    #[error("Signaling write failed: {0}")]
    SignalingWrite(String),

    /// An admission transaction kept conflicting and gave up.
    #[error("Transaction contention: gave up after {attempts} attempts")]
    Contention { attempts: u32 },

    /// Document store operation failed.
    #[error("Store error: {0}")]
    Store(String),

    /// Peer transport operation failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The session's coordinator has shut down.
    #[error("Session closed")]
    SessionClosed,

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MeshError {
    /// Returns the application-facing error code for this error.
    pub fn error_code(&self) -> i32 {
        match self {
            MeshError::CapacityExceeded { .. } => 1, // FULL
            MeshError::MediaUnavailable(_) => 2,     // MEDIA_UNAVAILABLE
            MeshError::SessionClosed => 3,          // NOT_JOINED
            MeshError::TransientLinkFailure(_)
            | MeshError::SignalingWrite(_)
            | MeshError::Contention { .. } => 4, // RETRYABLE
            MeshError::Store(_)
            | MeshError::Transport(_)
            | MeshError::Config(_)
            | MeshError::Internal(_) => 5, // INTERNAL_ERROR
        }
    }

    /// True for the room-full rejection, which callers surface distinctly.
    pub fn is_capacity_exceeded(&self) -> bool {
        matches!(self, MeshError::CapacityExceeded { .. })
    }

    /// True when retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MeshError::TransientLinkFailure(_)
                | MeshError::SignalingWrite(_)
                | MeshError::Contention { .. }
                | MeshError::Store(_)
        )
    }

    /// Returns a client-safe error message (no internal details).
    pub fn client_message(&self) -> String {
        match self {
            MeshError::CapacityExceeded { capacity } => {
                format!("The room is full ({capacity} people max)")
            }
            MeshError::MediaUnavailable(_) => {
                "Camera or microphone unavailable, joining without media".to_string()
            }
            MeshError::TransientLinkFailure(_) => "Reconnecting...".to_string(),
            MeshError::SignalingWrite(_) | MeshError::Contention { .. } => {
                "The room is busy, please try again".to_string()
            }
            MeshError::SessionClosed => "You are not in the room".to_string(),
            MeshError::Store(_)
            | MeshError::Transport(_)
            | MeshError::Config(_)
            | MeshError::Internal(_) => "An internal error occurred".to_string(),
        }
    }
}
