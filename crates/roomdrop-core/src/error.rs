//! Errors returned by the signaling relay

use thiserror::Error;

/// Rejection of a relay operation. Returned to the caller, never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("Room not found")]
    NotFound,
    #[error("Room is full")]
    Full,
    #[error("Only the room creator can do that")]
    PermissionDenied,
    #[error("Not a participant of this room")]
    NotParticipant,
    #[error("Daily room limit reached")]
    LimitReached {
        remaining: u32,
        /// Unix millis when the quota resets
        reset_time: u64,
    },
    #[error("Room is closed")]
    Closed,
    #[error("Unknown connection")]
    UnknownConnection,
    #[error("{0}")]
    Rejected(String),
}

impl RelayError {
    /// Map an error message received over the wire back to a variant
    pub fn from_message(message: &str) -> Self {
        match message {
            "Room not found" => Self::NotFound,
            "Room is full" => Self::Full,
            "Only the room creator can do that" => Self::PermissionDenied,
            "Not a participant of this room" => Self::NotParticipant,
            "Room is closed" => Self::Closed,
            "Unknown connection" => Self::UnknownConnection,
            other => Self::Rejected(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_round_trip() {
        for err in [
            RelayError::NotFound,
            RelayError::Full,
            RelayError::PermissionDenied,
            RelayError::NotParticipant,
            RelayError::Closed,
        ] {
            assert_eq!(RelayError::from_message(&err.to_string()), err);
        }
        assert_eq!(
            RelayError::from_message("boom"),
            RelayError::Rejected("boom".to_string())
        );
    }
}
