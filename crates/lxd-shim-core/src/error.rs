//! Error types for lxd-shim.

use thiserror::Error;

use crate::{OperationId, OperationStatus};

/// Main error type for lxd-shim operations.
#[derive(Debug, Error)]
pub enum Error {
    /// No operation is registered under this id
    #[error("Operation not found: {0}")]
    OperationNotFound(OperationId),

    /// No channel is registered under this id
    #[error("Channel not found: {0}")]
    ChannelNotFound(OperationId),

    /// An entry with this id is already registered
    #[error("Already exists: {0}")]
    AlreadyExists(OperationId),

    /// Presented secret matches neither role, or the role was already claimed
    #[error("Secret does not match any unclaimed channel role")]
    AuthMismatch,

    /// Pseudo-terminal allocation or process spawn failed
    #[error("Spawn failure: {0}")]
    SpawnFailure(String),

    /// Mid-session I/O failure
    #[error("Stream error: {0}")]
    StreamError(String),

    /// No notification subscriber is attached
    #[error("No notification subscriber attached")]
    NoSubscriber,

    /// Operation is already in a terminal state
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition {
        /// Current status
        from: OperationStatus,
        /// Requested status
        to: OperationStatus,
    },

    /// An instance action tool invocation failed
    #[error("Action failed: {0}")]
    ActionFailed(String),

    /// Live session limit reached
    #[error("Session limit reached (max: {0})")]
    SessionLimitReached(usize),

    /// Invalid input or parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// True for the lookup failures (`OperationNotFound`, `ChannelNotFound`).
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::OperationNotFound(_) | Error::ChannelNotFound(_))
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_not_found_error() {
        let id = OperationId::new();
        let err = Error::OperationNotFound(id);
        assert_eq!(err.to_string(), format!("Operation not found: {id}"));
        assert!(err.is_not_found());
    }

    #[test]
    fn test_channel_not_found_is_not_found() {
        assert!(Error::ChannelNotFound(OperationId::new()).is_not_found());
        assert!(!Error::AuthMismatch.is_not_found());
    }

    #[test]
    fn test_spawn_failure_error() {
        let err = Error::SpawnFailure("No such file or directory".to_string());
        assert_eq!(err.to_string(), "Spawn failure: No such file or directory");
    }

    #[test]
    fn test_invalid_transition_error() {
        let err = Error::InvalidTransition {
            from: OperationStatus::Success,
            to: OperationStatus::Failure,
        };
        assert_eq!(err.to_string(), "Invalid status transition: Success -> Failure");
    }

    #[test]
    fn test_session_limit_reached_error() {
        let err = Error::SessionLimitReached(10);
        assert_eq!(err.to_string(), "Session limit reached (max: 10)");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_serialization_error_conversion() {
        let json_err = serde_json::from_str::<i32>("invalid json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
