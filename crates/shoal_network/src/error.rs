//! Network error types.

use std::time::Duration;

use crate::message::FailReason;

/// Errors that can occur in the shoal_network crate.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// The coordinator rejected the supplied credentials.
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// The session token is missing, unknown, or has been evicted.
    #[error("Not authenticated (session missing or expired)")]
    Unauthenticated,

    /// The requested file or peer does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// No reply after the retry budget, or the remote refused the connection.
    #[error("Peer unavailable: {0}")]
    PeerUnavailable(String),

    /// A transfer stream ended short or errored before completion.
    #[error("Transfer aborted after {received} of {expected} bytes: {reason}")]
    TransferAborted {
        received: u64,
        expected: u64,
        reason: String,
    },

    /// A request field failed validation.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The remote end sent something that does not follow the protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// An operation timed out.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetworkError {
    /// Map a coordinator `FAIL` reply to the matching error.
    pub fn from_fail(reason: FailReason, context: &str) -> Self {
        match reason {
            FailReason::AuthFailed => Self::AuthenticationFailed,
            FailReason::Unauthenticated => Self::Unauthenticated,
            FailReason::NotFound => Self::NotFound(context.to_string()),
            FailReason::InvalidArgument => Self::InvalidArgument(context.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_fail_maps_every_reason() {
        assert!(matches!(
            NetworkError::from_fail(FailReason::AuthFailed, "alice"),
            NetworkError::AuthenticationFailed
        ));
        assert!(matches!(
            NetworkError::from_fail(FailReason::Unauthenticated, ""),
            NetworkError::Unauthenticated
        ));
        match NetworkError::from_fail(FailReason::NotFound, "book.pdf") {
            NetworkError::NotFound(what) => assert_eq!(what, "book.pdf"),
            other => panic!("Expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_transfer_aborted_display() {
        let err = NetworkError::TransferAborted {
            received: 10,
            expected: 1000,
            reason: "connection reset".into(),
        };
        assert_eq!(
            err.to_string(),
            "Transfer aborted after 10 of 1000 bytes: connection reset"
        );
    }
}
