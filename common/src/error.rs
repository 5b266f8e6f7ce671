//! Error types for coordinator and branch operations.

use crate::{BranchId, TransactionId, TransactionState};
use thiserror::Error;

/// Main error type for bankcoord operations.
#[derive(Error, Debug)]
pub enum BankCoordError {
    /// Invalid message format or content.
    #[error("Invalid message: {message}")]
    InvalidMessage {
        message: String,
        field: Option<String>,
    },

    /// Unknown branch.
    #[error("Unknown branch: {0}")]
    UnknownBranch(BranchId),

    /// Branch link is down.
    #[error("Branch disconnected: {0}")]
    BranchDisconnected(BranchId),

    /// Transaction is not registered (never begun, or already released).
    #[error("Transaction not found: {0}")]
    TransactionNotFound(TransactionId),

    /// Invalid state transition.
    #[error("Invalid transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: TransactionState,
        to: TransactionState,
    },

    /// Coordinator is not accepting requests.
    #[error("Coordinator not running")]
    NotRunning,

    /// Network error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// I/O error on a socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BankCoordError {
    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BankCoordError::BranchDisconnected(_)
                | BankCoordError::NetworkError(_)
                | BankCoordError::Io(_)
        )
    }

    /// Get error code for log records.
    pub fn error_code(&self) -> &'static str {
        match self {
            BankCoordError::InvalidMessage { .. } => "INVALID_MESSAGE",
            BankCoordError::UnknownBranch(_) => "UNKNOWN_BRANCH",
            BankCoordError::BranchDisconnected(_) => "BRANCH_DISCONNECTED",
            BankCoordError::TransactionNotFound(_) => "TRANSACTION_NOT_FOUND",
            BankCoordError::InvalidTransition { .. } => "INVALID_TRANSITION",
            BankCoordError::NotRunning => "NOT_RUNNING",
            BankCoordError::NetworkError(_) => "NETWORK_ERROR",
            BankCoordError::ConfigurationError(_) => "CONFIGURATION_ERROR",
            BankCoordError::Io(_) => "IO_ERROR",
        }
    }
}

/// Result type alias for bankcoord operations.
pub type Result<T> = std::result::Result<T, BankCoordError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(BankCoordError::NetworkError("reset".into()).is_retryable());
        assert!(!BankCoordError::UnknownBranch(BranchId::new("Z")).is_retryable());
    }

    #[test]
    fn test_error_code() {
        let err = BankCoordError::InvalidTransition {
            from: TransactionState::Committed,
            to: TransactionState::Idle,
        };
        assert_eq!(err.error_code(), "INVALID_TRANSITION");
        assert!(err.to_string().contains("Committed"));
    }
}
