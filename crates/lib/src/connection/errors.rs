//! Error types for connection lifecycle operations.

use thiserror::Error;

/// Structured error types for connections and backend bridges.
#[non_exhaustive]
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    /// The backend rejected the subscription
    #[error("Subscription for {key} failed: {reason}")]
    SubscriptionFailed { key: String, reason: String },

    /// The initial snapshot could not be converted into a mirror root
    #[error("Invalid initial snapshot for {key}: {reason}")]
    InvalidSnapshot { key: String, reason: String },

    /// The connection has been torn down
    #[error("Connection {key} has been released")]
    Released { key: String },

    /// `commit_transaction` was called with no open transaction
    #[error("No transaction is open")]
    NoTransactionOpen,

    /// `begin_transaction` was called while a transaction is open
    #[error("A transaction is already open")]
    TransactionAlreadyOpen,

    /// A bridge operation failed
    #[error("Backend bridge error: {reason}")]
    Bridge { reason: String },

    /// Connections spawn tasks and must be acquired inside a tokio runtime
    #[error("No tokio runtime is available")]
    NoRuntime,
}

impl ConnectionError {
    /// Check if this error means the connection never became ready
    pub fn is_readiness_error(&self) -> bool {
        matches!(
            self,
            ConnectionError::SubscriptionFailed { .. } | ConnectionError::InvalidSnapshot { .. }
        )
    }

    /// Check if this error is a misuse of the transaction API
    pub fn is_transaction_error(&self) -> bool {
        matches!(
            self,
            ConnectionError::NoTransactionOpen | ConnectionError::TransactionAlreadyOpen
        )
    }

    /// Check if this error originates in the backend bridge
    pub fn is_bridge_error(&self) -> bool {
        matches!(
            self,
            ConnectionError::Bridge { .. } | ConnectionError::SubscriptionFailed { .. }
        )
    }

    /// Check if the connection is gone
    pub fn is_released(&self) -> bool {
        matches!(self, ConnectionError::Released { .. })
    }

    /// Get the connection key if the error names one
    pub fn key(&self) -> Option<&str> {
        match self {
            ConnectionError::SubscriptionFailed { key, .. }
            | ConnectionError::InvalidSnapshot { key, .. }
            | ConnectionError::Released { key } => Some(key),
            _ => None,
        }
    }
}

impl From<ConnectionError> for crate::Error {
    fn from(err: ConnectionError) -> Self {
        crate::Error::Connection(err)
    }
}
