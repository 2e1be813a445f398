//! Error types for the basket adapter

use thiserror::Error;
use types::{AdapterId, MessageError, MessageType, TransactionId};

/// Result type alias for adapter operations
pub type Result<T> = std::result::Result<T, BasketError>;

/// Main error type for adapter operations
#[derive(Debug, Error)]
pub enum BasketError {
    /// Connect requested while no inner adapter is registered
    #[error("No inner adapters registered")]
    NoAdapters,

    /// Adapter id not present in the registry
    #[error("Unknown adapter {0}")]
    UnknownAdapter(AdapterId),

    /// Adapter id registered twice
    #[error("Adapter {0} is already registered")]
    DuplicateAdapter(AdapterId),

    /// Priority below the disabled marker
    #[error("Invalid priority {priority} for adapter {adapter}")]
    InvalidPriority {
        /// Adapter whose priority was being changed
        adapter: AdapterId,
        /// Rejected value
        priority: i32,
    },

    /// Request kind that must carry a transaction id arrived without one
    #[error("{0} message requires a transaction id")]
    MissingTransactionId(MessageType),

    /// Child subscription registered twice
    #[error("Child transaction {0} is already mapped")]
    DuplicateChild(TransactionId),

    /// Operation on an adapter that was already disposed
    #[error("Adapter has been disposed")]
    Disposed,

    /// Configuration error in basket settings
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Error reported back through a message
    #[error(transparent)]
    Message(#[from] MessageError),

    /// Generic errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BasketError {
    /// Check if this error is recoverable through retry
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BasketError::Message(MessageError::Connection(_))
                | BasketError::Message(MessageError::Adapter(_))
                | BasketError::Message(MessageError::NoAdapter(_))
        )
    }

    /// Check if this error indicates a permanent failure
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            BasketError::NoAdapters | BasketError::Disposed | BasketError::Configuration(_)
        )
    }

    /// Whether the caller violated the send contract; such errors are
    /// returned from `send_in` instead of being reported as messages
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            BasketError::NoAdapters
                | BasketError::MissingTransactionId(_)
                | BasketError::Disposed
        )
    }

    /// Convert into the error carried by response messages
    pub fn to_message_error(&self) -> MessageError {
        match self {
            BasketError::Message(e) => e.clone(),
            BasketError::NoAdapters => MessageError::NoAdapter("basket".to_string()),
            other => MessageError::Adapter(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_error_passthrough() {
        let err: BasketError = MessageError::Cancelled.into();
        assert_eq!(err.to_message_error(), MessageError::Cancelled);
        assert!(!err.is_contract_violation());
    }

    #[test]
    fn test_classification() {
        assert!(BasketError::NoAdapters.is_permanent());
        assert!(BasketError::NoAdapters.is_contract_violation());
        assert!(BasketError::Message(MessageError::Connection("reset".into())).is_recoverable());
        assert!(!BasketError::Disposed.is_recoverable());
    }
}
