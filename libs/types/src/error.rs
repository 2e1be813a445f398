//! Errors carried inside response messages
//!
//! Unlike service-level errors these travel with messages, so they are
//! cloneable, comparable and serializable.

use crate::ids::TransactionId;
use crate::data_type::MessageType;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error attached to a response or error message
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum MessageError {
    /// No connected adapter can serve the request
    #[error("No adapter found for {0}")]
    NoAdapter(String),

    /// The adapter does not support the request
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Replace/cancel referencing an order nobody registered
    #[error("Unknown transaction id {0}")]
    UnknownTransaction(TransactionId),

    /// Adapter-reported failure
    #[error("Adapter error: {0}")]
    Adapter(String),

    /// Connection could not be established or was lost
    #[error("Connection error: {0}")]
    Connection(String),

    /// Request was cancelled before it reached the adapter
    #[error("Request cancelled")]
    Cancelled,

    /// Combination of several independent failures
    #[error("{} errors: [{}]", .0.len(), join_errors(.0))]
    Aggregate(Vec<MessageError>),
}

impl MessageError {
    /// Not-supported error for the given message kind
    pub fn not_supported(message_type: MessageType) -> Self {
        MessageError::NotSupported(message_type.to_string())
    }

    /// Whether this error is a not-supported answer
    pub fn is_not_supported(&self) -> bool {
        matches!(self, MessageError::NotSupported(_))
    }

    /// Combine errors; a single error is returned unwrapped
    pub fn aggregate(mut errors: Vec<MessageError>) -> Self {
        if errors.len() == 1 {
            errors.remove(0)
        } else {
            MessageError::Aggregate(errors)
        }
    }
}

fn join_errors(errors: &[MessageError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_display() {
        let err = MessageError::aggregate(vec![
            MessageError::Connection("a down".to_string()),
            MessageError::Connection("b down".to_string()),
        ]);
        assert_eq!(
            err.to_string(),
            "2 errors: [Connection error: a down; Connection error: b down]"
        );
    }

    #[test]
    fn test_single_aggregate_unwraps() {
        let err = MessageError::aggregate(vec![MessageError::Cancelled]);
        assert_eq!(err, MessageError::Cancelled);
    }

    #[test]
    fn test_not_supported_classification() {
        assert!(MessageError::not_supported(MessageType::MarketData).is_not_supported());
        assert!(!MessageError::Cancelled.is_not_supported());
    }
}
