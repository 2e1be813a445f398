//! # Adapter Protocol Types
//!
//! Shared vocabulary of the trading connectivity layer: the message envelope
//! exchanged with venue adapters, the identifiers those messages carry, and
//! the errors embedded in responses.
//!
//! ## Quick Start
//!
//! ```rust
//! use types::{DataType, MarketDataMessage, Message, SecurityId, TransactionIdGenerator};
//!
//! let ids = TransactionIdGenerator::new();
//! let subscribe = Message::market_data(
//!     MarketDataMessage::subscribe(ids.next_id(), DataType::MarketDepth)
//!         .with_security(SecurityId::new("AAPL", "NASDAQ")),
//! );
//! assert!(subscribe.transaction_id().is_some());
//! ```
//!
//! ## Modules
//!
//! - [`ids`]: transaction, adapter and security identifiers
//! - [`data_type`]: message kinds and subscription data types
//! - [`message`]: envelope and typed bodies
//! - [`error`]: errors carried inside messages

pub mod data_type;
pub mod error;
pub mod ids;
pub mod message;

pub use data_type::{DataType, MessageType};
pub use error::MessageError;
pub use ids::{AdapterId, SecurityId, TransactionId, TransactionIdGenerator};
pub use message::{
    ChangePasswordMessage, ConnectMessage, DisconnectMessage, ErrorMessage, ExecutionMessage,
    MarketDataMessage, MarketEventMessage, Message, MessageBody, OrderCancelMessage,
    OrderGroupCancelMessage, OrderRegisterMessage, OrderReplaceMessage, OrderState,
    PortfolioMessage, PositionChangeMessage, SecurityMessage, Side, SubscriptionFinishedMessage,
    SubscriptionOnlineMessage, SubscriptionResponseMessage,
};
