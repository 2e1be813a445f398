//! Message kinds and market data discriminators

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Closed set of message kinds exchanged with adapters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MessageType {
    Reset,
    Connect,
    Disconnect,
    ChangePassword,
    OrderRegister,
    OrderReplace,
    OrderCancel,
    OrderGroupCancel,
    MarketData,
    SubscriptionResponse,
    SubscriptionOnline,
    SubscriptionFinished,
    Execution,
    Security,
    Portfolio,
    PositionChange,
    MarketEvent,
    Error,
}

impl MessageType {
    /// Outbound (application to venue) message kinds
    pub const IN_TYPES: [MessageType; 9] = [
        MessageType::Reset,
        MessageType::Connect,
        MessageType::Disconnect,
        MessageType::ChangePassword,
        MessageType::OrderRegister,
        MessageType::OrderReplace,
        MessageType::OrderCancel,
        MessageType::OrderGroupCancel,
        MessageType::MarketData,
    ];

    /// Whether messages of this kind carry a transaction id that must be set
    pub fn requires_transaction_id(self) -> bool {
        matches!(
            self,
            MessageType::ChangePassword
                | MessageType::OrderRegister
                | MessageType::OrderReplace
                | MessageType::OrderCancel
                | MessageType::OrderGroupCancel
                | MessageType::MarketData
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Subscription data type discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataType {
    Level1,
    MarketDepth,
    Ticks,
    OrderLog,
    /// Time-frame candles
    Candles(Duration),
    News,
    Board,
    Securities,
    Portfolios,
    Transactions,
    PositionChanges,
}

impl DataType {
    /// Candles of the given time frame
    pub fn candles(time_frame: Duration) -> Self {
        DataType::Candles(time_frame)
    }

    /// Time frame of candle subscriptions
    pub fn time_frame(&self) -> Option<Duration> {
        match self {
            DataType::Candles(tf) => Some(*tf),
            _ => None,
        }
    }

    /// Whether this is a candle data type
    pub fn is_candles(&self) -> bool {
        matches!(self, DataType::Candles(_))
    }

    /// Market data keyed by a single security
    pub fn is_security_required(&self) -> bool {
        matches!(
            self,
            DataType::Level1
                | DataType::MarketDepth
                | DataType::Ticks
                | DataType::OrderLog
                | DataType::Candles(_)
        )
    }

    /// Data types served by every capable adapter at once rather than the
    /// single best one. Duplicates are expected and left to the caller.
    pub fn is_fan_out(&self) -> bool {
        matches!(
            self,
            DataType::News
                | DataType::Board
                | DataType::Securities
                | DataType::Portfolios
                | DataType::Transactions
                | DataType::PositionChanges
        )
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Candles(tf) => write!(f, "Candles({}s)", tf.as_secs()),
            other => fmt::Debug::fmt(other, f),
        }
    }
}
