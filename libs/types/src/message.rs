//! Message envelope and bodies of the adapter protocol
//!
//! Every message is an [`Message`] envelope: an optional fixed target adapter,
//! the loop-back marker, and a typed [`MessageBody`]. Subscription-shaped
//! requests carry a unique `transaction_id`; responses reference it through
//! `original_transaction_id`. Data messages carry the ids of the
//! subscriptions they belong to in `subscription_ids`.

use crate::data_type::{DataType, MessageType};
use crate::error::MessageError;
use crate::ids::{AdapterId, SecurityId, TransactionId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Message envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Fixed target adapter for inbound requests, source adapter for events
    pub adapter: Option<AdapterId>,
    /// Loop-back marker: the message is re-injected into a dispatcher
    pub is_back: bool,
    /// Typed payload
    pub body: MessageBody,
}

/// Typed message payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessageBody {
    Reset,
    Connect(ConnectMessage),
    Disconnect(DisconnectMessage),
    ChangePassword(ChangePasswordMessage),
    OrderRegister(OrderRegisterMessage),
    OrderReplace(OrderReplaceMessage),
    OrderCancel(OrderCancelMessage),
    OrderGroupCancel(OrderGroupCancelMessage),
    MarketData(MarketDataMessage),
    SubscriptionResponse(SubscriptionResponseMessage),
    SubscriptionOnline(SubscriptionOnlineMessage),
    SubscriptionFinished(SubscriptionFinishedMessage),
    Execution(ExecutionMessage),
    Security(SecurityMessage),
    Portfolio(PortfolioMessage),
    PositionChange(PositionChangeMessage),
    MarketEvent(MarketEventMessage),
    Error(ErrorMessage),
}

/// Connection request (inbound) or connection result (outbound)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectMessage {
    pub error: Option<MessageError>,
}

/// Disconnection request (inbound) or result (outbound)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DisconnectMessage {
    pub error: Option<MessageError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangePasswordMessage {
    pub transaction_id: TransactionId,
    pub new_password: String,
}

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRegisterMessage {
    pub transaction_id: TransactionId,
    pub portfolio_name: String,
    pub security_id: SecurityId,
    pub side: Side,
    pub price: Decimal,
    pub volume: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderReplaceMessage {
    pub transaction_id: TransactionId,
    /// Transaction id of the order being replaced
    pub original_transaction_id: TransactionId,
    pub portfolio_name: String,
    pub security_id: SecurityId,
    pub price: Decimal,
    pub volume: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCancelMessage {
    pub transaction_id: TransactionId,
    /// Transaction id of the order being cancelled
    pub original_transaction_id: TransactionId,
    pub portfolio_name: String,
    pub security_id: SecurityId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderGroupCancelMessage {
    pub transaction_id: TransactionId,
    pub portfolio_name: Option<String>,
    pub security_id: Option<SecurityId>,
}

/// Subscribe or unsubscribe request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketDataMessage {
    pub transaction_id: TransactionId,
    /// For unsubscribes: the subscribe transaction being cancelled
    pub original_transaction_id: TransactionId,
    pub is_subscribe: bool,
    pub data_type: DataType,
    pub security_id: Option<SecurityId>,
    pub portfolio_name: Option<String>,
    /// Source data an order book is synthesized from, when not native
    pub build_from: Option<DataType>,
    /// Candles may be compressed from a smaller native time frame
    pub allow_build_from_smaller: bool,
    pub max_depth: Option<usize>,
}

impl MarketDataMessage {
    /// Subscribe request for `data_type`
    pub fn subscribe(transaction_id: TransactionId, data_type: DataType) -> Self {
        Self {
            transaction_id,
            original_transaction_id: TransactionId::NONE,
            is_subscribe: true,
            data_type,
            security_id: None,
            portfolio_name: None,
            build_from: None,
            allow_build_from_smaller: true,
            max_depth: None,
        }
    }

    /// Unsubscribe request cancelling `original_transaction_id`
    pub fn unsubscribe(
        transaction_id: TransactionId,
        original_transaction_id: TransactionId,
        data_type: DataType,
    ) -> Self {
        Self {
            original_transaction_id,
            is_subscribe: false,
            ..Self::subscribe(transaction_id, data_type)
        }
    }

    pub fn with_security(mut self, security_id: SecurityId) -> Self {
        self.security_id = Some(security_id);
        self
    }

    pub fn with_portfolio(mut self, portfolio_name: impl Into<String>) -> Self {
        self.portfolio_name = Some(portfolio_name.into());
        self
    }

    pub fn with_build_from(mut self, build_from: DataType) -> Self {
        self.build_from = Some(build_from);
        self
    }
}

/// Answer to a subscription request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionResponseMessage {
    pub original_transaction_id: TransactionId,
    pub error: Option<MessageError>,
}

impl SubscriptionResponseMessage {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn is_not_supported(&self) -> bool {
        self.error.as_ref().is_some_and(MessageError::is_not_supported)
    }
}

/// Subscription switched from history to live data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionOnlineMessage {
    pub original_transaction_id: TransactionId,
}

/// Subscription completed (history fully delivered)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionFinishedMessage {
    pub original_transaction_id: TransactionId,
}

/// Order state reported by an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    Pending,
    Active,
    Done,
    Failed,
}

/// Order/trade execution report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMessage {
    pub original_transaction_id: TransactionId,
    pub subscription_ids: Vec<TransactionId>,
    pub portfolio_name: Option<String>,
    pub security_id: Option<SecurityId>,
    pub order_state: Option<OrderState>,
    pub error: Option<MessageError>,
    /// Registration round-trip measured by the latency layer
    pub latency: Option<Duration>,
}

impl ExecutionMessage {
    /// Failed transaction report for `original_transaction_id`
    pub fn failed(original_transaction_id: TransactionId, error: MessageError) -> Self {
        Self {
            original_transaction_id,
            subscription_ids: Vec::new(),
            portfolio_name: None,
            security_id: None,
            order_state: Some(OrderState::Failed),
            error: Some(error),
            latency: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityMessage {
    pub security_id: SecurityId,
    pub subscription_ids: Vec<TransactionId>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioMessage {
    pub portfolio_name: String,
    pub subscription_ids: Vec<TransactionId>,
    pub error: Option<MessageError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionChangeMessage {
    pub portfolio_name: String,
    pub security_id: SecurityId,
    pub subscription_ids: Vec<TransactionId>,
    pub current_value: Decimal,
}

/// Market data payload (level1 fields, book levels, ticks, candles, news)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketEventMessage {
    pub data_type: DataType,
    pub security_id: Option<SecurityId>,
    pub subscription_ids: Vec<TransactionId>,
    pub fields: BTreeMap<String, Decimal>,
}

/// Error raised while handling `original`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub error: MessageError,
    pub original: Option<Box<Message>>,
}

impl Message {
    /// Wrap a body in an envelope without target adapter
    pub fn new(body: MessageBody) -> Self {
        Self {
            adapter: None,
            is_back: false,
            body,
        }
    }

    pub fn reset() -> Self {
        Self::new(MessageBody::Reset)
    }

    pub fn connect() -> Self {
        Self::new(MessageBody::Connect(ConnectMessage::default()))
    }

    /// Connection result carrying `error`
    pub fn connect_result(error: Option<MessageError>) -> Self {
        Self::new(MessageBody::Connect(ConnectMessage { error }))
    }

    pub fn disconnect() -> Self {
        Self::new(MessageBody::Disconnect(DisconnectMessage::default()))
    }

    /// Disconnection result carrying `error`
    pub fn disconnect_result(error: Option<MessageError>) -> Self {
        Self::new(MessageBody::Disconnect(DisconnectMessage { error }))
    }

    pub fn market_data(message: MarketDataMessage) -> Self {
        Self::new(MessageBody::MarketData(message))
    }

    pub fn subscription_response(
        original_transaction_id: TransactionId,
        error: Option<MessageError>,
    ) -> Self {
        Self::new(MessageBody::SubscriptionResponse(
            SubscriptionResponseMessage {
                original_transaction_id,
                error,
            },
        ))
    }

    pub fn subscription_online(original_transaction_id: TransactionId) -> Self {
        Self::new(MessageBody::SubscriptionOnline(SubscriptionOnlineMessage {
            original_transaction_id,
        }))
    }

    pub fn subscription_finished(original_transaction_id: TransactionId) -> Self {
        Self::new(MessageBody::SubscriptionFinished(
            SubscriptionFinishedMessage {
                original_transaction_id,
            },
        ))
    }

    /// Error message tagged with the message that caused it
    pub fn error(error: MessageError, original: Option<Message>) -> Self {
        Self::new(MessageBody::Error(ErrorMessage {
            error,
            original: original.map(Box::new),
        }))
    }

    /// Set the target/source adapter
    pub fn with_adapter(mut self, adapter: AdapterId) -> Self {
        self.adapter = Some(adapter);
        self
    }

    /// Mark for re-injection into the dispatcher owned by `adapter`
    pub fn looped_back(mut self, adapter: AdapterId) -> Self {
        self.adapter = Some(adapter);
        self.is_back = true;
        self
    }

    pub fn message_type(&self) -> MessageType {
        match &self.body {
            MessageBody::Reset => MessageType::Reset,
            MessageBody::Connect(_) => MessageType::Connect,
            MessageBody::Disconnect(_) => MessageType::Disconnect,
            MessageBody::ChangePassword(_) => MessageType::ChangePassword,
            MessageBody::OrderRegister(_) => MessageType::OrderRegister,
            MessageBody::OrderReplace(_) => MessageType::OrderReplace,
            MessageBody::OrderCancel(_) => MessageType::OrderCancel,
            MessageBody::OrderGroupCancel(_) => MessageType::OrderGroupCancel,
            MessageBody::MarketData(_) => MessageType::MarketData,
            MessageBody::SubscriptionResponse(_) => MessageType::SubscriptionResponse,
            MessageBody::SubscriptionOnline(_) => MessageType::SubscriptionOnline,
            MessageBody::SubscriptionFinished(_) => MessageType::SubscriptionFinished,
            MessageBody::Execution(_) => MessageType::Execution,
            MessageBody::Security(_) => MessageType::Security,
            MessageBody::Portfolio(_) => MessageType::Portfolio,
            MessageBody::PositionChange(_) => MessageType::PositionChange,
            MessageBody::MarketEvent(_) => MessageType::MarketEvent,
            MessageBody::Error(_) => MessageType::Error,
        }
    }

    /// Transaction id of request messages
    pub fn transaction_id(&self) -> Option<TransactionId> {
        match &self.body {
            MessageBody::ChangePassword(m) => Some(m.transaction_id),
            MessageBody::OrderRegister(m) => Some(m.transaction_id),
            MessageBody::OrderReplace(m) => Some(m.transaction_id),
            MessageBody::OrderCancel(m) => Some(m.transaction_id),
            MessageBody::OrderGroupCancel(m) => Some(m.transaction_id),
            MessageBody::MarketData(m) => Some(m.transaction_id),
            _ => None,
        }
    }

    /// Transaction id a response or correlated request refers to
    pub fn original_transaction_id(&self) -> Option<TransactionId> {
        match &self.body {
            MessageBody::OrderReplace(m) => Some(m.original_transaction_id),
            MessageBody::OrderCancel(m) => Some(m.original_transaction_id),
            MessageBody::MarketData(m) if !m.is_subscribe => Some(m.original_transaction_id),
            MessageBody::SubscriptionResponse(m) => Some(m.original_transaction_id),
            MessageBody::SubscriptionOnline(m) => Some(m.original_transaction_id),
            MessageBody::SubscriptionFinished(m) => Some(m.original_transaction_id),
            MessageBody::Execution(m) => Some(m.original_transaction_id),
            _ => None,
        }
    }

    /// Subscription ids of data messages, for rewriting
    pub fn subscription_ids_mut(&mut self) -> Option<&mut Vec<TransactionId>> {
        match &mut self.body {
            MessageBody::Execution(m) => Some(&mut m.subscription_ids),
            MessageBody::Security(m) => Some(&mut m.subscription_ids),
            MessageBody::Portfolio(m) => Some(&mut m.subscription_ids),
            MessageBody::PositionChange(m) => Some(&mut m.subscription_ids),
            MessageBody::MarketEvent(m) => Some(&mut m.subscription_ids),
            _ => None,
        }
    }

    /// Portfolio a message is keyed by
    pub fn portfolio_name(&self) -> Option<&str> {
        match &self.body {
            MessageBody::OrderRegister(m) => Some(m.portfolio_name.as_str()),
            MessageBody::OrderReplace(m) => Some(m.portfolio_name.as_str()),
            MessageBody::OrderCancel(m) => Some(m.portfolio_name.as_str()),
            MessageBody::OrderGroupCancel(m) => m.portfolio_name.as_deref(),
            MessageBody::MarketData(m) => m.portfolio_name.as_deref(),
            MessageBody::Execution(m) => m.portfolio_name.as_deref(),
            MessageBody::Portfolio(m) => Some(m.portfolio_name.as_str()),
            MessageBody::PositionChange(m) => Some(m.portfolio_name.as_str()),
            _ => None,
        }
        .filter(|name| !name.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsubscribe_references_original() {
        let msg = Message::market_data(MarketDataMessage::unsubscribe(
            TransactionId::new(7),
            TransactionId::new(3),
            DataType::Level1,
        ));

        assert_eq!(msg.message_type(), MessageType::MarketData);
        assert_eq!(msg.transaction_id(), Some(TransactionId::new(7)));
        assert_eq!(msg.original_transaction_id(), Some(TransactionId::new(3)));
    }

    #[test]
    fn test_subscribe_has_no_original() {
        let msg = Message::market_data(MarketDataMessage::subscribe(
            TransactionId::new(1),
            DataType::Ticks,
        ));
        assert_eq!(msg.original_transaction_id(), None);
    }

    #[test]
    fn test_loop_back_marks_message() {
        let basket = AdapterId::new();
        let msg = Message::connect().looped_back(basket);
        assert!(msg.is_back);
        assert_eq!(msg.adapter, Some(basket));
    }

    #[test]
    fn test_empty_portfolio_name_is_none() {
        let msg = Message::new(MessageBody::OrderGroupCancel(OrderGroupCancelMessage {
            transaction_id: TransactionId::new(1),
            portfolio_name: Some(String::new()),
            security_id: None,
        }));
        assert_eq!(msg.portfolio_name(), None);
    }

    #[test]
    fn test_json_wire_shape() {
        let msg = Message::subscription_response(
            TransactionId::new(5),
            Some(MessageError::NotSupported("MarketData".to_string())),
        );
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }
}
