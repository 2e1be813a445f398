//! In-memory leaf adapter with scripted replies
//!
//! Stands in for a venue connection in tests and demos: every inbound
//! message is recorded and answered synchronously according to the script.

use crate::common::{Capabilities, MessageAdapter, OutputHub};
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;
use types::{
    AdapterId, DataType, ExecutionMessage, Message, MessageBody, MessageError, MessageType,
    OrderState, TransactionId, TransactionIdGenerator,
};

/// Reply to a Connect request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectReply {
    /// Answer connected
    Succeed,
    /// Answer with a connection error
    Fail(String),
    /// Stay connecting until [`ScriptedAdapter::emit`] is used
    Silent,
}

/// Reply to a subscribe request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionReply {
    /// Successful response
    Ok,
    /// Successful response followed by Online
    Online,
    /// Successful response followed by Finished
    Finished,
    /// Not-supported response
    NotSupported,
    /// Error response
    Error(String),
    /// No answer
    Silent,
}

/// Scripted leaf adapter
pub struct ScriptedAdapter {
    id: AdapterId,
    name: String,
    capabilities: Capabilities,
    transaction_ids: TransactionIdGenerator,
    output: OutputHub,
    connect_reply: Mutex<ConnectReply>,
    replies: Mutex<HashMap<DataType, SubscriptionReply>>,
    sent: Mutex<Vec<Message>>,
    disposed: AtomicUsize,
}

impl ScriptedAdapter {
    /// Adapter answering every request successfully
    pub fn new(name: impl Into<String>, capabilities: Capabilities) -> Self {
        Self {
            id: AdapterId::new(),
            name: name.into(),
            capabilities,
            transaction_ids: TransactionIdGenerator::new(),
            output: OutputHub::new(),
            connect_reply: Mutex::new(ConnectReply::Succeed),
            replies: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
            disposed: AtomicUsize::new(0),
        }
    }

    /// How the adapter answers Connect
    pub fn with_connect_reply(self, reply: ConnectReply) -> Self {
        *self.connect_reply.lock() = reply;
        self
    }

    /// Script the subscription answer for one data type
    pub fn with_reply(self, data_type: DataType, reply: SubscriptionReply) -> Self {
        self.replies.lock().insert(data_type, reply);
        self
    }

    /// Change the connect reply at runtime
    pub fn set_connect_reply(&self, reply: ConnectReply) {
        *self.connect_reply.lock() = reply;
    }

    /// Publish a message as if it came from the venue
    pub fn emit(&self, message: Message) {
        self.output.publish(message.with_adapter(self.id));
    }

    /// Every message received so far
    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().clone()
    }

    /// Received messages of one kind
    pub fn sent_of(&self, message_type: MessageType) -> Vec<Message> {
        self.sent
            .lock()
            .iter()
            .filter(|m| m.message_type() == message_type)
            .cloned()
            .collect()
    }

    /// Forget received messages
    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    /// Number of `dispose` calls
    pub fn dispose_count(&self) -> usize {
        self.disposed.load(Ordering::SeqCst)
    }

    fn subscription_reply(&self, data_type: &DataType) -> SubscriptionReply {
        self.replies
            .lock()
            .get(data_type)
            .cloned()
            .unwrap_or(SubscriptionReply::Ok)
    }

    fn execution(
        &self,
        original_transaction_id: TransactionId,
        portfolio_name: &str,
        state: OrderState,
    ) -> Message {
        Message::new(MessageBody::Execution(ExecutionMessage {
            original_transaction_id,
            subscription_ids: Vec::new(),
            portfolio_name: Some(portfolio_name.to_string()),
            security_id: None,
            order_state: Some(state),
            error: None,
            latency: None,
        }))
    }

    fn reply(&self, message: &Message) {
        match &message.body {
            MessageBody::Connect(_) => {
                let reply = self.connect_reply.lock().clone();
                match reply {
                    ConnectReply::Succeed => self.emit(Message::connect_result(None)),
                    ConnectReply::Fail(reason) => self.emit(Message::connect_result(Some(
                        MessageError::Connection(reason),
                    ))),
                    ConnectReply::Silent => {}
                }
            }
            MessageBody::Disconnect(_) => self.emit(Message::disconnect_result(None)),
            MessageBody::MarketData(md) if !md.is_subscribe => {
                self.emit(Message::subscription_response(md.transaction_id, None))
            }
            MessageBody::MarketData(md) => {
                let tx = md.transaction_id;
                match self.subscription_reply(&md.data_type) {
                    SubscriptionReply::Ok => self.emit(Message::subscription_response(tx, None)),
                    SubscriptionReply::Online => {
                        self.emit(Message::subscription_response(tx, None));
                        self.emit(Message::subscription_online(tx));
                    }
                    SubscriptionReply::Finished => {
                        self.emit(Message::subscription_response(tx, None));
                        self.emit(Message::subscription_finished(tx));
                    }
                    SubscriptionReply::NotSupported => self.emit(Message::subscription_response(
                        tx,
                        Some(MessageError::not_supported(MessageType::MarketData)),
                    )),
                    SubscriptionReply::Error(reason) => self.emit(
                        Message::subscription_response(tx, Some(MessageError::Adapter(reason))),
                    ),
                    SubscriptionReply::Silent => {}
                }
            }
            MessageBody::OrderRegister(order) => self.emit(self.execution(
                order.transaction_id,
                &order.portfolio_name,
                OrderState::Active,
            )),
            MessageBody::OrderReplace(order) => self.emit(self.execution(
                order.transaction_id,
                &order.portfolio_name,
                OrderState::Active,
            )),
            MessageBody::OrderCancel(order) => self.emit(self.execution(
                order.transaction_id,
                &order.portfolio_name,
                OrderState::Done,
            )),
            _ => {}
        }
    }
}

#[async_trait]
impl MessageAdapter for ScriptedAdapter {
    fn id(&self) -> AdapterId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities.clone()
    }

    fn transaction_ids(&self) -> &TransactionIdGenerator {
        &self.transaction_ids
    }

    async fn send_in(&self, message: Message, _cancel: &CancellationToken) -> Result<()> {
        self.sent.lock().push(message.clone());
        self.reply(&message);
        Ok(())
    }

    fn output(&self) -> &OutputHub {
        &self.output
    }

    async fn dispose(&self) {
        self.disposed.fetch_add(1, Ordering::SeqCst);
    }
}
