//! Shared harness for basket integration tests

#![allow(dead_code)]

use basket_adapter::{
    BasketConfig, BasketMessageAdapter, Capabilities, MessageAdapter, ScriptedAdapter,
};
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use types::{
    DataType, MarketDataMessage, Message, MessageBody, OrderRegisterMessage, SecurityId, Side,
    TransactionId,
};

const WAIT: Duration = Duration::from_secs(2);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Basket wired to a channel that records everything it publishes
pub struct Harness {
    pub basket: BasketMessageAdapter,
    pub cancel: CancellationToken,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl Harness {
    pub fn new(config: BasketConfig) -> Self {
        init_tracing();
        let basket = BasketMessageAdapter::new(config);
        let (tx, rx) = mpsc::unbounded_channel();
        basket.output().subscribe(Arc::new(move |message: Message| {
            let _ = tx.send(message);
        }));
        Self {
            basket,
            cancel: CancellationToken::new(),
            rx,
        }
    }

    pub fn add(&self, adapter: &Arc<ScriptedAdapter>, priority: i32) {
        self.basket
            .add_adapter(adapter.clone(), priority)
            .expect("adapter registered");
    }

    pub async fn send(&self, message: Message) {
        self.basket
            .send_in(message, &self.cancel)
            .await
            .expect("message accepted");
    }

    /// Connect and wait for the aggregate connect result
    pub async fn connect(&mut self) -> Message {
        self.send(Message::connect()).await;
        self.next_where(is_aggregate_connect).await
    }

    /// Next published message matching `predicate`; others are skipped
    pub async fn next_where(&mut self, predicate: impl Fn(&Message) -> bool) -> Message {
        loop {
            let message = tokio::time::timeout(WAIT, self.rx.recv())
                .await
                .expect("timed out waiting for message")
                .expect("output closed");
            if predicate(&message) {
                return message;
            }
        }
    }

    /// Everything published so far that has not been consumed
    pub fn drain(&mut self) -> Vec<Message> {
        let mut messages = Vec::new();
        while let Ok(message) = self.rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    pub fn next_transaction_id(&self) -> TransactionId {
        self.basket.transaction_ids().next_id()
    }
}

pub fn venue(name: &str, data_types: impl IntoIterator<Item = DataType>) -> Arc<ScriptedAdapter> {
    Arc::new(ScriptedAdapter::new(name, Capabilities::market_data(data_types)))
}

pub fn trading_venue(name: &str) -> Arc<ScriptedAdapter> {
    Arc::new(ScriptedAdapter::new(
        name,
        Capabilities::market_data([DataType::Level1, DataType::Portfolios]).with_transactions(),
    ))
}

pub fn aapl() -> SecurityId {
    SecurityId::new("AAPL", "NASDAQ")
}

pub fn subscribe(tx: TransactionId, data_type: DataType) -> Message {
    Message::market_data(MarketDataMessage::subscribe(tx, data_type).with_security(aapl()))
}

pub fn unsubscribe(tx: TransactionId, original: TransactionId, data_type: DataType) -> Message {
    Message::market_data(
        MarketDataMessage::unsubscribe(tx, original, data_type).with_security(aapl()),
    )
}

pub fn register(tx: TransactionId, portfolio: &str) -> Message {
    Message::new(MessageBody::OrderRegister(OrderRegisterMessage {
        transaction_id: tx,
        portfolio_name: portfolio.to_string(),
        security_id: aapl(),
        side: Side::Buy,
        price: dec!(187.25),
        volume: dec!(100),
    }))
}

pub fn is_aggregate_connect(message: &Message) -> bool {
    message.adapter.is_none() && matches!(message.body, MessageBody::Connect(_))
}

pub fn is_aggregate_disconnect(message: &Message) -> bool {
    message.adapter.is_none() && matches!(message.body, MessageBody::Disconnect(_))
}

pub fn response_to(tx: TransactionId) -> impl Fn(&Message) -> bool {
    move |message| {
        matches!(&message.body, MessageBody::SubscriptionResponse(r) if r.original_transaction_id == tx)
    }
}

pub fn execution_for(tx: TransactionId) -> impl Fn(&Message) -> bool {
    move |message| {
        matches!(&message.body, MessageBody::Execution(e) if e.original_transaction_id == tx)
    }
}

/// Transaction ids of the market data requests an adapter received
pub fn market_data_ids(adapter: &ScriptedAdapter) -> Vec<TransactionId> {
    adapter
        .sent_of(types::MessageType::MarketData)
        .iter()
        .filter_map(Message::transaction_id)
        .collect()
}
