//! Single decorator layer over an inner adapter

use super::LayerKind;
use crate::common::{Capabilities, HandlerId, MessageAdapter, OutputHub};
use crate::config::PipelineConfig;
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use types::{DataType, Message, MessageBody, TransactionId, TransactionIdGenerator};

/// Message rewriting performed by one layer
trait LayerBehavior: Send + Sync {
    /// Inbound (towards venue). `None` holds the message back.
    fn inbound(&self, message: Message) -> Option<Message> {
        Some(message)
    }

    /// Outbound (towards application). Returns held inbound messages that
    /// may now be released to the inner adapter.
    fn outbound(&self, _message: &mut Message) -> Vec<Message> {
        Vec::new()
    }
}

struct PassThrough;

impl LayerBehavior for PassThrough {}

/// Holds requests back until the inner adapter reports connected
#[derive(Default)]
struct Offline {
    state: Mutex<OfflineState>,
}

#[derive(Default)]
struct OfflineState {
    connected: bool,
    held: Vec<Message>,
}

impl LayerBehavior for Offline {
    fn inbound(&self, message: Message) -> Option<Message> {
        let mut state = self.state.lock();
        match &message.body {
            MessageBody::Reset => {
                state.connected = false;
                state.held.clear();
                Some(message)
            }
            MessageBody::Connect(_) | MessageBody::Disconnect(_) => Some(message),
            _ if state.connected => Some(message),
            _ => {
                tracing::debug!("Holding {} until connected", message.message_type());
                state.held.push(message);
                None
            }
        }
    }

    fn outbound(&self, message: &mut Message) -> Vec<Message> {
        let mut state = self.state.lock();
        match &message.body {
            MessageBody::Connect(connect) if connect.error.is_none() => {
                state.connected = true;
                std::mem::take(&mut state.held)
            }
            MessageBody::Connect(_) | MessageBody::Disconnect(_) => {
                state.connected = false;
                Vec::new()
            }
            _ => Vec::new(),
        }
    }
}

/// Measures order registration round trips
#[derive(Default)]
struct Latency {
    sent: Mutex<HashMap<TransactionId, Instant>>,
}

impl LayerBehavior for Latency {
    fn inbound(&self, message: Message) -> Option<Message> {
        match &message.body {
            MessageBody::OrderRegister(order) => {
                self.sent.lock().insert(order.transaction_id, Instant::now());
            }
            MessageBody::Reset => self.sent.lock().clear(),
            _ => {}
        }
        Some(message)
    }

    fn outbound(&self, message: &mut Message) -> Vec<Message> {
        if let MessageBody::Execution(execution) = &mut message.body {
            if let Some(started) = self.sent.lock().remove(&execution.original_transaction_id) {
                execution.latency = Some(started.elapsed());
            }
        }
        Vec::new()
    }
}

/// Applies a default depth to order book subscriptions
struct Truncation {
    depth: usize,
}

impl LayerBehavior for Truncation {
    fn inbound(&self, mut message: Message) -> Option<Message> {
        if let MessageBody::MarketData(md) = &mut message.body {
            if md.is_subscribe && md.data_type == DataType::MarketDepth && md.max_depth.is_none() {
                md.max_depth = Some(self.depth);
            }
        }
        Some(message)
    }
}

fn behavior_for(kind: LayerKind, config: &PipelineConfig) -> Arc<dyn LayerBehavior> {
    match kind {
        LayerKind::Offline => Arc::new(Offline::default()),
        LayerKind::Latency => Arc::new(Latency::default()),
        LayerKind::OrderBookTruncation => match config.order_book_depth {
            Some(depth) => Arc::new(Truncation { depth }),
            None => Arc::new(PassThrough),
        },
        _ => Arc::new(PassThrough),
    }
}

/// Adapter-shaped decorator wrapping an inner adapter
pub struct LayerAdapter {
    kind: LayerKind,
    name: String,
    inner: Arc<dyn MessageAdapter>,
    output: Arc<OutputHub>,
    handler: HandlerId,
    behavior: Arc<dyn LayerBehavior>,
}

impl LayerAdapter {
    /// Wrap `inner`, forwarding its output through this layer
    pub fn new(kind: LayerKind, inner: Arc<dyn MessageAdapter>, config: &PipelineConfig) -> Self {
        let output = Arc::new(OutputHub::new());
        let behavior = behavior_for(kind, config);

        let hub = output.clone();
        let rewrite = behavior.clone();
        let downstream: Weak<dyn MessageAdapter> = Arc::downgrade(&inner);
        let handler = inner.output().subscribe(Arc::new(move |mut message: Message| {
            let released = rewrite.outbound(&mut message);
            hub.publish(message);
            if !released.is_empty() {
                if let Some(target) = downstream.upgrade() {
                    release(target, released);
                }
            }
        }));

        Self {
            kind,
            name: format!("{}/{}", inner.name(), kind),
            inner,
            output,
            handler,
            behavior,
        }
    }
}

fn release(target: Arc<dyn MessageAdapter>, messages: Vec<Message>) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        tracing::warn!("Dropping {} held messages: no runtime", messages.len());
        return;
    };
    runtime.spawn(async move {
        let cancel = CancellationToken::new();
        for message in messages {
            if let Err(e) = target.send_in(message, &cancel).await {
                tracing::warn!("Failed to release held message to {}: {}", target.name(), e);
            }
        }
    });
}

#[async_trait]
impl MessageAdapter for LayerAdapter {
    fn id(&self) -> types::AdapterId {
        self.inner.id()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    fn transaction_ids(&self) -> &TransactionIdGenerator {
        self.inner.transaction_ids()
    }

    async fn send_in(&self, message: Message, cancel: &CancellationToken) -> Result<()> {
        match self.behavior.inbound(message) {
            Some(message) => self.inner.send_in(message, cancel).await,
            None => Ok(()),
        }
    }

    fn output(&self) -> &OutputHub {
        &self.output
    }

    fn inner(&self) -> Option<Arc<dyn MessageAdapter>> {
        Some(self.inner.clone())
    }

    fn layer(&self) -> Option<LayerKind> {
        Some(self.kind)
    }

    async fn dispose(&self) {
        self.inner.output().unsubscribe(self.handler);
        self.output.clear();
        if self.inner.layer().is_some() {
            self.inner.dispose().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineBuilder;
    use crate::scripted::{ConnectReply, ScriptedAdapter};
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use types::{
        MarketDataMessage, MessageType, OrderRegisterMessage, SecurityId, Side,
    };

    fn register(id: u64) -> Message {
        Message::new(MessageBody::OrderRegister(OrderRegisterMessage {
            transaction_id: TransactionId::new(id),
            portfolio_name: "main".to_string(),
            security_id: SecurityId::new("AAPL", "NASDAQ"),
            side: Side::Buy,
            price: dec!(187.5),
            volume: dec!(10),
        }))
    }

    fn collect(adapter: &Arc<dyn MessageAdapter>) -> Arc<Mutex<Vec<Message>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        adapter
            .output()
            .subscribe(Arc::new(move |m| sink.lock().push(m)));
        seen
    }

    #[tokio::test]
    async fn test_latency_layer_stamps_executions() {
        let leaf = Arc::new(ScriptedAdapter::new(
            "leaf",
            Capabilities::default().with_transactions(),
        ));
        let config = PipelineConfig::disabled().with(LayerKind::Latency, true);
        let composed = PipelineBuilder::new(config).build(leaf.clone(), true);
        let seen = collect(composed.adapter());

        composed
            .adapter()
            .send_in(register(1), &CancellationToken::new())
            .await
            .unwrap();

        let seen = seen.lock();
        let execution = seen
            .iter()
            .find_map(|m| match &m.body {
                MessageBody::Execution(e) => Some(e.clone()),
                _ => None,
            })
            .expect("execution published");
        assert!(execution.latency.is_some());
    }

    #[tokio::test]
    async fn test_offline_layer_holds_until_connected() {
        let leaf = Arc::new(
            ScriptedAdapter::new("leaf", Capabilities::market_data([DataType::Level1]))
                .with_connect_reply(ConnectReply::Silent),
        );
        let config = PipelineConfig::disabled().with(LayerKind::Offline, true);
        let composed = PipelineBuilder::new(config).build(leaf.clone(), true);
        let cancel = CancellationToken::new();

        composed.adapter().send_in(Message::connect(), &cancel).await.unwrap();
        composed
            .adapter()
            .send_in(
                Message::market_data(MarketDataMessage::subscribe(
                    TransactionId::new(5),
                    DataType::Level1,
                )),
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(leaf.sent_of(MessageType::MarketData).len(), 0);

        leaf.emit(Message::connect_result(None));
        for _ in 0..50 {
            if !leaf.sent_of(MessageType::MarketData).is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(leaf.sent_of(MessageType::MarketData).len(), 1);
    }

    #[tokio::test]
    async fn test_truncation_sets_default_depth() {
        let leaf = Arc::new(ScriptedAdapter::new(
            "leaf",
            Capabilities::market_data([DataType::MarketDepth]),
        ));
        let mut config = PipelineConfig::disabled().with(LayerKind::OrderBookTruncation, true);
        config.order_book_depth = Some(10);
        let composed = PipelineBuilder::new(config).build(leaf.clone(), true);

        composed
            .adapter()
            .send_in(
                Message::market_data(MarketDataMessage::subscribe(
                    TransactionId::new(1),
                    DataType::MarketDepth,
                )),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        match &leaf.sent_of(MessageType::MarketData)[0].body {
            MessageBody::MarketData(md) => assert_eq!(md.max_depth, Some(10)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dispose_detaches_layers_but_not_leaf() {
        let leaf = Arc::new(ScriptedAdapter::new(
            "leaf",
            Capabilities::market_data([DataType::Level1]),
        ));
        let config = PipelineConfig::disabled()
            .with(LayerKind::Heartbeat, true)
            .with(LayerKind::Storage, true);
        let composed = PipelineBuilder::new(config).build(leaf.clone(), true);
        assert_eq!(leaf.output().handler_count(), 1);

        composed.dispose().await;

        assert_eq!(leaf.output().handler_count(), 0);
        assert_eq!(leaf.dispose_count(), 0);
    }
}
