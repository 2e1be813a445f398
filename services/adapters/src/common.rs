//! # Common Adapter Infrastructure
//!
//! Shared trait definitions for leaf venue adapters, pipeline layers and the
//! basket itself. Every participant exposes the same send/receive contract so
//! the rest of the system never distinguishes a leaf from its decorated form.

use crate::pipeline::LayerKind;
use crate::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use types::{AdapterId, DataType, Message, MessageError, MessageType, SecurityId, TransactionIdGenerator};

// ============================================================================
// CORE TRAIT
// ============================================================================

/// Contract shared by leaf adapters, pipeline layers and the basket
#[async_trait]
pub trait MessageAdapter: Send + Sync {
    /// Stable identity. Layers report the id of the adapter they wrap.
    fn id(&self) -> AdapterId;

    /// Human readable name
    fn name(&self) -> &str;

    /// Declared capability surface
    fn capabilities(&self) -> Capabilities;

    /// Transaction id source owned by this adapter
    fn transaction_ids(&self) -> &TransactionIdGenerator;

    /// Send a message towards the venue
    ///
    /// The cancellation token is checked before the message is issued.
    async fn send_in(&self, message: Message, cancel: &CancellationToken) -> Result<()>;

    /// Outbound event registry (venue towards application)
    fn output(&self) -> &OutputHub;

    /// Wrapped adapter, for layers
    fn inner(&self) -> Option<Arc<dyn MessageAdapter>> {
        None
    }

    /// Layer kind, for layers
    fn layer(&self) -> Option<LayerKind> {
        None
    }

    /// Release resources held by this adapter
    async fn dispose(&self) {}
}

/// Walk down the decorator stack to the leaf adapter
pub fn underlying(adapter: &Arc<dyn MessageAdapter>) -> Arc<dyn MessageAdapter> {
    let mut current = adapter.clone();
    while let Some(inner) = current.inner() {
        current = inner;
    }
    current
}

/// Send unless the caller already cancelled
pub async fn send_with_cancel(
    adapter: &Arc<dyn MessageAdapter>,
    message: Message,
    cancel: &CancellationToken,
) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(MessageError::Cancelled.into());
    }
    adapter.send_in(message, cancel).await
}

// ============================================================================
// CAPABILITIES
// ============================================================================

/// Capability surface declared by an adapter
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Capabilities {
    /// Inbound message kinds the adapter accepts
    pub message_types: BTreeSet<MessageType>,
    /// Market data types served natively (candles listed separately)
    pub data_types: BTreeSet<DataType>,
    /// Candle time frames served natively
    pub candle_time_frames: BTreeSet<Duration>,
    /// Securities the adapter refuses for a given data type
    pub excluded_securities: BTreeMap<DataType, BTreeSet<SecurityId>>,
    /// News only per security, never the general feed
    pub security_news_only: bool,
    /// Security lookup without criteria is allowed
    pub lookup_all: bool,
    /// Venue uses its own instrument identifiers
    pub native_identifiers: bool,
    /// Only finished candles are delivered
    pub full_candles_only: bool,
    /// Order books arrive as increments
    pub order_book_increments: bool,
    /// Executions already carry PnL
    pub execution_pnl: bool,
    /// Subscription lifecycle messages are emitted
    pub subscriptions: bool,
    /// Extra security fields the venue reports
    pub extended_fields: Vec<String>,
}

impl Capabilities {
    /// Market data adapter serving `data_types`
    pub fn market_data(data_types: impl IntoIterator<Item = DataType>) -> Self {
        let mut caps = Self {
            subscriptions: true,
            ..Self::default()
        };
        caps.message_types.extend([
            MessageType::Reset,
            MessageType::Connect,
            MessageType::Disconnect,
            MessageType::MarketData,
        ]);
        for data_type in data_types {
            caps.add_data_type(data_type);
        }
        caps
    }

    /// Add transactional message kinds (orders, password change)
    pub fn with_transactions(mut self) -> Self {
        self.message_types.extend([
            MessageType::Reset,
            MessageType::Connect,
            MessageType::Disconnect,
            MessageType::ChangePassword,
            MessageType::OrderRegister,
            MessageType::OrderReplace,
            MessageType::OrderCancel,
            MessageType::OrderGroupCancel,
        ]);
        self
    }

    /// Add a data type; candles register their time frame
    pub fn add_data_type(&mut self, data_type: DataType) {
        match data_type {
            DataType::Candles(time_frame) => {
                self.candle_time_frames.insert(time_frame);
            }
            other => {
                self.data_types.insert(other);
            }
        }
    }

    /// Builder form of [`Capabilities::add_data_type`]
    pub fn with_data_type(mut self, data_type: DataType) -> Self {
        self.add_data_type(data_type);
        self
    }

    /// Refuse `security` for `data_type`
    pub fn exclude_security(mut self, data_type: DataType, security: SecurityId) -> Self {
        self.excluded_securities
            .entry(data_type)
            .or_default()
            .insert(security);
        self
    }

    /// Whether the message type is supported
    pub fn supports_message(&self, message_type: MessageType) -> bool {
        self.message_types.contains(&message_type)
    }

    /// Native support for a data type
    pub fn supports_data_type(&self, data_type: &DataType) -> bool {
        match data_type {
            DataType::Candles(time_frame) => self.candle_time_frames.contains(time_frame),
            other => self.data_types.contains(other),
        }
    }

    /// Whether `security` is not excluded for `data_type`
    pub fn supports_security(&self, data_type: &DataType, security: &SecurityId) -> bool {
        self.excluded_securities
            .get(data_type)
            .map_or(true, |excluded| !excluded.contains(security))
    }

    /// Largest native time frame strictly smaller than `time_frame`
    pub fn smaller_time_frame(&self, time_frame: Duration) -> Option<Duration> {
        self.candle_time_frames.range(..time_frame).next_back().copied()
    }

    /// Merge another surface into this one. Support flags combine with
    /// `any`, restriction flags with `all`.
    pub fn merge(&mut self, other: &Capabilities, first: bool) {
        self.message_types.extend(other.message_types.iter().copied());
        self.data_types.extend(other.data_types.iter().copied());
        self.candle_time_frames
            .extend(other.candle_time_frames.iter().copied());
        for field in &other.extended_fields {
            if !self.extended_fields.contains(field) {
                self.extended_fields.push(field.clone());
            }
        }
        self.lookup_all |= other.lookup_all;
        self.native_identifiers |= other.native_identifiers;
        self.order_book_increments |= other.order_book_increments;
        self.execution_pnl |= other.execution_pnl;
        self.subscriptions |= other.subscriptions;
        if first {
            self.security_news_only = other.security_news_only;
            self.full_candles_only = other.full_candles_only;
        } else {
            self.security_news_only &= other.security_news_only;
            self.full_candles_only &= other.full_candles_only;
        }
    }
}

// ============================================================================
// OUTPUT HUB
// ============================================================================

/// Outbound message callback
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Handle returned by [`OutputHub::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Publish/subscribe registry for outbound messages
///
/// `publish` snapshots the handler list and invokes every handler once per
/// message with the lock released, so handlers may (un)subscribe freely.
#[derive(Default)]
pub struct OutputHub {
    next: AtomicU64,
    handlers: RwLock<Vec<(HandlerId, MessageHandler)>>,
}

impl OutputHub {
    /// Create new output hub
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler
    pub fn subscribe(&self, handler: MessageHandler) -> HandlerId {
        let id = HandlerId(self.next.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().push((id, handler));
        id
    }

    /// Remove a handler; returns whether it was registered
    pub fn unsubscribe(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        handlers.len() != before
    }

    /// Deliver a message to every registered handler
    pub fn publish(&self, message: Message) {
        let snapshot: Vec<MessageHandler> = self
            .handlers
            .read()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();

        let Some((last, rest)) = snapshot.split_last() else {
            return;
        };
        for handler in rest {
            handler(message.clone());
        }
        last(message);
    }

    /// Number of subscribed handlers
    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    /// Drop every handler
    pub fn clear(&self) {
        self.handlers.write().clear();
    }
}

impl std::fmt::Debug for OutputHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputHub")
            .field("handlers", &self.handler_count())
            .finish()
    }
}
