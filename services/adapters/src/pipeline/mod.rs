//! Per-adapter decorator pipeline
//!
//! [`PipelineBuilder`] wraps a leaf adapter in optional layers. Layers are
//! applied in [`LayerKind::ORDER`]: the first listed sits directly on the
//! leaf, the last listed is outermost. A layer is applied only when its
//! switch is on and the leaf's capabilities satisfy its precondition.

mod layer;

pub use layer::LayerAdapter;

use crate::common::{Capabilities, MessageAdapter};
use crate::config::PipelineConfig;
use crate::BasketError;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use types::DataType;

/// Behavior layer kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerKind {
    Heartbeat,
    Offline,
    Channels,
    Latency,
    Slippage,
    NativeId,
    SecurityMapping,
    LookupTracking,
    TransactionOrdering,
    PositionEmulation,
    SubscriptionOnline,
    SubscribeAllSecurities,
    Level1Depth,
    Level1Extend,
    Pnl,
    Commission,
    SubscriptionLifecycle,
    FullCandleHolding,
    Storage,
    OrderLogSynthesis,
    OrderBookIncrement,
    OrderBookTruncation,
    CandleCompression,
    ExtendedInfo,
    GapFilling,
}

impl LayerKind {
    /// Application order, innermost first
    pub const ORDER: [LayerKind; 25] = [
        LayerKind::Heartbeat,
        LayerKind::Offline,
        LayerKind::Channels,
        LayerKind::Latency,
        LayerKind::Slippage,
        LayerKind::NativeId,
        LayerKind::SecurityMapping,
        LayerKind::LookupTracking,
        LayerKind::TransactionOrdering,
        LayerKind::PositionEmulation,
        LayerKind::SubscriptionOnline,
        LayerKind::SubscribeAllSecurities,
        LayerKind::Level1Depth,
        LayerKind::Level1Extend,
        LayerKind::Pnl,
        LayerKind::Commission,
        LayerKind::SubscriptionLifecycle,
        LayerKind::FullCandleHolding,
        LayerKind::Storage,
        LayerKind::OrderLogSynthesis,
        LayerKind::OrderBookIncrement,
        LayerKind::OrderBookTruncation,
        LayerKind::CandleCompression,
        LayerKind::ExtendedInfo,
        LayerKind::GapFilling,
    ];

    /// Kebab-case name used in configuration and logs
    pub fn name(self) -> &'static str {
        match self {
            LayerKind::Heartbeat => "heartbeat",
            LayerKind::Offline => "offline",
            LayerKind::Channels => "channels",
            LayerKind::Latency => "latency",
            LayerKind::Slippage => "slippage",
            LayerKind::NativeId => "native-id",
            LayerKind::SecurityMapping => "security-mapping",
            LayerKind::LookupTracking => "lookup-tracking",
            LayerKind::TransactionOrdering => "transaction-ordering",
            LayerKind::PositionEmulation => "position-emulation",
            LayerKind::SubscriptionOnline => "subscription-online",
            LayerKind::SubscribeAllSecurities => "subscribe-all-securities",
            LayerKind::Level1Depth => "level1-depth",
            LayerKind::Level1Extend => "level1-extend",
            LayerKind::Pnl => "pnl",
            LayerKind::Commission => "commission",
            LayerKind::SubscriptionLifecycle => "subscription-lifecycle",
            LayerKind::FullCandleHolding => "full-candle-holding",
            LayerKind::Storage => "storage",
            LayerKind::OrderLogSynthesis => "order-log-synthesis",
            LayerKind::OrderBookIncrement => "order-book-increment",
            LayerKind::OrderBookTruncation => "order-book-truncation",
            LayerKind::CandleCompression => "candle-compression",
            LayerKind::ExtendedInfo => "extended-info",
            LayerKind::GapFilling => "gap-filling",
        }
    }

    /// Layers kept when extra layers are ignored
    fn is_essential(self) -> bool {
        matches!(self, LayerKind::Heartbeat | LayerKind::Offline)
    }

    /// Capability precondition for wrapping a leaf
    fn applies_to(self, caps: &Capabilities) -> bool {
        match self {
            LayerKind::NativeId => caps.native_identifiers,
            LayerKind::PositionEmulation => {
                !caps.supports_data_type(&DataType::PositionChanges)
            }
            LayerKind::SubscriptionOnline | LayerKind::SubscriptionLifecycle => {
                caps.subscriptions
            }
            LayerKind::Level1Depth => {
                caps.supports_data_type(&DataType::Level1)
                    && !caps.supports_data_type(&DataType::MarketDepth)
            }
            LayerKind::Pnl => !caps.execution_pnl,
            LayerKind::FullCandleHolding => caps.full_candles_only,
            LayerKind::OrderLogSynthesis => caps.supports_data_type(&DataType::OrderLog),
            LayerKind::OrderBookIncrement => caps.order_book_increments,
            LayerKind::ExtendedInfo => !caps.extended_fields.is_empty(),
            _ => true,
        }
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LayerKind {
    type Err = BasketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LayerKind::ORDER
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| BasketError::Configuration(format!("unknown layer '{}'", s)))
    }
}

/// Leaf adapter together with the layers stacked on it
#[derive(Clone)]
pub struct ComposedAdapter {
    top: Arc<dyn MessageAdapter>,
    leaf: Arc<dyn MessageAdapter>,
}

impl ComposedAdapter {
    /// Outermost adapter; messages are sent here
    pub fn adapter(&self) -> &Arc<dyn MessageAdapter> {
        &self.top
    }

    /// The wrapped leaf
    pub fn leaf(&self) -> &Arc<dyn MessageAdapter> {
        &self.leaf
    }

    /// Applied layers from innermost to outermost
    pub fn layers(&self) -> Vec<LayerKind> {
        let mut layers = Vec::new();
        let mut current = Some(self.top.clone());
        while let Some(adapter) = current {
            if let Some(kind) = adapter.layer() {
                layers.push(kind);
            }
            current = adapter.inner();
        }
        layers.reverse();
        layers
    }

    /// Dispose the layers; the leaf is left to its owner
    pub async fn dispose(&self) {
        if self.top.layer().is_some() {
            self.top.dispose().await;
        }
    }
}

impl fmt::Debug for ComposedAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComposedAdapter")
            .field("leaf", &self.leaf.name())
            .field("layers", &self.layers())
            .finish()
    }
}

/// Builds the layer stack around leaf adapters
#[derive(Debug, Clone, Default)]
pub struct PipelineBuilder {
    config: PipelineConfig,
}

impl PipelineBuilder {
    /// Builder for the given layer switches
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    /// Layer switches in use
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Layers that [`PipelineBuilder::build`] would apply to a leaf
    pub fn plan(&self, caps: &Capabilities, heartbeat: bool) -> Vec<LayerKind> {
        LayerKind::ORDER
            .into_iter()
            .filter(|kind| self.config.is_enabled(*kind))
            .filter(|kind| !self.config.ignore_extra_layers || kind.is_essential())
            .filter(|kind| *kind != LayerKind::Heartbeat || heartbeat)
            .filter(|kind| kind.applies_to(caps))
            .collect()
    }

    /// Wrap `leaf`; `heartbeat` is the adapter's own heartbeat flag
    pub fn build(&self, leaf: Arc<dyn MessageAdapter>, heartbeat: bool) -> ComposedAdapter {
        let caps = leaf.capabilities();
        let mut top = leaf.clone();
        for kind in self.plan(&caps, heartbeat) {
            top = Arc::new(LayerAdapter::new(kind, top, &self.config));
        }

        tracing::debug!("Built pipeline for {}: {} layers", leaf.name(), layer_count(&top));
        ComposedAdapter { top, leaf }
    }
}

fn layer_count(top: &Arc<dyn MessageAdapter>) -> usize {
    let mut count = 0;
    let mut current = Some(top.clone());
    while let Some(adapter) = current {
        if adapter.layer().is_some() {
            count += 1;
        }
        current = adapter.inner();
    }
    count
}
