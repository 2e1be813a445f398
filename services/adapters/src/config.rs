//! Configuration module for the basket adapter
//!
//! Provides defaults, environment-based loading and TOML loading

use crate::pipeline::LayerKind;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;

/// Per-layer switches of the pipeline built around each leaf adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Only heartbeat and offline layers are applied
    pub ignore_extra_layers: bool,
    /// Periodic ping and reconnect
    pub heartbeat: bool,
    /// Hold requests while the adapter is down
    pub offline: bool,
    /// Channel state tracking
    pub channels: bool,
    /// Stamp executions with round-trip latency
    pub latency: bool,
    /// Slippage on own trades
    pub slippage: bool,
    /// Map venue-native security ids
    pub native_id: bool,
    /// Rename securities
    pub security_mapping: bool,
    /// Time out lookups the venue never finishes
    pub lookup_tracking: bool,
    /// Order executions by transaction
    pub transaction_ordering: bool,
    /// Build positions from own trades
    pub position_emulation: bool,
    /// Emit online for venues that do not
    pub subscription_online: bool,
    /// Subscribe all securities for one request
    pub subscribe_all_securities: bool,
    /// Build depth from Level1
    pub level1_depth: bool,
    /// Extend Level1 with depth fields
    pub level1_extend: bool,
    /// Profit and loss
    pub pnl: bool,
    /// Commission
    pub commission: bool,
    /// Restore subscriptions after a reconnect
    pub subscription_lifecycle: bool,
    /// Only emit finished candles
    pub full_candle_holding: bool,
    /// Persist received data
    pub storage: bool,
    /// Build depth and ticks from the order log
    pub order_log_synthesis: bool,
    /// Apply incremental order book updates
    pub order_book_increment: bool,
    /// Truncate order books to the requested depth
    pub order_book_truncation: bool,
    /// Build candles from other data
    pub candle_compression: bool,
    /// Extended security and order fields
    pub extended_info: bool,
    /// Fill gaps in market data
    pub gap_filling: bool,
    /// Depth applied by the truncation layer when a request sets none
    pub order_book_depth: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ignore_extra_layers: false,
            heartbeat: true,
            offline: false,
            channels: false,
            latency: false,
            slippage: false,
            native_id: false,
            security_mapping: false,
            lookup_tracking: true,
            transaction_ordering: false,
            position_emulation: false,
            subscription_online: false,
            subscribe_all_securities: false,
            level1_depth: false,
            level1_extend: false,
            pnl: false,
            commission: false,
            subscription_lifecycle: true,
            full_candle_holding: false,
            storage: false,
            order_log_synthesis: true,
            order_book_increment: false,
            order_book_truncation: true,
            candle_compression: true,
            extended_info: false,
            gap_filling: false,
            order_book_depth: None,
        }
    }
}

impl PipelineConfig {
    /// Every switch off
    pub fn disabled() -> Self {
        let mut config = Self::default();
        for kind in LayerKind::ORDER {
            config.set_enabled(kind, false);
        }
        config
    }

    /// Whether the switch for `kind` is on
    pub fn is_enabled(&self, kind: LayerKind) -> bool {
        *self.switch(kind)
    }

    /// Turn the switch for `kind` on or off
    pub fn set_enabled(&mut self, kind: LayerKind, enabled: bool) {
        *self.switch_mut(kind) = enabled;
    }

    /// Builder form of [`PipelineConfig::set_enabled`]
    pub fn with(mut self, kind: LayerKind, enabled: bool) -> Self {
        self.set_enabled(kind, enabled);
        self
    }

    fn switch(&self, kind: LayerKind) -> &bool {
        match kind {
            LayerKind::Heartbeat => &self.heartbeat,
            LayerKind::Offline => &self.offline,
            LayerKind::Channels => &self.channels,
            LayerKind::Latency => &self.latency,
            LayerKind::Slippage => &self.slippage,
            LayerKind::NativeId => &self.native_id,
            LayerKind::SecurityMapping => &self.security_mapping,
            LayerKind::LookupTracking => &self.lookup_tracking,
            LayerKind::TransactionOrdering => &self.transaction_ordering,
            LayerKind::PositionEmulation => &self.position_emulation,
            LayerKind::SubscriptionOnline => &self.subscription_online,
            LayerKind::SubscribeAllSecurities => &self.subscribe_all_securities,
            LayerKind::Level1Depth => &self.level1_depth,
            LayerKind::Level1Extend => &self.level1_extend,
            LayerKind::Pnl => &self.pnl,
            LayerKind::Commission => &self.commission,
            LayerKind::SubscriptionLifecycle => &self.subscription_lifecycle,
            LayerKind::FullCandleHolding => &self.full_candle_holding,
            LayerKind::Storage => &self.storage,
            LayerKind::OrderLogSynthesis => &self.order_log_synthesis,
            LayerKind::OrderBookIncrement => &self.order_book_increment,
            LayerKind::OrderBookTruncation => &self.order_book_truncation,
            LayerKind::CandleCompression => &self.candle_compression,
            LayerKind::ExtendedInfo => &self.extended_info,
            LayerKind::GapFilling => &self.gap_filling,
        }
    }

    fn switch_mut(&mut self, kind: LayerKind) -> &mut bool {
        match kind {
            LayerKind::Heartbeat => &mut self.heartbeat,
            LayerKind::Offline => &mut self.offline,
            LayerKind::Channels => &mut self.channels,
            LayerKind::Latency => &mut self.latency,
            LayerKind::Slippage => &mut self.slippage,
            LayerKind::NativeId => &mut self.native_id,
            LayerKind::SecurityMapping => &mut self.security_mapping,
            LayerKind::LookupTracking => &mut self.lookup_tracking,
            LayerKind::TransactionOrdering => &mut self.transaction_ordering,
            LayerKind::PositionEmulation => &mut self.position_emulation,
            LayerKind::SubscriptionOnline => &mut self.subscription_online,
            LayerKind::SubscribeAllSecurities => &mut self.subscribe_all_securities,
            LayerKind::Level1Depth => &mut self.level1_depth,
            LayerKind::Level1Extend => &mut self.level1_extend,
            LayerKind::Pnl => &mut self.pnl,
            LayerKind::Commission => &mut self.commission,
            LayerKind::SubscriptionLifecycle => &mut self.subscription_lifecycle,
            LayerKind::FullCandleHolding => &mut self.full_candle_holding,
            LayerKind::Storage => &mut self.storage,
            LayerKind::OrderLogSynthesis => &mut self.order_log_synthesis,
            LayerKind::OrderBookIncrement => &mut self.order_book_increment,
            LayerKind::OrderBookTruncation => &mut self.order_book_truncation,
            LayerKind::CandleCompression => &mut self.candle_compression,
            LayerKind::ExtendedInfo => &mut self.extended_info,
            LayerKind::GapFilling => &mut self.gap_filling,
        }
    }

    /// Load configuration from environment variables with defaults
    ///
    /// `BASKET_LAYERS` (comma separated layer names) replaces the enabled
    /// set when present.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(layers) = env::var("BASKET_LAYERS") {
            config = Self {
                order_book_depth: config.order_book_depth,
                ..Self::disabled()
            };
            for name in layers.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                match name.parse::<LayerKind>() {
                    Ok(kind) => config.set_enabled(kind, true),
                    Err(e) => tracing::warn!("Ignoring BASKET_LAYERS entry: {}", e),
                }
            }
        }

        config.ignore_extra_layers = env::var("BASKET_IGNORE_EXTRA_LAYERS")
            .map(|s| s.to_lowercase() == "true")
            .unwrap_or(config.ignore_extra_layers);

        config.order_book_depth = env::var("BASKET_ORDER_BOOK_DEPTH")
            .ok()
            .and_then(|s| s.parse().ok())
            .or(config.order_book_depth);

        config
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.order_book_depth == Some(0) {
            return Err("Order book depth must be greater than 0".to_string());
        }
        if self.order_book_depth.is_some() && !self.order_book_truncation {
            return Err("Order book depth requires the order book truncation layer".to_string());
        }
        Ok(())
    }
}

/// Basket adapter configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BasketConfig {
    /// Basket name reported through the adapter contract
    pub name: String,

    /// Declare the basket connected on the first successful adapter instead
    /// of waiting until no adapter is still connecting
    pub connect_on_first_adapter: bool,

    /// Pipeline applied to every leaf adapter
    pub pipeline: PipelineConfig,
}

impl Default for BasketConfig {
    fn default() -> Self {
        Self {
            name: "basket".to_string(),
            connect_on_first_adapter: true,
            pipeline: PipelineConfig::default(),
        }
    }
}

impl BasketConfig {
    /// Load complete configuration from environment
    pub fn from_env() -> Self {
        Self {
            name: env::var("BASKET_NAME").unwrap_or_else(|_| "basket".to_string()),

            connect_on_first_adapter: env::var("BASKET_CONNECT_ON_FIRST_ADAPTER")
                .map(|s| s.to_lowercase() == "true")
                .unwrap_or(true),

            pipeline: PipelineConfig::from_env(),
        }
    }

    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse basket config")?;
        config.validate().map_err(anyhow::Error::msg)?;
        Ok(config)
    }

    /// Load a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    /// Validate all configurations
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("Basket name cannot be empty".to_string());
        }
        self.pipeline.validate()
    }
}
