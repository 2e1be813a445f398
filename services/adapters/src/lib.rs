//! # Basket Adapter - Multi-Venue Message Aggregation
//!
//! ## Purpose
//!
//! Presents many venue connections as one [`MessageAdapter`]. The
//! application connects, subscribes and trades against the basket; the
//! basket decides which inner adapter serves each request and merges what
//! comes back into a single stream keyed by the application's own
//! transaction ids.
//!
//! ## Integration Points
//!
//! - **Inner adapters**: anything implementing [`MessageAdapter`], registered
//!   with a priority through [`BasketMessageAdapter::add_adapter`]
//! - **Pipelines**: each inner adapter is wrapped by [`PipelineBuilder`] in
//!   the behavior layers enabled by [`PipelineConfig`]
//! - **Output**: every event is published on the basket's [`OutputHub`]
//! - **Configuration**: [`BasketConfig`] from TOML or `BASKET_*` environment
//!   variables
//!
//! ## Routing Rules
//!
//! - A message naming an adapter goes to exactly that adapter
//! - Portfolio and security affinity, learned from inbound portfolio,
//!   position and security events, wins over capability matching
//! - Otherwise the connected adapters are filtered by capability in
//!   priority order; lookups and general news fan out to all of them
//! - Requests arriving before any adapter is connected are queued and
//!   replayed in order once one is
//!
//! ## Quick Start
//!
//! ```no_run
//! use basket_adapter::{BasketConfig, BasketMessageAdapter, Capabilities, MessageAdapter, ScriptedAdapter};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use types::{DataType, MarketDataMessage, Message, SecurityId};
//!
//! # async fn run() -> basket_adapter::Result<()> {
//! let basket = BasketMessageAdapter::new(BasketConfig::from_env());
//! let venue = Arc::new(ScriptedAdapter::new(
//!     "venue",
//!     Capabilities::market_data([DataType::Level1, DataType::MarketDepth]),
//! ));
//! basket.add_adapter(venue, 1)?;
//!
//! let cancel = CancellationToken::new();
//! basket.send_in(Message::connect(), &cancel).await?;
//!
//! let tx = basket.transaction_ids().next_id();
//! let request = MarketDataMessage::subscribe(tx, DataType::MarketDepth)
//!     .with_security(SecurityId::new("AAPL", "NASDAQ"));
//! basket.send_in(Message::market_data(request), &cancel).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Adapter contract and shared plumbing
pub mod common;
pub mod config;
pub mod error;

// Aggregation state
pub mod connection;
pub mod parent_child;
pub mod pending;
pub mod registry;
pub mod router;

// Per-adapter decorators
pub mod pipeline;

// The aggregate itself
pub mod basket;

// In-memory venue for tests and demos
pub mod scripted;

pub use basket::{error_response, BasketMessageAdapter};
pub use common::{
    send_with_cancel, underlying, Capabilities, HandlerId, MessageAdapter, MessageHandler,
    OutputHub,
};
pub use config::{BasketConfig, PipelineConfig};
pub use connection::{AggregateEvent, ConnectionState, ConnectionStateTracker};
pub use error::{BasketError, Result};
pub use parent_child::{ChildInfo, ChildState, ParentChildMap};
pub use pending::{PendingMessage, PendingQueue};
pub use pipeline::{ComposedAdapter, LayerAdapter, LayerKind, PipelineBuilder};
pub use registry::{AdapterRegistry, DISABLED_PRIORITY};
pub use router::{Candidate, RoutedAdapter, RoutingView, Selection, SubscriptionRouter};
pub use scripted::{ConnectReply, ScriptedAdapter, SubscriptionReply};

// Re-export message types for convenience
pub use types::{AdapterId, DataType, Message, MessageBody, MessageError, MessageType, TransactionId};

/// Architecture diagram showing how a request travels through the basket
#[cfg_attr(doc, aquamarine::aquamarine)]
/// ```mermaid
/// graph LR
///     subgraph App["Application"]
///         direction TB
///         RQ[Requests]
///         EV[Events]
///     end
///
///     subgraph Basket["Basket Adapter"]
///         direction TB
///         DI[Dispatcher]
///         RO[Router]
///         PC[Parent/Child Map]
///         CS[Connection Tracker]
///         PQ[Pending Queue]
///     end
///
///     subgraph Pipelines["Per-Adapter Pipelines"]
///         direction TB
///         L1[Layers A]
///         L2[Layers B]
///     end
///
///     subgraph Venues["Inner Adapters"]
///         direction TB
///         VA[Venue A]
///         VB[Venue B]
///     end
///
///     RQ --> DI
///     DI --> RO
///     DI --> PQ
///     RO --> L1
///     RO --> L2
///     L1 --> VA
///     L2 --> VB
///     VA --> CS
///     VB --> PC
///     CS --> EV
///     PC --> EV
///
///     style App fill:#e3f2fd
///     style Basket fill:#fff3e0
///     style Pipelines fill:#e8f5e9
///     style Venues fill:#ffebee
/// ```
pub fn architecture_diagram() {
    // Rendered by aquamarine in rustdoc
}
