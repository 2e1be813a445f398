//! Adapter selection for outbound messages
//!
//! Selection order: an explicit target adapter, then the affinity caches,
//! then capability filtering over the priority-ordered connected adapters
//! with data-type specific refinement.

use crate::common::{Capabilities, MessageAdapter};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use types::{AdapterId, DataType, MarketDataMessage, Message, MessageBody, SecurityId, TransactionId};

/// Connected adapter as seen by the router
#[derive(Clone)]
pub struct RoutedAdapter {
    /// Leaf id
    pub id: AdapterId,
    /// Composed form messages are sent to
    pub adapter: Arc<dyn MessageAdapter>,
    /// Leaf capabilities
    pub capabilities: Capabilities,
}

/// Snapshot of the basket the router decides over
#[derive(Default)]
pub struct RoutingView {
    /// Connected adapters in priority order
    pub connected: Vec<RoutedAdapter>,
    /// Adapters still connecting
    pub connecting: HashSet<AdapterId>,
}

impl RoutingView {
    fn find(&self, id: AdapterId) -> Option<&RoutedAdapter> {
        self.connected.iter().find(|a| a.id == id)
    }

    fn has_pending(&self) -> bool {
        !self.connecting.is_empty()
    }
}

/// One selected adapter
#[derive(Clone)]
pub struct Candidate {
    /// Selected adapter
    pub adapter: RoutedAdapter,
    /// Source data type the request must be built from, if not native
    pub build_from: Option<DataType>,
}

impl std::fmt::Debug for Candidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Candidate")
            .field("adapter", &self.adapter.id)
            .field("build_from", &self.build_from)
            .finish()
    }
}

/// Routing decision
#[derive(Debug, Default)]
pub struct Selection {
    /// Remaining candidates in priority order
    pub candidates: Vec<Candidate>,
    /// No candidate yet but adapters are still connecting
    pub is_pending: bool,
    /// The message named its adapter explicitly
    pub exact: bool,
}

impl Selection {
    fn exact(adapter: RoutedAdapter) -> Self {
        Self {
            candidates: vec![Candidate {
                adapter,
                build_from: None,
            }],
            is_pending: false,
            exact: true,
        }
    }

    fn pending() -> Self {
        Self {
            is_pending: true,
            ..Self::default()
        }
    }

    /// Whether no adapter was selected
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

/// Routing state: affinity caches and per-transaction not-supported sets.
///
/// Owners set from outside are kept apart from learned ones, take
/// precedence over them and survive [`SubscriptionRouter::clear`].
#[derive(Debug, Default)]
pub struct SubscriptionRouter {
    portfolio_adapters: HashMap<String, AdapterId>,
    security_adapters: HashMap<(SecurityId, Option<DataType>), AdapterId>,
    seeded_portfolios: HashMap<String, AdapterId>,
    seeded_securities: HashMap<(SecurityId, Option<DataType>), AdapterId>,
    not_supported: HashMap<TransactionId, HashSet<AdapterId>>,
}

impl SubscriptionRouter {
    /// Create a router with empty caches
    pub fn new() -> Self {
        Self::default()
    }

    /// Choose the adapter(s) for `message`
    pub fn select(&self, message: &Message, view: &RoutingView) -> Selection {
        if let Some(id) = message.adapter {
            return match view.find(id) {
                Some(adapter) => Selection::exact(adapter.clone()),
                None if view.connecting.contains(&id) => Selection::pending(),
                None => Selection::default(),
            };
        }

        let excluded = message
            .transaction_id()
            .and_then(|tx| self.not_supported.get(&tx));
        let is_excluded = |id: AdapterId| excluded.is_some_and(|set| set.contains(&id));

        if let Some(id) = self.affinity(message) {
            if let Some(adapter) = view.find(id).filter(|a| !is_excluded(a.id)) {
                tracing::debug!("Routing {} by affinity to {}", message.message_type(), id);
                return Selection {
                    candidates: vec![Candidate {
                        adapter: adapter.clone(),
                        build_from: None,
                    }],
                    ..Selection::default()
                };
            }
        }

        let message_type = message.message_type();
        let candidates: Vec<Candidate> = view
            .connected
            .iter()
            .filter(|a| a.capabilities.supports_message(message_type))
            .filter(|a| !is_excluded(a.id))
            .filter_map(|a| {
                let build_from = match &message.body {
                    MessageBody::MarketData(md) if md.is_subscribe => {
                        refine_market_data(md, &a.capabilities)?
                    }
                    _ => None,
                };
                Some(Candidate {
                    adapter: a.clone(),
                    build_from,
                })
            })
            .collect();

        if candidates.is_empty() && view.has_pending() {
            return Selection::pending();
        }
        Selection {
            candidates,
            ..Selection::default()
        }
    }

    fn affinity(&self, message: &Message) -> Option<AdapterId> {
        match &message.body {
            MessageBody::MarketData(md) if md.data_type.is_security_required() => {
                let security = md.security_id.as_ref()?;
                self.security_adapter(security, Some(md.data_type))
                    .or_else(|| self.security_adapter(security, None))
            }
            _ => self.portfolio_adapter(message.portfolio_name()?),
        }
    }

    /// Remember the owner of a portfolio; the first owner wins
    pub fn remember_portfolio(&mut self, name: &str, adapter: AdapterId) {
        if name.is_empty() {
            return;
        }
        self.portfolio_adapters
            .entry(name.to_lowercase())
            .or_insert(adapter);
    }

    /// Set the owner of a portfolio, replacing any earlier owner
    pub fn set_portfolio(&mut self, name: &str, adapter: AdapterId) {
        self.seeded_portfolios.insert(name.to_lowercase(), adapter);
    }

    /// Remember the owner of a security (for any data type when `None`);
    /// the first owner wins
    pub fn remember_security(
        &mut self,
        security: SecurityId,
        data_type: Option<DataType>,
        adapter: AdapterId,
    ) {
        self.security_adapters
            .entry((security, data_type))
            .or_insert(adapter);
    }

    /// Set the owner of a security, replacing any earlier owner
    pub fn set_security(
        &mut self,
        security: SecurityId,
        data_type: Option<DataType>,
        adapter: AdapterId,
    ) {
        self.seeded_securities.insert((security, data_type), adapter);
    }

    /// Owner of a portfolio, set or learned
    pub fn portfolio_adapter(&self, name: &str) -> Option<AdapterId> {
        let key = name.to_lowercase();
        self.seeded_portfolios
            .get(&key)
            .or_else(|| self.portfolio_adapters.get(&key))
            .copied()
    }

    /// Owner of a security for exactly `data_type`, set or learned
    pub fn security_adapter(
        &self,
        security: &SecurityId,
        data_type: Option<DataType>,
    ) -> Option<AdapterId> {
        let key = (security.clone(), data_type);
        self.seeded_securities
            .get(&key)
            .or_else(|| self.security_adapters.get(&key))
            .copied()
    }

    /// Exclude `adapter` from further routing of `transaction_id`
    pub fn record_not_supported(&mut self, transaction_id: TransactionId, adapter: AdapterId) {
        self.not_supported
            .entry(transaction_id)
            .or_default()
            .insert(adapter);
    }

    /// Whether some adapter already refused `transaction_id`
    pub fn was_refused(&self, transaction_id: TransactionId) -> bool {
        self.not_supported
            .get(&transaction_id)
            .is_some_and(|set| !set.is_empty())
    }

    /// Forget the not-supported set of a transaction
    pub fn clear_transaction(&mut self, transaction_id: TransactionId) {
        self.not_supported.remove(&transaction_id);
    }

    /// Drop every cache entry keyed by `adapter`
    pub fn forget_adapter(&mut self, adapter: AdapterId) {
        self.portfolio_adapters.retain(|_, a| *a != adapter);
        self.security_adapters.retain(|_, a| *a != adapter);
        self.seeded_portfolios.retain(|_, a| *a != adapter);
        self.seeded_securities.retain(|_, a| *a != adapter);
        for refused in self.not_supported.values_mut() {
            refused.remove(&adapter);
        }
    }

    /// Whether any cache still references `adapter`
    pub fn references(&self, adapter: AdapterId) -> bool {
        self.portfolio_adapters.values().any(|a| *a == adapter)
            || self.security_adapters.values().any(|a| *a == adapter)
            || self.seeded_portfolios.values().any(|a| *a == adapter)
            || self.seeded_securities.values().any(|a| *a == adapter)
            || self.not_supported.values().any(|set| set.contains(&adapter))
    }

    /// Drop learned owners and not-supported sets; set owners stay
    pub fn clear(&mut self) {
        self.portfolio_adapters.clear();
        self.security_adapters.clear();
        self.not_supported.clear();
    }
}

/// Capability refinement for a subscribe request.
///
/// `None` rejects the adapter; `Some(build_from)` accepts it, with the
/// source data type when the request cannot be served natively.
fn refine_market_data(
    md: &MarketDataMessage,
    caps: &Capabilities,
) -> Option<Option<DataType>> {
    if let Some(security) = &md.security_id {
        if !caps.supports_security(&md.data_type, security) {
            return None;
        }
    }

    match md.data_type {
        DataType::MarketDepth => {
            if let Some(source) = md.build_from {
                return caps.supports_data_type(&source).then_some(Some(source));
            }
            if caps.supports_data_type(&DataType::MarketDepth) {
                Some(None)
            } else if caps.supports_data_type(&DataType::OrderLog) {
                Some(Some(DataType::OrderLog))
            } else if caps.supports_data_type(&DataType::Level1) {
                Some(Some(DataType::Level1))
            } else {
                None
            }
        }
        DataType::Candles(time_frame) => {
            if caps.supports_data_type(&md.data_type) {
                return Some(None);
            }
            if md.allow_build_from_smaller {
                if let Some(smaller) = caps.smaller_time_frame(time_frame) {
                    return Some(Some(DataType::Candles(smaller)));
                }
            }
            [DataType::Ticks, DataType::OrderLog, DataType::Level1]
                .into_iter()
                .find(|source| caps.supports_data_type(source))
                .map(Some)
        }
        DataType::Ticks => {
            if caps.supports_data_type(&DataType::Ticks) {
                Some(None)
            } else if caps.supports_data_type(&DataType::OrderLog) {
                Some(Some(DataType::OrderLog))
            } else {
                None
            }
        }
        DataType::News if md.security_id.is_none() => {
            (caps.supports_data_type(&DataType::News) && !caps.security_news_only).then_some(None)
        }
        DataType::Securities if md.security_id.is_none() => {
            (caps.supports_data_type(&DataType::Securities) && caps.lookup_all).then_some(None)
        }
        other => caps.supports_data_type(&other).then_some(None),
    }
}
