//! # Basket Message Adapter
//!
//! One logical adapter in front of many venue connections. Outbound
//! requests are routed to the best connected adapter (or fanned out to all
//! capable ones), inbound events are rewritten so the application only ever
//! sees its own transaction ids, and per-adapter connection results are
//! folded into a single aggregate connection state.
//!
//! ## Locking
//!
//! All mutable routing state lives in one [`BasketState`] behind a
//! `parking_lot::Mutex`. The lock is taken for each read-modify-write and
//! released before any adapter is called; sends happen after the lock is
//! dropped and are awaited jointly.

use crate::common::{
    send_with_cancel, Capabilities, HandlerId, MessageAdapter, MessageHandler, OutputHub,
};
use crate::config::BasketConfig;
use crate::connection::{AggregateEvent, ConnectionState, ConnectionStateTracker};
use crate::parent_child::{ChildState, ParentChildMap};
use crate::pending::{PendingMessage, PendingQueue};
use crate::pipeline::{ComposedAdapter, PipelineBuilder};
use crate::registry::AdapterRegistry;
use crate::router::{RoutedAdapter, RoutingView, SubscriptionRouter};
use crate::{BasketError, Result};
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use types::{
    AdapterId, DataType, ExecutionMessage, MarketDataMessage, Message, MessageBody, MessageError,
    MessageType, SecurityId, TransactionId, TransactionIdGenerator,
};

/// Composed adapter currently wired into the basket
struct ActiveAdapter {
    composed: ComposedAdapter,
    handler: HandlerId,
}

/// Subscription that reached at least one adapter
struct SubscriptionEntry {
    request: Message,
    /// caller's token, reused when the request is retried
    cancel: CancellationToken,
    adapters: Vec<AdapterId>,
    fan_out: bool,
    exact: bool,
}

/// Everything guarded by the basket lock
struct BasketState {
    tracker: ConnectionStateTracker,
    router: SubscriptionRouter,
    pending: PendingQueue,
    active: HashMap<AdapterId, ActiveAdapter>,
    subscriptions: HashMap<TransactionId, SubscriptionEntry>,
    /// unsubscribe transaction -> subscribe transaction it cancels
    unsubscribes: HashMap<TransactionId, TransactionId>,
    /// order transaction -> adapter that registered it
    order_adapters: HashMap<TransactionId, AdapterId>,
}

impl BasketState {
    fn new(connect_on_first_adapter: bool) -> Self {
        Self {
            tracker: ConnectionStateTracker::new(connect_on_first_adapter),
            router: SubscriptionRouter::new(),
            pending: PendingQueue::new(),
            active: HashMap::new(),
            subscriptions: HashMap::new(),
            unsubscribes: HashMap::new(),
            order_adapters: HashMap::new(),
        }
    }

    fn routing_view(&self, registry: &AdapterRegistry) -> RoutingView {
        let mut view = RoutingView::default();
        for leaf in registry.sorted() {
            let id = leaf.id();
            match self.tracker.state(id) {
                ConnectionState::Connected => {
                    if let Some(active) = self.active.get(&id) {
                        view.connected.push(RoutedAdapter {
                            id,
                            adapter: active.composed.adapter().clone(),
                            capabilities: leaf.capabilities(),
                        });
                    }
                }
                ConnectionState::Connecting => {
                    view.connecting.insert(id);
                }
                _ => {}
            }
        }
        view
    }

    fn connected_adapter(&self, id: AdapterId) -> Option<Arc<dyn MessageAdapter>> {
        if !self.tracker.is_connected(id) {
            return None;
        }
        self.active.get(&id).map(|a| a.composed.adapter().clone())
    }

    /// Pending messages to replay and to fail after a connection change
    fn settle_pending(&mut self) -> (Vec<PendingMessage>, Vec<PendingMessage>) {
        if self.pending.is_empty() {
            (Vec::new(), Vec::new())
        } else if self.tracker.has_connected() {
            (self.pending.take_all(), Vec::new())
        } else if !self.tracker.has_pending() {
            (Vec::new(), self.pending.take_all())
        } else {
            (Vec::new(), Vec::new())
        }
    }

    fn clear(&mut self) {
        self.tracker.clear();
        self.router.clear();
        self.pending.clear();
        self.active.clear();
        self.subscriptions.clear();
        self.unsubscribes.clear();
        self.order_adapters.clear();
    }
}

/// Message bound for one adapter
struct Outbound {
    adapter_id: AdapterId,
    adapter: Arc<dyn MessageAdapter>,
    message: Message,
}

/// What a dispatcher decided under the lock
enum Plan {
    /// Queued or answered already
    Done,
    /// Answer the request with an error
    Reject(MessageError),
    /// Answer the request successfully without sending
    Accept,
    /// Send to adapters
    Send(Vec<Outbound>),
}

struct BasketInner {
    id: AdapterId,
    config: BasketConfig,
    registry: AdapterRegistry,
    builder: PipelineBuilder,
    transaction_ids: TransactionIdGenerator,
    output: OutputHub,
    parent_child: ParentChildMap,
    state: Mutex<BasketState>,
    disposed: AtomicBool,
}

impl BasketInner {
    async fn send_in(self: &Arc<Self>, mut message: Message, cancel: &CancellationToken) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(BasketError::Disposed);
        }
        if message.is_back {
            message.is_back = false;
            if message.adapter == Some(self.id) {
                message.adapter = None;
            }
        }

        let message_type = message.message_type();
        if message_type.requires_transaction_id()
            && !message.transaction_id().is_some_and(TransactionId::is_set)
        {
            return Err(BasketError::MissingTransactionId(message_type));
        }

        match self.dispatch(message.clone(), cancel).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_contract_violation() => Err(e),
            Err(e) => {
                error!("Failed to process {} message: {}", message_type, e);
                self.output
                    .publish(Message::error(e.to_message_error(), Some(message)));
                Ok(())
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, message: Message, cancel: &CancellationToken) -> Result<()> {
        let is_subscribe =
            matches!(&message.body, MessageBody::MarketData(md) if md.is_subscribe);

        match message.message_type() {
            MessageType::Reset => {
                self.reset(cancel).await;
                Ok(())
            }
            MessageType::Connect => self.connect(cancel).await,
            MessageType::Disconnect => self.disconnect(cancel).await,
            MessageType::MarketData if is_subscribe => self.subscribe(message, cancel).await,
            MessageType::MarketData => self.unsubscribe(message, cancel).await,
            MessageType::OrderReplace | MessageType::OrderCancel => {
                self.send_correlated(message, cancel).await
            }
            MessageType::OrderGroupCancel if message.portfolio_name().is_none() => {
                self.broadcast(message, cancel).await
            }
            MessageType::OrderRegister
            | MessageType::OrderGroupCancel
            | MessageType::ChangePassword => self.send_single(message, cancel).await,
            other => Err(MessageError::not_supported(other).into()),
        }
    }

    // ------------------------------------------------------------------
    // connection lifecycle
    // ------------------------------------------------------------------

    async fn reset(&self, cancel: &CancellationToken) {
        let active: Vec<ActiveAdapter> = {
            let mut state = self.state.lock();
            state.active.drain().map(|(_, a)| a).collect()
        };

        for adapter in &active {
            adapter.composed.adapter().output().unsubscribe(adapter.handler);
        }

        join_all(active.iter().map(|adapter| async move {
            let composed = &adapter.composed;
            if let Err(e) = send_with_cancel(composed.adapter(), Message::reset(), cancel).await {
                debug!("Reset of {} failed: {}", composed.leaf().name(), e);
            }
            composed.dispose().await;
        }))
        .await;

        self.state.lock().clear();
        self.parent_child.clear();
        debug!("Basket {} reset ({} adapters released)", self.config.name, active.len());
    }

    async fn connect(self: &Arc<Self>, cancel: &CancellationToken) -> Result<()> {
        let leaves = self.registry.sorted();
        if leaves.is_empty() {
            return Err(BasketError::NoAdapters);
        }

        self.reset(cancel).await;

        let mut targets = Vec::with_capacity(leaves.len());
        {
            let mut state = self.state.lock();
            for leaf in &leaves {
                let id = leaf.id();
                let composed = self.builder.build(leaf.clone(), self.registry.heartbeat(id));
                let handler = composed.adapter().output().subscribe(self.out_handler(id));
                targets.push((id, composed.adapter().clone()));
                state.active.insert(id, ActiveAdapter { composed, handler });
            }
            state.tracker.begin_connect(leaves.iter().map(|leaf| leaf.id()));
        }

        info!("Basket {} connecting {} adapters", self.config.name, targets.len());

        let results = join_all(targets.iter().map(|(id, adapter)| async move {
            (*id, send_with_cancel(adapter, Message::connect(), cancel).await)
        }))
        .await;

        for (id, result) in results {
            if let Err(e) = result {
                let error = e.to_message_error();
                self.on_connect_result(
                    id,
                    Some(error.clone()),
                    Message::connect_result(Some(error)).with_adapter(id),
                );
            }
        }
        Ok(())
    }

    async fn disconnect(self: &Arc<Self>, cancel: &CancellationToken) -> Result<()> {
        let targets: Vec<(AdapterId, Arc<dyn MessageAdapter>)> = {
            let mut state = self.state.lock();
            let ids = state.tracker.begin_disconnect();
            ids.into_iter()
                .filter_map(|id| {
                    state
                        .active
                        .get(&id)
                        .map(|a| (id, a.composed.adapter().clone()))
                })
                .collect()
        };

        if targets.is_empty() {
            info!("Basket {} has no connected adapters", self.config.name);
            self.output.publish(Message::disconnect_result(None));
            return Ok(());
        }

        info!("Basket {} disconnecting {} adapters", self.config.name, targets.len());

        let results = join_all(targets.iter().map(|(id, adapter)| async move {
            (*id, send_with_cancel(adapter, Message::disconnect(), cancel).await)
        }))
        .await;

        for (id, result) in results {
            if let Err(e) = result {
                let error = e.to_message_error();
                self.on_disconnect_result(
                    id,
                    Some(error.clone()),
                    Message::disconnect_result(Some(error)).with_adapter(id),
                );
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // routing
    // ------------------------------------------------------------------

    async fn subscribe(self: &Arc<Self>, message: Message, cancel: &CancellationToken) -> Result<()> {
        let md = market_data(&message)?;
        let tx = md.transaction_id;

        let plan = {
            let mut state = self.state.lock();
            let view = state.routing_view(&self.registry);
            let selection = state.router.select(&message, &view);

            if selection.is_pending {
                debug!("No adapter connected yet for subscription {}, queueing", tx);
                state.pending.push(message.clone(), cancel);
                Plan::Done
            } else if selection.is_empty() {
                let refused = state.router.was_refused(tx);
                state.router.clear_transaction(tx);
                Plan::Reject(if refused {
                    MessageError::not_supported(MessageType::MarketData)
                } else {
                    MessageError::NoAdapter(md.data_type.to_string())
                })
            } else if is_fan_out(&md) && !selection.exact && selection.candidates.len() > 1 {
                let mut sends = Vec::with_capacity(selection.candidates.len());
                for candidate in &selection.candidates {
                    let child = self.transaction_ids.next_id();
                    let mut request = md.clone();
                    request.transaction_id = child;
                    request.build_from = candidate.build_from.or(md.build_from);
                    sends.push(Outbound {
                        adapter_id: candidate.adapter.id,
                        adapter: candidate.adapter.adapter.clone(),
                        message: Message::market_data(request),
                    });
                }
                self.map_children(tx, &sends)?;
                debug!("Subscription {} ({}) fanned out to {} adapters", tx, md.data_type, sends.len());
                state.subscriptions.insert(
                    tx,
                    SubscriptionEntry {
                        request: message.clone(),
                        cancel: cancel.clone(),
                        adapters: sends.iter().map(|s| s.adapter_id).collect(),
                        fan_out: true,
                        exact: false,
                    },
                );
                Plan::Send(sends)
            } else {
                let candidate = &selection.candidates[0];
                let mut request = md.clone();
                request.build_from = candidate.build_from.or(md.build_from);
                debug!("Subscription {} ({}) routed to {}", tx, md.data_type, candidate.adapter.id);
                state.subscriptions.insert(
                    tx,
                    SubscriptionEntry {
                        request: message.clone(),
                        cancel: cancel.clone(),
                        adapters: vec![candidate.adapter.id],
                        fan_out: false,
                        exact: selection.exact,
                    },
                );
                Plan::Send(vec![Outbound {
                    adapter_id: candidate.adapter.id,
                    adapter: candidate.adapter.adapter.clone(),
                    message: Message::market_data(request),
                }])
            }
        };

        self.execute(&message, plan, cancel).await;
        Ok(())
    }

    async fn unsubscribe(self: &Arc<Self>, message: Message, cancel: &CancellationToken) -> Result<()> {
        let md = market_data(&message)?;
        let tx = md.transaction_id;
        let original = md.original_transaction_id;

        let plan = {
            let mut state = self.state.lock();
            if state.pending.remove_subscription(original).is_some() {
                debug!("Subscription {} cancelled before reaching an adapter", original);
                Plan::Accept
            } else {
                match state.subscriptions.get(&original) {
                    None => Plan::Reject(MessageError::UnknownTransaction(original)),
                    Some(entry) if entry.fan_out => {
                        let children: Vec<_> = self
                            .parent_child
                            .children_of(original)
                            .into_iter()
                            .filter(|c| matches!(c.state, ChildState::Active | ChildState::Online))
                            .filter_map(|c| state.connected_adapter(c.adapter).map(|a| (c, a)))
                            .collect();

                        if children.is_empty() {
                            state.subscriptions.remove(&original);
                            self.parent_child.remove_parent(original);
                            Plan::Accept
                        } else {
                            let mut sends = Vec::with_capacity(children.len());
                            for (child, adapter) in children {
                                let child_tx = self.transaction_ids.next_id();
                                let mut request = md.clone();
                                request.transaction_id = child_tx;
                                request.original_transaction_id = child.transaction_id;
                                sends.push(Outbound {
                                    adapter_id: child.adapter,
                                    adapter,
                                    message: Message::market_data(request),
                                });
                            }
                            self.map_children(tx, &sends)?;
                            state.unsubscribes.insert(tx, original);
                            Plan::Send(sends)
                        }
                    }
                    Some(entry) => {
                        let id = entry.adapters.first().copied();
                        match id.and_then(|id| state.connected_adapter(id).map(|a| (id, a))) {
                            Some((adapter_id, adapter)) => {
                                state.unsubscribes.insert(tx, original);
                                Plan::Send(vec![Outbound {
                                    adapter_id,
                                    adapter,
                                    message: Message::market_data(md.clone()),
                                }])
                            }
                            None => {
                                state.subscriptions.remove(&original);
                                Plan::Reject(MessageError::NoAdapter(md.data_type.to_string()))
                            }
                        }
                    }
                }
            }
        };

        self.execute(&message, plan, cancel).await;
        Ok(())
    }

    /// OrderRegister, OrderGroupCancel with portfolio, ChangePassword
    async fn send_single(self: &Arc<Self>, message: Message, cancel: &CancellationToken) -> Result<()> {
        let message_type = message.message_type();

        let plan = {
            let mut state = self.state.lock();
            let view = state.routing_view(&self.registry);
            let selection = state.router.select(&message, &view);

            if selection.is_pending {
                debug!("No adapter connected yet for {}, queueing", message_type);
                state.pending.push(message.clone(), cancel);
                Plan::Done
            } else {
                match selection.candidates.first() {
                    None => Plan::Reject(MessageError::NoAdapter(message_type.to_string())),
                    Some(candidate) => {
                        if let (MessageType::OrderRegister, Some(tx)) =
                            (message_type, message.transaction_id())
                        {
                            state.order_adapters.insert(tx, candidate.adapter.id);
                        }
                        Plan::Send(vec![Outbound {
                            adapter_id: candidate.adapter.id,
                            adapter: candidate.adapter.adapter.clone(),
                            message: message.clone(),
                        }])
                    }
                }
            }
        };

        self.execute(&message, plan, cancel).await;
        Ok(())
    }

    /// OrderReplace / OrderCancel follow the adapter of the original order
    async fn send_correlated(self: &Arc<Self>, message: Message, cancel: &CancellationToken) -> Result<()> {
        let original = message.original_transaction_id().unwrap_or_default();

        let plan = {
            let mut state = self.state.lock();
            match state.order_adapters.get(&original).copied() {
                None => {
                    warn!("Unknown order transaction {} for {}", original, message.message_type());
                    Plan::Reject(MessageError::UnknownTransaction(original))
                }
                Some(id) => match state.connected_adapter(id) {
                    None => Plan::Reject(MessageError::NoAdapter(id.to_string())),
                    Some(adapter) => {
                        if let (MessageBody::OrderReplace(_), Some(tx)) =
                            (&message.body, message.transaction_id())
                        {
                            state.order_adapters.insert(tx, id);
                        }
                        Plan::Send(vec![Outbound {
                            adapter_id: id,
                            adapter,
                            message: message.clone(),
                        }])
                    }
                },
            }
        };

        self.execute(&message, plan, cancel).await;
        Ok(())
    }

    /// OrderGroupCancel without portfolio goes to every capable adapter
    async fn broadcast(self: &Arc<Self>, message: Message, cancel: &CancellationToken) -> Result<()> {
        let message_type = message.message_type();

        let plan = {
            let mut state = self.state.lock();
            let view = state.routing_view(&self.registry);
            let sends: Vec<Outbound> = view
                .connected
                .iter()
                .filter(|a| a.capabilities.supports_message(message_type))
                .map(|a| Outbound {
                    adapter_id: a.id,
                    adapter: a.adapter.clone(),
                    message: message.clone(),
                })
                .collect();

            if !sends.is_empty() {
                Plan::Send(sends)
            } else if !view.connecting.is_empty() {
                state.pending.push(message.clone(), cancel);
                Plan::Done
            } else {
                Plan::Reject(MessageError::NoAdapter(message_type.to_string()))
            }
        };

        self.execute(&message, plan, cancel).await;
        Ok(())
    }

    async fn execute(self: &Arc<Self>, request: &Message, plan: Plan, cancel: &CancellationToken) {
        match plan {
            Plan::Done => {}
            Plan::Accept => {
                if let Some(tx) = request.transaction_id() {
                    self.output.publish(Message::subscription_response(tx, None));
                }
            }
            Plan::Reject(error) => {
                warn!("Cannot route {}: {}", request.message_type(), error);
                self.output.publish(error_response(request, error));
            }
            Plan::Send(sends) => {
                let results = join_all(sends.into_iter().map(|outbound| async move {
                    let result =
                        send_with_cancel(&outbound.adapter, outbound.message.clone(), cancel).await;
                    (outbound, result)
                }))
                .await;

                for (outbound, result) in results {
                    if let Err(e) = result {
                        warn!("Failed to send {} to {}: {}", outbound.message.message_type(), outbound.adapter_id, e);
                        self.on_send_failed(outbound, e.to_message_error());
                    }
                }
            }
        }
    }

    fn on_send_failed(self: &Arc<Self>, outbound: Outbound, error: MessageError) {
        let response = error_response(&outbound.message, error.clone());
        match (&outbound.message.body, outbound.message.transaction_id()) {
            (MessageBody::MarketData(_), Some(tx)) => {
                self.on_subscription_response(
                    outbound.adapter_id,
                    tx,
                    Some(error),
                    response.with_adapter(outbound.adapter_id),
                );
            }
            (_, tx) => {
                if let Some(tx) = tx {
                    self.state.lock().order_adapters.remove(&tx);
                }
                self.output.publish(response.with_adapter(outbound.adapter_id));
            }
        }
    }

    // ------------------------------------------------------------------
    // inbound events
    // ------------------------------------------------------------------

    fn out_handler(self: &Arc<Self>, leaf: AdapterId) -> MessageHandler {
        let basket: Weak<BasketInner> = Arc::downgrade(self);
        Arc::new(move |message: Message| {
            if let Some(basket) = basket.upgrade() {
                basket.process_out(leaf, message);
            }
        })
    }

    fn process_out(self: &Arc<Self>, leaf: AdapterId, mut message: Message) {
        message.adapter = Some(leaf);
        message.is_back = false;

        match &message.body {
            MessageBody::Connect(connect) => {
                let error = connect.error.clone();
                self.on_connect_result(leaf, error, message);
            }
            MessageBody::Disconnect(disconnect) => {
                let error = disconnect.error.clone();
                self.on_disconnect_result(leaf, error, message);
            }
            MessageBody::SubscriptionResponse(response) => {
                let (tx, error) = (response.original_transaction_id, response.error.clone());
                self.on_subscription_response(leaf, tx, error, message);
            }
            MessageBody::SubscriptionOnline(online) => {
                let tx = online.original_transaction_id;
                self.on_online(tx, message);
            }
            MessageBody::SubscriptionFinished(finished) => {
                let tx = finished.original_transaction_id;
                self.on_finished(tx, message);
            }
            _ => {
                self.learn_affinity(leaf, &message);
                self.rewrite_subscription_ids(&mut message);
                self.output.publish(message);
            }
        }
    }

    fn on_connect_result(self: &Arc<Self>, leaf: AdapterId, error: Option<MessageError>, message: Message) {
        let (event, replay, drained) = {
            let mut state = self.state.lock();
            let event = state.tracker.on_connected(leaf, error.clone());
            let (replay, drained) = state.settle_pending();
            (event, replay, drained)
        };

        match &error {
            Some(e) => error!("Adapter {} failed to connect: {}", leaf, e),
            None => info!("Adapter {} connected", leaf),
        }
        self.output.publish(message);

        match event {
            Some(AggregateEvent::Connected) => {
                info!("Basket {} connected", self.config.name);
                self.output.publish(Message::connect_result(None));
            }
            Some(AggregateEvent::Failed(e)) => {
                error!("Basket {} failed to connect: {}", self.config.name, e);
                self.output.publish(Message::connect_result(Some(e)));
            }
            _ => {}
        }

        self.fail_all(drained);
        self.loop_back(replay);
    }

    fn on_disconnect_result(self: &Arc<Self>, leaf: AdapterId, error: Option<MessageError>, message: Message) {
        let (event, replay, drained) = {
            let mut state = self.state.lock();
            let event = state.tracker.on_disconnected(leaf, error.clone());
            let (replay, drained) = state.settle_pending();
            (event, replay, drained)
        };

        match &error {
            Some(e) => warn!("Adapter {} disconnected with error: {}", leaf, e),
            None => info!("Adapter {} disconnected", leaf),
        }
        self.output.publish(message);

        if event == Some(AggregateEvent::Disconnected) {
            info!("Basket {} disconnected", self.config.name);
            self.output.publish(Message::disconnect_result(None));
        }
        self.fail_all(drained);
        self.loop_back(replay);
    }

    fn on_subscription_response(
        self: &Arc<Self>,
        leaf: AdapterId,
        tx: TransactionId,
        error: Option<MessageError>,
        message: Message,
    ) {
        if self.parent_child.try_get_parent(tx).is_some() {
            if let Some((parent, outcome)) = self.parent_child.process_child_response(tx, error) {
                let error = outcome.err();
                if let Some(e) = &error {
                    warn!("Subscription {} failed on every adapter: {}", parent, e);
                }
                self.finish_request(parent, error.as_ref());
                self.output.publish(Message::subscription_response(parent, error));
            }
            return;
        }

        let retry = {
            let mut state = self.state.lock();
            let retry = match (&error, state.subscriptions.get(&tx)) {
                (Some(e), Some(entry)) if e.is_not_supported() && !entry.exact => Some(
                    PendingMessage::new(entry.request.clone(), entry.cancel.clone()),
                ),
                _ => None,
            };
            if retry.is_some() {
                state.router.record_not_supported(tx, leaf);
                state.subscriptions.remove(&tx);
            }
            retry
        };

        if let Some(request) = retry {
            debug!("Adapter {} does not support subscription {}, trying next", leaf, tx);
            self.loop_back(vec![request]);
            return;
        }

        if let Some(e) = &error {
            warn!("Subscription {} failed on {}: {}", tx, leaf, e);
        }
        self.finish_request(tx, error.as_ref());
        self.output.publish(message);
    }

    fn on_online(&self, tx: TransactionId, message: Message) {
        if self.parent_child.try_get_parent(tx).is_some() {
            if let Some(parent) = self.parent_child.process_child_online(tx) {
                self.output.publish(Message::subscription_online(parent));
            }
            return;
        }
        self.output.publish(message);
    }

    fn on_finished(&self, tx: TransactionId, message: Message) {
        if self.parent_child.try_get_parent(tx).is_some() {
            if let Some(parent) = self.parent_child.process_child_finish(tx) {
                self.complete_subscription(parent);
                self.output.publish(Message::subscription_finished(parent));
            }
            return;
        }
        self.complete_subscription(tx);
        self.output.publish(message);
    }

    /// Bookkeeping after the final response to a subscribe or unsubscribe
    fn finish_request(&self, tx: TransactionId, error: Option<&MessageError>) {
        let mut state = self.state.lock();
        state.router.clear_transaction(tx);

        if let Some(subscription) = state.unsubscribes.remove(&tx) {
            self.parent_child.remove_parent(tx);
            if error.is_none() {
                state.subscriptions.remove(&subscription);
                self.parent_child.remove_parent(subscription);
            }
        } else if error.is_some() {
            state.subscriptions.remove(&tx);
            self.parent_child.remove_parent(tx);
        }
    }

    fn complete_subscription(&self, tx: TransactionId) {
        self.state.lock().subscriptions.remove(&tx);
        self.parent_child.remove_parent(tx);
    }

    fn learn_affinity(&self, leaf: AdapterId, message: &Message) {
        match &message.body {
            MessageBody::Security(security) => {
                self.state
                    .lock()
                    .router
                    .remember_security(security.security_id.clone(), None, leaf);
            }
            MessageBody::Portfolio(portfolio) => {
                self.state
                    .lock()
                    .router
                    .remember_portfolio(&portfolio.portfolio_name, leaf);
            }
            MessageBody::PositionChange(position) => {
                self.state
                    .lock()
                    .router
                    .remember_portfolio(&position.portfolio_name, leaf);
            }
            _ => {}
        }
    }

    fn rewrite_subscription_ids(&self, message: &mut Message) {
        if let Some(ids) = message.subscription_ids_mut() {
            for id in ids.iter_mut() {
                if let Some(parent) = self.parent_child.try_get_parent(*id) {
                    *id = parent;
                }
            }
            ids.dedup();
        }
    }

    /// Map the children of a fan-out; a taken child id maps none of them
    fn map_children(&self, parent: TransactionId, sends: &[Outbound]) -> Result<()> {
        let children: Vec<(TransactionId, AdapterId)> = sends
            .iter()
            .filter_map(|s| s.message.transaction_id().map(|child| (child, s.adapter_id)))
            .collect();
        self.parent_child.add_children(parent, &children)
    }

    /// Answer queued messages that can no longer be routed
    fn fail_all(&self, messages: Vec<PendingMessage>) {
        for PendingMessage { message, .. } in messages {
            let error = MessageError::NoAdapter(message.message_type().to_string());
            warn!("Dropping pending {}: {}", message.message_type(), error);
            self.output.publish(error_response(&message, error));
        }
    }

    /// Re-inject messages into this basket, in order, on the runtime
    fn loop_back(self: &Arc<Self>, messages: Vec<PendingMessage>) {
        if messages.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!("No runtime to replay {} messages", messages.len());
            self.fail_all(messages);
            return;
        };

        let basket = self.clone();
        runtime.spawn(async move {
            for PendingMessage { message, cancel } in messages {
                let message = message.looped_back(basket.id);
                if let Err(e) = basket.send_in(message, &cancel).await {
                    warn!("Loop-back message rejected: {}", e);
                }
            }
        });
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.reset(&CancellationToken::new()).await;
        join_all(self.registry.all().iter().map(|leaf| leaf.dispose())).await;
        self.output.clear();
        info!("Basket {} disposed", self.config.name);
    }
}

/// A named portfolio is served by one adapter; other lookups go to all
fn is_fan_out(md: &MarketDataMessage) -> bool {
    md.data_type.is_fan_out()
        && !(md.data_type == DataType::Portfolios && md.portfolio_name.is_some())
}

fn market_data(message: &Message) -> Result<MarketDataMessage> {
    match &message.body {
        MessageBody::MarketData(md) => Ok(md.clone()),
        _ => Err(MessageError::not_supported(message.message_type()).into()),
    }
}

/// Failure answer for a request that could not be served
pub fn error_response(message: &Message, error: MessageError) -> Message {
    let tx = message.transaction_id().unwrap_or_default();
    match &message.body {
        MessageBody::MarketData(_) => Message::subscription_response(tx, Some(error)),
        MessageBody::OrderRegister(_)
        | MessageBody::OrderReplace(_)
        | MessageBody::OrderCancel(_)
        | MessageBody::OrderGroupCancel(_) => Message::new(MessageBody::Execution(ExecutionMessage {
            portfolio_name: message.portfolio_name().map(str::to_string),
            ..ExecutionMessage::failed(tx, error)
        })),
        MessageBody::Connect(_) => Message::connect_result(Some(error)),
        MessageBody::Disconnect(_) => Message::disconnect_result(Some(error)),
        _ => Message::error(error, Some(message.clone())),
    }
}

/// Aggregating adapter over a set of leaf adapters
///
/// ```no_run
/// use basket_adapter::{BasketConfig, BasketMessageAdapter, Capabilities, MessageAdapter, ScriptedAdapter};
/// use std::sync::Arc;
/// use tokio_util::sync::CancellationToken;
/// use types::{DataType, Message};
///
/// # async fn run() -> basket_adapter::Result<()> {
/// let basket = BasketMessageAdapter::new(BasketConfig::default());
/// basket.add_adapter(
///     Arc::new(ScriptedAdapter::new("venue", Capabilities::market_data([DataType::Level1]))),
///     0,
/// )?;
/// basket.output().subscribe(Arc::new(|message| println!("{:?}", message)));
/// basket.send_in(Message::connect(), &CancellationToken::new()).await?;
/// # Ok(())
/// # }
/// ```
pub struct BasketMessageAdapter {
    inner: Arc<BasketInner>,
}

impl BasketMessageAdapter {
    /// Create an empty basket
    pub fn new(config: BasketConfig) -> Self {
        let state = BasketState::new(config.connect_on_first_adapter);
        Self {
            inner: Arc::new(BasketInner {
                id: AdapterId::new(),
                builder: PipelineBuilder::new(config.pipeline.clone()),
                config,
                registry: AdapterRegistry::new(),
                transaction_ids: TransactionIdGenerator::new(),
                output: OutputHub::new(),
                parent_child: ParentChildMap::new(),
                state: Mutex::new(state),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Create a basket after validating `config`
    pub fn try_new(config: BasketConfig) -> Result<Self> {
        config.validate().map_err(BasketError::Configuration)?;
        Ok(Self::new(config))
    }

    /// Register a leaf adapter with a priority (`-1` disables it)
    pub fn add_adapter(&self, adapter: Arc<dyn MessageAdapter>, priority: i32) -> Result<()> {
        self.inner.registry.add(adapter, priority)
    }

    /// Unregister a leaf adapter, dropping every cache entry keyed by it.
    /// The leaf is returned undisposed.
    pub async fn remove_adapter(&self, id: AdapterId) -> Option<Arc<dyn MessageAdapter>> {
        let adapter = self.inner.registry.remove(id)?;

        let active = {
            let mut state = self.inner.state.lock();
            state.tracker.remove(id);
            state.router.forget_adapter(id);
            state.order_adapters.retain(|_, owner| *owner != id);
            for entry in state.subscriptions.values_mut() {
                entry.adapters.retain(|owner| *owner != id);
            }
            state.subscriptions.retain(|_, entry| !entry.adapters.is_empty());
            state.active.remove(&id)
        };
        self.inner.parent_child.remove_adapter(id);

        if let Some(active) = active {
            active.composed.adapter().output().unsubscribe(active.handler);
            active.composed.dispose().await;
        }
        info!("Removed adapter {} from basket {}", id, self.inner.config.name);
        Some(adapter)
    }

    /// Change an adapter's priority
    pub fn set_priority(&self, id: AdapterId, priority: i32) -> Result<()> {
        self.inner.registry.set_priority(id, priority)
    }

    /// Enable or disable the heartbeat layer for one adapter
    pub fn apply_heartbeat(&self, id: AdapterId, enabled: bool) -> Result<()> {
        self.inner.registry.set_heartbeat(id, enabled)
    }

    /// Route a portfolio to an adapter. Unknown adapters are ignored.
    pub fn set_portfolio_adapter(&self, portfolio: &str, id: AdapterId) -> bool {
        if !self.inner.registry.contains(id) {
            return false;
        }
        self.inner.state.lock().router.set_portfolio(portfolio, id);
        true
    }

    /// Route a security (for one data type, or all when `None`) to an
    /// adapter. Unknown adapters are ignored.
    pub fn set_security_adapter(
        &self,
        security: SecurityId,
        data_type: Option<DataType>,
        id: AdapterId,
    ) -> bool {
        if !self.inner.registry.contains(id) {
            return false;
        }
        self.inner
            .state
            .lock()
            .router
            .set_security(security, data_type, id);
        true
    }

    /// Adapter a portfolio is routed to
    pub fn portfolio_adapter(&self, portfolio: &str) -> Option<AdapterId> {
        self.inner.state.lock().router.portfolio_adapter(portfolio)
    }

    /// Adapter a security is routed to
    pub fn security_adapter(&self, security: &SecurityId, data_type: Option<DataType>) -> Option<AdapterId> {
        self.inner
            .state
            .lock()
            .router
            .security_adapter(security, data_type)
    }

    /// Aggregate connection state
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state.lock().tracker.aggregate()
    }

    /// Connection state of one adapter
    pub fn adapter_state(&self, id: AdapterId) -> ConnectionState {
        self.inner.state.lock().tracker.state(id)
    }

    /// Registered leaf adapters
    pub fn registry(&self) -> &AdapterRegistry {
        &self.inner.registry
    }

    /// Composed pipeline currently wired for a leaf
    pub fn composed_adapter(&self, id: AdapterId) -> Option<ComposedAdapter> {
        self.inner
            .state
            .lock()
            .active
            .get(&id)
            .map(|a| a.composed.clone())
    }

    /// Adapters serving a live subscription
    pub fn subscription_adapters(&self, tx: TransactionId) -> Vec<AdapterId> {
        self.inner
            .state
            .lock()
            .subscriptions
            .get(&tx)
            .map(|entry| entry.adapters.clone())
            .unwrap_or_default()
    }

    /// Adapter that registered an order
    pub fn order_adapter(&self, tx: TransactionId) -> Option<AdapterId> {
        self.inner.state.lock().order_adapters.get(&tx).copied()
    }

    /// Messages waiting for a connected adapter
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Whether no routing state is held (nothing wired, pending or mapped)
    pub fn is_idle(&self) -> bool {
        let state = self.inner.state.lock();
        state.active.is_empty()
            && state.pending.is_empty()
            && state.subscriptions.is_empty()
            && state.unsubscribes.is_empty()
            && state.order_adapters.is_empty()
            && state.tracker.aggregate() == ConnectionState::Disconnected
            && self.inner.parent_child.is_empty()
    }
}

#[async_trait]
impl MessageAdapter for BasketMessageAdapter {
    fn id(&self) -> AdapterId {
        self.inner.id
    }

    fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Union over the enabled inner adapters
    fn capabilities(&self) -> Capabilities {
        let mut caps = Capabilities::default();
        for (index, leaf) in self.inner.registry.sorted().iter().enumerate() {
            caps.merge(&leaf.capabilities(), index == 0);
        }
        caps
    }

    fn transaction_ids(&self) -> &TransactionIdGenerator {
        &self.inner.transaction_ids
    }

    async fn send_in(&self, message: Message, cancel: &CancellationToken) -> Result<()> {
        self.inner.send_in(message, cancel).await
    }

    fn output(&self) -> &OutputHub {
        &self.inner.output
    }

    async fn dispose(&self) {
        self.inner.dispose().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::ScriptedAdapter;
    use types::OrderRegisterMessage;

    fn leaf(name: &str, caps: Capabilities) -> Arc<ScriptedAdapter> {
        Arc::new(ScriptedAdapter::new(name, caps))
    }

    #[tokio::test]
    async fn test_connect_without_adapters_fails_fast() {
        let basket = BasketMessageAdapter::new(BasketConfig::default());
        let result = basket.send_in(Message::connect(), &CancellationToken::new()).await;
        assert!(matches!(result, Err(BasketError::NoAdapters)));
    }

    #[tokio::test]
    async fn test_missing_transaction_id_rejected() {
        let basket = BasketMessageAdapter::new(BasketConfig::default());
        let message = Message::market_data(MarketDataMessage::subscribe(
            TransactionId::NONE,
            DataType::Level1,
        ));
        let result = basket.send_in(message, &CancellationToken::new()).await;
        assert!(matches!(
            result,
            Err(BasketError::MissingTransactionId(MessageType::MarketData))
        ));
    }

    #[tokio::test]
    async fn test_reset_is_idempotent() {
        let basket = BasketMessageAdapter::new(BasketConfig::default());
        let cancel = CancellationToken::new();
        basket.send_in(Message::reset(), &cancel).await.unwrap();
        basket.send_in(Message::reset(), &cancel).await.unwrap();
        assert!(basket.is_idle());

        let venue = leaf("venue", Capabilities::market_data([DataType::Level1]));
        basket.add_adapter(venue.clone(), 0).unwrap();
        basket.send_in(Message::connect(), &cancel).await.unwrap();
        assert!(!basket.is_idle());

        basket.send_in(Message::reset(), &cancel).await.unwrap();
        basket.send_in(Message::reset(), &cancel).await.unwrap();
        assert!(basket.is_idle());
        assert_eq!(venue.output().handler_count(), 0);
    }

    #[tokio::test]
    async fn test_capability_union() {
        let basket = BasketMessageAdapter::new(BasketConfig::default());
        basket
            .add_adapter(leaf("a", Capabilities::market_data([DataType::Level1])), 0)
            .unwrap();
        basket
            .add_adapter(
                leaf("b", Capabilities::market_data([DataType::News]).with_transactions()),
                1,
            )
            .unwrap();
        basket
            .add_adapter(leaf("off", Capabilities::market_data([DataType::OrderLog])), -1)
            .unwrap();

        let caps = basket.capabilities();
        assert!(caps.supports_data_type(&DataType::Level1));
        assert!(caps.supports_data_type(&DataType::News));
        assert!(!caps.supports_data_type(&DataType::OrderLog));
        assert!(caps.supports_message(MessageType::OrderRegister));
    }

    #[tokio::test]
    async fn test_dispose_releases_leaves_once() {
        let basket = BasketMessageAdapter::new(BasketConfig::default());
        let venue = leaf("venue", Capabilities::market_data([DataType::Level1]));
        basket.add_adapter(venue.clone(), 0).unwrap();
        let cancel = CancellationToken::new();
        basket.send_in(Message::connect(), &cancel).await.unwrap();

        basket.dispose().await;
        basket.dispose().await;

        assert_eq!(venue.dispose_count(), 1);
        assert_eq!(venue.output().handler_count(), 0);
        assert!(matches!(
            basket.send_in(Message::connect(), &cancel).await,
            Err(BasketError::Disposed)
        ));
    }

    #[tokio::test]
    async fn test_named_portfolio_lookup_not_fanned_out() {
        let basket = BasketMessageAdapter::new(BasketConfig::default());
        let a = leaf("a", Capabilities::market_data([DataType::Portfolios]));
        let b = leaf("b", Capabilities::market_data([DataType::Portfolios]));
        basket.add_adapter(a.clone(), 0).unwrap();
        basket.add_adapter(b.clone(), 1).unwrap();
        let cancel = CancellationToken::new();
        basket.send_in(Message::connect(), &cancel).await.unwrap();

        let named = basket.transaction_ids().next_id();
        let request = MarketDataMessage::subscribe(named, DataType::Portfolios).with_portfolio("main");
        basket.send_in(Message::market_data(request), &cancel).await.unwrap();
        assert_eq!(basket.subscription_adapters(named), vec![a.id()]);
        assert!(b.sent_of(MessageType::MarketData).is_empty());

        let all = basket.transaction_ids().next_id();
        let request = MarketDataMessage::subscribe(all, DataType::Portfolios);
        basket.send_in(Message::market_data(request), &cancel).await.unwrap();
        assert_eq!(basket.subscription_adapters(all), vec![a.id(), b.id()]);
    }

    #[test]
    fn test_error_response_shapes() {
        let order = Message::new(MessageBody::OrderRegister(OrderRegisterMessage {
            transaction_id: TransactionId::new(4),
            portfolio_name: "main".to_string(),
            security_id: SecurityId::new("AAPL", "NASDAQ"),
            side: types::Side::Buy,
            price: Default::default(),
            volume: Default::default(),
        }));
        match error_response(&order, MessageError::Cancelled).body {
            MessageBody::Execution(execution) => {
                assert_eq!(execution.original_transaction_id, TransactionId::new(4));
                assert_eq!(execution.error, Some(MessageError::Cancelled));
                assert_eq!(execution.portfolio_name.as_deref(), Some("main"));
            }
            other => panic!("unexpected {:?}", other),
        }

        let reset = Message::reset();
        assert!(matches!(
            error_response(&reset, MessageError::Cancelled).body,
            MessageBody::Error(_)
        ));
    }
}
