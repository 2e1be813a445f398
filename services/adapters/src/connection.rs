//! Per-adapter connection state and its aggregation into one logical state
//!
//! The tracker is owned by the basket state and only mutated under its lock,
//! so observers always see a consistent aggregate.

use std::collections::HashMap;
use types::{AdapterId, MessageError};

/// Connection lifecycle of one adapter (or of the aggregate)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not connected
    #[default]
    Disconnected,
    /// Connect sent, no answer yet
    Connecting,
    /// Successfully connected
    Connected,
    /// Disconnect sent, no answer yet
    Disconnecting,
    /// Connection attempt or session failed
    Failed(MessageError),
}

impl ConnectionState {
    /// Disconnected or failed
    pub fn is_down(&self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed(_))
    }
}

/// Aggregate transition raised by the tracker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregateEvent {
    /// The basket is usable
    Connected,
    /// Every adapter failed; carries the combined error
    Failed(MessageError),
    /// Every adapter is down after a disconnect
    Disconnected,
}

/// Tracks every adapter's state and decides aggregate transitions
#[derive(Debug)]
pub struct ConnectionStateTracker {
    connect_on_first_adapter: bool,
    states: HashMap<AdapterId, ConnectionState>,
    aggregate: ConnectionState,
    connected_fired: bool,
}

impl ConnectionStateTracker {
    /// Create a tracker with the given connect policy
    pub fn new(connect_on_first_adapter: bool) -> Self {
        Self {
            connect_on_first_adapter,
            states: HashMap::new(),
            aggregate: ConnectionState::Disconnected,
            connected_fired: false,
        }
    }

    /// Start a connect cycle for `adapters`
    pub fn begin_connect(&mut self, adapters: impl IntoIterator<Item = AdapterId>) {
        self.states.clear();
        for id in adapters {
            self.states.insert(id, ConnectionState::Connecting);
        }
        self.aggregate = ConnectionState::Connecting;
        self.connected_fired = false;
    }

    /// Record a connect result
    pub fn on_connected(
        &mut self,
        adapter: AdapterId,
        error: Option<MessageError>,
    ) -> Option<AggregateEvent> {
        let succeeded = error.is_none();
        let state = match error {
            Some(e) => ConnectionState::Failed(e),
            None => ConnectionState::Connected,
        };
        self.states.insert(adapter, state);

        if self.connected_fired {
            return None;
        }

        if succeeded && (self.connect_on_first_adapter || !self.has_pending()) {
            return Some(self.fire_connected());
        }

        if !succeeded {
            if self.all_failed() {
                let error = MessageError::aggregate(self.errors());
                self.aggregate = ConnectionState::Failed(error.clone());
                return Some(AggregateEvent::Failed(error));
            }
            // the last pending adapter failed while a sibling is up
            if !self.has_pending() && self.has_connected() {
                return Some(self.fire_connected());
            }
        }

        None
    }

    /// Mark every Connecting/Connected adapter as Disconnecting and return them
    pub fn begin_disconnect(&mut self) -> Vec<AdapterId> {
        let mut targets = Vec::new();
        for (id, state) in self.states.iter_mut() {
            if matches!(state, ConnectionState::Connecting | ConnectionState::Connected) {
                *state = ConnectionState::Disconnecting;
                targets.push(*id);
            }
        }
        if !targets.is_empty() {
            self.aggregate = ConnectionState::Disconnecting;
        }
        targets
    }

    /// Record a disconnect result
    pub fn on_disconnected(
        &mut self,
        adapter: AdapterId,
        error: Option<MessageError>,
    ) -> Option<AggregateEvent> {
        let state = match error {
            Some(e) => ConnectionState::Failed(e),
            None => ConnectionState::Disconnected,
        };
        self.states.insert(adapter, state);

        if self.aggregate == ConnectionState::Disconnected {
            return None;
        }
        if self.states.values().all(ConnectionState::is_down) {
            self.aggregate = ConnectionState::Disconnected;
            self.connected_fired = false;
            return Some(AggregateEvent::Disconnected);
        }
        None
    }

    fn fire_connected(&mut self) -> AggregateEvent {
        self.connected_fired = true;
        self.aggregate = ConnectionState::Connected;
        AggregateEvent::Connected
    }

    fn all_failed(&self) -> bool {
        !self.states.is_empty()
            && self
                .states
                .values()
                .all(|s| matches!(s, ConnectionState::Failed(_)))
    }

    fn errors(&self) -> Vec<MessageError> {
        let mut errors: Vec<(String, MessageError)> = self
            .states
            .iter()
            .filter_map(|(id, s)| match s {
                ConnectionState::Failed(e) => Some((id.to_string(), e.clone())),
                _ => None,
            })
            .collect();
        errors.sort_by(|a, b| a.0.cmp(&b.0));
        errors.into_iter().map(|(_, e)| e).collect()
    }

    /// Any adapter still Connecting
    pub fn has_pending(&self) -> bool {
        self.states
            .values()
            .any(|s| *s == ConnectionState::Connecting)
    }

    /// Any adapter Connected
    pub fn has_connected(&self) -> bool {
        self.states
            .values()
            .any(|s| *s == ConnectionState::Connected)
    }

    /// Whether one adapter is Connected
    pub fn is_connected(&self, adapter: AdapterId) -> bool {
        self.states.get(&adapter) == Some(&ConnectionState::Connected)
    }

    /// State of one adapter
    pub fn state(&self, adapter: AdapterId) -> ConnectionState {
        self.states.get(&adapter).cloned().unwrap_or_default()
    }

    /// Aggregate state
    pub fn aggregate(&self) -> ConnectionState {
        self.aggregate.clone()
    }

    /// Forget one adapter
    pub fn remove(&mut self, adapter: AdapterId) {
        self.states.remove(&adapter);
    }

    /// Forget everything
    pub fn clear(&mut self) {
        self.states.clear();
        self.aggregate = ConnectionState::Disconnected;
        self.connected_fired = false;
    }
}
