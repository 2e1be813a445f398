//! Priority-ordered registry of leaf adapters
//!
//! The sorted view is the fallback order used by routing: lower priority
//! values are tried first and [`DISABLED_PRIORITY`] hides an adapter.

use crate::common::MessageAdapter;
use crate::{BasketError, Result};
use parking_lot::RwLock;
use std::sync::Arc;
use types::AdapterId;

/// Priority marking an adapter as disabled
pub const DISABLED_PRIORITY: i32 = -1;

struct RegistryEntry {
    adapter: Arc<dyn MessageAdapter>,
    priority: i32,
    heartbeat: bool,
}

/// Ordered set of leaf adapters with per-adapter priority and heartbeat flag
#[derive(Default)]
pub struct AdapterRegistry {
    entries: RwLock<Vec<RegistryEntry>>,
}

impl AdapterRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a leaf adapter
    pub fn add(&self, adapter: Arc<dyn MessageAdapter>, priority: i32) -> Result<()> {
        let id = adapter.id();
        check_priority(id, priority)?;

        let mut entries = self.entries.write();
        if entries.iter().any(|e| e.adapter.id() == id) {
            return Err(BasketError::DuplicateAdapter(id));
        }

        tracing::debug!("Registering adapter {} ({}) priority {}", adapter.name(), id, priority);
        entries.push(RegistryEntry {
            adapter,
            priority,
            heartbeat: true,
        });
        Ok(())
    }

    /// Unregister an adapter, returning it
    pub fn remove(&self, id: AdapterId) -> Option<Arc<dyn MessageAdapter>> {
        let mut entries = self.entries.write();
        let index = entries.iter().position(|e| e.adapter.id() == id)?;
        tracing::debug!("Unregistering adapter {}", id);
        Some(entries.remove(index).adapter)
    }

    /// Unregister every adapter, returning them in insertion order
    pub fn clear(&self) -> Vec<Arc<dyn MessageAdapter>> {
        self.entries
            .write()
            .drain(..)
            .map(|e| e.adapter)
            .collect()
    }

    /// Change an adapter's priority; values below `-1` are rejected
    pub fn set_priority(&self, id: AdapterId, priority: i32) -> Result<()> {
        check_priority(id, priority)?;
        let mut entries = self.entries.write();
        let entry = entries
            .iter_mut()
            .find(|e| e.adapter.id() == id)
            .ok_or(BasketError::UnknownAdapter(id))?;
        entry.priority = priority;
        Ok(())
    }

    /// Priority of an adapter, if registered
    pub fn priority(&self, id: AdapterId) -> Option<i32> {
        self.entries
            .read()
            .iter()
            .find(|e| e.adapter.id() == id)
            .map(|e| e.priority)
    }

    /// Toggle heartbeat for one adapter (on by default)
    pub fn set_heartbeat(&self, id: AdapterId, enabled: bool) -> Result<()> {
        let mut entries = self.entries.write();
        let entry = entries
            .iter_mut()
            .find(|e| e.adapter.id() == id)
            .ok_or(BasketError::UnknownAdapter(id))?;
        entry.heartbeat = enabled;
        Ok(())
    }

    /// Whether heartbeat is on for an adapter; false when unknown
    pub fn heartbeat(&self, id: AdapterId) -> bool {
        self.entries
            .read()
            .iter()
            .find(|e| e.adapter.id() == id)
            .is_some_and(|e| e.heartbeat)
    }

    /// Enabled adapters, ascending by priority. Ties keep insertion order.
    pub fn sorted(&self) -> Vec<Arc<dyn MessageAdapter>> {
        let entries = self.entries.read();
        let mut enabled: Vec<&RegistryEntry> = entries
            .iter()
            .filter(|e| e.priority != DISABLED_PRIORITY)
            .collect();
        enabled.sort_by_key(|e| e.priority);
        enabled.into_iter().map(|e| e.adapter.clone()).collect()
    }

    /// Every adapter, including disabled ones, in insertion order
    pub fn all(&self) -> Vec<Arc<dyn MessageAdapter>> {
        self.entries.read().iter().map(|e| e.adapter.clone()).collect()
    }

    /// Look up an adapter by id
    pub fn get(&self, id: AdapterId) -> Option<Arc<dyn MessageAdapter>> {
        self.entries
            .read()
            .iter()
            .find(|e| e.adapter.id() == id)
            .map(|e| e.adapter.clone())
    }

    /// Whether an adapter is registered
    pub fn contains(&self, id: AdapterId) -> bool {
        self.get(id).is_some()
    }

    /// Number of registered adapters, disabled ones included
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether no adapter is registered
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

fn check_priority(adapter: AdapterId, priority: i32) -> Result<()> {
    if priority < DISABLED_PRIORITY {
        return Err(BasketError::InvalidPriority { adapter, priority });
    }
    Ok(())
}
