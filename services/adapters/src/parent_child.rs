//! Parent/child subscription correlation
//!
//! A parent subscription fanned out to N adapters owns N child transactions.
//! Child lifecycle events are reduced over all siblings so the application
//! sees exactly one response, one Online and one Finished per parent.

use crate::{BasketError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use types::{AdapterId, MessageError, TransactionId};

/// Lifecycle of one child subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    /// Sent, not answered yet
    Stopped,
    /// Answered successfully
    Active,
    /// Answered with an error
    Error,
    /// Switched to live data
    Online,
    /// Completed
    Finished,
}

#[derive(Debug, Clone)]
struct ChildEntry {
    parent: TransactionId,
    adapter: AdapterId,
    state: ChildState,
    error: Option<MessageError>,
}

#[derive(Debug, Default, Clone, Copy)]
struct ParentFlags {
    responded: bool,
    online: bool,
    finished: bool,
}

/// Child of a parent subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildInfo {
    /// Child transaction id
    pub transaction_id: TransactionId,
    /// Adapter serving the child
    pub adapter: AdapterId,
    /// Current state
    pub state: ChildState,
}

#[derive(Debug, Default)]
struct Inner {
    children: HashMap<TransactionId, ChildEntry>,
    parents: HashMap<TransactionId, ParentFlags>,
}

impl Inner {
    fn siblings(&self, parent: TransactionId) -> impl Iterator<Item = &ChildEntry> {
        self.children.values().filter(move |c| c.parent == parent)
    }

    fn set_state(&mut self, child: TransactionId, state: ChildState) -> Option<TransactionId> {
        let entry = self.children.get_mut(&child)?;
        entry.state = state;
        Some(entry.parent)
    }
}

/// Thread-safe child to parent map
#[derive(Debug, Default)]
pub struct ParentChildMap {
    inner: Mutex<Inner>,
}

impl ParentChildMap {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `child` under `parent`; the child starts Stopped
    pub fn add_mapping(
        &self,
        child: TransactionId,
        parent: TransactionId,
        adapter: AdapterId,
    ) -> Result<()> {
        self.add_children(parent, &[(child, adapter)])
    }

    /// Register every child of a fan-out under `parent`.
    ///
    /// Nothing is inserted when any child id is already mapped or repeated.
    pub fn add_children(
        &self,
        parent: TransactionId,
        children: &[(TransactionId, AdapterId)],
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        for (index, (child, _)) in children.iter().enumerate() {
            if inner.children.contains_key(child)
                || children[..index].iter().any(|(seen, _)| seen == child)
            {
                return Err(BasketError::DuplicateChild(*child));
            }
        }
        for (child, adapter) in children {
            inner.children.insert(
                *child,
                ChildEntry {
                    parent,
                    adapter: *adapter,
                    state: ChildState::Stopped,
                    error: None,
                },
            );
        }
        inner.parents.entry(parent).or_default();
        Ok(())
    }

    /// Record a child's response.
    ///
    /// Returns the parent and its response once every sibling has left
    /// Stopped: `Ok` if any child succeeded, otherwise the combined error
    /// (not-supported only when every child answered not-supported).
    pub fn process_child_response(
        &self,
        child: TransactionId,
        error: Option<MessageError>,
    ) -> Option<(TransactionId, std::result::Result<(), MessageError>)> {
        let mut inner = self.inner.lock();
        let entry = inner.children.get_mut(&child)?;
        entry.state = if error.is_some() {
            ChildState::Error
        } else {
            ChildState::Active
        };
        entry.error = error;
        let parent = entry.parent;

        if inner.siblings(parent).any(|c| c.state == ChildState::Stopped) {
            return None;
        }
        let flags = inner.parents.entry(parent).or_default();
        if flags.responded {
            return None;
        }
        flags.responded = true;

        let errors: Vec<MessageError> = inner
            .siblings(parent)
            .map(|c| c.error.clone())
            .collect::<Option<Vec<_>>>()
            .unwrap_or_default();

        if errors.is_empty() {
            return Some((parent, Ok(())));
        }
        let error = if errors.iter().all(MessageError::is_not_supported) {
            errors.into_iter().next().unwrap_or_else(|| MessageError::NotSupported(String::new()))
        } else {
            MessageError::aggregate(errors)
        };
        Some((parent, Err(error)))
    }

    /// Record a child going online; returns the parent once every sibling is
    /// online (or errored, or already finished)
    pub fn process_child_online(&self, child: TransactionId) -> Option<TransactionId> {
        let mut inner = self.inner.lock();
        let parent = inner.set_state(child, ChildState::Online)?;

        let ready = inner.siblings(parent).all(|c| {
            matches!(c.state, ChildState::Online | ChildState::Finished | ChildState::Error)
        });
        let flags = inner.parents.entry(parent).or_default();
        if !ready || flags.online {
            return None;
        }
        flags.online = true;
        Some(parent)
    }

    /// Record a child finishing; returns the parent once every sibling is
    /// finished (or errored)
    pub fn process_child_finish(&self, child: TransactionId) -> Option<TransactionId> {
        let mut inner = self.inner.lock();
        let parent = inner.set_state(child, ChildState::Finished)?;

        let ready = inner
            .siblings(parent)
            .all(|c| matches!(c.state, ChildState::Finished | ChildState::Error));
        let flags = inner.parents.entry(parent).or_default();
        if !ready || flags.finished {
            return None;
        }
        flags.finished = true;
        Some(parent)
    }

    /// Parent of a child transaction
    pub fn try_get_parent(&self, child: TransactionId) -> Option<TransactionId> {
        self.inner.lock().children.get(&child).map(|c| c.parent)
    }

    /// Children of a parent, ordered by transaction id
    pub fn children_of(&self, parent: TransactionId) -> Vec<ChildInfo> {
        let inner = self.inner.lock();
        let mut children: Vec<ChildInfo> = inner
            .children
            .iter()
            .filter(|(_, c)| c.parent == parent)
            .map(|(id, c)| ChildInfo {
                transaction_id: *id,
                adapter: c.adapter,
                state: c.state,
            })
            .collect();
        children.sort_by_key(|c| c.transaction_id);
        children
    }

    /// Drop a parent and all its children
    pub fn remove_parent(&self, parent: TransactionId) -> Vec<ChildInfo> {
        let removed = self.children_of(parent);
        let mut inner = self.inner.lock();
        inner.children.retain(|_, c| c.parent != parent);
        inner.parents.remove(&parent);
        removed
    }

    /// Drop every child served by `adapter`
    pub fn remove_adapter(&self, adapter: AdapterId) {
        self.inner.lock().children.retain(|_, c| c.adapter != adapter);
    }

    /// Number of child mappings
    pub fn len(&self) -> usize {
        self.inner.lock().children.len()
    }

    /// Whether no child is mapped
    pub fn is_empty(&self) -> bool {
        self.inner.lock().children.is_empty()
    }

    /// Drop every mapping atomically
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.children.clear();
        inner.parents.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(id: u64) -> TransactionId {
        TransactionId::new(id)
    }

    fn map_with_children(parent: u64, children: &[u64]) -> ParentChildMap {
        let map = ParentChildMap::new();
        for child in children {
            map.add_mapping(tx(*child), tx(parent), AdapterId::new()).unwrap();
        }
        map
    }

    #[test]
    fn test_response_waits_for_every_child() {
        let map = map_with_children(1, &[10, 11, 12]);

        assert_eq!(map.process_child_response(tx(11), None), None);
        assert_eq!(
            map.process_child_response(tx(10), Some(MessageError::Adapter("x".into()))),
            None
        );
        assert_eq!(map.process_child_response(tx(12), None), Some((tx(1), Ok(()))));
        // a late duplicate answer does not re-emit
        assert_eq!(map.process_child_response(tx(12), None), None);
    }

    #[test]
    fn test_all_children_failed() {
        let map = map_with_children(1, &[10, 11]);

        map.process_child_response(tx(10), Some(MessageError::Adapter("a".into())));
        let (parent, outcome) = map
            .process_child_response(tx(11), Some(MessageError::Adapter("b".into())))
            .unwrap();

        assert_eq!(parent, tx(1));
        assert!(matches!(outcome, Err(MessageError::Aggregate(ref e)) if e.len() == 2));
    }

    #[test]
    fn test_all_not_supported_stays_not_supported() {
        let map = map_with_children(1, &[10, 11]);
        let ns = MessageError::NotSupported("News".into());

        map.process_child_response(tx(10), Some(ns.clone()));
        let (_, outcome) = map.process_child_response(tx(11), Some(ns)).unwrap();
        assert!(outcome.unwrap_err().is_not_supported());
    }

    #[test]
    fn test_online_and_finish_fire_once_in_any_order() {
        let map = map_with_children(1, &[10, 11, 12]);
        for child in [12, 10, 11] {
            map.process_child_response(tx(child), None);
        }

        assert_eq!(map.process_child_online(tx(11)), None);
        assert_eq!(map.process_child_finish(tx(12)), None);
        assert_eq!(map.process_child_online(tx(10)), Some(tx(1)));
        assert_eq!(map.process_child_online(tx(10)), None);

        assert_eq!(map.process_child_finish(tx(10)), None);
        assert_eq!(map.process_child_finish(tx(11)), Some(tx(1)));
        assert_eq!(map.process_child_finish(tx(11)), None);
    }

    #[test]
    fn test_errored_child_counts_as_finished() {
        let map = map_with_children(1, &[10, 11]);
        map.process_child_response(tx(10), Some(MessageError::Adapter("x".into())));
        map.process_child_response(tx(11), None);

        assert_eq!(map.process_child_finish(tx(11)), Some(tx(1)));
    }

    #[test]
    fn test_duplicate_child_rejected() {
        let map = map_with_children(1, &[10]);
        assert!(matches!(
            map.add_mapping(tx(10), tx(2), AdapterId::new()),
            Err(BasketError::DuplicateChild(_))
        ));
        assert_eq!(map.try_get_parent(tx(10)), Some(tx(1)));
    }

    #[test]
    fn test_fan_out_with_taken_child_inserts_nothing() {
        let map = map_with_children(1, &[10]);
        let adapter = AdapterId::new();

        let result = map.add_children(tx(2), &[(tx(20), adapter), (tx(10), adapter)]);
        assert!(matches!(result, Err(BasketError::DuplicateChild(id)) if id == tx(10)));
        assert_eq!(map.try_get_parent(tx(20)), None);
        assert!(map.children_of(tx(2)).is_empty());

        map.add_children(tx(2), &[(tx(20), adapter), (tx(21), adapter)]).unwrap();
        assert_eq!(map.children_of(tx(2)).len(), 2);
        assert_eq!(map.try_get_parent(tx(10)), Some(tx(1)));
    }

    #[test]
    fn test_remove_parent_and_clear() {
        let map = map_with_children(1, &[10, 11]);
        map.add_mapping(tx(20), tx(2), AdapterId::new()).unwrap();

        let removed = map.remove_parent(tx(1));
        assert_eq!(removed.len(), 2);
        assert!(removed.iter().all(|c| c.state == ChildState::Stopped));
        assert_eq!(map.len(), 1);

        map.clear();
        assert!(map.is_empty());
        assert_eq!(map.try_get_parent(tx(20)), None);
    }
}
