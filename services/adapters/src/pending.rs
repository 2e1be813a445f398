//! FIFO buffer of messages waiting for a connected adapter

use std::collections::VecDeque;
use tokio_util::sync::CancellationToken;
use types::{Message, MessageBody, TransactionId};

/// Queued message with the cancellation token of the call that sent it
#[derive(Debug, Clone)]
pub struct PendingMessage {
    /// Request to replay
    pub message: Message,
    /// Cancellation of the originating call
    pub cancel: CancellationToken,
}

impl PendingMessage {
    /// Pair a message with its caller's token
    pub fn new(message: Message, cancel: CancellationToken) -> Self {
        Self { message, cancel }
    }
}

/// Messages that could not be routed while adapters were still connecting
#[derive(Debug, Default)]
pub struct PendingQueue {
    items: VecDeque<PendingMessage>,
}

impl PendingQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message
    pub fn push(&mut self, message: Message, cancel: &CancellationToken) {
        self.items.push_back(PendingMessage::new(message, cancel.clone()));
    }

    /// Take every queued message in submission order
    pub fn take_all(&mut self) -> Vec<PendingMessage> {
        self.items.drain(..).collect()
    }

    /// Remove the pending subscribe with the given transaction id
    pub fn remove_subscription(&mut self, transaction_id: TransactionId) -> Option<PendingMessage> {
        let index = self.items.iter().position(|p| {
            matches!(&p.message.body, MessageBody::MarketData(md)
                if md.is_subscribe && md.transaction_id == transaction_id)
        })?;
        self.items.remove(index)
    }

    /// Number of queued messages
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drop every queued message
    pub fn clear(&mut self) {
        self.items.clear();
    }
}
