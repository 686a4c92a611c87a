// Pending send queue: messages waiting for a connection
// FIFO; the front item is only removed once its send succeeded.

use std::collections::VecDeque;

use crate::models::QueuedMessage;

#[derive(Debug, Default, Clone)]
pub struct PendingSendQueue {
    items: VecDeque<QueuedMessage>,
}

impl PendingSendQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: QueuedMessage) {
        self.items.push_back(item);
    }

    pub fn front(&self) -> Option<&QueuedMessage> {
        self.items.front()
    }

    /// Remove the front item after it was sent
    pub fn pop_front(&mut self) -> Option<QueuedMessage> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains_local(&self, local_temp_id: &str) -> bool {
        self.items
            .iter()
            .any(|item| item.local_temp_id.as_deref() == Some(local_temp_id))
    }

    pub fn snapshot(&self) -> Vec<QueuedMessage> {
        self.items.iter().cloned().collect()
    }
}
