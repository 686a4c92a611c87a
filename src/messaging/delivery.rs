// Delivery tracking for outbound messages
//
// Every message the user sends is rendered optimistically under a local
// clientTempId. The outbox maps the tempId that went (or will go) on the wire
// to that local copy, so the server's echo can be matched back to it.
// The broker echoes a sent message to the sender's own topic, usually without
// the tempId, so an echo is also matched on sender, receiver and content.

use log::{debug, info, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use crate::models::{DeliveryStatus, Message};
use crate::stomp::InboundHook;

/// Tracked entries kept before settled ones are evicted
pub const DEFAULT_OUTBOX_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct Pending {
    entries: HashMap<String, Message>, // wire tempId -> local message
    order: VecDeque<String>,           // wire tempIds, oldest first
}

impl Pending {
    fn remove(&mut self, wire_temp_id: &str) -> Option<Message> {
        let local = self.entries.remove(wire_temp_id)?;
        self.order.retain(|id| id != wire_temp_id);
        Some(local)
    }

    // Drop the oldest settled entries until we are within `capacity`.
    // Entries still waiting to go out are never evicted.
    fn evict(&mut self, capacity: usize) {
        while self.entries.len() > capacity {
            let oldest_settled = self
                .order
                .iter()
                .find(|id| self.entries.get(*id).is_some_and(|m| is_settled(m.delivery_status)))
                .cloned();
            match oldest_settled {
                Some(id) => {
                    debug!("Evicting settled message {} from outbox", id);
                    self.remove(&id);
                }
                None => break,
            }
        }
    }
}

// Written to the broker; only an echo can still change it
fn is_settled(status: DeliveryStatus) -> bool {
    status != DeliveryStatus::Sending && !status.is_retryable()
}

#[derive(Debug)]
pub struct Outbox {
    pending: Mutex<Pending>,
    capacity: usize,
}

impl Default for Outbox {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_OUTBOX_CAPACITY)
    }
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pending: Mutex::new(Pending::default()),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn track(&self, wire_temp_id: &str, local: Message) {
        let mut pending = self.lock();
        if pending.entries.insert(wire_temp_id.to_string(), local).is_none() {
            pending.order.push_back(wire_temp_id.to_string());
        }
        pending.evict(self.capacity);
    }

    /// Record the status of a tracked message, returning the updated copy
    pub fn update_status(&self, wire_temp_id: &str, status: DeliveryStatus) -> Option<Message> {
        let mut pending = self.lock();
        let updated = match pending.entries.get_mut(wire_temp_id) {
            Some(local) => {
                debug!(
                    "Updating message {} status from {:?} to {:?}",
                    wire_temp_id, local.delivery_status, status
                );
                *local = local.with_status(status);
                local.clone()
            }
            None => {
                debug!("Tried to update status for unknown message ID: {}", wire_temp_id);
                return None;
            }
        };
        pending.evict(self.capacity);
        Some(updated)
    }

    /// A queued message is about to go out under a fresh wire id
    pub fn rekey(&self, from: &str, to: &str) {
        let mut pending = self.lock();
        let Some(local) = pending.entries.remove(from) else {
            warn!("No tracked message for tempId {}", from);
            return;
        };
        pending.entries.insert(to.to_string(), local);
        for id in pending.order.iter_mut() {
            if id == from {
                *id = to.to_string();
            }
        }
    }

    pub fn get(&self, wire_temp_id: &str) -> Option<Message> {
        self.lock().entries.get(wire_temp_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Match a server message against the outbox. A match is removed and
    /// the server copy is returned under the local clientTempId.
    pub fn reconcile(&self, mut message: Message) -> Message {
        let mut pending = self.lock();

        let by_temp_id = message
            .client_temp_id
            .as_deref()
            .filter(|id| pending.entries.contains_key(*id))
            .map(str::to_string);
        // Oldest message on its way out with the same participants and text.
        // Queued and failed copies never reached the broker.
        let matched = by_temp_id.or_else(|| {
            pending
                .order
                .iter()
                .find(|id| {
                    pending.entries.get(*id).is_some_and(|local| {
                        !local.delivery_status.is_retryable()
                            && local.sender_id == message.sender_id
                            && local.receiver_id == message.receiver_id
                            && local.content == message.content
                    })
                })
                .cloned()
        });

        if let Some(wire_temp_id) = matched {
            if let Some(local) = pending.remove(&wire_temp_id) {
                info!(
                    "Server acknowledged message {} (server id {:?})",
                    wire_temp_id, message.id
                );
                message.client_temp_id = local.client_temp_id;
            }
        }
        message
    }
}

impl InboundHook for Outbox {
    fn on_message(&self, message: Message) -> Message {
        self.reconcile(message)
    }
}
