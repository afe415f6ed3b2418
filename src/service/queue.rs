//! Per-server outbound priority queue.
//!
//! Entries stay sorted by priority, highest first, and keep insertion order
//! within a priority. A full queue evicts its lowest-priority oldest entry
//! before admitting a new one. Draining is best-effort: an entry that keeps
//! failing is dropped once its retry count reaches the configured maximum.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Delivery priority, `Emergency` highest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Emergency,
}

/// A payload waiting for delivery to one server
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub id: u64,
    pub payload: Bytes,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
}

impl QueuedMessage {
    pub fn new(payload: Bytes, priority: Priority) -> Self {
        Self {
            id: NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed),
            payload,
            priority,
            enqueued_at: Utc::now(),
            retry_count: 0,
        }
    }
}

/// Outcome of one drain pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub sent: usize,
    pub retried: usize,
    pub dropped: usize,
}

#[derive(Debug)]
pub struct PriorityQueue {
    entries: Vec<QueuedMessage>,
    capacity: usize,
}

impl PriorityQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries in delivery order.
    pub fn iter(&self) -> impl Iterator<Item = &QueuedMessage> {
        self.entries.iter()
    }

    /// Admit `message`, returning the entry evicted to make room, if any.
    pub fn push(&mut self, message: QueuedMessage) -> Option<QueuedMessage> {
        let evicted = if self.entries.len() >= self.capacity {
            self.evict_lowest()
        } else {
            None
        };
        let at = self
            .entries
            .partition_point(|queued| queued.priority >= message.priority);
        self.entries.insert(at, message);
        evicted
    }

    /// Remove the oldest entry of the lowest priority present.
    fn evict_lowest(&mut self) -> Option<QueuedMessage> {
        let lowest = self.entries.last()?.priority;
        let first_of_lowest = self.entries.partition_point(|queued| queued.priority > lowest);
        Some(self.entries.remove(first_of_lowest))
    }

    /// Offer every entry to `send` in delivery order.
    ///
    /// Delivered entries are removed. A failed entry is dropped when its retry
    /// count has reached `max_retries`, otherwise its count is incremented.
    pub fn drain_with<F>(&mut self, max_retries: u32, mut send: F) -> DrainReport
    where
        F: FnMut(&QueuedMessage) -> bool,
    {
        let mut report = DrainReport::default();
        self.entries.retain_mut(|message| {
            if send(message) {
                report.sent += 1;
                return false;
            }
            if message.retry_count >= max_retries {
                warn!(
                    id = message.id,
                    priority = ?message.priority,
                    retries = message.retry_count,
                    "Dropping undeliverable message"
                );
                report.dropped += 1;
                false
            } else {
                message.retry_count += 1;
                report.retried += 1;
                true
            }
        });
        report
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
