//! In-process hand-off of received committed streams.
//!
//! Every subscriber owns a bounded queue. A subscriber that falls behind
//! loses streams (counted and logged) instead of stalling the connection
//! that publishes them; a dropped subscription is pruned on the next publish.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::bus::{EventBus, Subscription};
use crate::stream::CommittedEventStream;

/// Streams a subscriber may have pending before newer ones are dropped.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum InMemoryBusError {
    #[error("in-memory bus lock poisoned")]
    Poisoned,
}

#[derive(Debug)]
pub struct InMemoryEventBus {
    capacity: usize,
    subscribers: Mutex<Vec<SyncSender<Arc<CommittedEventStream>>>>,
    dropped: AtomicU64,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    /// `capacity` is per subscriber; zero is raised to one.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            subscribers: Mutex::new(Vec::new()),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Live subscriptions as of the last publish.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Deliveries skipped because a subscriber's queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus<Arc<CommittedEventStream>> for InMemoryEventBus {
    type Error = InMemoryBusError;

    fn publish(&self, stream: Arc<CommittedEventStream>) -> Result<(), Self::Error> {
        let mut subscribers = self.subscribers.lock().map_err(|_| InMemoryBusError::Poisoned)?;

        subscribers.retain(|tx| match tx.try_send(Arc::clone(&stream)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    commit_id = %stream.commit_id(),
                    bounded_context = %stream.bounded_context(),
                    capacity = self.capacity,
                    "subscriber lagging, committed event stream dropped"
                );
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });

        Ok(())
    }

    fn subscribe(&self) -> Subscription<Arc<CommittedEventStream>> {
        let (tx, rx) = mpsc::sync_channel(self.capacity);

        // A poisoned lock still hands out a subscription that never receives.
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }

        Subscription::new(rx)
    }
}
