//! Event name to subscriber index with non-blocking publish.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use subwire_proto::{ClientId, EventName, SubscriptionEvent};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::dispatch::{drain_and_dispose, DispatchItem, DispatchQueue, DrainPolicy, DrainReport};

/// Errors that can occur during router operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouterError {
    /// The router is shutting down and no longer accepts publishes.
    #[error("event router is shut down")]
    ShutDown,
}

/// Routes published events to the clients subscribed to their name.
///
/// The index is guarded by one coarse lock. Publishing copies the target
/// list under the lock and enqueues outside it, so a publisher never
/// waits on delivery and never races with (un)subscribes.
#[derive(Debug)]
pub struct EventRouter {
    index: Mutex<HashMap<EventName, HashSet<ClientId>>>,
    queue: Arc<dyn DispatchQueue>,
    accepting: AtomicBool,
}

impl EventRouter {
    /// Create a router feeding `queue`.
    #[must_use]
    pub fn new(queue: Arc<dyn DispatchQueue>) -> Self {
        Self {
            index: Mutex::new(HashMap::new()),
            queue,
            accepting: AtomicBool::new(true),
        }
    }

    /// Add `client_id` to the subscribers of `event_name`.
    ///
    /// Returns `true` if the client was not yet subscribed.
    pub fn subscribe(&self, client_id: ClientId, event_name: EventName) -> bool {
        let mut index = self.index.lock();
        let added = index.entry(event_name.clone()).or_default().insert(client_id);
        if added {
            debug!(client_id = %client_id, event = %event_name, "Client subscribed to event");
        }
        added
    }

    /// Remove `client_id` from the subscribers of `event_name` only.
    ///
    /// Returns `true` if the client was subscribed. Drops the bucket once
    /// it is empty.
    pub fn unsubscribe(&self, client_id: ClientId, event_name: &EventName) -> bool {
        let mut index = self.index.lock();
        let Some(bucket) = index.get_mut(event_name) else {
            return false;
        };

        let removed = bucket.remove(&client_id);
        if bucket.is_empty() {
            index.remove(event_name);
        }
        if removed {
            debug!(client_id = %client_id, event = %event_name, "Client unsubscribed from event");
        }
        removed
    }

    /// Remove `client_id` from every bucket it occupies.
    ///
    /// Returns the number of buckets the client was removed from.
    pub fn unsubscribe_all(&self, client_id: ClientId) -> usize {
        let mut index = self.index.lock();
        let mut removed = 0;

        index.retain(|_, bucket| {
            if bucket.remove(&client_id) {
                removed += 1;
            }
            !bucket.is_empty()
        });

        if removed > 0 {
            debug!(client_id = %client_id, buckets = removed, "Client removed from all events");
        }
        removed
    }

    /// Publish an event to every subscribed client.
    ///
    /// Returns the number of work items enqueued. An event nobody listens
    /// to is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::ShutDown`] after [`shutdown`](Self::shutdown)
    /// has started.
    pub fn publish(&self, event: SubscriptionEvent) -> Result<usize, RouterError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(RouterError::ShutDown);
        }

        let targets: Vec<ClientId> = {
            let index = self.index.lock();
            match index.get(&event.name) {
                Some(bucket) => bucket.iter().copied().collect(),
                None => return Ok(0),
            }
        };

        let event = Arc::new(event);
        let mut enqueued = 0;
        for client_id in targets {
            match self.queue.enqueue(DispatchItem::new(client_id, Arc::clone(&event))) {
                Ok(()) => enqueued += 1,
                Err(e) => {
                    warn!(client_id = %client_id, event = %event.name, error = %e, "Failed to enqueue event");
                }
            }
        }

        debug!(event = %event.name, targets = enqueued, "Event published");
        Ok(enqueued)
    }

    /// Stop accepting publishes, drain the dispatch queue within `policy`
    /// and dispose it.
    pub async fn shutdown(&self, policy: DrainPolicy) -> DrainReport {
        self.accepting.store(false, Ordering::Release);
        info!(
            poll_interval_ms = policy.poll_interval.as_millis() as u64,
            ceiling_ms = policy.ceiling.as_millis() as u64,
            "Event router shutting down"
        );
        drain_and_dispose(self.queue.as_ref(), policy).await
    }

    /// Check if publishes are still accepted.
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Number of clients subscribed to `event_name`.
    #[must_use]
    pub fn subscriber_count(&self, event_name: &EventName) -> usize {
        self.index.lock().get(event_name).map_or(0, HashSet::len)
    }

    /// Check if a bucket exists for `event_name`.
    #[must_use]
    pub fn has_bucket(&self, event_name: &EventName) -> bool {
        self.index.lock().contains_key(event_name)
    }

    /// Check if `client_id` is subscribed to `event_name`.
    #[must_use]
    pub fn is_subscribed(&self, client_id: ClientId, event_name: &EventName) -> bool {
        self.index
            .lock()
            .get(event_name)
            .is_some_and(|bucket| bucket.contains(&client_id))
    }

    /// Every event name with at least one subscriber.
    #[must_use]
    pub fn event_names(&self) -> Vec<EventName> {
        self.index.lock().keys().cloned().collect()
    }
}
