//! Asynchronous delivery of published events.
//!
//! The [`EventRouter`](crate::EventRouter) only enqueues `(client, event)`
//! work items; a [`DispatchQueue`] performs the actual delivery elsewhere so
//! publishers never wait on a client.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use subwire_proto::{ClientId, SubscriptionEvent};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default interval between drain polls.
pub const DEFAULT_DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Default hard ceiling on the shutdown drain.
pub const DEFAULT_DRAIN_CEILING: Duration = Duration::from_secs(5);

/// Errors that can occur during dispatch operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// The queue no longer accepts work.
    #[error("dispatch queue is closed")]
    Closed,
}

/// One unit of delivery work: send `event` to `client_id`.
#[derive(Debug, Clone)]
pub struct DispatchItem {
    /// Target client.
    pub client_id: ClientId,
    /// Shared event; the same allocation is handed to every target.
    pub event: Arc<SubscriptionEvent>,
}

impl DispatchItem {
    /// Create a work item.
    #[must_use]
    pub const fn new(client_id: ClientId, event: Arc<SubscriptionEvent>) -> Self {
        Self { client_id, event }
    }
}

/// Work queue decoupling publication from per-client delivery.
pub trait DispatchQueue: Send + Sync + fmt::Debug {
    /// Enqueue an item without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Closed`] once the queue stopped accepting.
    fn enqueue(&self, item: DispatchItem) -> Result<(), DispatchError>;

    /// Number of items enqueued but not yet delivered.
    fn pending(&self) -> usize;

    /// Stop accepting new items; queued items are still delivered.
    fn stop_accepting(&self);

    /// Tear the queue down, dropping anything still pending.
    ///
    /// Returns the number of dropped items.
    fn dispose(&self) -> usize;
}

/// Final destination of dispatched items.
pub trait EventSink: Send + Sync {
    /// Deliver one item. Must not block.
    fn deliver(&self, item: DispatchItem);
}

/// How long shutdown waits for the queue to empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainPolicy {
    /// Time between checks of [`DispatchQueue::pending`].
    pub poll_interval: Duration,
    /// Give up after this long and dispose anyway.
    pub ceiling: Duration,
}

impl DrainPolicy {
    /// Create a drain policy.
    #[must_use]
    pub const fn new(poll_interval: Duration, ceiling: Duration) -> Self {
        Self {
            poll_interval,
            ceiling,
        }
    }
}

impl Default for DrainPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_DRAIN_POLL_INTERVAL, DEFAULT_DRAIN_CEILING)
    }
}

/// Outcome of a shutdown drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// Whether the queue emptied before the ceiling.
    pub drained: bool,
    /// Items dropped by the final dispose.
    pub abandoned: usize,
    /// Time spent waiting.
    pub elapsed: Duration,
}

/// Stop `queue`, wait for it to empty (bounded by `policy`), then dispose
/// it whether or not it emptied.
pub async fn drain_and_dispose(queue: &dyn DispatchQueue, policy: DrainPolicy) -> DrainReport {
    queue.stop_accepting();

    let started = Instant::now();
    let deadline = started + policy.ceiling;
    let drained = loop {
        if queue.pending() == 0 {
            break true;
        }
        if Instant::now() >= deadline {
            break false;
        }
        tokio::time::sleep(policy.poll_interval).await;
    };

    let abandoned = queue.dispose();
    let elapsed = started.elapsed();

    if drained {
        info!(elapsed_ms = elapsed.as_millis() as u64, "Dispatch queue drained");
    } else {
        warn!(
            abandoned = abandoned,
            ceiling_ms = policy.ceiling.as_millis() as u64,
            "Dispatch queue drain hit its ceiling, pending events dropped"
        );
    }

    DrainReport {
        drained,
        abandoned,
        elapsed,
    }
}

/// In-process dispatch queue: an unbounded channel drained by one worker
/// task that hands each item to an [`EventSink`].
#[derive(Debug)]
pub struct ChannelDispatchQueue {
    sender: Mutex<Option<mpsc::UnboundedSender<DispatchItem>>>,
    pending: Arc<AtomicUsize>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelDispatchQueue {
    /// Create the queue and spawn its worker on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    #[must_use]
    pub fn spawn(sink: Arc<dyn EventSink>) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<DispatchItem>();
        let pending = Arc::new(AtomicUsize::new(0));
        let worker_pending = Arc::clone(&pending);

        let worker = tokio::spawn(async move {
            while let Some(item) = receiver.recv().await {
                sink.deliver(item);
                // dispose may already have zeroed the counter
                let _ = worker_pending.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    n.checked_sub(1)
                });
            }
            debug!("Dispatch worker stopped");
        });

        Self {
            sender: Mutex::new(Some(sender)),
            pending,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Check if the queue still accepts items.
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.sender.lock().is_some()
    }
}

impl DispatchQueue for ChannelDispatchQueue {
    fn enqueue(&self, item: DispatchItem) -> Result<(), DispatchError> {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return Err(DispatchError::Closed);
        };

        self.pending.fetch_add(1, Ordering::AcqRel);
        if sender.send(item).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(DispatchError::Closed);
        }
        Ok(())
    }

    fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    fn stop_accepting(&self) {
        // Dropping the sender lets the worker finish what is queued and exit.
        if self.sender.lock().take().is_some() {
            debug!("Dispatch queue stopped accepting");
        }
    }

    fn dispose(&self) -> usize {
        self.stop_accepting();
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
        self.pending.swap(0, Ordering::AcqRel)
    }
}

impl Drop for ChannelDispatchQueue {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            worker.abort();
        }
    }
}
