//! Per-app work queue shared by an app runner and its dispatcher loops.
//!
//! FIFO, safe for concurrent push and pop. Accounting tracks how many
//! payloads have been pushed and how many have been reported processed, so
//! the runner can apply back-pressure and drain before shutdown.
//!
//! Each dispatcher loop waits on the queue with its own cancellation token.
//! [`Queue::wakeup`] cancels exactly that token, so a shutdown request
//! reaches the loop it names and is never consumed by another waiter.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::batch::Batch;

/// A unit of work for a dispatcher loop.
#[derive(Debug, Clone)]
pub enum QueuePayload {
    /// Every notification in the batch, delivered in one round trip.
    Batch(Arc<Batch>),
    /// A single notification of a shared batch.
    Notification {
        /// Batch the notification belongs to.
        batch: Arc<Batch>,
        /// Position of the notification within the batch.
        index: usize,
    },
}

impl QueuePayload {
    /// Batch this payload refers to.
    pub fn batch(&self) -> &Arc<Batch> {
        match self {
            Self::Batch(batch) | Self::Notification { batch, .. } => batch,
        }
    }

    /// Batch positions covered by this payload.
    pub fn indices(&self) -> Vec<usize> {
        match self {
            Self::Batch(batch) => (0..batch.len()).collect(),
            Self::Notification { index, .. } => vec![*index],
        }
    }
}

/// Result of waiting on the queue.
#[derive(Debug)]
pub enum Popped {
    /// Work to perform.
    Payload(QueuePayload),
    /// The waiting loop was asked to shut down.
    Shutdown,
}

/// Blocking FIFO of delivery payloads.
#[derive(Debug, Default)]
pub struct Queue {
    items: Mutex<VecDeque<QueuePayload>>,
    available: Notify,
    pushed: AtomicU64,
    processed: AtomicU64,
}

impl Queue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a payload and wakes one waiting loop.
    pub fn push(&self, payload: QueuePayload) {
        self.pushed.fetch_add(1, Ordering::SeqCst);
        self.lock().push_back(payload);
        self.available.notify_one();
    }

    /// Waits for the next payload, or for `waiter` to be woken up.
    ///
    /// A wakeup wins over queued work: a loop asked to stop does not start
    /// another payload.
    pub async fn pop(&self, waiter: &CancellationToken) -> Popped {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if waiter.is_cancelled() {
                self.pass_on_wakeup();
                return Popped::Shutdown;
            }

            if let Some(payload) = self.try_pop() {
                self.pass_on_wakeup();
                return Popped::Payload(payload);
            }

            tokio::select! {
                biased;
                () = waiter.cancelled() => {
                    self.pass_on_wakeup();
                    return Popped::Shutdown;
                },
                () = &mut notified => {},
            }
        }
    }

    /// Interrupts the pop of the loop owning `waiter`.
    pub fn wakeup(&self, waiter: &CancellationToken) {
        waiter.cancel();
    }

    /// Records that one popped payload has been fully handled.
    pub fn notification_processed(&self) {
        self.processed.fetch_add(1, Ordering::SeqCst);
    }

    /// Whether every payload ever pushed has been reported processed.
    pub fn notifications_processed(&self) -> bool {
        self.processed.load(Ordering::SeqCst) >= self.pushed.load(Ordering::SeqCst)
    }

    /// Number of payloads waiting to be popped.
    pub fn size(&self) -> usize {
        self.lock().len()
    }

    /// Total payloads pushed so far.
    pub fn pushed_count(&self) -> u64 {
        self.pushed.load(Ordering::SeqCst)
    }

    /// Total payloads reported processed so far.
    pub fn processed_count(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    fn try_pop(&self) -> Option<QueuePayload> {
        self.lock().pop_front()
    }

    /// A consumed notification may have been meant for another waiter.
    fn pass_on_wakeup(&self) {
        if !self.lock().is_empty() {
            self.available.notify_one();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<QueuePayload>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
