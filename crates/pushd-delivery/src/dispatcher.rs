//! Dispatcher loop: one task, one connection, one adapter.
//!
//! Pops payloads from the app's queue until it is woken up for shutdown.
//! Each payload is handed to the adapter, its batch is told the payload was
//! processed, and the queue's accounting advances, whether or not delivery
//! succeeded. A failing payload never stops the loop.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use chrono::{DateTime, Utc};
use pushd_core::PushEvent;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{
    context::DeliveryContext,
    error::ErrorCategory,
    protocol::ProtocolDispatcher,
    queue::{Popped, Queue, QueuePayload},
};

/// Debug view of one dispatcher loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherSnapshot {
    /// Loop identifier within its runner.
    pub id: usize,
    /// When the loop was started.
    pub started_at: DateTime<Utc>,
    /// Payloads dispatched so far.
    pub dispatched: u64,
    /// Whether the loop task is still alive.
    pub alive: bool,
}

/// Handle to a running dispatcher loop.
#[derive(Debug)]
pub struct DispatcherLoop {
    id: usize,
    queue: Arc<Queue>,
    waiter: CancellationToken,
    started_at: DateTime<Utc>,
    dispatch_count: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl DispatcherLoop {
    /// Spawns a loop draining `queue` through `dispatcher`.
    pub fn start(
        id: usize,
        queue: Arc<Queue>,
        dispatcher: ProtocolDispatcher,
        ctx: DeliveryContext,
        app_name: String,
    ) -> Self {
        let waiter = CancellationToken::new();
        let dispatch_count = Arc::new(AtomicU64::new(0));

        let worker = Worker {
            id,
            app_name,
            queue: queue.clone(),
            dispatcher,
            ctx: ctx.clone(),
            waiter: waiter.clone(),
            dispatch_count: dispatch_count.clone(),
        };
        let handle = tokio::spawn(worker.run());

        Self { id, queue, waiter, started_at: ctx.now(), dispatch_count, handle: Some(handle) }
    }

    /// Loop identifier.
    pub fn id(&self) -> usize {
        self.id
    }

    /// When the loop was started.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Payloads dispatched so far.
    pub fn dispatch_count(&self) -> u64 {
        self.dispatch_count.load(Ordering::SeqCst)
    }

    /// Whether the loop task is still running.
    pub fn is_alive(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Debug view of the loop.
    pub fn snapshot(&self) -> DispatcherSnapshot {
        DispatcherSnapshot {
            id: self.id,
            started_at: self.started_at,
            dispatched: self.dispatch_count(),
            alive: self.is_alive(),
        }
    }

    /// Wakes the loop out of its pop and waits for it to exit.
    ///
    /// A payload being dispatched is finished first.
    pub async fn stop(&mut self) {
        self.queue.wakeup(&self.waiter);

        if let Some(handle) = self.handle.take() {
            if let Err(join_error) = handle.await {
                error!(worker_id = self.id, error = %join_error, "dispatcher loop panicked");
            }
        }
    }
}

struct Worker {
    id: usize,
    app_name: String,
    queue: Arc<Queue>,
    dispatcher: ProtocolDispatcher,
    ctx: DeliveryContext,
    waiter: CancellationToken,
    dispatch_count: Arc<AtomicU64>,
}

impl Worker {
    async fn run(mut self) {
        debug!(app = %self.app_name, worker_id = self.id, "dispatcher loop started");

        loop {
            let payload = match self.queue.pop(&self.waiter).await {
                Popped::Payload(payload) => payload,
                Popped::Shutdown => break,
            };

            self.dispatch(&payload).await;
        }

        self.dispatcher.close().await;
        debug!(app = %self.app_name, worker_id = self.id, "dispatcher loop stopped");
    }

    async fn dispatch(&mut self, payload: &QueuePayload) {
        let batch = payload.batch();

        if let Err(error) = self.dispatcher.dispatch(payload).await {
            if error.is_classified() {
                warn!(
                    app = %self.app_name,
                    worker_id = self.id,
                    batch_id = %batch.id(),
                    error = %error,
                    "delivery failed"
                );
            } else {
                error!(
                    app = %self.app_name,
                    worker_id = self.id,
                    batch_id = %batch.id(),
                    category = %ErrorCategory::from(&error),
                    error = %error,
                    "delivery fault"
                );
                self.ctx
                    .publish(PushEvent::Error {
                        app_id: Some(batch.app().id),
                        message: error.to_string(),
                    })
                    .await;
            }
        }

        match payload {
            QueuePayload::Batch(batch) => batch.all_processed().await,
            QueuePayload::Notification { batch, .. } => batch.notification_processed().await,
        }
        self.dispatch_count.fetch_add(1, Ordering::SeqCst);
        self.queue.notification_processed();
    }
}
