//! Per-app runner: a queue and the pool of dispatcher loops draining it.

use std::{sync::Arc, time::Duration};

use pushd_core::{App, AppId, Notification, PushEvent};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    batch::Batch,
    context::DeliveryContext,
    dispatcher::{DispatcherLoop, DispatcherSnapshot},
    error::{DeliveryError, Result},
    protocol::ProtocolDispatcher,
    queue::{Queue, QueuePayload},
};

/// App runner settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// How often `stop` checks whether the queue has drained.
    #[serde(with = "crate::secs")]
    pub drain_poll_interval: Duration,

    /// Longest `stop` waits for the queue to drain. `None` waits forever.
    #[serde(with = "crate::secs::option")]
    pub drain_timeout: Option<Duration>,

    /// Enqueue even while earlier work is still being processed.
    pub enqueue_when_busy: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            drain_poll_interval: Duration::from_millis(500),
            drain_timeout: Some(Duration::from_secs(30)),
            enqueue_when_busy: false,
        }
    }
}

/// Result of handing notifications to a runner.
#[derive(Debug)]
pub enum Enqueued {
    /// Notifications were queued.
    Accepted(usize),
    /// Earlier work is still in flight; nothing was queued.
    Busy(Vec<Notification>),
    /// The runner has no dispatcher loops; nothing was queued.
    NoDispatchers(Vec<Notification>),
}

/// Debug view of a runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerSnapshot {
    /// App identifier.
    pub app_id: AppId,
    /// App name.
    pub app_name: String,
    /// One entry per dispatcher loop.
    pub dispatchers: Vec<DispatcherSnapshot>,
    /// Payloads waiting in the queue.
    pub queued: usize,
}

/// Supervises the dispatcher loops of one app.
#[derive(Debug)]
pub struct AppRunner {
    app: Arc<App>,
    ctx: DeliveryContext,
    config: RunnerConfig,
    queue: Arc<Queue>,
    loops: Vec<DispatcherLoop>,
    next_loop_id: usize,
    running: bool,
}

impl AppRunner {
    /// Creates a stopped runner.
    pub fn new(app: App, ctx: DeliveryContext, config: RunnerConfig) -> Self {
        Self {
            app: Arc::new(app),
            ctx,
            config,
            queue: Arc::new(Queue::new()),
            loops: Vec::new(),
            next_loop_id: 0,
            running: false,
        }
    }

    /// App snapshot the runner is sized from.
    pub fn app(&self) -> &App {
        &self.app
    }

    /// Whether `start` has succeeded and `stop` has not been called.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Number of dispatcher loops.
    pub fn num_dispatcher_loops(&self) -> usize {
        self.loops.len()
    }

    /// Payloads dispatched by the current loops.
    pub fn dispatch_count(&self) -> u64 {
        self.loops.iter().map(DispatcherLoop::dispatch_count).sum()
    }

    /// Payloads waiting in the queue.
    pub fn queue_size(&self) -> usize {
        self.queue.size()
    }

    /// Payloads queued since the runner was created.
    pub fn pushed_count(&self) -> u64 {
        self.queue.pushed_count()
    }

    /// Payloads the loops have finished with, whatever their outcome.
    pub fn processed_count(&self) -> u64 {
        self.queue.processed_count()
    }

    /// Starts one dispatcher loop per configured connection.
    ///
    /// # Errors
    ///
    /// Returns the first adapter construction or connection failure. Loops
    /// started before the failure are stopped again.
    pub async fn start(&mut self) -> Result<()> {
        for _ in 0..self.app.connections {
            match self.new_dispatcher_loop().await {
                Ok(dispatcher_loop) => self.loops.push(dispatcher_loop),
                Err(error) => {
                    self.stop_loops(self.loops.len()).await;
                    return Err(error);
                },
            }
        }

        self.running = true;
        info!(app = %self.app.name, "Started, {}.", dispatchers_str(self.loops.len()));
        Ok(())
    }

    async fn new_dispatcher_loop(&mut self) -> Result<DispatcherLoop> {
        let id = self.next_loop_id;
        self.next_loop_id += 1;

        let name = format!("{}:{id}", self.app.name);
        let dispatcher = ProtocolDispatcher::for_app(self.app.clone(), self.ctx.clone(), name).await?;

        Ok(DispatcherLoop::start(
            id,
            self.queue.clone(),
            dispatcher,
            self.ctx.clone(),
            self.app.name.clone(),
        ))
    }

    /// Queues notifications for delivery.
    ///
    /// Batching protocols get one payload per group of
    /// `ceil(n / dispatcher loops)` notifications. Other protocols get one
    /// payload per notification, all sharing one batch.
    pub async fn enqueue(&self, notifications: Vec<Notification>) -> Enqueued {
        if notifications.is_empty() {
            return Enqueued::Accepted(0);
        }
        if self.loops.is_empty() {
            warn!(app = %self.app.name, "no dispatchers running, not enqueuing");
            return Enqueued::NoDispatchers(notifications);
        }
        if !self.config.enqueue_when_busy && !self.queue.notifications_processed() {
            debug!(app = %self.app.name, queued = self.queue.size(), "queue busy, not enqueuing");
            return Enqueued::Busy(notifications);
        }

        let count = notifications.len();

        if self.app.protocol.batch_deliveries() {
            for group in notifications.chunks(group_size(count, self.loops.len())) {
                let batch = Batch::new(self.app.clone(), group.to_vec(), self.ctx.clone());
                debug!(app = %self.app.name, batch_id = %batch.id(), size = group.len(), "enqueuing batch");
                self.queue.push(QueuePayload::Batch(Arc::new(batch)));
            }
        } else {
            let ids: Vec<_> = notifications.iter().map(|n| n.id).collect();
            let batch = Arc::new(Batch::new(self.app.clone(), notifications, self.ctx.clone()));
            for (index, notification_id) in ids.into_iter().enumerate() {
                self.queue.push(QueuePayload::Notification { batch: batch.clone(), index });
                self.ctx
                    .publish(PushEvent::NotificationEnqueued { app_id: self.app.id, notification_id })
                    .await;
            }
        }

        Enqueued::Accepted(count)
    }

    /// Resizes the loop pool to the app's configured connections.
    ///
    /// # Errors
    ///
    /// Returns the failure of a loop that could not be added. Loops added
    /// before the failure keep running.
    pub async fn sync(&mut self, app: App) -> Result<()> {
        self.app = Arc::new(app);

        let current = self.loops.len();
        let desired = self.app.connections;

        if desired < current {
            let diff = current - desired;
            self.stop_loops(diff).await;
            info!(
                app = %self.app.name,
                "Stopped {}. {} running.",
                dispatchers_str(diff),
                dispatchers_str(self.loops.len())
            );
        } else if desired > current {
            let diff = desired - current;
            for _ in 0..diff {
                let dispatcher_loop = self.new_dispatcher_loop().await?;
                self.loops.push(dispatcher_loop);
            }
            info!(
                app = %self.app.name,
                "Started {}. {} running.",
                dispatchers_str(diff),
                dispatchers_str(self.loops.len())
            );
        }

        Ok(())
    }

    /// Waits for queued work to drain, then stops every loop.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::ShutdownTimeout`] when the queue did not
    /// drain in time. The loops are stopped regardless.
    pub async fn stop(&mut self) -> Result<()> {
        let drained = self.wait_until_idle().await;

        self.stop_loops(self.loops.len()).await;
        self.running = false;
        debug!(app = %self.app.name, "runner stopped");

        drained
    }

    async fn wait_until_idle(&self) -> Result<()> {
        let poll = async {
            while !self.queue.notifications_processed() {
                tokio::time::sleep(self.config.drain_poll_interval).await;
            }
        };

        match self.config.drain_timeout {
            None => {
                poll.await;
                Ok(())
            },
            Some(timeout) => match tokio::time::timeout(timeout, poll).await {
                Ok(()) => Ok(()),
                Err(_) => {
                    warn!(
                        app = %self.app.name,
                        queued = self.queue.size(),
                        timeout_seconds = timeout.as_secs_f64(),
                        "queue did not drain before shutdown"
                    );
                    Err(DeliveryError::ShutdownTimeout { timeout })
                },
            },
        }
    }

    async fn stop_loops(&mut self, count: usize) {
        for _ in 0..count {
            let Some(mut dispatcher_loop) = self.loops.pop() else {
                break;
            };
            dispatcher_loop.stop().await;
        }
    }

    /// Snapshot of every loop and the queue depth, also logged as JSON.
    pub fn debug(&self) -> RunnerSnapshot {
        let snapshot = RunnerSnapshot {
            app_id: self.app.id,
            app_name: self.app.name.clone(),
            dispatchers: self.loops.iter().map(DispatcherLoop::snapshot).collect(),
            queued: self.queue.size(),
        };

        match serde_json::to_string_pretty(&snapshot) {
            Ok(json) => info!(app = %self.app.name, "{json}"),
            Err(error) => warn!(app = %self.app.name, error = %error, "failed to render runner snapshot"),
        }

        snapshot
    }
}

/// Notifications per batch when `count` are spread over `dispatchers` loops.
fn group_size(count: usize, dispatchers: usize) -> usize {
    count.div_ceil(dispatchers.max(1)).max(1)
}

fn dispatchers_str(count: usize) -> String {
    if count == 1 {
        "1 dispatcher".to_string()
    } else {
        format!("{count} dispatchers")
    }
}
