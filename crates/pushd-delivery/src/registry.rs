//! Registry of app runners, keyed by app id.
//!
//! ```text
//! ┌────────┐  enqueue  ┌──────────────────┐  per app   ┌───────────┐
//! │ Feeder │──────────▶│ AppRunnerRegistry│───────────▶│ AppRunner │──▶ loops
//! └────────┘           └──────────────────┘            └───────────┘
//!                              │ sync / stop / debug
//!                              ▼
//!                        every runner
//! ```
//!
//! Notifications handed to the registry that cannot be queued (the runner is
//! busy, or the app has no runner) are saved back unchanged, which releases
//! the storage claim so the next fetch picks them up again.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use pushd_core::{App, AppId, Notification, PushEvent};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::{
    context::DeliveryContext,
    error::{DeliveryError, Result},
    runner::{AppRunner, Enqueued, RunnerConfig, RunnerSnapshot},
};

/// Outcome of one registry enqueue pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueReport {
    /// Notifications handed to a runner's queue.
    pub enqueued: usize,
    /// Notifications released because their runner was busy.
    pub skipped_busy: usize,
    /// Notifications released because their app has no runner.
    pub dropped_no_runner: usize,
}

impl EnqueueReport {
    /// Total notifications the pass looked at.
    pub fn total(&self) -> usize {
        self.enqueued + self.skipped_busy + self.dropped_no_runner
    }
}

type SharedRunner = Arc<Mutex<AppRunner>>;

/// Owns one [`AppRunner`] per app.
#[derive(Debug)]
pub struct AppRunnerRegistry {
    ctx: DeliveryContext,
    config: RunnerConfig,
    runners: RwLock<HashMap<AppId, SharedRunner>>,
}

impl AppRunnerRegistry {
    /// Creates an empty registry.
    pub fn new(ctx: DeliveryContext, config: RunnerConfig) -> Self {
        Self { ctx, config, runners: RwLock::new(HashMap::new()) }
    }

    /// Shared delivery context.
    pub fn context(&self) -> &DeliveryContext {
        &self.ctx
    }

    /// Groups notifications by app and hands each group to its runner.
    ///
    /// Apps without a runner are looked up in storage and started on demand.
    /// Groups that cannot be queued are released back to storage.
    pub async fn enqueue(&self, notifications: Vec<Notification>) -> EnqueueReport {
        let mut report = EnqueueReport::default();

        let mut groups: BTreeMap<AppId, Vec<Notification>> = BTreeMap::new();
        for notification in notifications {
            groups.entry(notification.app_id).or_default().push(notification);
        }

        for (app_id, group) in groups {
            let Some(runner) = self.runner_for(app_id).await else {
                warn!(app_id = %app_id, count = group.len(), "no runner for app, releasing notifications");
                report.dropped_no_runner += group.len();
                self.release(group).await;
                continue;
            };

            let enqueued = runner.lock().await.enqueue(group).await;
            match enqueued {
                Enqueued::Accepted(count) => report.enqueued += count,
                Enqueued::Busy(group) => {
                    report.skipped_busy += group.len();
                    self.release(group).await;
                },
                Enqueued::NoDispatchers(group) => {
                    report.dropped_no_runner += group.len();
                    self.release(group).await;
                },
            }
        }

        if report.total() > 0 {
            debug!(
                enqueued = report.enqueued,
                skipped_busy = report.skipped_busy,
                dropped_no_runner = report.dropped_no_runner,
                "enqueue pass complete"
            );
        }
        report
    }

    async fn runner_for(&self, app_id: AppId) -> Option<SharedRunner> {
        if let Some(runner) = self.runners.read().await.get(&app_id) {
            return Some(runner.clone());
        }

        let app = match self.ctx.store.app(app_id).await {
            Ok(app) => app,
            Err(error) => {
                error!(app_id = %app_id, error = %error, "failed to load app");
                self.ctx
                    .publish(PushEvent::Error { app_id: Some(app_id), message: error.to_string() })
                    .await;
                return None;
            },
        };

        self.start_runner(app).await.ok()?;
        self.runners.read().await.get(&app_id).cloned()
    }

    async fn release(&self, notifications: Vec<Notification>) {
        for notification in notifications {
            let id = notification.id;
            if let Err(error) = self.ctx.store.save(notification, false).await {
                warn!(notification_id = %id, error = %error, "failed to release notification");
            }
        }
    }

    /// Starts, resizes and stops runners so exactly `apps` have one.
    pub async fn sync(&self, apps: Vec<App>) {
        let wanted: Vec<AppId> = apps.iter().map(|app| app.id).collect();

        for app in apps {
            // A failed app is logged and published by `sync_app`.
            let _ = self.sync_app(app).await;
        }

        let removed: Vec<(AppId, SharedRunner)> = {
            let mut runners = self.runners.write().await;
            let stale: Vec<AppId> =
                runners.keys().filter(|id| !wanted.contains(id)).copied().collect();
            stale.into_iter().filter_map(|id| runners.remove(&id).map(|r| (id, r))).collect()
        };

        for (app_id, runner) in removed {
            let mut runner = runner.lock().await;
            info!(app = %runner.app().name, app_id = %app_id, "app removed, stopping runner");
            if let Err(error) = runner.stop().await {
                warn!(app_id = %app_id, error = %error, "runner did not stop cleanly");
            }
        }
    }

    /// Loads every app from storage and syncs to them.
    ///
    /// # Errors
    ///
    /// Returns the storage error when apps cannot be listed.
    pub async fn sync_from_store(&self) -> Result<()> {
        let apps = self.ctx.store.all_apps().await?;
        self.sync(apps).await;
        Ok(())
    }

    /// Starts a runner for a new app, or resizes the existing one.
    ///
    /// # Errors
    ///
    /// Returns the startup failure. The app is left without a runner and its
    /// notifications are not delivered until a later sync succeeds.
    pub async fn sync_app(&self, app: App) -> Result<()> {
        let existing = self.runners.read().await.get(&app.id).cloned();

        match existing {
            Some(runner) => {
                let name = app.name.clone();
                let app_id = app.id;
                let result = runner.lock().await.sync(app).await;
                if let Err(error) = &result {
                    error!(app = %name, error = %error, "resizing dispatchers failed");
                    self.ctx
                        .publish(PushEvent::Error { app_id: Some(app_id), message: error.to_string() })
                        .await;
                }
                result
            },
            None => self.start_runner(app).await,
        }
    }

    async fn start_runner(&self, app: App) -> Result<()> {
        let name = app.name.clone();
        let app_id = app.id;

        let mut runner = AppRunner::new(app, self.ctx.clone(), self.config.clone());
        if let Err(error) = runner.start().await {
            error!(
                app = %name,
                error = %error,
                "[{name}] Exception raised during startup. Notifications will not be delivered for this app."
            );
            self.ctx
                .publish(PushEvent::Error { app_id: Some(app_id), message: error.to_string() })
                .await;
            return Err(error);
        }

        let mut runners = self.runners.write().await;
        if runners.contains_key(&app_id) {
            // Another caller started this app first; keep theirs.
            drop(runners);
            if let Err(error) = runner.stop().await {
                warn!(app = %name, error = %error, "duplicate runner did not stop cleanly");
            }
            return Ok(());
        }
        runners.insert(app_id, Arc::new(Mutex::new(runner)));
        Ok(())
    }

    /// Stops every runner, draining its queue first.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::ShutdownTimeout`] when any runner failed to
    /// drain in time. Every runner is stopped regardless.
    pub async fn stop(&self) -> Result<()> {
        let runners: Vec<SharedRunner> = self.runners.write().await.drain().map(|(_, r)| r).collect();
        info!(runners = runners.len(), "stopping app runners");

        let stops = runners.into_iter().map(|runner| async move {
            let mut runner = runner.lock().await;
            runner.stop().await
        });
        let results = futures::future::join_all(stops).await;

        let mut first_error: Option<DeliveryError> = None;
        for result in results {
            if let Err(error) = result {
                first_error.get_or_insert(error);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Snapshot of every runner, ordered by app id.
    pub async fn debug(&self) -> Vec<RunnerSnapshot> {
        let mut snapshots = Vec::new();
        for runner in self.runners_by_id().await {
            snapshots.push(runner.lock().await.debug());
        }
        snapshots
    }

    /// Total dispatcher loops across every runner.
    pub async fn num_dispatchers(&self) -> usize {
        let mut total = 0;
        for runner in self.runners_by_id().await {
            total += runner.lock().await.num_dispatcher_loops();
        }
        total
    }

    /// Total payloads waiting across every runner.
    pub async fn num_queued(&self) -> usize {
        let mut total = 0;
        for runner in self.runners_by_id().await {
            total += runner.lock().await.queue_size();
        }
        total
    }

    /// Number of apps with a runner.
    pub async fn runner_count(&self) -> usize {
        self.runners.read().await.len()
    }

    /// Whether `app_id` has a runner.
    pub async fn contains(&self, app_id: AppId) -> bool {
        self.runners.read().await.contains_key(&app_id)
    }

    /// Dispatcher loops of one app, if it has a runner.
    pub async fn dispatchers_for(&self, app_id: AppId) -> Option<usize> {
        let runner = self.runners.read().await.get(&app_id).cloned()?;
        let count = runner.lock().await.num_dispatcher_loops();
        Some(count)
    }

    async fn runners_by_id(&self) -> Vec<SharedRunner> {
        let runners = self.runners.read().await;
        let mut ids: Vec<AppId> = runners.keys().copied().collect();
        ids.sort();
        ids.into_iter().filter_map(|id| runners.get(&id).cloned()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_total_sums_every_bucket() {
        let report = EnqueueReport { enqueued: 3, skipped_busy: 2, dropped_no_runner: 1 };
        assert_eq!(report.total(), 6);
        assert_eq!(EnqueueReport::default().total(), 0);
    }
}
