//! A group of notifications enqueued together and tracked to completion.
//!
//! Adapters record one outcome per notification with the `mark_*` methods.
//! Dispatcher loops report progress with [`Batch::notification_processed`]
//! (per-notification protocols) or [`Batch::all_processed`] (batching
//! protocols). The call that brings the processed count to the batch size
//! completes the batch exactly once: every notification is persisted and
//! the matching outcome event is published.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use chrono::{DateTime, Utc};
use pushd_core::{App, Notification, NotificationId, PushEvent};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{context::DeliveryContext, retry::RetryDecision};

/// Identifier used to correlate a batch across log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchId(pub Uuid);

impl BatchId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Terminal outcome recorded for one notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Accepted by the gateway.
    Delivered,
    /// Permanently failed.
    Failed,
    /// Rescheduled for a later attempt.
    Retry,
}

#[derive(Debug)]
struct Members {
    notifications: Vec<Notification>,
    outcomes: Vec<Option<Outcome>>,
}

/// Notifications enqueued together.
pub struct Batch {
    id: BatchId,
    app: Arc<App>,
    ctx: DeliveryContext,
    members: Mutex<Members>,
    total: usize,
    processed: AtomicUsize,
    completed: AtomicBool,
}

impl Batch {
    /// Creates a batch over an ordered list of notifications.
    pub fn new(app: Arc<App>, notifications: Vec<Notification>, ctx: DeliveryContext) -> Self {
        let total = notifications.len();
        Self {
            id: BatchId::new(),
            app,
            ctx,
            members: Mutex::new(Members { notifications, outcomes: vec![None; total] }),
            total,
            processed: AtomicUsize::new(0),
            completed: AtomicBool::new(false),
        }
    }

    /// Batch identifier.
    pub fn id(&self) -> BatchId {
        self.id
    }

    /// App the notifications belong to.
    pub fn app(&self) -> &Arc<App> {
        &self.app
    }

    /// Number of notifications.
    pub fn len(&self) -> usize {
        self.total
    }

    /// Whether the batch has no notifications.
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Notifications processed so far.
    pub fn num_processed(&self) -> usize {
        self.processed.load(Ordering::SeqCst)
    }

    /// Whether completion has run.
    pub fn is_complete(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    /// Copy of the notification at `index`.
    pub fn notification(&self, index: usize) -> Option<Notification> {
        self.members().notifications.get(index).cloned()
    }

    /// Copy of every notification, in batch order.
    pub fn notifications(&self) -> Vec<Notification> {
        self.members().notifications.clone()
    }

    /// Applies `f` to every notification in batch order.
    pub fn each_notification(&self, mut f: impl FnMut(usize, &Notification)) {
        for (index, notification) in self.members().notifications.iter().enumerate() {
            f(index, notification);
        }
    }

    /// Outcome recorded for the notification at `index`.
    pub fn outcome(&self, index: usize) -> Option<Outcome> {
        self.members().outcomes.get(index).copied().flatten()
    }

    /// Marks one notification delivered.
    pub fn mark_delivered(&self, index: usize) {
        let now = self.ctx.now();
        self.update(index, |notification| {
            notification.mark_delivered(now);
            Outcome::Delivered
        });
    }

    /// Marks every notification delivered.
    pub fn mark_all_delivered(&self) {
        for index in 0..self.total {
            self.mark_delivered(index);
        }
    }

    /// Marks one notification permanently failed.
    pub fn mark_failed(&self, index: usize, code: Option<i32>, description: &str) {
        let now = self.ctx.now();
        self.update(index, |notification| {
            notification.mark_failed(now, code, description);
            Outcome::Failed
        });
    }

    /// Marks every notification permanently failed.
    pub fn mark_all_failed(&self, code: Option<i32>, description: &str) {
        for index in 0..self.total {
            self.mark_failed(index, code, description);
        }
    }

    /// Reschedules one notification for `deliver_after`.
    ///
    /// Becomes a permanent failure once the retry policy gives up.
    pub fn mark_retryable(&self, index: usize, deliver_after: DateTime<Utc>) -> RetryDecision {
        self.reschedule(index, Some(deliver_after))
    }

    /// Reschedules one notification using exponential backoff.
    pub fn mark_retryable_exponential(&self, index: usize) -> RetryDecision {
        self.reschedule(index, None)
    }

    fn reschedule(&self, index: usize, retry_at: Option<DateTime<Utc>>) -> RetryDecision {
        let now = self.ctx.now();
        let retry = &self.ctx.retry;
        let mut decision = RetryDecision::GiveUp { reason: format!("no notification at {index}") };

        self.update(index, |notification| {
            decision = retry.decide(notification.retries, now, retry_at);
            match &decision {
                RetryDecision::Retry { deliver_after } => {
                    notification.mark_retryable(*deliver_after);
                    Outcome::Retry
                },
                RetryDecision::GiveUp { reason } => {
                    notification.mark_failed(now, None, reason);
                    Outcome::Failed
                },
            }
        });

        decision
    }

    fn update(&self, index: usize, f: impl FnOnce(&mut Notification) -> Outcome) {
        let mut members = self.members();
        let Members { notifications, outcomes } = &mut *members;

        match (notifications.get_mut(index), outcomes.get_mut(index)) {
            (Some(notification), Some(outcome)) => *outcome = Some(f(notification)),
            _ => warn!(batch_id = %self.id, index, "no notification at index"),
        }
    }

    /// Records that one notification has been processed.
    pub async fn notification_processed(&self) {
        let processed = self.processed.fetch_add(1, Ordering::SeqCst) + 1;
        if processed == self.total {
            self.complete().await;
        }
    }

    /// Records that every notification has been processed.
    pub async fn all_processed(&self) {
        let previous = self.processed.swap(self.total, Ordering::SeqCst);
        if previous < self.total {
            self.complete().await;
        }
    }

    /// Persists every notification and publishes its outcome, at most once.
    async fn complete(&self) {
        if self.completed.swap(true, Ordering::SeqCst) {
            return;
        }

        let (notifications, outcomes) = {
            let members = self.members();
            (members.notifications.clone(), members.outcomes.clone())
        };

        debug!(batch_id = %self.id, app = %self.app.name, size = self.total, "batch completed");

        for (notification, outcome) in notifications.into_iter().zip(outcomes) {
            let event = self.outcome_event(&notification, outcome);
            let id = notification.id;

            if let Err(error) = self.ctx.store.save(notification, false).await {
                warn!(
                    batch_id = %self.id,
                    notification_id = %id,
                    error = %error,
                    "failed to persist notification outcome"
                );
                self.ctx
                    .publish(PushEvent::Error {
                        app_id: Some(self.app.id),
                        message: format!("failed to persist notification {id}: {error}"),
                    })
                    .await;
                continue;
            }

            if let Some(event) = event {
                self.ctx.publish(event).await;
            }
        }
    }

    fn outcome_event(&self, notification: &Notification, outcome: Option<Outcome>) -> Option<PushEvent> {
        let app_id = self.app.id;
        let notification_id: NotificationId = notification.id;

        match outcome {
            Some(Outcome::Delivered) => Some(PushEvent::NotificationDelivered {
                app_id,
                notification_id,
                delivered_at: notification.delivered_at.unwrap_or_else(|| self.ctx.now()),
            }),
            Some(Outcome::Failed) => Some(PushEvent::NotificationFailed {
                app_id,
                notification_id,
                code: notification.error_code,
                description: notification.error_description.clone().unwrap_or_default(),
            }),
            Some(Outcome::Retry) => Some(PushEvent::NotificationWillRetry {
                app_id,
                notification_id,
                deliver_after: notification.deliver_after.unwrap_or_else(|| self.ctx.now()),
                retries: notification.retries,
            }),
            None => {
                warn!(
                    batch_id = %self.id,
                    notification_id = %notification_id,
                    "notification processed without an outcome, releasing it unchanged"
                );
                None
            },
        }
    }

    fn members(&self) -> MutexGuard<'_, Members> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batch")
            .field("id", &self.id)
            .field("app", &self.app.name)
            .field("total", &self.total)
            .field("processed", &self.num_processed())
            .field("completed", &self.is_complete())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use pushd_core::{AppId, Clock, DeliveryState, NoOpEventHandler, Protocol, TestClock};

    use super::*;
    use crate::{retry::RetryPolicy, storage::{memory::MemoryStore, NotificationStore}};

    async fn batch_of(count: usize, retry: RetryPolicy) -> (Batch, Arc<MemoryStore>, TestClock) {
        let clock = TestClock::with_start_time(UNIX_EPOCH + Duration::from_secs(1_700_000_000));
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let mut notifications = Vec::new();
        for _ in 0..count {
            let mut notification = Notification::new(AppId(1));
            notification.registration_ids = vec!["reg".to_string()];
            notifications.push(store.insert(notification).await);
        }

        let ctx = DeliveryContext::new(store.clone(), Arc::new(NoOpEventHandler))
            .with_clock(Arc::new(clock.clone()))
            .with_retry_policy(retry);
        let app = Arc::new(App::new(AppId(1), "android", Protocol::Gcm));
        (Batch::new(app, notifications, ctx), store, clock)
    }

    #[tokio::test]
    async fn completes_once_when_every_notification_is_processed() {
        let (batch, store, _) = batch_of(3, RetryPolicy::default()).await;
        batch.mark_all_delivered();

        batch.notification_processed().await;
        batch.notification_processed().await;
        assert!(!batch.is_complete());
        assert_eq!(store.save_count(), 0);

        batch.notification_processed().await;
        assert!(batch.is_complete());
        assert_eq!(store.save_count(), 3);

        batch.all_processed().await;
        assert_eq!(store.save_count(), 3);
    }

    #[tokio::test]
    async fn outcomes_are_persisted() {
        let (batch, store, clock) = batch_of(3, RetryPolicy::default()).await;
        batch.mark_delivered(0);
        batch.mark_failed(1, Some(8), "Invalid token");
        let decision = batch.mark_retryable_exponential(2);
        batch.all_processed().await;

        let saved = store.notifications().await;
        assert_eq!(saved[0].state, DeliveryState::Delivered);
        assert_eq!(saved[1].state, DeliveryState::Failed);
        assert_eq!(saved[1].error_description.as_deref(), Some("Invalid token"));
        assert_eq!(saved[2].state, DeliveryState::Pending);
        assert_eq!(saved[2].retries, 1);

        let expected = clock.now_utc() + chrono::Duration::seconds(1);
        assert_eq!(decision, RetryDecision::Retry { deliver_after: expected });
        assert_eq!(saved[2].deliver_after, Some(expected));
    }

    #[tokio::test]
    async fn failed_outcome_write_leaves_notification_fetchable() {
        let (batch, store, _) = batch_of(2, RetryPolicy::default()).await;
        let claimed = store.notifications_ready_for_delivery(10).await.unwrap();
        assert_eq!(claimed.len(), 2);
        batch.mark_all_delivered();

        store.inject_save_error("connection lost").await;
        batch.all_processed().await;

        assert_eq!(store.save_count(), 1);
        let ready = store.notifications_ready_for_delivery(10).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, batch.notifications()[0].id);
        assert_eq!(ready[0].state, DeliveryState::Pending);
    }

    #[tokio::test]
    async fn retry_limit_turns_into_failure() {
        let retry = RetryPolicy { max_retries: Some(0), ..Default::default() };
        let (batch, _, _) = batch_of(1, retry).await;

        let decision = batch.mark_retryable_exponential(0);

        assert!(matches!(decision, RetryDecision::GiveUp { .. }));
        assert_eq!(batch.outcome(0), Some(Outcome::Failed));
        assert_eq!(batch.notification(0).unwrap().state, DeliveryState::Failed);
    }

    #[tokio::test]
    async fn out_of_range_marks_are_ignored() {
        let (batch, _, _) = batch_of(1, RetryPolicy::default()).await;
        batch.mark_delivered(5);
        assert_eq!(batch.outcome(0), None);
    }

    #[tokio::test]
    async fn each_notification_visits_in_order() {
        let (batch, _, _) = batch_of(3, RetryPolicy::default()).await;
        let mut seen = Vec::new();
        batch.each_notification(|index, notification| seen.push((index, notification.id)));

        let ids: Vec<_> = batch.notifications().iter().map(|n| n.id).collect();
        assert_eq!(seen.iter().map(|(_, id)| *id).collect::<Vec<_>>(), ids);
        assert_eq!(seen.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![0, 1, 2]);
    }
}
