//! Test infrastructure for deterministic delivery tests.
//!
//! Provides an in-memory store wired to a controllable clock, an event
//! recorder, fixture builders, and a scriptable fake of the binary gateway.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::{sync::Arc, time::Duration};

use pushd_core::{App, Notification, NotificationId, TestClock};
use pushd_delivery::{
    storage::memory::MemoryStore, ApnsConfig, AppRunnerRegistry, Batch, DeliveryContext,
    ProtocolDispatcher, QueuePayload, RetryPolicy, RunnerConfig,
};

pub mod events;
pub mod fixtures;
pub mod gateway;

pub use events::{wait_until, RecordingEventHandler, DEFAULT_EVENT_TIMEOUT};
pub use fixtures::{apns2_app, apns_app, gcm_app, token, NotificationBuilder, TEST_AUTH_KEY};
pub use gateway::{FakeGateway, ReceivedFrame};

/// Error-tuple window used by test environments.
pub const TEST_SELECT_WINDOW: Duration = Duration::from_millis(200);

/// A batch after one adapter pass and its completion.
#[derive(Debug)]
pub struct Delivery {
    /// The delivered batch, completed.
    pub batch: Arc<Batch>,
    /// What the adapter returned.
    pub result: pushd_delivery::Result<()>,
}

/// Store, clock, and event recorder shared by a delivery context.
#[derive(Debug, Clone)]
pub struct TestEnv {
    /// In-memory store.
    pub store: Arc<MemoryStore>,
    /// Recorder receiving every published event.
    pub events: Arc<RecordingEventHandler>,
    /// Clock shared by the store and the context.
    pub clock: TestClock,
    /// Binary gateway fake, used by contexts built from this environment.
    pub gateway: FakeGateway,
    /// Retry policy handed to contexts. Jitter-free by default.
    pub retry: RetryPolicy,
}

impl TestEnv {
    /// Creates an environment with no apps.
    pub fn new() -> Self {
        let clock = TestClock::new();
        Self {
            store: Arc::new(MemoryStore::with_clock(Arc::new(clock.clone()))),
            events: RecordingEventHandler::new(),
            clock,
            gateway: FakeGateway::new(),
            retry: RetryPolicy::default(),
        }
    }

    /// Uses `retry` for every context built from this environment.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Creates an environment whose store holds `apps`.
    pub async fn with_apps(apps: impl IntoIterator<Item = App>) -> Self {
        let env = Self::new();
        for app in apps {
            env.store.add_app(app).await;
        }
        env
    }

    /// Delivery context wired to this environment.
    ///
    /// Events are recorded synchronously, the binary gateway is the fake,
    /// retries follow [`Self::retry`], and the error-tuple window is short.
    pub fn context(&self) -> DeliveryContext {
        DeliveryContext::new(self.store.clone(), self.events.clone())
            .with_clock(Arc::new(self.clock.clone()))
            .with_retry_policy(self.retry.clone())
            .with_apns_config(ApnsConfig { select_window: TEST_SELECT_WINDOW, ..ApnsConfig::default() })
            .with_connector(Arc::new(self.gateway.clone()))
    }

    /// Registry using [`Self::context`] and fast drain polling.
    pub fn registry(&self) -> Arc<AppRunnerRegistry> {
        Arc::new(AppRunnerRegistry::new(self.context(), fast_runner_config()))
    }

    /// Stores a notification and returns it with its assigned id.
    pub async fn insert(&self, notification: Notification) -> Notification {
        self.store.insert(notification).await
    }

    /// Stores every notification, returning them with assigned ids.
    pub async fn insert_all(&self, notifications: impl IntoIterator<Item = Notification>) -> Vec<Notification> {
        let mut stored = Vec::new();
        for notification in notifications {
            stored.push(self.insert(notification).await);
        }
        stored
    }

    /// Runs one adapter for `app` over `notifications` as a single batch
    /// payload, then completes the batch.
    ///
    /// # Errors
    ///
    /// Returns an error when the adapter cannot be built.
    pub async fn deliver(&self, app: &App, notifications: Vec<Notification>) -> anyhow::Result<Delivery> {
        let app = Arc::new(app.clone());
        let ctx = self.context();
        let mut dispatcher =
            ProtocolDispatcher::for_app(app.clone(), ctx.clone(), format!("{}:test", app.name)).await?;

        let batch = Arc::new(Batch::new(app, notifications, ctx));
        let result = dispatcher.dispatch(&QueuePayload::Batch(batch.clone())).await;
        batch.all_processed().await;
        dispatcher.close().await;

        Ok(Delivery { batch, result })
    }

    /// Current stored state of a notification.
    ///
    /// # Panics
    ///
    /// Panics when the notification does not exist.
    pub async fn stored(&self, id: NotificationId) -> Notification {
        match self.store.notification(id).await {
            Some(notification) => notification,
            None => panic!("notification {id} is not in the store"),
        }
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// Runner settings that drain quickly in tests.
pub fn fast_runner_config() -> RunnerConfig {
    RunnerConfig {
        drain_poll_interval: Duration::from_millis(10),
        drain_timeout: Some(Duration::from_secs(5)),
        enqueue_when_busy: false,
    }
}
