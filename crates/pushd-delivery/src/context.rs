//! Shared collaborators handed to runners, batches and adapters.

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use pushd_core::{Clock, EventHandler, PushEvent, RealClock};

use crate::{
    client::ClientConfig,
    connection::{ApnsConfig, Connector},
    retry::RetryPolicy,
    storage::NotificationStore,
};

/// Everything a delivery component needs besides its own state.
///
/// Cheap to clone; every collaborator is behind an `Arc`.
#[derive(Clone)]
pub struct DeliveryContext {
    /// Persistence collaborator.
    pub store: Arc<dyn NotificationStore>,
    /// Lifecycle event sink.
    pub events: Arc<dyn EventHandler>,
    /// Time source for outcome timestamps and retry scheduling.
    pub clock: Arc<dyn Clock>,
    /// Retry policy applied when notifications are rescheduled.
    pub retry: RetryPolicy,
    /// Binary gateway settings.
    pub apns: ApnsConfig,
    /// HTTP gateway client settings.
    pub http: ClientConfig,
    /// Overrides the TLS connector built from each app's certificate.
    pub connector: Option<Arc<dyn Connector>>,
}

impl DeliveryContext {
    /// Creates a context with default settings and the system clock.
    pub fn new(store: Arc<dyn NotificationStore>, events: Arc<dyn EventHandler>) -> Self {
        Self {
            store,
            events,
            clock: Arc::new(RealClock::new()),
            retry: RetryPolicy::default(),
            apns: ApnsConfig::default(),
            http: ClientConfig::default(),
            connector: None,
        }
    }

    /// Replaces the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Replaces the binary gateway settings.
    #[must_use]
    pub fn with_apns_config(mut self, apns: ApnsConfig) -> Self {
        self.apns = apns;
        self
    }

    /// Replaces the HTTP client settings.
    #[must_use]
    pub fn with_client_config(mut self, http: ClientConfig) -> Self {
        self.http = http;
        self
    }

    /// Routes every binary gateway connection through `connector`.
    #[must_use]
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Current time according to the context clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now_utc()
    }

    /// Publishes an event without waiting on subscribers beyond the handler
    /// call itself.
    pub async fn publish(&self, event: PushEvent) {
        self.events.handle_event(event).await;
    }
}

impl fmt::Debug for DeliveryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryContext")
            .field("events", &self.events)
            .field("clock", &self.clock)
            .field("retry", &self.retry)
            .field("apns", &self.apns)
            .field("http", &self.http)
            .field("connector", &self.connector)
            .finish_non_exhaustive()
    }
}
