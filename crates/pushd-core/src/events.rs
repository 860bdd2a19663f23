//! Lifecycle events published as notifications move through delivery.
//!
//! The delivery core reports what happened to each notification through an
//! [`EventHandler`]. Subscribers (metrics, audit logs, app-level token
//! cleanup) live outside the core and must never slow delivery down.
//!
//! ```text
//! ┌─────────────────┐   PushEvent   ┌──────────────────────┐
//! │ Batch / Adapter │ ─────────────▶│ SpawningEventHandler │
//! └─────────────────┘               └──────────────────────┘
//!                                              │ spawned task
//!                                              ▼
//!                                   ┌──────────────────────┐
//!                                   │ MulticastEventHandler│──▶ subscribers
//!                                   └──────────────────────┘
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{AppId, NotificationId};

/// Events emitted by the delivery daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PushEvent {
    /// A notification was pushed onto an app's queue.
    NotificationEnqueued {
        /// Owning app.
        app_id: AppId,
        /// Enqueued notification.
        notification_id: NotificationId,
    },

    /// The gateway accepted a notification.
    NotificationDelivered {
        /// Owning app.
        app_id: AppId,
        /// Delivered notification.
        notification_id: NotificationId,
        /// When delivery was recorded.
        delivered_at: DateTime<Utc>,
    },

    /// A notification permanently failed and has been persisted as such.
    NotificationFailed {
        /// Owning app.
        app_id: AppId,
        /// Failed notification.
        notification_id: NotificationId,
        /// Gateway error code, when the gateway supplied one.
        code: Option<i32>,
        /// Failure description.
        description: String,
    },

    /// A notification was rescheduled and has been persisted as such.
    NotificationWillRetry {
        /// Owning app.
        app_id: AppId,
        /// Rescheduled notification.
        notification_id: NotificationId,
        /// Earliest time of the next attempt.
        deliver_after: DateTime<Utc>,
        /// Retry count after this reschedule.
        retries: u32,
    },

    /// The gateway reported a failure for a notification id.
    NotificationIdFailed {
        /// Owning app.
        app_id: AppId,
        /// Notification the gateway named.
        notification_id: NotificationId,
        /// Gateway error code.
        code: Option<i32>,
        /// Failure description.
        description: String,
    },

    /// A notification id will be retried at `retry_at`.
    NotificationIdWillRetry {
        /// Owning app.
        app_id: AppId,
        /// Notification to retry.
        notification_id: NotificationId,
        /// Earliest time of the next attempt.
        retry_at: DateTime<Utc>,
    },

    /// A GCM recipient accepted the message.
    GcmDeliveredToRecipient {
        /// Notification carrying the recipient.
        notification_id: NotificationId,
        /// Recipient registration id.
        registration_id: String,
    },

    /// GCM returned a canonical id that must replace the registration id.
    GcmCanonicalId {
        /// Registration id that was used.
        old_id: String,
        /// Canonical registration id to use instead.
        canonical_id: String,
    },

    /// A GCM recipient rejected the message.
    GcmFailedToRecipient {
        /// Notification carrying the recipient.
        notification_id: NotificationId,
        /// Gateway error string.
        error: String,
        /// Recipient registration id.
        registration_id: String,
    },

    /// A GCM registration id is permanently invalid for the app.
    GcmInvalidRegistrationId {
        /// Owning app.
        app_id: AppId,
        /// Gateway error string.
        error: String,
        /// Invalid registration id.
        registration_id: String,
    },

    /// An unexpected fault occurred.
    Error {
        /// App the fault relates to, when known.
        app_id: Option<AppId>,
        /// Error message.
        message: String,
    },
}

impl PushEvent {
    /// Returns the snake_case event name.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::NotificationEnqueued { .. } => "notification_enqueued",
            Self::NotificationDelivered { .. } => "notification_delivered",
            Self::NotificationFailed { .. } => "notification_failed",
            Self::NotificationWillRetry { .. } => "notification_will_retry",
            Self::NotificationIdFailed { .. } => "notification_id_failed",
            Self::NotificationIdWillRetry { .. } => "notification_id_will_retry",
            Self::GcmDeliveredToRecipient { .. } => "gcm_delivered_to_recipient",
            Self::GcmCanonicalId { .. } => "gcm_canonical_id",
            Self::GcmFailedToRecipient { .. } => "gcm_failed_to_recipient",
            Self::GcmInvalidRegistrationId { .. } => "gcm_invalid_registration_id",
            Self::Error { .. } => "error",
        }
    }
}

/// Trait for handling push lifecycle events.
///
/// Implementations must not propagate errors back to the caller. Failures
/// while handling an event should be logged and swallowed.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + std::fmt::Debug {
    /// Handles a lifecycle event.
    async fn handle_event(&self, event: PushEvent);
}

/// Event handler that discards all events.
#[derive(Debug, Default)]
pub struct NoOpEventHandler;

impl NoOpEventHandler {
    /// Creates a new no-op event handler.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl EventHandler for NoOpEventHandler {
    async fn handle_event(&self, _event: PushEvent) {}
}

/// Writes every event to the `pushd::events` tracing target.
///
/// Errors are logged at `warn`; everything else at `debug`.
#[derive(Debug, Default)]
pub struct TracingEventHandler;

impl TracingEventHandler {
    /// Creates a tracing event handler.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl EventHandler for TracingEventHandler {
    async fn handle_event(&self, event: PushEvent) {
        let fields = serde_json::to_string(&event).unwrap_or_default();
        match &event {
            PushEvent::Error { app_id, message } => {
                tracing::warn!(target: "pushd::events", app_id = ?app_id, message = %message, "error");
            },
            _ => tracing::debug!(target: "pushd::events", event = event.name(), %fields),
        }
    }
}

/// Forwards events to multiple subscribers concurrently.
#[derive(Debug, Clone)]
pub struct MulticastEventHandler {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl MulticastEventHandler {
    /// Creates a new multicast handler with no subscribers.
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Adds a subscriber.
    pub fn add_subscriber(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    /// Returns the number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.handlers.len()
    }
}

impl Default for MulticastEventHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl EventHandler for MulticastEventHandler {
    async fn handle_event(&self, event: PushEvent) {
        let futures = self.handlers.iter().map(|handler| {
            let event = event.clone();
            async move {
                handler.handle_event(event).await;
            }
        });

        futures::future::join_all(futures).await;
    }
}

/// Hands each event to a spawned task so publishers never wait on
/// subscribers.
///
/// Must be used from within a tokio runtime.
#[derive(Debug, Clone)]
pub struct SpawningEventHandler {
    inner: Arc<dyn EventHandler>,
}

impl SpawningEventHandler {
    /// Wraps a handler.
    pub fn new(inner: Arc<dyn EventHandler>) -> Self {
        Self { inner }
    }
}

#[async_trait::async_trait]
impl EventHandler for SpawningEventHandler {
    async fn handle_event(&self, event: PushEvent) {
        let inner = self.inner.clone();
        tracing::trace!(event = event.name(), "publishing event");
        tokio::spawn(async move {
            inner.handle_event(event).await;
        });
    }
}
