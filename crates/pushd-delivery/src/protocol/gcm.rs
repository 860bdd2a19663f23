//! Multicast JSON adapter.
//!
//! One request carries every registration id of a notification. The
//! response's `results` array lines up with those ids by position; each
//! entry is either a success (`message_id`, optionally a canonical
//! `registration_id`) or a failure (`error`).
//!
//! Failures fall into two named groups: invalid registrations, which are
//! permanent, and unavailable recipients, which are retried. When every
//! recipient is unavailable the notification itself is rescheduled. When
//! only some are, a new notification carrying just those ids is created and
//! the original is marked failed.

use std::{sync::Arc, time::Instant};

use pushd_core::{App, Notification, NotificationAttrs, PushEvent};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    batch::Batch,
    client::{GatewayResponse, HttpConnection},
    context::DeliveryContext,
    error::{DeliveryError, Result},
    retry::{retry_after_from_headers, RetryDecision},
    status::http_status_phrase,
};

/// Errors meaning the registration id will never work for this app.
pub const INVALID_REGISTRATION_ID_STATES: [&str; 4] =
    ["InvalidRegistration", "MismatchSenderId", "NotRegistered", "InvalidPackageName"];

/// Errors meaning the recipient can be retried.
pub const UNAVAILABLE_STATES: [&str; 2] = ["Unavailable", "InternalServerError"];

#[derive(Debug, Serialize)]
struct GcmRequest<'a> {
    registration_ids: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    collapse_key: Option<&'a str>,
    delay_while_idle: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct GcmResponse {
    results: Vec<GcmResult>,
}

#[derive(Debug, Deserialize)]
struct GcmResult {
    message_id: Option<String>,
    registration_id: Option<String>,
    error: Option<String>,
}

/// A recipient the gateway accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Success {
    /// Position in the request's registration ids.
    pub index: usize,
    /// Registration id that was used.
    pub registration_id: String,
    /// Replacement id the app should store instead.
    pub canonical_id: Option<String>,
}

/// A recipient the gateway rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    /// Position in the request's registration ids.
    pub index: usize,
    /// Registration id that was used.
    pub registration_id: String,
    /// Gateway error string.
    pub error: String,
}

/// Every failure in response order, plus named partitions pointing into it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Failures {
    /// All failures.
    pub all: Vec<Failure>,
    /// Positions in `all` of invalid registrations.
    pub invalid: Vec<usize>,
    /// Positions in `all` of unavailable recipients.
    pub unavailable: Vec<usize>,
    /// Whether every recipient failed.
    pub total_fail: bool,
}

impl Failures {
    /// Whether there are no failures.
    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }

    /// Invalid registration failures.
    pub fn invalid(&self) -> impl Iterator<Item = &Failure> {
        self.invalid.iter().filter_map(|&i| self.all.get(i))
    }

    /// Unavailable recipient failures.
    pub fn unavailable(&self) -> impl Iterator<Item = &Failure> {
        self.unavailable.iter().filter_map(|&i| self.all.get(i))
    }

    /// Summary used as the notification's error description.
    pub fn describe(&self) -> String {
        let recipients = if self.total_fail {
            "Failed to deliver to all recipients.".to_string()
        } else {
            let indexes: Vec<String> = self.all.iter().map(|f| f.index.to_string()).collect();
            format!("Failed to deliver to recipients {}.", indexes.join(", "))
        };
        let errors: Vec<&str> = self.all.iter().map(|f| f.error.as_str()).collect();
        format!("{recipients} Errors: {}.", errors.join(", "))
    }
}

/// Per-recipient results of one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Results {
    /// Accepted recipients.
    pub successes: Vec<Success>,
    /// Rejected recipients.
    pub failures: Failures,
}

impl Results {
    /// Lines up `results` with `registration_ids` by position.
    fn process(results: Vec<GcmResult>, registration_ids: &[String]) -> Self {
        let mut processed = Self::default();

        for (index, (result, registration_id)) in results.into_iter().zip(registration_ids).enumerate()
        {
            if result.message_id.is_some() {
                processed.successes.push(Success {
                    index,
                    registration_id: registration_id.clone(),
                    canonical_id: result.registration_id.filter(|id| !id.is_empty()),
                });
            } else if let Some(error) = result.error {
                let failures = &mut processed.failures;
                let position = failures.all.len();
                if INVALID_REGISTRATION_ID_STATES.contains(&error.as_str()) {
                    failures.invalid.push(position);
                }
                if UNAVAILABLE_STATES.contains(&error.as_str()) {
                    failures.unavailable.push(position);
                }
                failures.all.push(Failure { index, registration_id: registration_id.clone(), error });
            }
        }

        processed.failures.total_fail = processed.failures.all.len() == registration_ids.len();
        processed
    }
}

/// Multicast JSON gateway adapter bound to one client.
#[derive(Debug)]
pub struct GcmDispatcher {
    app: Arc<App>,
    ctx: DeliveryContext,
    connection: HttpConnection,
    endpoint: String,
    auth_key: String,
}

impl GcmDispatcher {
    /// Creates the adapter.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the app has no `auth_key`.
    pub fn new(app: Arc<App>, ctx: DeliveryContext, name: String) -> Result<Self> {
        let auth_key = app.auth_key.clone().ok_or_else(|| {
            DeliveryError::configuration(format!("app {} has no auth_key", app.name))
        })?;
        let connection = HttpConnection::connect(name, ctx.http.clone(), None)?;
        let endpoint = app.gateway_endpoint();
        Ok(Self { app, ctx, connection, endpoint, auth_key })
    }

    /// Delivers each notification at `indices`, returning the first error
    /// after every notification has an outcome.
    pub async fn perform(&mut self, batch: &Batch, indices: &[usize]) -> Result<()> {
        let mut first_error = None;
        for &index in indices {
            if let Err(error) = self.deliver(batch, index).await {
                first_error.get_or_insert(error);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn deliver(&mut self, batch: &Batch, index: usize) -> Result<()> {
        let Some(notification) = batch.notification(index) else {
            return Ok(());
        };

        let started = Instant::now();
        let body = GcmRequest {
            registration_ids: &notification.registration_ids,
            collapse_key: notification.collapse_key.as_deref(),
            delay_while_idle: notification.delay_while_idle,
            data: notification.data.as_ref(),
        };
        let result = self
            .connection
            .client()
            .post(&self.endpoint)
            .header("Authorization", format!("key={}", self.auth_key))
            .json(&body)
            .send()
            .await;

        let response = match result {
            Ok(response) => GatewayResponse::read(response, started.elapsed()).await,
            Err(error) => {
                let error = DeliveryError::from(error);
                warn!(
                    app = %self.app.name,
                    notification_id = %notification.id,
                    error = %error,
                    "request to gateway failed"
                );
                self.retry(batch, index, &notification, None);
                if let Err(reconnect_error) = self.connection.reconnect() {
                    warn!(app = %self.app.name, error = %reconnect_error, "rebuilding client failed");
                }
                return Err(error);
            },
        };

        let outcome = self.handle_response(batch, index, &notification, &response).await;
        if let Err(error) = &outcome {
            if batch.outcome(index).is_none() {
                batch.mark_failed(index, error.code(), &error.description());
            }
        }
        outcome
    }

    async fn handle_response(
        &self,
        batch: &Batch,
        index: usize,
        notification: &Notification,
        response: &GatewayResponse,
    ) -> Result<()> {
        let status = response.status.as_u16();
        match status {
            200 => self.ok(batch, index, notification, response).await,
            400 => Err(DeliveryError::gateway(
                Some(400),
                "GCM failed to parse the JSON request. Possibly a pushd bug, please open an issue.",
                Some(notification.id),
            )),
            401 => Err(DeliveryError::gateway(
                Some(401),
                "Unauthorized, check your App auth_key.",
                Some(notification.id),
            )),
            500 | 503 => {
                let kind = if status == 500 { "an Internal Error" } else { "a Service Unavailable Error" };
                warn!(app = %self.app.name, status, "GCM responded with {kind}.");
                let retry_at = retry_after_from_headers(&response.headers, self.ctx.now());
                self.retry(batch, index, notification, retry_at);
                Ok(())
            },
            _ => Err(DeliveryError::gateway(
                Some(i32::from(status)),
                http_status_phrase(status).unwrap_or("Unknown"),
                Some(notification.id),
            )),
        }
    }

    async fn ok(
        &self,
        batch: &Batch,
        index: usize,
        notification: &Notification,
        response: &GatewayResponse,
    ) -> Result<()> {
        let parsed: GcmResponse = serde_json::from_str(&response.body)
            .map_err(|e| DeliveryError::protocol(format!("GCM response: {e}")))?;
        if parsed.results.len() != notification.registration_ids.len() {
            return Err(DeliveryError::protocol(format!(
                "GCM response has {} results for {} registration ids",
                parsed.results.len(),
                notification.registration_ids.len()
            )));
        }
        let results = Results::process(parsed.results, &notification.registration_ids);

        for success in &results.successes {
            self.ctx
                .publish(PushEvent::GcmDeliveredToRecipient {
                    notification_id: notification.id,
                    registration_id: success.registration_id.clone(),
                })
                .await;
            if let Some(canonical_id) = &success.canonical_id {
                self.ctx
                    .publish(PushEvent::GcmCanonicalId {
                        old_id: success.registration_id.clone(),
                        canonical_id: canonical_id.clone(),
                    })
                    .await;
            }
        }

        let failures = &results.failures;
        let all_unavailable = !notification.registration_ids.is_empty()
            && failures.unavailable.len() == notification.registration_ids.len();
        if all_unavailable {
            warn!(app = %self.app.name, notification_id = %notification.id, "All recipients unavailable.");
            let retry_at = retry_after_from_headers(&response.headers, self.ctx.now());
            self.retry(batch, index, notification, retry_at);
            return Ok(());
        }

        if !failures.is_empty() {
            let description = self.handle_failures(notification, failures, response).await;
            batch.mark_failed(index, None, &description);
            return Err(DeliveryError::gateway(None, description, Some(notification.id)));
        }

        batch.mark_delivered(index);
        info!(
            app = %self.app.name,
            notification_id = %notification.id,
            "{} sent to {}",
            notification.id,
            notification.registration_ids.join(", ")
        );
        Ok(())
    }

    /// Publishes per-recipient failures and splits off unavailable
    /// recipients. Returns the error description for the original.
    async fn handle_failures(
        &self,
        notification: &Notification,
        failures: &Failures,
        response: &GatewayResponse,
    ) -> String {
        for failure in &failures.all {
            self.ctx
                .publish(PushEvent::GcmFailedToRecipient {
                    notification_id: notification.id,
                    error: failure.error.clone(),
                    registration_id: failure.registration_id.clone(),
                })
                .await;
        }

        for failure in failures.invalid() {
            self.ctx
                .publish(PushEvent::GcmInvalidRegistrationId {
                    app_id: self.app.id,
                    error: failure.error.clone(),
                    registration_id: failure.registration_id.clone(),
                })
                .await;
        }

        let mut description = failures.describe();
        let unavailable: Vec<&Failure> = failures.unavailable().collect();
        if unavailable.is_empty() {
            return description;
        }

        let indexes: Vec<String> = unavailable.iter().map(|f| f.index.to_string()).collect();
        let now = self.ctx.now();
        let retry_at = retry_after_from_headers(&response.headers, now);
        let deliver_after = match self.ctx.retry.decide(notification.retries, now, retry_at) {
            RetryDecision::Retry { deliver_after } => deliver_after,
            RetryDecision::GiveUp { reason } => {
                warn!(
                    app = %self.app.name,
                    notification_id = %notification.id,
                    reason = %reason,
                    "not retrying unavailable recipients"
                );
                description.push_str(&format!(" {} will not be retried: {reason}.", indexes.join(", ")));
                return description;
            },
        };
        let registration_ids = unavailable.iter().map(|f| f.registration_id.clone()).collect();

        let mut attrs = NotificationAttrs::from(notification);
        attrs.retries = notification.retries.saturating_add(1);

        match self
            .ctx
            .store
            .create_notification(attrs, registration_ids, Some(deliver_after), (*self.app).clone())
            .await
        {
            Ok(created) => {
                description.push_str(&format!(
                    " {} will be retried as notification {}.",
                    indexes.join(", "),
                    created.id
                ));
            },
            Err(error) => {
                warn!(
                    app = %self.app.name,
                    notification_id = %notification.id,
                    error = %error,
                    "failed to create retry notification for unavailable recipients"
                );
                self.ctx
                    .publish(PushEvent::Error {
                        app_id: Some(self.app.id),
                        message: format!(
                            "failed to create retry notification for {}: {error}",
                            notification.id
                        ),
                    })
                    .await;
            },
        }

        description
    }

    fn retry(
        &self,
        batch: &Batch,
        index: usize,
        notification: &Notification,
        retry_at: Option<chrono::DateTime<chrono::Utc>>,
    ) {
        let decision = match retry_at {
            Some(at) => batch.mark_retryable(index, at),
            None => batch.mark_retryable_exponential(index),
        };

        match decision {
            RetryDecision::Retry { deliver_after } => warn!(
                app = %self.app.name,
                notification_id = %notification.id,
                "Notification {} will be retried after {} (retry {}).",
                notification.id,
                deliver_after.format("%Y-%m-%d %H:%M:%S"),
                notification.retries + 1
            ),
            RetryDecision::GiveUp { reason } => warn!(
                app = %self.app.name,
                notification_id = %notification.id,
                reason = %reason,
                "giving up on notification"
            ),
        }
    }
}
