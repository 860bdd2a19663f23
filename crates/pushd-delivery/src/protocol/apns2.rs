//! HTTP/2 JSON adapter.
//!
//! One request per notification, posted to `/3/device/{token}`.
//!
//! | Response           | Outcome                                          |
//! |--------------------|--------------------------------------------------|
//! | 200                | delivered                                        |
//! | 4xx                | failed, code = status, description = `reason`    |
//! | 5xx, transport     | rescheduled (`retry-after` or exponential)       |
//! | anything else      | failed, classified error carrying the status     |

use std::{sync::Arc, time::Instant};

use pushd_core::{App, Notification};
use serde::Deserialize;
use tracing::{info, warn};

use super::frame::{aps_payload, DEFAULT_PRIORITY};
use crate::{
    batch::Batch,
    client::{GatewayResponse, HttpConnection},
    context::DeliveryContext,
    error::{DeliveryError, Result},
    retry::{retry_after_from_headers, RetryDecision},
    status::http_status_phrase,
};

#[derive(Debug, Deserialize)]
struct ErrorBody {
    reason: Option<String>,
}

/// HTTP/2 gateway adapter bound to one client.
#[derive(Debug)]
pub struct Apns2Dispatcher {
    app: Arc<App>,
    ctx: DeliveryContext,
    connection: HttpConnection,
    base_url: String,
}

impl Apns2Dispatcher {
    /// Creates the adapter, presenting the app's certificate when it has one.
    pub fn new(app: Arc<App>, ctx: DeliveryContext, name: String) -> Result<Self> {
        let connection = HttpConnection::connect(name, ctx.http.clone(), app.certificate.clone())?;
        let base_url = app.gateway_endpoint().trim_end_matches('/').to_string();
        Ok(Self { app, ctx, connection, base_url })
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

        let Some(token) = notification.device_token.clone() else {
            let error = DeliveryError::gateway(None, "Missing device token", Some(notification.id));
            batch.mark_failed(index, None, "Missing device token");
            return Err(error);
        };

        let started = Instant::now();
        let result = self.request(&notification, &token).send().await;

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

        let status = response.status.as_u16();
        match status {
            200 => {
                batch.mark_delivered(index);
                info!(
                    app = %self.app.name,
                    notification_id = %notification.id,
                    "{} sent to {}",
                    notification.id,
                    token
                );
                Ok(())
            },
            400..=499 => {
                let description = serde_json::from_str::<ErrorBody>(&response.body)
                    .ok()
                    .and_then(|body| body.reason)
                    .unwrap_or_else(|| generic_description(status));
                let code = Some(i32::from(status));
                batch.mark_failed(index, code, &description);
                Err(DeliveryError::gateway(code, description, Some(notification.id)))
            },
            500..=599 => {
                let retry_at = retry_after_from_headers(&response.headers, self.ctx.now());
                self.retry(batch, index, &notification, retry_at);
                Ok(())
            },
            _ => {
                let description = generic_description(status);
                let code = Some(i32::from(status));
                batch.mark_failed(index, code, &description);
                Err(DeliveryError::gateway(code, description, Some(notification.id)))
            },
        }
    }

    fn request(&self, notification: &Notification, token: &str) -> reqwest::RequestBuilder {
        let expiration = notification.expires_at.map_or(0, |at| at.timestamp().max(0));
        let priority = notification.priority.unwrap_or(DEFAULT_PRIORITY);

        let mut request = self
            .connection
            .client()
            .post(format!("{}/3/device/{token}", self.base_url))
            .header("apns-expiration", expiration.to_string())
            .header("apns-priority", priority.to_string())
            .json(&aps_payload(notification));

        if let Some(topic) = &self.app.bundle_id {
            request = request.header("apns-topic", topic);
        }
        request
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

fn generic_description(status: u16) -> String {
    match http_status_phrase(status) {
        Some(phrase) => format!("{status} {phrase}"),
        None => format!("Unexpected status {status}"),
    }
}
