//! Binary socket adapter.
//!
//! Writes every frame of a batch in one write, then waits a short window for
//! an error tuple. The gateway never acknowledges individual notifications:
//! silence means the whole batch was accepted. When a tuple arrives the
//! gateway has dropped the connection; notifications written before the
//! rejected one were accepted, those written after it are in an unknown
//! state and get rescheduled.

use std::sync::Arc;

use bytes::BytesMut;
use pushd_core::{App, PushEvent};
use tracing::{error, info, warn};

use super::frame::{ErrorTuple, ToBinary};
use crate::{
    batch::Batch,
    connection::{BinaryConnection, Connector, TlsConnector, TupleRead},
    context::DeliveryContext,
    error::{DeliveryError, Result},
    retry::RetryDecision,
    status::apns_status_description,
};

/// Binary gateway adapter bound to one connection.
#[derive(Debug)]
pub struct ApnsDispatcher {
    app: Arc<App>,
    ctx: DeliveryContext,
    connection: BinaryConnection,
}

impl ApnsDispatcher {
    /// Creates the adapter and opens its gateway connection.
    ///
    /// Uses the context's connector when one is set, otherwise a TLS
    /// connector presenting the app's certificate.
    pub async fn connect(app: Arc<App>, ctx: DeliveryContext, name: String) -> Result<Self> {
        let connector: Arc<dyn Connector> = match &ctx.connector {
            Some(connector) => connector.clone(),
            None => Arc::new(TlsConnector::for_app(&app, ctx.apns.connect_timeout)?),
        };

        let mut connection = BinaryConnection::new(name, app.gateway_endpoint(), connector);
        connection.connect().await?;

        Ok(Self { app, ctx, connection })
    }

    /// Releases the connection.
    pub async fn close(&mut self) {
        self.connection.close().await;
    }

    /// Delivers the notifications at `indices` in one pipelined write.
    pub async fn perform(&mut self, batch: &Batch, indices: &[usize]) -> Result<()> {
        let mut frames = BytesMut::new();
        let mut written = Vec::with_capacity(indices.len());

        for &index in indices {
            let Some(notification) = batch.notification(index) else {
                continue;
            };
            match notification.to_binary() {
                Ok(frame) => {
                    frames.extend_from_slice(&frame);
                    written.push(index);
                },
                Err(error) => {
                    warn!(
                        app = %self.app.name,
                        notification_id = %notification.id,
                        error = %error,
                        "notification cannot be encoded"
                    );
                    batch.mark_failed(index, None, &error.description());
                },
            }
        }

        if written.is_empty() {
            return Ok(());
        }

        if let Err(error) = self.connection.write(&frames).await {
            for &index in &written {
                batch.mark_failed(index, None, &error.description());
            }
            return Err(error);
        }

        if !self.ctx.apns.check_for_errors {
            self.mark_sent(batch, &written);
            return Ok(());
        }

        match self.connection.read_error_tuple(self.ctx.apns.select_window).await {
            Ok(TupleRead::Timeout) => {
                self.mark_sent(batch, &written);
                Ok(())
            },
            Ok(TupleRead::Tuple(tuple)) => {
                self.reconnect_after_error().await;
                self.handle_error_tuple(batch, &written, tuple).await
            },
            Ok(TupleRead::Closed) => {
                let error = DeliveryError::Disconnected;
                for &index in &written {
                    batch.mark_failed(index, None, &error.to_string());
                }
                self.reconnect_after_error().await;
                Err(error)
            },
            Err(error) => {
                for &index in &written {
                    batch.mark_failed(index, None, &error.description());
                }
                self.reconnect_after_error().await;
                Err(error)
            },
        }
    }

    fn mark_sent(&self, batch: &Batch, indices: &[usize]) {
        for &index in indices {
            batch.mark_delivered(index);
            if let Some(notification) = batch.notification(index) {
                info!(
                    app = %self.app.name,
                    notification_id = %notification.id,
                    "{} sent to {}",
                    notification.id,
                    notification.recipients()
                );
            }
        }
    }

    async fn reconnect_after_error(&mut self) {
        error!(app = %self.app.name, "Error received, reconnecting...");
        if let Err(error) = self.connection.reconnect().await {
            warn!(app = %self.app.name, error = %error, "reconnect to gateway failed");
        }
    }

    async fn handle_error_tuple(
        &mut self,
        batch: &Batch,
        written: &[usize],
        tuple: ErrorTuple,
    ) -> Result<()> {
        let code = i32::from(tuple.status);
        let description = apns_status_description(tuple.status);

        let failed_at = written.iter().position(|&index| {
            batch
                .notification(index)
                .is_some_and(|n| n.id.frame_identifier() == tuple.identifier)
        });

        let Some(position) = failed_at else {
            warn!(
                app = %self.app.name,
                identifier = tuple.identifier,
                status = tuple.status,
                "error tuple names a notification outside this batch, rescheduling batch"
            );
            for &index in written {
                self.reschedule(batch, index).await;
            }
            return Err(DeliveryError::gateway(
                Some(code),
                format!("{description} (identifier {})", tuple.identifier),
                None,
            ));
        };

        self.mark_sent(batch, &written[..position]);

        let failed_index = written[position];
        batch.mark_failed(failed_index, Some(code), description);
        let failed_id = batch.notification(failed_index).map(|n| n.id);
        if let Some(notification_id) = failed_id {
            self.ctx
                .publish(PushEvent::NotificationIdFailed {
                    app_id: self.app.id,
                    notification_id,
                    code: Some(code),
                    description: description.to_string(),
                })
                .await;
        }

        for &index in &written[position + 1..] {
            self.reschedule(batch, index).await;
        }

        Err(DeliveryError::gateway(Some(code), description, failed_id))
    }

    async fn reschedule(&mut self, batch: &Batch, index: usize) {
        let decision = batch.mark_retryable_exponential(index);
        let Some(notification) = batch.notification(index) else {
            return;
        };

        if let RetryDecision::Retry { deliver_after } = decision {
            info!(
                app = %self.app.name,
                notification_id = %notification.id,
                retry_at = %deliver_after,
                "notification will be retried"
            );
            self.ctx
                .publish(PushEvent::NotificationIdWillRetry {
                    app_id: self.app.id,
                    notification_id: notification.id,
                    retry_at: deliver_after,
                })
                .await;
        }
    }
}
