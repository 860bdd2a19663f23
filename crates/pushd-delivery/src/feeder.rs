//! Storage poller that feeds due notifications to the registry.

use std::{fmt, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    error::Result,
    registry::{AppRunnerRegistry, EnqueueReport},
    storage::NotificationStore,
};

/// Feeder settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeederConfig {
    /// Pause between storage polls.
    #[serde(with = "crate::secs")]
    pub poll_interval: Duration,

    /// Most notifications fetched per poll.
    pub batch_size: usize,
}

impl Default for FeederConfig {
    fn default() -> Self {
        Self { poll_interval: Duration::from_secs(2), batch_size: 5000 }
    }
}

/// Polls storage and hands due notifications to the registry.
pub struct Feeder {
    store: Arc<dyn NotificationStore>,
    registry: Arc<AppRunnerRegistry>,
    config: FeederConfig,
}

impl fmt::Debug for Feeder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Feeder").field("config", &self.config).finish_non_exhaustive()
    }
}

impl Feeder {
    /// Creates a feeder.
    pub fn new(
        store: Arc<dyn NotificationStore>,
        registry: Arc<AppRunnerRegistry>,
        config: FeederConfig,
    ) -> Self {
        Self { store, registry, config }
    }

    /// Polls until `cancel` fires. Storage errors are logged and the next
    /// poll proceeds as usual.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            poll_interval_seconds = self.config.poll_interval.as_secs_f64(),
            batch_size = self.config.batch_size,
            "feeder starting"
        );
        let clock = self.registry.context().clock.clone();

        loop {
            if cancel.is_cancelled() {
                break;
            }

            if let Err(error) = self.enqueue_once().await {
                error!(error = %error, "fetching ready notifications failed");
            }

            tokio::select! {
                () = clock.sleep(self.config.poll_interval) => {},
                () = cancel.cancelled() => break,
            }
        }

        info!("feeder stopped");
    }

    /// Runs a single fetch-and-enqueue pass.
    ///
    /// # Errors
    ///
    /// Returns the storage error when notifications cannot be fetched.
    pub async fn enqueue_once(&self) -> Result<EnqueueReport> {
        let notifications = self.store.notifications_ready_for_delivery(self.config.batch_size).await?;
        if notifications.is_empty() {
            return Ok(EnqueueReport::default());
        }

        debug!(count = notifications.len(), "fetched ready notifications");
        Ok(self.registry.enqueue(notifications).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config: FeederConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, FeederConfig::default());
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.batch_size, 5000);
    }

    #[test]
    fn poll_interval_accepts_fractions() {
        let config: FeederConfig = serde_json::from_str(r#"{"poll_interval": 0.1}"#).unwrap();
        assert_eq!(config.poll_interval, Duration::from_millis(100));
    }
}
