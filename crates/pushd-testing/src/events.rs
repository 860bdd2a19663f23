//! Event recording and deterministic waiting.
//!
//! All waits are bounded so a broken test fails instead of hanging CI.

use std::{
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{bail, Result};
use pushd_core::{EventHandler, PushEvent};
use tokio::sync::Notify;

/// Default bound for waits in tests.
pub const DEFAULT_EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Records every published event in order.
#[derive(Debug, Default)]
pub struct RecordingEventHandler {
    events: Mutex<Vec<PushEvent>>,
    notify: Notify,
}

impl RecordingEventHandler {
    /// Creates an empty recorder.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every event recorded so far.
    pub fn events(&self) -> Vec<PushEvent> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }

    /// Events with the given name (see [`PushEvent::name`]).
    pub fn named(&self, name: &str) -> Vec<PushEvent> {
        self.events().into_iter().filter(|event| event.name() == name).collect()
    }

    /// Number of events with the given name.
    pub fn count(&self, name: &str) -> usize {
        self.named(name).len()
    }

    /// Waits until at least `count` events named `name` have arrived.
    pub async fn wait_for(&self, name: &str, count: usize) -> Result<Vec<PushEvent>> {
        let waited = tokio::time::timeout(DEFAULT_EVENT_TIMEOUT, async {
            loop {
                let notified = self.notify.notified();
                if self.count(name) >= count {
                    return;
                }
                notified.await;
            }
        })
        .await;

        if waited.is_err() {
            bail!(
                "expected {count} `{name}` events within {DEFAULT_EVENT_TIMEOUT:?}, saw {}",
                self.count(name)
            );
        }
        Ok(self.named(name))
    }
}

#[async_trait::async_trait]
impl EventHandler for RecordingEventHandler {
    async fn handle_event(&self, event: PushEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
        self.notify.notify_waiters();
    }
}

/// Polls `condition` every 10ms until it holds or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let waited = tokio::time::timeout(timeout, async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;

    if waited.is_err() {
        bail!("condition not met within {timeout:?}");
    }
    Ok(())
}
