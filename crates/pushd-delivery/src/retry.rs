//! Retry scheduling: exponential backoff and server-provided hints.
//!
//! A rescheduled notification is not re-enqueued. It gets a future
//! `deliver_after` and becomes eligible for the feeder again once that time
//! has passed.
//!
//! Delay for a notification that has been retried `n` times:
//!
//! ```text
//! delay = base ^ min(n, max_exponent) seconds      (± jitter_factor)
//! ```
//!
//! A `Retry-After` header, given either as delta-seconds or as an HTTP date,
//! replaces the computed delay entirely.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Retry policy for rescheduled notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Base of the exponential backoff, in seconds.
    pub base: u32,

    /// Cap on the exponent, bounding the longest backoff.
    pub max_exponent: u32,

    /// Retries after which a would-be retry becomes a permanent failure.
    /// `None` retries forever.
    pub max_retries: Option<u32>,

    /// Jitter fraction (0.0 to 1.0) applied to computed backoff delays.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { base: 2, max_exponent: 16, max_retries: None, jitter_factor: 0.0 }
    }
}

/// Result of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Reschedule the notification.
    Retry {
        /// Earliest time of the next attempt.
        deliver_after: DateTime<Utc>,
    },
    /// Stop retrying and fail permanently.
    GiveUp {
        /// Why the notification will not be retried.
        reason: String,
    },
}

impl RetryPolicy {
    /// Backoff delay for a notification that has been retried `retries`
    /// times.
    pub fn backoff_delay(&self, retries: u32) -> Duration {
        let exponent = retries.min(self.max_exponent);
        let seconds = u64::from(self.base).saturating_pow(exponent);
        apply_jitter(Duration::from_secs(seconds), self.jitter_factor)
    }

    /// Decides whether and when to retry.
    ///
    /// `retry_at` is a server-provided hint; when present it wins over the
    /// computed backoff.
    pub fn decide(
        &self,
        retries: u32,
        now: DateTime<Utc>,
        retry_at: Option<DateTime<Utc>>,
    ) -> RetryDecision {
        if let Some(max_retries) = self.max_retries {
            if retries >= max_retries {
                return RetryDecision::GiveUp {
                    reason: format!("maximum retries ({max_retries}) exceeded"),
                };
            }
        }

        if let Some(deliver_after) = retry_at {
            return RetryDecision::Retry { deliver_after };
        }

        let Ok(delay) = chrono::Duration::from_std(self.backoff_delay(retries)) else {
            return RetryDecision::GiveUp { reason: "retry delay out of range".to_string() };
        };

        RetryDecision::Retry { deliver_after: now + delay }
    }
}

/// Randomizes a delay by ±`jitter_factor`.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return duration;
    }

    let clamped = jitter_factor.clamp(0.0, 1.0);
    let range = duration.as_secs_f64() * clamped;
    let offset = rand::rng().random_range(-range..=range);

    Duration::from_secs_f64((duration.as_secs_f64() + offset).max(0.0))
}

/// Parses a `Retry-After` value given as delta-seconds or an HTTP date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let value = value.trim();

    if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
        let seconds = value.parse::<i64>().ok()?;
        return now.checked_add_signed(chrono::Duration::seconds(seconds));
    }

    match DateTime::parse_from_rfc2822(value) {
        Ok(date) => Some(date.with_timezone(&Utc)),
        Err(error) => {
            warn!(retry_after = value, error = %error, "ignoring unparseable retry-after header");
            None
        },
    }
}

/// Extracts the `Retry-After` hint from response headers.
pub fn retry_after_from_headers(headers: &HeaderMap, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| parse_retry_after(value, now))
}
