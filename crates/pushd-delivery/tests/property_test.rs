//! Property-based tests for retry scheduling and batch completion.
//!
//! Inputs are generated randomly; the invariants below must hold for all
//! of them.

use std::{sync::Arc, time::Duration};

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use pushd_core::AppId;
use pushd_delivery::{Batch, Outcome, RetryDecision, RetryPolicy};
use pushd_testing::{apns_app, NotificationBuilder, TestEnv};

/// Creates property test configuration based on environment.
///
/// Uses environment variables:
/// - `PROPTEST_CASES`: Number of test cases (default: 20 for dev, 100 for CI)
/// - `CI`: If set to "true", uses CI configuration
fn proptest_config() -> ProptestConfig {
    let is_ci = std::env::var("CI").unwrap_or_default() == "true";
    let default_cases = if is_ci { 100 } else { 20 };

    let cases =
        std::env::var("PROPTEST_CASES").ok().and_then(|s| s.parse().ok()).unwrap_or(default_cases);

    ProptestConfig::with_cases(cases)
}

fn policy(base: u32, max_exponent: u32, max_retries: Option<u32>) -> RetryPolicy {
    RetryPolicy { base, max_exponent, max_retries, jitter_factor: 0.0 }
}

/// Outcome applied to one batch member before completion.
#[derive(Debug, Clone, Copy)]
enum Mark {
    Delivered,
    Failed,
    Retry,
    Untouched,
}

fn mark_strategy() -> impl Strategy<Value = Mark> {
    prop_oneof![
        Just(Mark::Delivered),
        Just(Mark::Failed),
        Just(Mark::Retry),
        Just(Mark::Untouched),
    ]
}

proptest! {
    #![proptest_config(proptest_config())]

    /// Backoff never shrinks as retries grow and stops growing at the cap.
    #[test]
    fn backoff_is_monotonic_and_capped(
        base in 2u32..5,
        max_exponent in 0u32..12,
        retries in 0u32..40,
    ) {
        let policy = policy(base, max_exponent, None);
        let current = policy.backoff_delay(retries);
        let next = policy.backoff_delay(retries + 1);
        let cap = Duration::from_secs(u64::from(base).pow(max_exponent));

        prop_assert!(next >= current);
        prop_assert!(current <= cap);
        if retries >= max_exponent {
            prop_assert_eq!(current, cap);
        }
    }

    /// The policy gives up exactly when the retry budget is spent.
    #[test]
    fn give_up_iff_budget_spent(
        max_retries in 0u32..10,
        retries in 0u32..20,
        hinted in any::<bool>(),
    ) {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let hint = hinted.then(|| now + chrono::Duration::seconds(30));
        let decision = policy(2, 16, Some(max_retries)).decide(retries, now, hint);

        match decision {
            RetryDecision::GiveUp { .. } => prop_assert!(retries >= max_retries),
            RetryDecision::Retry { deliver_after } => {
                prop_assert!(retries < max_retries);
                prop_assert!(deliver_after > now);
                if let Some(hint) = hint {
                    prop_assert_eq!(deliver_after, hint);
                }
            },
        }
    }

    /// Every member of a batch is saved exactly once, whatever order and
    /// number of completion signals arrive.
    #[test]
    fn batch_completes_exactly_once(
        marks in prop::collection::vec(mark_strategy(), 1..12),
        extra_signals in 0usize..4,
        finish_with_all_processed in any::<bool>(),
    ) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let env = TestEnv::new();
            let app = Arc::new(apns_app(1, "gateway.test:2195"));
            let notifications = env
                .insert_all(
                    (0..marks.len()).map(|i| NotificationBuilder::apns(AppId(1), i as u8).build()),
                )
                .await;
            let batch = Batch::new(app, notifications, env.context());

            for (index, mark) in marks.iter().enumerate() {
                match mark {
                    Mark::Delivered => batch.mark_delivered(index),
                    Mark::Failed => batch.mark_failed(index, Some(8), "Invalid token"),
                    Mark::Retry => {
                        batch.mark_retryable_exponential(index);
                    },
                    Mark::Untouched => {},
                }
            }

            if finish_with_all_processed {
                batch.all_processed().await;
            } else {
                for _ in 0..marks.len() {
                    batch.notification_processed().await;
                }
            }
            for _ in 0..extra_signals {
                batch.notification_processed().await;
                batch.all_processed().await;
            }

            prop_assert!(batch.is_complete());
            prop_assert_eq!(env.store.save_count(), marks.len());

            let count = |wanted: fn(&Mark) -> bool| marks.iter().filter(|m| wanted(m)).count();
            prop_assert_eq!(
                env.events.count("notification_delivered"),
                count(|m| matches!(m, Mark::Delivered))
            );
            prop_assert_eq!(
                env.events.count("notification_failed"),
                count(|m| matches!(m, Mark::Failed))
            );
            prop_assert_eq!(
                env.events.count("notification_will_retry"),
                count(|m| matches!(m, Mark::Retry))
            );

            for (index, mark) in marks.iter().enumerate() {
                let expected = match mark {
                    Mark::Delivered => Some(Outcome::Delivered),
                    Mark::Failed => Some(Outcome::Failed),
                    Mark::Retry => Some(Outcome::Retry),
                    Mark::Untouched => None,
                };
                prop_assert_eq!(batch.outcome(index), expected);
            }
            Ok(())
        })?;
    }
}
