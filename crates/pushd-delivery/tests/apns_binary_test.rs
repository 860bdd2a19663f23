//! Binary gateway delivery against the in-memory fake gateway.

use anyhow::Result;
use pushd_core::{AppId, Clock, DeliveryState, PushEvent};
use pushd_delivery::{DeliveryError, Outcome};
use pushd_testing::{apns_app, NotificationBuilder, TestEnv};

const APP: AppId = AppId(1);

async fn env_with_notifications(count: u8) -> (TestEnv, Vec<pushd_core::Notification>) {
    let env = TestEnv::with_apps([apns_app(1, "gateway.test:2195")]).await;
    let notifications = env
        .insert_all((1..=count).map(|seed| NotificationBuilder::apns(APP, seed).build()))
        .await;
    (env, notifications)
}

#[tokio::test]
async fn silence_after_write_means_every_notification_was_accepted() -> Result<()> {
    let (env, notifications) = env_with_notifications(3).await;
    let app = apns_app(1, "gateway.test:2195");

    let delivery = env.deliver(&app, notifications.clone()).await?;

    assert!(delivery.result.is_ok());
    for notification in &notifications {
        let stored = env.stored(notification.id).await;
        assert_eq!(stored.state, DeliveryState::Delivered);
        assert!(stored.delivered_at.is_some());
    }

    let identifiers: Vec<u32> = notifications.iter().map(|n| n.id.frame_identifier()).collect();
    assert_eq!(env.gateway.identifiers(), identifiers);
    assert_eq!(env.gateway.connection_count(), 1);
    assert_eq!(env.events.count("notification_delivered"), 3);
    Ok(())
}

#[tokio::test]
async fn error_tuple_splits_batch_into_delivered_failed_and_retried() -> Result<()> {
    let (env, notifications) = env_with_notifications(4).await;
    let app = apns_app(1, "gateway.test:2195");
    let rejected = &notifications[1];
    env.gateway.reject(rejected.id.frame_identifier(), 8);

    let delivery = env.deliver(&app, notifications.clone()).await?;

    match delivery.result {
        Err(DeliveryError::Gateway { code, description, notification_id }) => {
            assert_eq!(code, Some(8));
            assert_eq!(description, "Invalid token");
            assert_eq!(notification_id, Some(rejected.id));
        },
        other => panic!("expected gateway error, got {other:?}"),
    }

    let batch = &delivery.batch;
    assert_eq!(batch.outcome(0), Some(Outcome::Delivered));
    assert_eq!(batch.outcome(1), Some(Outcome::Failed));
    assert_eq!(batch.outcome(2), Some(Outcome::Retry));
    assert_eq!(batch.outcome(3), Some(Outcome::Retry));

    let failed = env.stored(rejected.id).await;
    assert_eq!(failed.state, DeliveryState::Failed);
    assert_eq!(failed.error_code, Some(8));
    assert_eq!(failed.error_description.as_deref(), Some("Invalid token"));

    for notification in &notifications[2..] {
        let stored = env.stored(notification.id).await;
        assert_eq!(stored.state, DeliveryState::Pending);
        assert_eq!(stored.retries, 1);
        assert!(stored.deliver_after.is_some_and(|at| at > env.clock.now_utc()));
    }

    let id_failed = env.events.named("notification_id_failed");
    assert_eq!(id_failed.len(), 1);
    assert!(matches!(
        &id_failed[0],
        PushEvent::NotificationIdFailed { notification_id, code: Some(8), .. }
            if *notification_id == rejected.id
    ));
    assert_eq!(env.events.count("notification_id_will_retry"), 2);

    // The gateway drops the socket after an error; the adapter reconnects.
    assert_eq!(env.gateway.connection_count(), 2);
    Ok(())
}

#[tokio::test]
async fn hang_up_without_tuple_fails_written_notifications() -> Result<()> {
    let (env, notifications) = env_with_notifications(2).await;
    let app = apns_app(1, "gateway.test:2195");
    env.gateway.hang_up_after(2);

    let delivery = env.deliver(&app, notifications.clone()).await?;

    assert!(matches!(delivery.result, Err(DeliveryError::Disconnected)));
    for notification in &notifications {
        let stored = env.stored(notification.id).await;
        assert_eq!(stored.state, DeliveryState::Failed);
        assert!(stored
            .error_description
            .as_deref()
            .is_some_and(|d| d.contains("disconnected without returning an error")));
    }
    assert_eq!(env.gateway.connection_count(), 2);
    Ok(())
}

#[tokio::test]
async fn unencodable_notification_fails_alone() -> Result<()> {
    let env = TestEnv::with_apps([apns_app(1, "gateway.test:2195")]).await;
    let app = apns_app(1, "gateway.test:2195");
    let good = env.insert(NotificationBuilder::apns(APP, 1).build()).await;
    let bad = env.insert(NotificationBuilder::new(APP).device_token("abcd").alert("short").build()).await;

    let delivery = env.deliver(&app, vec![good.clone(), bad.clone()]).await?;

    assert!(delivery.result.is_ok());
    assert_eq!(env.stored(good.id).await.state, DeliveryState::Delivered);
    assert_eq!(env.stored(bad.id).await.state, DeliveryState::Failed);
    assert_eq!(env.gateway.identifiers(), vec![good.id.frame_identifier()]);
    Ok(())
}

#[tokio::test]
async fn frames_carry_payload_expiry_and_priority() -> Result<()> {
    let env = TestEnv::with_apps([apns_app(1, "gateway.test:2195")]).await;
    let app = apns_app(1, "gateway.test:2195");
    let notification = env
        .insert(NotificationBuilder::apns(APP, 9).badge(3).sound("ping.aiff").priority(5).build())
        .await;

    env.deliver(&app, vec![notification.clone()]).await?;

    let frames = env.gateway.frames();
    assert_eq!(frames.len(), 1);
    let frame = &frames[0];
    assert_eq!(frame.device_token, pushd_testing::token(9));
    assert_eq!(frame.payload["aps"]["alert"], "hello");
    assert_eq!(frame.payload["aps"]["badge"], 3);
    assert_eq!(frame.payload["aps"]["sound"], "ping.aiff");
    assert_eq!(frame.expiry, 0);
    assert_eq!(frame.priority, 5);
    Ok(())
}

#[tokio::test]
async fn unreachable_gateway_fails_adapter_construction() {
    let env = TestEnv::with_apps([apns_app(1, "gateway.test:2195")]).await;
    env.gateway.refuse_connections(1);

    let result = env.deliver(&apns_app(1, "gateway.test:2195"), Vec::new()).await;

    assert!(result.is_err());
}
