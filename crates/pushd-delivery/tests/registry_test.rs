//! Registry routing, syncing and shutdown.

use anyhow::Result;
use pushd_core::{App, AppId, DeliveryState, PushEvent};
use pushd_delivery::{EnqueueReport, NotificationStore};
use pushd_testing::{apns_app, gcm_app, NotificationBuilder, TestEnv};

fn binary_app(id: u64, connections: usize) -> App {
    let mut app = apns_app(id, "gateway.test:2195");
    app.connections = connections;
    app
}

fn broken_gcm_app(id: u64) -> App {
    let mut app = gcm_app(id, "http://127.0.0.1:9");
    app.auth_key = None;
    app
}

#[tokio::test]
async fn sync_starts_runners_and_skips_apps_that_fail_to_start() -> Result<()> {
    let env = TestEnv::new();
    let registry = env.registry();

    registry.sync(vec![binary_app(1, 2), broken_gcm_app(2)]).await;

    assert_eq!(registry.runner_count().await, 1);
    assert!(registry.contains(AppId(1)).await);
    assert!(!registry.contains(AppId(2)).await);
    assert_eq!(registry.num_dispatchers().await, 2);

    let errors = env.events.named("error");
    assert_eq!(errors.len(), 1);
    assert!(matches!(&errors[0], PushEvent::Error { app_id: Some(AppId(2)), .. }));

    registry.stop().await?;
    Ok(())
}

#[tokio::test]
async fn sync_resizes_and_removes_runners() -> Result<()> {
    let env = TestEnv::new();
    let registry = env.registry();
    registry.sync(vec![binary_app(1, 3), binary_app(2, 1)]).await;
    assert_eq!(registry.num_dispatchers().await, 4);

    registry.sync(vec![binary_app(1, 1)]).await;

    assert_eq!(registry.runner_count().await, 1);
    assert_eq!(registry.dispatchers_for(AppId(1)).await, Some(1));
    assert_eq!(registry.dispatchers_for(AppId(2)).await, None);

    registry.stop().await?;
    assert_eq!(registry.runner_count().await, 0);
    Ok(())
}

#[tokio::test]
async fn sync_from_store_loads_every_app() -> Result<()> {
    let env = TestEnv::with_apps([binary_app(1, 1), binary_app(2, 2)]).await;
    let registry = env.registry();

    registry.sync_from_store().await?;

    assert_eq!(registry.runner_count().await, 2);
    assert_eq!(registry.num_dispatchers().await, 3);
    let snapshots = registry.debug().await;
    assert_eq!(snapshots.iter().map(|s| s.app_id).collect::<Vec<_>>(), vec![AppId(1), AppId(2)]);

    registry.stop().await?;
    Ok(())
}

#[tokio::test]
async fn enqueue_starts_missing_runners_from_storage() -> Result<()> {
    let env = TestEnv::with_apps([binary_app(1, 1)]).await;
    let registry = env.registry();
    let notifications = env
        .insert_all((1..=2).map(|seed| NotificationBuilder::apns(AppId(1), seed).build()))
        .await;

    let report = registry.enqueue(notifications.clone()).await;

    assert_eq!(report, EnqueueReport { enqueued: 2, skipped_busy: 0, dropped_no_runner: 0 });
    assert!(registry.contains(AppId(1)).await);

    registry.stop().await?;
    for notification in &notifications {
        assert_eq!(env.stored(notification.id).await.state, DeliveryState::Delivered);
    }
    Ok(())
}

#[tokio::test]
async fn notifications_for_unknown_apps_are_released() -> Result<()> {
    let env = TestEnv::with_apps([binary_app(1, 1)]).await;
    let registry = env.registry();
    let known = env.insert(NotificationBuilder::apns(AppId(1), 1).build()).await;
    let orphan = env.insert(NotificationBuilder::apns(AppId(9), 2).build()).await;

    let claimed = env.store.notifications_ready_for_delivery(10).await?;
    assert_eq!(claimed.len(), 2);

    let report = registry.enqueue(vec![known.clone(), orphan.clone()]).await;

    assert_eq!(report.enqueued, 1);
    assert_eq!(report.dropped_no_runner, 1);
    assert_eq!(env.events.count("error"), 1);

    // The orphan was saved back unchanged and can be fetched again.
    let stored = env.stored(orphan.id).await;
    assert_eq!(stored.state, DeliveryState::Pending);
    let refetched = env.store.notifications_ready_for_delivery(10).await?;
    assert!(refetched.iter().any(|n| n.id == orphan.id));

    registry.stop().await?;
    Ok(())
}

#[tokio::test]
async fn busy_runners_release_their_group() -> Result<()> {
    let env = TestEnv::with_apps([binary_app(1, 1)]).await;
    let registry = env.registry();
    let first = env.insert(NotificationBuilder::apns(AppId(1), 1).build()).await;
    let second = env.insert(NotificationBuilder::apns(AppId(1), 2).build()).await;

    assert_eq!(registry.enqueue(vec![first]).await.enqueued, 1);
    let report = registry.enqueue(vec![second.clone()]).await;

    assert_eq!(report.skipped_busy, 1);
    assert_eq!(env.stored(second.id).await.state, DeliveryState::Pending);

    registry.stop().await?;
    Ok(())
}

#[tokio::test]
async fn stop_drains_every_runner() -> Result<()> {
    let env = TestEnv::with_apps([binary_app(1, 2), binary_app(2, 1)]).await;
    let registry = env.registry();
    registry.sync_from_store().await?;

    let notifications = env
        .insert_all(
            (1..=4)
                .map(|seed| NotificationBuilder::apns(AppId(1), seed).build())
                .chain((5..=6).map(|seed| NotificationBuilder::apns(AppId(2), seed).build())),
        )
        .await;
    registry.enqueue(notifications.clone()).await;

    registry.stop().await?;

    for notification in &notifications {
        assert_eq!(env.stored(notification.id).await.state, DeliveryState::Delivered);
    }
    assert_eq!(registry.num_queued().await, 0);
    assert_eq!(registry.num_dispatchers().await, 0);
    Ok(())
}

#[tokio::test]
async fn delivered_events_follow_enqueue() -> Result<()> {
    let env = TestEnv::with_apps([binary_app(1, 1)]).await;
    let registry = env.registry();
    let notification = env.insert(NotificationBuilder::apns(AppId(1), 1).build()).await;

    registry.enqueue(vec![notification]).await;
    let delivered = env.events.wait_for("notification_delivered", 1).await?;

    assert!(matches!(&delivered[0], PushEvent::NotificationDelivered { app_id: AppId(1), .. }));
    registry.stop().await?;
    Ok(())
}
