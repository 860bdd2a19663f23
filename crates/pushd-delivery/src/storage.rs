//! Storage abstraction consumed by the delivery core.
//!
//! Persistence is an external collaborator. The core only needs to fetch due
//! notifications, write back outcomes, spawn retry notifications for a subset
//! of GCM recipients, and look up apps. Tests and the bundled daemon use the
//! in-memory implementation in [`memory`].

use std::{future::Future, pin::Pin};

use chrono::{DateTime, Utc};
use pushd_core::{error::Result, App, AppId, Notification, NotificationAttrs};

/// Storage operations required by the delivery daemon.
pub trait NotificationStore: Send + Sync + 'static {
    /// Returns up to `limit` pending notifications whose `deliver_after`
    /// has passed, oldest first.
    ///
    /// Returned notifications are claimed: they are not returned again until
    /// a save has been attempted for them. A failed save still ends the
    /// claim, so the notification is fetched again on a later pass.
    fn notifications_ready_for_delivery(
        &self,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Notification>>> + Send + '_>>;

    /// Persists a notification's delivery state.
    ///
    /// With `validate` set the notification's content is checked before it
    /// is written. Outcome writes from the core skip validation.
    fn save(
        &self,
        notification: Notification,
        validate: bool,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Creates a notification carrying `registration_ids` and the copied
    /// attributes, eligible for delivery after `deliver_after`.
    fn create_notification(
        &self,
        attrs: NotificationAttrs,
        registration_ids: Vec<String>,
        deliver_after: Option<DateTime<Utc>>,
        app: App,
    ) -> Pin<Box<dyn Future<Output = Result<Notification>> + Send + '_>>;

    /// Returns every configured app.
    fn all_apps(&self) -> Pin<Box<dyn Future<Output = Result<Vec<App>>> + Send + '_>>;

    /// Looks up an app by id.
    fn app(&self, id: AppId) -> Pin<Box<dyn Future<Output = Result<App>> + Send + '_>>;
}

pub mod memory {
    //! In-memory notification store.
    //!
    //! Deterministic and process-local. Supports injecting fetch failures so
    //! callers can exercise their storage error paths.

    use std::{
        collections::{BTreeMap, HashMap, HashSet},
        future::Future,
        pin::Pin,
        sync::{
            atomic::{AtomicU64, AtomicUsize, Ordering},
            Arc,
        },
    };

    use chrono::{DateTime, Utc};
    use pushd_core::{
        error::Result, App, AppId, Clock, CoreError, Notification, NotificationAttrs,
        NotificationId, RealClock,
    };
    use tokio::sync::RwLock;

    use super::NotificationStore;

    /// In-memory storage for apps and notifications.
    #[derive(Debug)]
    pub struct MemoryStore {
        apps: Arc<RwLock<HashMap<AppId, App>>>,
        notifications: Arc<RwLock<BTreeMap<NotificationId, Notification>>>,
        claimed: Arc<RwLock<HashSet<NotificationId>>>,
        next_id: AtomicU64,
        saves: AtomicUsize,
        fetch_error: Arc<RwLock<Option<String>>>,
        save_error: Arc<RwLock<Option<String>>>,
        clock: Arc<dyn Clock>,
    }

    impl MemoryStore {
        /// Creates an empty store using the system clock.
        pub fn new() -> Self {
            Self::with_clock(Arc::new(RealClock::new()))
        }

        /// Creates an empty store that decides readiness with `clock`.
        pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
            Self {
                apps: Arc::new(RwLock::new(HashMap::new())),
                notifications: Arc::new(RwLock::new(BTreeMap::new())),
                claimed: Arc::new(RwLock::new(HashSet::new())),
                next_id: AtomicU64::new(1),
                saves: AtomicUsize::new(0),
                fetch_error: Arc::new(RwLock::new(None)),
                save_error: Arc::new(RwLock::new(None)),
                clock,
            }
        }

        /// Creates a store seeded with apps.
        pub async fn with_apps(apps: impl IntoIterator<Item = App>) -> Self {
            let store = Self::new();
            for app in apps {
                store.add_app(app).await;
            }
            store
        }

        /// Adds or replaces an app.
        pub async fn add_app(&self, app: App) {
            self.apps.write().await.insert(app.id, app);
        }

        /// Removes an app. Its notifications are kept.
        pub async fn remove_app(&self, id: AppId) -> Option<App> {
            self.apps.write().await.remove(&id)
        }

        /// Stores a new notification, assigning it the next id.
        pub async fn insert(&self, mut notification: Notification) -> Notification {
            notification.id = NotificationId(self.next_id.fetch_add(1, Ordering::SeqCst));
            self.notifications.write().await.insert(notification.id, notification.clone());
            notification
        }

        /// Returns the stored copy of a notification.
        pub async fn notification(&self, id: NotificationId) -> Option<Notification> {
            self.notifications.read().await.get(&id).cloned()
        }

        /// Returns every stored notification ordered by id.
        pub async fn notifications(&self) -> Vec<Notification> {
            self.notifications.read().await.values().cloned().collect()
        }

        /// Number of `save` calls served so far.
        pub fn save_count(&self) -> usize {
            self.saves.load(Ordering::SeqCst)
        }

        /// Makes the next ready-for-delivery fetch fail.
        pub async fn inject_fetch_error(&self, error: impl Into<String>) {
            *self.fetch_error.write().await = Some(error.into());
        }

        /// Makes the next save fail.
        pub async fn inject_save_error(&self, error: impl Into<String>) {
            *self.save_error.write().await = Some(error.into());
        }

        async fn persist(&self, notification: Notification, validate_first: bool) -> Result<()> {
            if let Some(error) = self.save_error.write().await.take() {
                return Err(CoreError::Storage(error));
            }
            if validate_first {
                validate(&notification)?;
            }

            let id = notification.id;
            let mut notifications = self.notifications.write().await;
            let stored =
                notifications.get_mut(&id).ok_or_else(|| CoreError::notification_not_found(id))?;
            *stored = notification;

            self.saves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl Default for MemoryStore {
        fn default() -> Self {
            Self::new()
        }
    }

    fn validate(notification: &Notification) -> Result<()> {
        if notification.device_token.is_none() && notification.registration_ids.is_empty() {
            return Err(CoreError::InvalidInput(format!(
                "notification {} has no recipients",
                notification.id
            )));
        }
        if let Some(token) = &notification.device_token {
            if hex::decode(token).is_err() {
                return Err(CoreError::InvalidInput(format!(
                    "notification {} has a malformed device token",
                    notification.id
                )));
            }
        }
        Ok(())
    }

    impl NotificationStore for MemoryStore {
        fn notifications_ready_for_delivery(
            &self,
            limit: usize,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<Notification>>> + Send + '_>> {
            Box::pin(async move {
                if let Some(error) = self.fetch_error.write().await.take() {
                    return Err(CoreError::Storage(error));
                }

                let now = self.clock.now_utc();
                let notifications = self.notifications.read().await;
                let mut claimed = self.claimed.write().await;

                let ready: Vec<Notification> = notifications
                    .values()
                    .filter(|n| n.is_ready(now) && !claimed.contains(&n.id))
                    .take(limit)
                    .cloned()
                    .collect();

                claimed.extend(ready.iter().map(|n| n.id));
                Ok(ready)
            })
        }

        fn save(
            &self,
            notification: Notification,
            validate_first: bool,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                let id = notification.id;
                let result = self.persist(notification, validate_first).await;
                self.claimed.write().await.remove(&id);
                result
            })
        }

        fn create_notification(
            &self,
            attrs: NotificationAttrs,
            registration_ids: Vec<String>,
            deliver_after: Option<DateTime<Utc>>,
            app: App,
        ) -> Pin<Box<dyn Future<Output = Result<Notification>> + Send + '_>> {
            Box::pin(async move {
                let mut notification = Notification::new(app.id);
                notification.collapse_key = attrs.collapse_key;
                notification.delay_while_idle = attrs.delay_while_idle;
                notification.data = attrs.data;
                notification.retries = attrs.retries;
                notification.registration_ids = registration_ids;
                notification.deliver_after = deliver_after;
                notification.created_at = self.clock.now_utc();

                validate(&notification)?;
                Ok(self.insert(notification).await)
            })
        }

        fn all_apps(&self) -> Pin<Box<dyn Future<Output = Result<Vec<App>>> + Send + '_>> {
            Box::pin(async move {
                let mut apps: Vec<App> = self.apps.read().await.values().cloned().collect();
                apps.sort_by_key(|app| app.id);
                Ok(apps)
            })
        }

        fn app(&self, id: AppId) -> Pin<Box<dyn Future<Output = Result<App>> + Send + '_>> {
            Box::pin(async move {
                self.apps.read().await.get(&id).cloned().ok_or_else(|| CoreError::app_not_found(id))
            })
        }
    }

}
