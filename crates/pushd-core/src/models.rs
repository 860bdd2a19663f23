//! Core domain models and strongly-typed identifiers.
//!
//! Defines notifications, apps, and the newtype ID wrappers used throughout
//! the daemon. Notifications carry their own state transition logic so that
//! delivered and failed can never both be set.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Strongly-typed notification identifier.
///
/// Assigned by storage. The binary gateway protocol only carries 32 bits of
/// identifier, see [`NotificationId::frame_identifier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NotificationId(pub u64);

impl NotificationId {
    /// Returns the identifier as written into a binary frame.
    ///
    /// Only the low 32 bits survive the round trip through the gateway.
    pub fn frame_identifier(self) -> u32 {
        u32::try_from(self.0 & u64::from(u32::MAX)).unwrap_or_default()
    }
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for NotificationId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Strongly-typed app identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AppId(pub u64);

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for AppId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Gateway protocol family an app delivers through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// Pipelined binary frames over a TLS socket.
    Apns,
    /// JSON over HTTP/2, one request per notification.
    Apns2,
    /// JSON over HTTP, one request per notification carrying many recipients.
    Gcm,
}

impl Protocol {
    /// Whether notifications are delivered many-per-round-trip.
    ///
    /// Batching protocols receive one queue payload per group of
    /// notifications; the others receive one payload per notification.
    pub const fn batch_deliveries(self) -> bool {
        matches!(self, Self::Apns)
    }

    /// Returns the lowercase protocol name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Apns => "apns",
            Self::Apns2 => "apns2",
            Self::Gcm => "gcm",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gateway environment used to pick default hosts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    /// Live gateway.
    #[default]
    Production,
    /// Development gateway.
    Sandbox,
}

/// An application that owns notifications and gateway credentials.
///
/// Owned by storage. The daemon keeps a snapshot per runner and is told about
/// changes through `sync`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct App {
    /// Unique identifier.
    pub id: AppId,

    /// Human-readable name used in log lines.
    pub name: String,

    /// Gateway protocol family, selects the delivery adapter.
    pub protocol: Protocol,

    /// Number of concurrent gateway connections (dispatcher loops).
    #[serde(default = "default_connections")]
    pub connections: usize,

    /// Gateway environment.
    #[serde(default)]
    pub environment: Environment,

    /// PEM bundle holding the client certificate and private key.
    #[serde(default)]
    pub certificate: Option<String>,

    /// Server key for key-authenticated gateways.
    #[serde(default)]
    pub auth_key: Option<String>,

    /// Topic (bundle identifier) sent with HTTP/2 requests.
    #[serde(default)]
    pub bundle_id: Option<String>,

    /// Overrides the default gateway: `host:port` for socket gateways, a base
    /// URL for HTTP gateways.
    #[serde(default)]
    pub gateway: Option<String>,
}

fn default_connections() -> usize {
    1
}

impl App {
    /// Creates an app with one connection and no credentials.
    pub fn new(id: AppId, name: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            id,
            name: name.into(),
            protocol,
            connections: default_connections(),
            environment: Environment::default(),
            certificate: None,
            auth_key: None,
            bundle_id: None,
            gateway: None,
        }
    }

    /// Returns the gateway endpoint, falling back to the protocol default.
    pub fn gateway_endpoint(&self) -> String {
        if let Some(gateway) = &self.gateway {
            return gateway.clone();
        }

        let default = match (self.protocol, self.environment) {
            (Protocol::Apns, Environment::Production) => "gateway.push.apple.com:2195",
            (Protocol::Apns, Environment::Sandbox) => "gateway.sandbox.push.apple.com:2195",
            (Protocol::Apns2, Environment::Production) => "https://api.push.apple.com",
            (Protocol::Apns2, Environment::Sandbox) => "https://api.sandbox.push.apple.com",
            (Protocol::Gcm, _) => "https://android.googleapis.com/gcm/send",
        };
        default.to_string()
    }
}

/// Delivery state of a notification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Waiting for delivery or rescheduled for a retry.
    #[default]
    Pending,
    /// Accepted by the gateway.
    Delivered,
    /// Permanently failed.
    Failed,
}

/// An outbound push notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Unique identifier, assigned by storage.
    pub id: NotificationId,

    /// Owning app.
    pub app_id: AppId,

    /// Target device token (hex) for APNs-family gateways.
    pub device_token: Option<String>,

    /// Target registration ids for GCM-family gateways.
    pub registration_ids: Vec<String>,

    /// Alert text or dictionary.
    pub alert: Option<Value>,

    /// Badge count.
    pub badge: Option<u32>,

    /// Sound name.
    pub sound: Option<String>,

    /// Notification category.
    pub category: Option<String>,

    /// Whether to set the content-available flag.
    pub content_available: bool,

    /// Custom payload data.
    pub data: Option<Value>,

    /// Collapse key for GCM-family gateways.
    pub collapse_key: Option<String>,

    /// Whether GCM should hold the message until the device is active.
    pub delay_while_idle: bool,

    /// When the gateway may discard the notification.
    pub expires_at: Option<DateTime<Utc>>,

    /// Delivery priority (10 immediate, 5 power-conserving).
    pub priority: Option<u8>,

    /// Current delivery state.
    pub state: DeliveryState,

    /// When the gateway accepted the notification.
    pub delivered_at: Option<DateTime<Utc>>,

    /// When the notification permanently failed.
    pub failed_at: Option<DateTime<Utc>>,

    /// Gateway error code of the last failure.
    pub error_code: Option<i32>,

    /// Description of the last failure.
    pub error_description: Option<String>,

    /// Number of retries scheduled so far.
    pub retries: u32,

    /// Earliest time the notification is eligible for (re)delivery.
    pub deliver_after: Option<DateTime<Utc>>,

    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Notification {
    /// Creates an empty pending notification for an app.
    ///
    /// The id is left at zero until storage assigns one.
    pub fn new(app_id: AppId) -> Self {
        Self {
            id: NotificationId(0),
            app_id,
            device_token: None,
            registration_ids: Vec::new(),
            alert: None,
            badge: None,
            sound: None,
            category: None,
            content_available: false,
            data: None,
            collapse_key: None,
            delay_while_idle: false,
            expires_at: None,
            priority: None,
            state: DeliveryState::Pending,
            delivered_at: None,
            failed_at: None,
            error_code: None,
            error_description: None,
            retries: 0,
            deliver_after: None,
            created_at: Utc::now(),
        }
    }

    /// Whether the notification is pending and its retry window has passed.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.state == DeliveryState::Pending && self.deliver_after.is_none_or(|at| at <= now)
    }

    /// Human-readable recipient list for log lines.
    pub fn recipients(&self) -> String {
        match &self.device_token {
            Some(token) => token.clone(),
            None => self.registration_ids.join(", "),
        }
    }

    /// Transitions to delivered.
    pub fn mark_delivered(&mut self, at: DateTime<Utc>) {
        self.state = DeliveryState::Delivered;
        self.delivered_at = Some(at);
        self.failed_at = None;
    }

    /// Transitions to permanently failed.
    pub fn mark_failed(&mut self, at: DateTime<Utc>, code: Option<i32>, description: &str) {
        self.state = DeliveryState::Failed;
        self.delivered_at = None;
        self.failed_at = Some(at);
        self.error_code = code;
        self.error_description = Some(description.to_string());
    }

    /// Reschedules for a later attempt and counts the retry.
    pub fn mark_retryable(&mut self, deliver_after: DateTime<Utc>) {
        self.state = DeliveryState::Pending;
        self.delivered_at = None;
        self.failed_at = None;
        self.retries = self.retries.saturating_add(1);
        self.deliver_after = Some(deliver_after);
    }
}

/// Attributes copied onto a notification spawned to retry a subset of
/// recipients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationAttrs {
    /// Owning app.
    pub app_id: AppId,

    /// Collapse key of the original notification.
    pub collapse_key: Option<String>,

    /// Delay-while-idle flag of the original notification.
    pub delay_while_idle: bool,

    /// Original payload data.
    pub data: Option<Value>,

    /// Delivery attempts already spent on these recipients.
    pub retries: u32,
}

impl From<&Notification> for NotificationAttrs {
    fn from(notification: &Notification) -> Self {
        Self {
            app_id: notification.app_id,
            collapse_key: notification.collapse_key.clone(),
            delay_while_idle: notification.delay_while_idle,
            data: notification.data.clone(),
            retries: notification.retries,
        }
    }
}
