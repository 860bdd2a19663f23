//! Builders for apps and notifications.

use chrono::{DateTime, Utc};
use pushd_core::{App, AppId, Environment, Notification, Protocol};
use serde_json::Value;

/// Server key given to GCM test apps.
pub const TEST_AUTH_KEY: &str = "test-server-key";

/// Deterministic 32-byte device token, hex-encoded.
pub fn token(seed: u8) -> String {
    hex::encode([seed; 32])
}

/// Binary-protocol app pointed at `gateway` (`host:port`).
pub fn apns_app(id: u64, gateway: impl Into<String>) -> App {
    let mut app = App::new(AppId(id), format!("apns-{id}"), Protocol::Apns);
    app.environment = Environment::Sandbox;
    app.gateway = Some(gateway.into());
    app
}

/// HTTP/2 app pointed at `base_url`.
pub fn apns2_app(id: u64, base_url: impl Into<String>) -> App {
    let mut app = App::new(AppId(id), format!("apns2-{id}"), Protocol::Apns2);
    app.environment = Environment::Sandbox;
    app.bundle_id = Some("com.example.pushd".to_string());
    app.gateway = Some(base_url.into());
    app
}

/// GCM app posting to `url`, with [`TEST_AUTH_KEY`].
pub fn gcm_app(id: u64, url: impl Into<String>) -> App {
    let mut app = App::new(AppId(id), format!("gcm-{id}"), Protocol::Gcm);
    app.auth_key = Some(TEST_AUTH_KEY.to_string());
    app.gateway = Some(url.into());
    app
}

/// Builder for test notifications.
#[derive(Debug, Clone)]
pub struct NotificationBuilder {
    notification: Notification,
}

impl NotificationBuilder {
    /// Starts an empty notification for `app_id`.
    pub fn new(app_id: AppId) -> Self {
        Self { notification: Notification::new(app_id) }
    }

    /// Device-token notification with an alert.
    pub fn apns(app_id: AppId, seed: u8) -> Self {
        Self::new(app_id).device_token(token(seed)).alert("hello")
    }

    /// Registration-id notification with a data payload.
    pub fn gcm<I, S>(app_id: AppId, registration_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(app_id)
            .registration_ids(registration_ids)
            .data(serde_json::json!({ "message": "hello" }))
    }

    /// Sets the device token.
    pub fn device_token(mut self, token: impl Into<String>) -> Self {
        self.notification.device_token = Some(token.into());
        self
    }

    /// Sets the registration ids.
    pub fn registration_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.notification.registration_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Sets a plain-text alert.
    pub fn alert(mut self, alert: impl Into<String>) -> Self {
        self.notification.alert = Some(Value::String(alert.into()));
        self
    }

    /// Sets the badge.
    pub fn badge(mut self, badge: u32) -> Self {
        self.notification.badge = Some(badge);
        self
    }

    /// Sets the sound.
    pub fn sound(mut self, sound: impl Into<String>) -> Self {
        self.notification.sound = Some(sound.into());
        self
    }

    /// Sets custom data.
    pub fn data(mut self, data: Value) -> Self {
        self.notification.data = Some(data);
        self
    }

    /// Sets the collapse key.
    pub fn collapse_key(mut self, key: impl Into<String>) -> Self {
        self.notification.collapse_key = Some(key.into());
        self
    }

    /// Sets the expiry.
    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.notification.expires_at = Some(at);
        self
    }

    /// Sets the priority.
    pub fn priority(mut self, priority: u8) -> Self {
        self.notification.priority = Some(priority);
        self
    }

    /// Sets the retry count.
    pub fn retries(mut self, retries: u32) -> Self {
        self.notification.retries = retries;
        self
    }

    /// Defers the notification until `at`.
    pub fn deliver_after(mut self, at: DateTime<Utc>) -> Self {
        self.notification.deliver_after = Some(at);
        self
    }

    /// Finishes the notification. The id stays zero until storage assigns
    /// one.
    pub fn build(self) -> Notification {
        self.notification
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_32_bytes_of_hex() {
        assert_eq!(token(1).len(), 64);
        assert_eq!(hex::decode(token(7)).unwrap(), vec![7; 32]);
    }

    #[test]
    fn apps_point_at_their_gateway() {
        assert_eq!(apns_app(1, "127.0.0.1:2195").gateway_endpoint(), "127.0.0.1:2195");
        assert_eq!(gcm_app(2, "http://localhost/gcm").auth_key.as_deref(), Some(TEST_AUTH_KEY));
        assert_eq!(apns2_app(3, "http://localhost").protocol, Protocol::Apns2);
    }
}
