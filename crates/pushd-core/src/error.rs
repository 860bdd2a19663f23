//! Error types for storage-facing operations.
//!
//! Storage is an external collaborator; these variants describe what the
//! delivery core needs to know about its failures without depending on any
//! particular backend.

use thiserror::Error;

use crate::models::{AppId, NotificationId};

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for storage and model operations.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Backend storage operation failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Entity not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid input or model state.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl CoreError {
    /// Creates a not-found error for an app.
    pub fn app_not_found(id: AppId) -> Self {
        Self::NotFound(format!("app {id}"))
    }

    /// Creates a not-found error for a notification.
    pub fn notification_not_found(id: NotificationId) -> Self {
        Self::NotFound(format!("notification {id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_messages_name_the_entity() {
        assert_eq!(CoreError::app_not_found(AppId(7)).to_string(), "not found: app 7");
        assert_eq!(
            CoreError::notification_not_found(NotificationId(42)).to_string(),
            "not found: notification 42"
        );
    }
}
