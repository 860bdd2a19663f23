//! Error types for push delivery operations.
//!
//! Separates faults the gateway classified (a status code and description,
//! possibly naming a notification) from transport faults, malformed
//! responses, and configuration problems. Adapters record a terminal state
//! on every affected notification before returning any of these.

use std::{fmt, time::Duration};

use pushd_core::{CoreError, NotificationId};
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Error taxonomy for push delivery.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Connection refused or reset, TLS handshake failure, or I/O fault.
    #[error("transport error: {message}")]
    Transport {
        /// Description of the transport fault.
        message: String,
    },

    /// The gateway classified the delivery as failed.
    #[error("{}", describe_gateway(*code, description, *notification_id))]
    Gateway {
        /// Gateway status or error code.
        code: Option<i32>,
        /// Human-readable description of the failure.
        description: String,
        /// Notification the gateway named, when it named one.
        notification_id: Option<NotificationId>,
    },

    /// The gateway closed the connection without returning an error.
    #[error(
        "the gateway disconnected without returning an error, this may indicate an invalid \
         certificate for the host"
    )]
    Disconnected,

    /// The gateway response did not have the expected shape.
    #[error("unexpected gateway response: {message}")]
    Protocol {
        /// Description of the violation.
        message: String,
    },

    /// An app or client could not be configured.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// The storage collaborator failed.
    #[error(transparent)]
    Storage(#[from] CoreError),

    /// A runner did not drain before its shutdown deadline.
    #[error("shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// The deadline that elapsed.
        timeout: Duration,
    },
}

fn describe_gateway(
    code: Option<i32>,
    description: &str,
    notification_id: Option<NotificationId>,
) -> String {
    match (notification_id, code) {
        (Some(id), Some(code)) => {
            format!("Unable to deliver notification {id}, received error {code} ({description})")
        },
        (Some(id), None) => format!("Unable to deliver notification {id}, {description}"),
        (None, Some(code)) => format!("gateway error {code}: {description}"),
        (None, None) => format!("gateway error: {description}"),
    }
}

impl DeliveryError {
    /// Creates a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport { message: message.into() }
    }

    /// Creates a gateway-classified error.
    pub fn gateway(
        code: Option<i32>,
        description: impl Into<String>,
        notification_id: Option<NotificationId>,
    ) -> Self {
        Self::Gateway { code, description: description.into(), notification_id }
    }

    /// Creates a protocol violation error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Whether the fault is eligible for a reconnect-and-retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::Storage(_) => true,

            Self::Gateway { .. }
            | Self::Disconnected
            | Self::Protocol { .. }
            | Self::Configuration { .. }
            | Self::ShutdownTimeout { .. } => false,
        }
    }

    /// Whether the fault came from a classified gateway response.
    ///
    /// Classified errors have already been recorded on the notification by
    /// the adapter; the dispatcher loop only logs them.
    pub fn is_classified(&self) -> bool {
        matches!(self, Self::Gateway { .. } | Self::Disconnected)
    }

    /// Gateway error code, if any.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Gateway { code, .. } => *code,
            _ => None,
        }
    }

    /// Description suitable for `error_description`.
    pub fn description(&self) -> String {
        match self {
            Self::Gateway { description, .. } => description.clone(),
            other => other.to_string(),
        }
    }
}

impl From<std::io::Error> for DeliveryError {
    fn from(error: std::io::Error) -> Self {
        Self::transport(error.to_string())
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_builder() {
            return Self::configuration(error.to_string());
        }
        if error.is_decode() {
            return Self::protocol(error.to_string());
        }
        Self::transport(error.to_string())
    }
}

/// Category of delivery error for log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Connectivity issues.
    Transport,
    /// Gateway-classified failures.
    Gateway,
    /// Malformed responses.
    Protocol,
    /// Configuration problems.
    Configuration,
    /// Storage failures.
    Storage,
    /// Shutdown problems.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::Transport { .. } => Self::Transport,
            DeliveryError::Gateway { .. } | DeliveryError::Disconnected => Self::Gateway,
            DeliveryError::Protocol { .. } => Self::Protocol,
            DeliveryError::Configuration { .. } => Self::Configuration,
            DeliveryError::Storage(_) => Self::Storage,
            DeliveryError::ShutdownTimeout { .. } => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport => write!(f, "transport"),
            Self::Gateway => write!(f, "gateway"),
            Self::Protocol => write!(f, "protocol"),
            Self::Configuration => write!(f, "configuration"),
            Self::Storage => write!(f, "storage"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors_identified_correctly() {
        assert!(DeliveryError::transport("connection reset").is_retryable());
        assert!(DeliveryError::Storage(CoreError::Storage("lost".into())).is_retryable());

        assert!(!DeliveryError::gateway(Some(8), "Invalid token", None).is_retryable());
        assert!(!DeliveryError::Disconnected.is_retryable());
        assert!(!DeliveryError::protocol("bad json").is_retryable());
        assert!(!DeliveryError::configuration("no certificate").is_retryable());
    }

    #[test]
    fn gateway_display_names_notification() {
        let error = DeliveryError::gateway(Some(4), "Missing payload", Some(NotificationId(69)));
        assert_eq!(
            error.to_string(),
            "Unable to deliver notification 69, received error 4 (Missing payload)"
        );
        assert_eq!(error.code(), Some(4));
        assert_eq!(error.description(), "Missing payload");
    }

    #[test]
    fn only_gateway_errors_are_classified() {
        assert!(DeliveryError::gateway(None, "x", None).is_classified());
        assert!(DeliveryError::Disconnected.is_classified());
        assert!(!DeliveryError::transport("x").is_classified());
    }

    #[test]
    fn io_errors_become_transport_errors() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let error = DeliveryError::from(io);
        assert_eq!(ErrorCategory::from(&error), ErrorCategory::Transport);
        assert_eq!(error.to_string(), "transport error: reset by peer");
    }
}
