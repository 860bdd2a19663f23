//! Core domain models and lifecycle events.
//!
//! Provides the notification and app models shared by the delivery daemon,
//! the event vocabulary published as notifications move through delivery,
//! and the clock abstraction used for deterministic retry scheduling.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod models;
pub mod time;

pub use error::{CoreError, Result};
pub use events::{
    EventHandler, MulticastEventHandler, NoOpEventHandler, PushEvent, SpawningEventHandler,
    TracingEventHandler,
};
pub use models::{
    App, AppId, DeliveryState, Environment, Notification, NotificationAttrs, NotificationId,
    Protocol,
};
pub use time::{Clock, RealClock, TestClock};
