//! Push notification delivery core.
//!
//! Delivers stored notifications to push gateways through per-app pools of
//! persistent connections. Every app gets an [`AppRunner`] owning a queue
//! and one dispatcher loop per configured connection; each loop owns a
//! protocol adapter and its gateway connection.
//!
//! # Architecture
//!
//! ```text
//! ┌────────┐   ┌──────────────────┐   ┌───────────┐   ┌────────────────┐
//! │ Feeder │──▶│ AppRunnerRegistry│──▶│ AppRunner │──▶│ Queue          │
//! └────────┘   └──────────────────┘   └───────────┘   └────────────────┘
//!     │                                                   │ pop
//!     ▼                                                   ▼
//! ┌──────────────────┐                       ┌──────────────────────────┐
//! │ NotificationStore│◀── batch completion ──│ DispatcherLoop + adapter │
//! └──────────────────┘                       └──────────────────────────┘
//! ```
//!
//! 1. **Fetch** - the feeder claims due notifications from storage
//! 2. **Enqueue** - the registry routes them to their app's runner
//! 3. **Dispatch** - a loop pops a payload and the adapter talks to the
//!    gateway, recording an outcome on every notification
//! 4. **Complete** - the last processed payload of a batch persists every
//!    notification and publishes its lifecycle event
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use pushd_core::{App, AppId, NoOpEventHandler, Protocol};
//! use pushd_delivery::{
//!     storage::memory::MemoryStore, AppRunnerRegistry, DeliveryContext, Feeder, FeederConfig,
//!     RunnerConfig,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> pushd_delivery::Result<()> {
//! let store = Arc::new(MemoryStore::with_apps([App::new(AppId(1), "demo", Protocol::Gcm)]).await);
//! let ctx = DeliveryContext::new(store.clone(), Arc::new(NoOpEventHandler::new()));
//!
//! let registry = Arc::new(AppRunnerRegistry::new(ctx, RunnerConfig::default()));
//! registry.sync_from_store().await?;
//!
//! let feeder = Feeder::new(store, registry.clone(), FeederConfig::default());
//! feeder.run(CancellationToken::new()).await;
//! registry.stop().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod batch;
pub mod client;
pub mod connection;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod feeder;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod runner;
pub mod secs;
pub mod status;
pub mod storage;

pub use batch::{Batch, BatchId, Outcome};
pub use client::ClientConfig;
pub use connection::{ApnsConfig, BinaryConnection, Connector, TcpConnector, TlsConnector};
pub use context::DeliveryContext;
pub use dispatcher::{DispatcherLoop, DispatcherSnapshot};
pub use error::{DeliveryError, ErrorCategory, Result};
pub use feeder::{Feeder, FeederConfig};
pub use protocol::ProtocolDispatcher;
pub use queue::{Popped, Queue, QueuePayload};
pub use registry::{AppRunnerRegistry, EnqueueReport};
pub use retry::{RetryDecision, RetryPolicy};
pub use runner::{AppRunner, Enqueued, RunnerConfig, RunnerSnapshot};
pub use storage::NotificationStore;
