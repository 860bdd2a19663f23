//! Gateway protocol adapters.
//!
//! Every adapter takes a batch plus the positions it should deliver and
//! leaves each of those notifications delivered, failed, or rescheduled
//! before returning. Errors are returned only after outcomes are recorded;
//! they exist so the dispatcher loop can log them.

pub mod apns;
pub mod apns2;
pub mod frame;
pub mod gcm;

use std::sync::Arc;

use pushd_core::{App, Protocol};

pub use self::{apns::ApnsDispatcher, apns2::Apns2Dispatcher, gcm::GcmDispatcher};
use crate::{context::DeliveryContext, error::Result, queue::QueuePayload};

/// One adapter instance with its own connection, selected by the app's
/// protocol.
#[derive(Debug)]
pub enum ProtocolDispatcher {
    /// Pipelined binary frames over TLS.
    Apns(ApnsDispatcher),
    /// JSON over HTTP/2.
    Apns2(Apns2Dispatcher),
    /// Multicast JSON over HTTP.
    Gcm(GcmDispatcher),
}

impl ProtocolDispatcher {
    /// Builds and connects the adapter for `app`.
    ///
    /// # Errors
    ///
    /// Returns configuration errors for missing or malformed credentials and
    /// transport errors when the gateway cannot be reached.
    pub async fn for_app(app: Arc<App>, ctx: DeliveryContext, name: String) -> Result<Self> {
        match app.protocol {
            Protocol::Apns => Ok(Self::Apns(ApnsDispatcher::connect(app, ctx, name).await?)),
            Protocol::Apns2 => Ok(Self::Apns2(Apns2Dispatcher::new(app, ctx, name)?)),
            Protocol::Gcm => Ok(Self::Gcm(GcmDispatcher::new(app, ctx, name)?)),
        }
    }

    /// Protocol spoken by this adapter.
    pub fn protocol(&self) -> Protocol {
        match self {
            Self::Apns(_) => Protocol::Apns,
            Self::Apns2(_) => Protocol::Apns2,
            Self::Gcm(_) => Protocol::Gcm,
        }
    }

    /// Delivers the notifications a payload covers.
    pub async fn dispatch(&mut self, payload: &QueuePayload) -> Result<()> {
        let batch = payload.batch();
        let indices = payload.indices();

        match self {
            Self::Apns(dispatcher) => dispatcher.perform(batch, &indices).await,
            Self::Apns2(dispatcher) => dispatcher.perform(batch, &indices).await,
            Self::Gcm(dispatcher) => dispatcher.perform(batch, &indices).await,
        }
    }

    /// Releases the adapter's connection.
    pub async fn close(&mut self) {
        match self {
            Self::Apns(dispatcher) => dispatcher.close().await,
            Self::Apns2(_) | Self::Gcm(_) => {},
        }
    }
}
