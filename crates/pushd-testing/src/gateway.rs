//! In-memory binary gateway.
//!
//! [`FakeGateway`] is a [`Connector`] whose connections are
//! `tokio::io::duplex` pipes served by a spawned task. The task decodes every
//! command-2 frame it receives and records it. Scripted rules make it answer
//! like the real gateway: reject a frame identifier with an error tuple and
//! hang up, or hang up silently.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use pushd_delivery::{
    connection::{BoxedStream, Connector},
    protocol::frame::{ErrorTuple, FRAME_COMMAND},
    DeliveryError,
};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tracing::debug;

const PIPE_CAPACITY: usize = 64 * 1024;

/// A decoded notification frame as the gateway received it.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedFrame {
    /// Connection the frame arrived on, counted from 1.
    pub connection: usize,
    /// Hex-encoded device token.
    pub device_token: String,
    /// Decoded JSON payload.
    pub payload: Value,
    /// Frame identifier.
    pub identifier: u32,
    /// Expiry, epoch seconds.
    pub expiry: u32,
    /// Priority.
    pub priority: u8,
}

#[derive(Debug, Default)]
struct Script {
    rejections: HashMap<u32, u8>,
    hang_ups: VecDeque<usize>,
    failed_connects: usize,
}

#[derive(Debug, Default)]
struct Shared {
    frames: Mutex<Vec<ReceivedFrame>>,
    script: Mutex<Script>,
    connections: AtomicUsize,
}

/// Scriptable fake of the binary push gateway.
#[derive(Debug, Clone, Default)]
pub struct FakeGateway {
    shared: Arc<Shared>,
}

impl FakeGateway {
    /// Creates a gateway that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects the next frame carrying `identifier` with `status`.
    pub fn reject(&self, identifier: u32, status: u8) -> &Self {
        self.script().rejections.insert(identifier, status);
        self
    }

    /// Closes the next connection without an error tuple after it has
    /// received `frames` frames.
    pub fn hang_up_after(&self, frames: usize) -> &Self {
        self.script().hang_ups.push_back(frames);
        self
    }

    /// Refuses the next `count` connection attempts.
    pub fn refuse_connections(&self, count: usize) -> &Self {
        self.script().failed_connects += count;
        self
    }

    /// Frames received so far, across every connection.
    pub fn frames(&self) -> Vec<ReceivedFrame> {
        self.shared.frames.lock().map(|frames| frames.clone()).unwrap_or_default()
    }

    /// Identifiers received so far, in arrival order.
    pub fn identifiers(&self) -> Vec<u32> {
        self.frames().iter().map(|frame| frame.identifier).collect()
    }

    /// Connections opened so far.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        match self.shared.script.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl Connector for FakeGateway {
    async fn connect(&self, endpoint: &str) -> pushd_delivery::Result<BoxedStream> {
        let hang_up_after = {
            let mut script = self.script();
            if script.failed_connects > 0 {
                script.failed_connects -= 1;
                return Err(DeliveryError::transport(format!("connect to {endpoint}: refused")));
            }
            script.hang_ups.pop_front()
        };

        let connection = self.shared.connections.fetch_add(1, Ordering::SeqCst) + 1;
        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        tokio::spawn(serve(self.shared.clone(), server, connection, hang_up_after));

        Ok(Box::new(client))
    }
}

async fn serve(
    shared: Arc<Shared>,
    mut socket: DuplexStream,
    connection: usize,
    hang_up_after: Option<usize>,
) {
    let mut received = 0;

    loop {
        if hang_up_after.is_some_and(|limit| received >= limit) {
            debug!(connection, "fake gateway hanging up");
            return;
        }

        let Some(frame) = read_frame(&mut socket, connection).await else {
            return;
        };
        received += 1;
        let identifier = frame.identifier;

        if let Ok(mut frames) = shared.frames.lock() {
            frames.push(frame);
        }

        let rejection = shared.script.lock().ok().and_then(|mut s| s.rejections.remove(&identifier));
        if let Some(status) = rejection {
            debug!(connection, identifier, status, "fake gateway rejecting frame");
            let _ = socket.write_all(&ErrorTuple::new(status, identifier).encode()).await;
            let _ = socket.flush().await;
            return;
        }
    }
}

async fn read_frame(socket: &mut DuplexStream, connection: usize) -> Option<ReceivedFrame> {
    let command = socket.read_u8().await.ok()?;
    if command != FRAME_COMMAND {
        return None;
    }
    let length = socket.read_u32().await.ok()?;
    let mut body = vec![0_u8; usize::try_from(length).ok()?];
    socket.read_exact(&mut body).await.ok()?;

    decode_items(Bytes::from(body), connection)
}

fn decode_items(mut body: Bytes, connection: usize) -> Option<ReceivedFrame> {
    let mut frame = ReceivedFrame {
        connection,
        device_token: String::new(),
        payload: Value::Null,
        identifier: 0,
        expiry: 0,
        priority: 0,
    };

    while body.remaining() >= 3 {
        let item = body.get_u8();
        let length = usize::from(body.get_u16());
        if body.remaining() < length {
            return None;
        }
        let mut data = body.split_to(length);

        match item {
            1 => frame.device_token = hex::encode(&data),
            2 => frame.payload = serde_json::from_slice(&data).ok()?,
            3 if length == 4 => frame.identifier = data.get_u32(),
            4 if length == 4 => frame.expiry = data.get_u32(),
            5 if length == 1 => frame.priority = data.get_u8(),
            _ => {},
        }
    }

    Some(frame)
}
