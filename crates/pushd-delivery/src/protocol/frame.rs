//! Binary gateway wire format.
//!
//! Notifications are written as command-2 frames:
//!
//! ```text
//! ┌─────────┬──────────────┬──────────────────────────────────────┐
//! │ cmd (2) │ len: u32 BE  │ items: (id: u8, len: u16 BE, data)*  │
//! └─────────┴──────────────┴──────────────────────────────────────┘
//!
//!   item 1  device token   32 bytes
//!   item 2  payload        JSON
//!   item 3  identifier     u32 BE
//!   item 4  expiry         u32 BE, epoch seconds (0: do not store)
//!   item 5  priority       u8
//! ```
//!
//! On failure the gateway answers with a 6-byte error tuple
//! `(command: u8, status: u8, identifier: u32 BE)` and closes the socket.

use bytes::{BufMut, Bytes, BytesMut};
use pushd_core::Notification;
use serde_json::{json, Map, Value};

use crate::error::{DeliveryError, Result};

/// Command byte of a notification frame.
pub const FRAME_COMMAND: u8 = 2;

/// Command byte of an error tuple.
pub const ERROR_COMMAND: u8 = 8;

/// Size of an error tuple in bytes.
pub const ERROR_TUPLE_BYTES: usize = 6;

/// Device token length in bytes.
pub const DEVICE_TOKEN_BYTES: usize = 32;

/// Priority used when a notification does not set one.
pub const DEFAULT_PRIORITY: u8 = 10;

const ITEM_DEVICE_TOKEN: u8 = 1;
const ITEM_PAYLOAD: u8 = 2;
const ITEM_IDENTIFIER: u8 = 3;
const ITEM_EXPIRY: u8 = 4;
const ITEM_PRIORITY: u8 = 5;

/// Error report returned by the binary gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorTuple {
    /// Command byte, always 8 from a conforming gateway.
    pub command: u8,
    /// Status code, see [`crate::status::apns_status_description`].
    pub status: u8,
    /// Frame identifier of the rejected notification.
    pub identifier: u32,
}

impl ErrorTuple {
    /// Creates an error tuple with the standard command byte.
    pub fn new(status: u8, identifier: u32) -> Self {
        Self { command: ERROR_COMMAND, status, identifier }
    }

    /// Decodes the wire representation.
    pub fn decode(bytes: [u8; ERROR_TUPLE_BYTES]) -> Self {
        Self {
            command: bytes[0],
            status: bytes[1],
            identifier: u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]),
        }
    }

    /// Encodes the wire representation.
    pub fn encode(&self) -> [u8; ERROR_TUPLE_BYTES] {
        let id = self.identifier.to_be_bytes();
        [self.command, self.status, id[0], id[1], id[2], id[3]]
    }
}

/// Builds the `{"aps": {...}, ...data}` payload shared by the APNs gateways.
pub fn aps_payload(notification: &Notification) -> Value {
    let mut aps = Map::new();
    if let Some(alert) = &notification.alert {
        aps.insert("alert".to_string(), alert.clone());
    }
    if let Some(badge) = notification.badge {
        aps.insert("badge".to_string(), json!(badge));
    }
    if let Some(sound) = &notification.sound {
        aps.insert("sound".to_string(), json!(sound));
    }
    if let Some(category) = &notification.category {
        aps.insert("category".to_string(), json!(category));
    }
    if notification.content_available {
        aps.insert("content-available".to_string(), json!(1));
    }

    let mut payload = Map::new();
    payload.insert("aps".to_string(), Value::Object(aps));

    // Custom data sits next to "aps" and cannot replace it.
    if let Some(Value::Object(data)) = &notification.data {
        for (key, value) in data {
            if key != "aps" {
                payload.insert(key.clone(), value.clone());
            }
        }
    }

    Value::Object(payload)
}

/// Binary frame encoding.
pub trait ToBinary {
    /// Encodes a command-2 frame.
    ///
    /// # Errors
    ///
    /// Returns a protocol error when the device token is missing or is not
    /// 32 hex-encoded bytes, or when an item does not fit its length field.
    fn to_binary(&self) -> Result<Bytes>;
}

impl ToBinary for Notification {
    fn to_binary(&self) -> Result<Bytes> {
        let token = self
            .device_token
            .as_deref()
            .ok_or_else(|| DeliveryError::protocol(format!("notification {} has no device token", self.id)))?;
        let token = hex::decode(token.trim()).map_err(|e| {
            DeliveryError::protocol(format!("notification {} device token: {e}", self.id))
        })?;
        if token.len() != DEVICE_TOKEN_BYTES {
            return Err(DeliveryError::protocol(format!(
                "notification {} device token is {} bytes, expected {DEVICE_TOKEN_BYTES}",
                self.id,
                token.len()
            )));
        }

        let payload = serde_json::to_vec(&aps_payload(self))
            .map_err(|e| DeliveryError::protocol(format!("notification {} payload: {e}", self.id)))?;
        let expiry = self
            .expires_at
            .map(|at| u32::try_from(at.timestamp().max(0)).unwrap_or(u32::MAX))
            .unwrap_or(0);
        let priority = self.priority.unwrap_or(DEFAULT_PRIORITY);

        let mut items = BytesMut::new();
        put_item(&mut items, ITEM_DEVICE_TOKEN, &token)?;
        put_item(&mut items, ITEM_PAYLOAD, &payload)?;
        put_item(&mut items, ITEM_IDENTIFIER, &self.id.frame_identifier().to_be_bytes())?;
        put_item(&mut items, ITEM_EXPIRY, &expiry.to_be_bytes())?;
        put_item(&mut items, ITEM_PRIORITY, &[priority])?;

        let length = u32::try_from(items.len())
            .map_err(|_| DeliveryError::protocol(format!("notification {} frame too large", self.id)))?;

        let mut frame = BytesMut::with_capacity(5 + items.len());
        frame.put_u8(FRAME_COMMAND);
        frame.put_u32(length);
        frame.extend_from_slice(&items);
        Ok(frame.freeze())
    }
}

fn put_item(buf: &mut BytesMut, id: u8, data: &[u8]) -> Result<()> {
    let length = u16::try_from(data.len())
        .map_err(|_| DeliveryError::protocol(format!("frame item {id} is {} bytes", data.len())))?;
    buf.put_u8(id);
    buf.put_u16(length);
    buf.extend_from_slice(data);
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use pushd_core::{AppId, NotificationId};

    use super::*;

    const TOKEN: &str = "a1b2c3d4e5f60718293a4b5c6d7e8f90a1b2c3d4e5f60718293a4b5c6d7e8f90";

    fn notification() -> Notification {
        let mut notification = Notification::new(AppId(1));
        notification.id = NotificationId(69);
        notification.device_token = Some(TOKEN.to_string());
        notification.alert = Some(json!("hi"));
        notification.badge = Some(3);
        notification
    }

    /// Splits a frame into `(item id, data)` pairs.
    fn items(frame: &[u8]) -> Vec<(u8, Vec<u8>)> {
        let mut items = Vec::new();
        let mut rest = &frame[5..];
        while !rest.is_empty() {
            let id = rest[0];
            let len = usize::from(u16::from_be_bytes([rest[1], rest[2]]));
            items.push((id, rest[3..3 + len].to_vec()));
            rest = &rest[3 + len..];
        }
        items
    }

    #[test]
    fn frame_header_counts_item_bytes() {
        let frame = notification().to_binary().unwrap();
        assert_eq!(frame[0], FRAME_COMMAND);
        let length = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]) as usize;
        assert_eq!(length, frame.len() - 5);
    }

    #[test]
    fn frame_carries_every_item() {
        let mut notification = notification();
        notification.expires_at = Some(Utc.timestamp_opt(1_700_000_000, 0).unwrap());
        notification.priority = Some(5);

        let frame = notification.to_binary().unwrap();
        let items = items(&frame);

        assert_eq!(items.iter().map(|(id, _)| *id).collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);
        assert_eq!(items[0].1, hex::decode(TOKEN).unwrap());
        let payload: Value = serde_json::from_slice(&items[1].1).unwrap();
        assert_eq!(payload["aps"]["alert"], "hi");
        assert_eq!(payload["aps"]["badge"], 3);
        assert_eq!(items[2].1, 69_u32.to_be_bytes());
        assert_eq!(items[3].1, 1_700_000_000_u32.to_be_bytes());
        assert_eq!(items[4].1, vec![5]);
    }

    #[test]
    fn custom_data_sits_beside_aps() {
        let mut notification = notification();
        notification.content_available = true;
        notification.data = Some(json!({"thread": "t1", "aps": "ignored"}));

        let payload = aps_payload(&notification);
        assert_eq!(payload["thread"], "t1");
        assert_eq!(payload["aps"]["content-available"], 1);
        assert_eq!(payload["aps"]["alert"], "hi");
    }

    #[test]
    fn short_device_token_is_rejected() {
        let mut notification = notification();
        notification.device_token = Some("abcd".to_string());
        assert!(matches!(notification.to_binary(), Err(DeliveryError::Protocol { .. })));
    }

    #[test]
    fn error_tuple_layout_is_big_endian() {
        let tuple = ErrorTuple::decode([8, 4, 0, 0, 0, 69]);
        assert_eq!(tuple, ErrorTuple::new(4, 69));
        assert_eq!(ErrorTuple::new(8, 0x0102_0304).encode(), [8, 8, 1, 2, 3, 4]);
    }
}
