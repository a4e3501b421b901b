//! Frame types exchanged with the device control endpoint.
//!
//! This module defines all frames carried over the control channel:
//! - Device → Host: Hello, Event, Reply
//! - Host → Device: Hello, Request
//!
//! Frames are serialized as JSON objects tagged by `type` and carried in
//! WebSocket text frames.

use serde::{Deserialize, Serialize};

use devlink_core::{Command, CommandId, CommandReply, DeviceId};

/// Protocol version announced in the host hello.
pub const PROTOCOL_VERSION: u32 = 1;

// ============================================================================
// Device → Host
// ============================================================================

/// Hello frame sent by the device immediately after the channel opens.
///
/// # Example
/// ```json
/// { "type": "hello", "deviceId": "esp32m-1a2b3c", "name": "garage", "firmware": "1.4.2" }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceHello {
    pub device_id: DeviceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware: Option<String>,
}

/// Telemetry event frame.
///
/// # Example
/// ```json
/// { "type": "event", "topic": "wifi/rssi", "seq": 42, "payload": { "rssi": -61 } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    pub topic: String,
    pub seq: u64,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Reply to a host request, correlated by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyFrame {
    pub id: CommandId,
    pub ok: bool,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<ReplyFrame> for CommandReply {
    fn from(frame: ReplyFrame) -> Self {
        CommandReply {
            id: frame.id,
            ok: frame.ok,
            payload: frame.payload,
            error: frame.error,
        }
    }
}

/// Frames the device sends to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DeviceFrame {
    Hello(DeviceHello),
    Event(EventFrame),
    Reply(ReplyFrame),
}

// ============================================================================
// Host → Device
// ============================================================================

/// Hello frame sent by the host after the channel opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostHello {
    pub client: String,
    pub version: u32,
}

impl HostHello {
    pub fn new(client: impl Into<String>) -> Self {
        Self {
            client: client.into(),
            version: PROTOCOL_VERSION,
        }
    }
}

/// Command request addressed to a device topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: CommandId,
    pub topic: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl From<&Command> for RequestFrame {
    fn from(cmd: &Command) -> Self {
        RequestFrame {
            id: cmd.id,
            topic: cmd.topic.clone(),
            payload: cmd.payload.clone(),
        }
    }
}

/// Frames the host sends to the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HostFrame {
    Hello(HostHello),
    Request(RequestFrame),
}
