//! Control channel codec.
//!
//! Frames travel as JSON in WebSocket text frames. The transport treats this
//! module as its only view of the wire format.

use crate::messages::{DeviceFrame, HostFrame};
use thiserror::Error;

/// Upper bound on an inbound frame; larger frames are rejected unparsed.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    /// JSON (de)serialization failed.
    #[error("Malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    /// Received binary frame instead of text.
    #[error("Expected text frame, received binary")]
    BinaryFrame,

    /// Frame exceeds [`MAX_FRAME_BYTES`].
    #[error("Frame of {0} bytes exceeds limit")]
    TooLarge(usize),
}

/// Encode a host frame for transmission.
pub fn encode_host_frame(frame: &HostFrame) -> Result<String, CodecError> {
    serde_json::to_string(frame).map_err(CodecError::from)
}

/// Decode a frame received from the device.
pub fn decode_device_frame(text: &str) -> Result<DeviceFrame, CodecError> {
    if text.len() > MAX_FRAME_BYTES {
        return Err(CodecError::TooLarge(text.len()));
    }
    serde_json::from_str(text).map_err(CodecError::from)
}

/// Encode a device frame. Used by device simulators and tests.
pub fn encode_device_frame(frame: &DeviceFrame) -> Result<String, CodecError> {
    serde_json::to_string(frame).map_err(CodecError::from)
}

/// Decode a host frame. Used by device simulators and tests.
pub fn decode_host_frame(text: &str) -> Result<HostFrame, CodecError> {
    serde_json::from_str(text).map_err(CodecError::from)
}
