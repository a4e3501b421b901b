//! Error types for the runtime.

use devlink_core::{PatternError, PluginId, SchemaViolation};
use devlink_protocol::CodecError;
use thiserror::Error;

/// Failures at the device control channel.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connect to {url} timed out")]
    ConnectTimeout { url: String },

    #[error("Connection to {url} refused")]
    ConnectRefused { url: String },

    #[error("No channel to the device is open")]
    NotConnected,

    #[error("Outbound queue is full")]
    QueueFull,

    #[error("No reply to '{topic}' within {timeout_ms} ms")]
    ReplyTimeout { topic: String, timeout_ms: u64 },

    /// Superseded by a session switch or disconnect.
    #[error("Operation cancelled by session change")]
    Cancelled,

    #[error("Joining portal network '{ssid}' failed: {message}")]
    PortalJoin { ssid: String, message: String },

    #[error("Portal scan failed: {0}")]
    PortalScan(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Failures of bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    #[error(transparent)]
    SchemaViolation(#[from] SchemaViolation),

    #[error(transparent)]
    Pattern(#[from] PatternError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The device answered with `ok: false`.
    #[error("Device rejected '{topic}': {reason}")]
    Rejected { topic: String, reason: String },

    /// The topic belongs to the provisioning state machine.
    #[error("Topic '{topic}' is reserved for provisioning")]
    Reserved { topic: String },

    /// A plugin subscribed outside the topics its descriptor declares.
    #[error("Plugin '{plugin}' did not declare topic pattern '{pattern}'")]
    UndeclaredTopic { plugin: PluginId, pattern: String },
}

/// Failures of plugin registration and lifecycle.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Capability '{capability}' already claimed by '{owner}'")]
    DuplicateCapability { capability: String, owner: PluginId },

    #[error("Plugin '{0}' is already registered")]
    DuplicatePlugin(PluginId),

    #[error("Plugins cannot be activated before the shell has started")]
    ShellNotStarted,

    #[error("Registry has been disposed")]
    Disposed,
}

/// Failures of provisioning actions.
#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("Cannot {action} while {state}")]
    InvalidTransition { state: &'static str, action: &'static str },

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Failures while starting the shell.
#[derive(Debug, Error)]
pub enum ShellError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Pattern(#[from] PatternError),
}
