//! Device session data model.
//!
//! These types describe the state shared between the transport, the
//! command/telemetry bus and the provisioning state machine:
//! - Device sessions and the endpoints used to reach them
//! - Commands issued by plugins and replies from the device
//! - Telemetry events streamed by the device
//! - Connectivity and provisioning state enums

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier reported by the device in its hello frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name of a registered plugin. Commands keep one of these as a lookup-only
/// reference to their issuer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PluginId(pub String);

impl PluginId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Correlation id linking a command to the device reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(pub uuid::Uuid);

impl CommandId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How the device control endpoint is reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Endpoint {
    /// The device is reachable on the current network.
    Direct { url: String },

    /// The device is its own access point; the host must join `ssid` before
    /// `url` becomes addressable.
    Captive {
        ssid: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passphrase: Option<String>,
        url: String,
    },
}

impl Endpoint {
    pub fn direct(url: impl Into<String>) -> Self {
        Endpoint::Direct { url: url.into() }
    }

    pub fn captive(ssid: impl Into<String>, url: impl Into<String>) -> Self {
        Endpoint::Captive {
            ssid: ssid.into(),
            passphrase: None,
            url: url.into(),
        }
    }

    /// Control endpoint URL.
    pub fn url(&self) -> &str {
        match self {
            Endpoint::Direct { url } | Endpoint::Captive { url, .. } => url,
        }
    }

    /// SSID of the portal network that must be joined first, if any.
    pub fn portal_ssid(&self) -> Option<&str> {
        match self {
            Endpoint::Direct { .. } => None,
            Endpoint::Captive { ssid, .. } => Some(ssid),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Direct { url } => write!(f, "{}", url),
            Endpoint::Captive { ssid, url, .. } => write!(f, "{} via AP '{}'", url, ssid),
        }
    }
}

/// Connectivity of the logical channel to the active device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ConnectionState {
    Disconnected,
    /// Joining the device's own access point.
    JoiningPortal,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Retries exhausted. Terminal until the user connects again.
    Unreachable,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Unreachable)
    }
}

/// Why provisioning ended up in `Faulted`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum FaultReason {
    /// No association reported within the join window.
    ProvisioningTimeout,
    /// The device reported that association failed.
    DeviceRejected { reason: String },
}

impl fmt::Display for FaultReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultReason::ProvisioningTimeout => write!(f, "provisioning timed out"),
            FaultReason::DeviceRejected { reason } => write!(f, "device rejected join: {}", reason),
        }
    }
}

/// Network-join lifecycle of the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ProvisioningState {
    Unconfigured,
    /// The device advertises a captive-portal network.
    ApMode { ssid: String },
    Scanning,
    Joining { ssid: String },
    Joined { ssid: String },
    Faulted { reason: FaultReason },
}

impl ProvisioningState {
    /// Short lowercase name used in logs and telemetry.
    pub fn name(&self) -> &'static str {
        match self {
            ProvisioningState::Unconfigured => "unconfigured",
            ProvisioningState::ApMode { .. } => "apMode",
            ProvisioningState::Scanning => "scanning",
            ProvisioningState::Joining { .. } => "joining",
            ProvisioningState::Joined { .. } => "joined",
            ProvisioningState::Faulted { .. } => "faulted",
        }
    }
}

impl Default for ProvisioningState {
    fn default() -> Self {
        ProvisioningState::Unconfigured
    }
}

/// A known device and how to reach it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSession {
    pub id: DeviceId,
    pub link: ConnectionState,
    pub endpoint: Endpoint,
    pub last_seen: DateTime<Utc>,
    /// Discovered through a captive-portal advertisement.
    #[serde(default)]
    pub via_portal: bool,
}

impl DeviceSession {
    pub fn new(id: DeviceId, endpoint: Endpoint) -> Self {
        Self {
            id,
            link: ConnectionState::Disconnected,
            via_portal: endpoint.portal_ssid().is_some(),
            endpoint,
            last_seen: Utc::now(),
        }
    }
}

/// An outbound command addressed to a device topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: CommandId,
    pub topic: String,
    pub payload: serde_json::Value,
    /// Issuing plugin; lookup only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<PluginId>,
}

impl Command {
    pub fn new(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: CommandId::generate(),
            topic: topic.into(),
            payload,
            issuer: None,
        }
    }

    pub fn with_issuer(mut self, issuer: PluginId) -> Self {
        self.issuer = Some(issuer);
        self
    }

    /// Capability tag addressed by this command (first topic segment).
    pub fn capability(&self) -> &str {
        self.topic.split('/').next().unwrap_or_default()
    }
}

/// Device reply to a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandReply {
    pub id: CommandId,
    pub ok: bool,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A device-reported state update on a topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEvent {
    pub topic: String,
    /// Monotonic per topic; used to detect drops and reordering.
    pub seq: u64,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

impl TelemetryEvent {
    pub fn new(topic: impl Into<String>, seq: u64, payload: serde_json::Value) -> Self {
        Self {
            topic: topic.into(),
            seq,
            payload,
            received_at: Utc::now(),
        }
    }
}

/// Topics produced by the host itself rather than the device.
pub mod topics {
    /// Connectivity state changes of the transport.
    pub const LINK_STATE: &str = "link/state";
    /// Captive-portal advertisements seen by the portal detector.
    pub const PORTAL_ADVERTISED: &str = "portal/advertised";
    /// Provisioning state mirror.
    pub const PROVISIONING_STATE: &str = "provisioning/state";
    /// Station association reports from the device.
    pub const WIFI_STA: &str = "wifi/sta";
    /// Network scan results from the device.
    pub const WIFI_SCAN_RESULTS: &str = "wifi/networks";
}
