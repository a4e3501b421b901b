//! Runtime configuration.
//!
//! All durations are stored in milliseconds so the JSON file stays plain.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use devlink_core::ConfigError;

use crate::backoff::ReconnectBackoff;

/// Top-level runtime configuration, loaded from `devlink.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DevlinkConfig {
    pub transport: TransportConfig,
    pub bus: BusConfig,
    pub provisioning: ProvisioningConfig,
    pub session: SessionConfig,
}

impl DevlinkConfig {
    /// Parse a configuration document. Missing fields take defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::InvalidData(e.to_string()))
    }

    /// Load configuration from `path`, or defaults if the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(json) => Self::from_json_str(&json),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(ConfigError::ReadError(format!("{}: {}", path.display(), e))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TransportConfig {
    /// Client name sent in the host hello.
    pub client_name: String,
    /// Covers TCP connect, WebSocket upgrade and the device hello.
    pub connect_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// No inbound traffic for this long counts as link loss.
    pub idle_timeout_ms: u64,
    pub reply_timeout_ms: u64,
    pub outbound_queue: usize,
    pub backoff: ReconnectBackoff,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            client_name: "devlink".to_string(),
            connect_timeout_ms: 5_000,
            heartbeat_interval_ms: 10_000,
            idle_timeout_ms: 30_000,
            reply_timeout_ms: 5_000,
            outbound_queue: 64,
            backoff: ReconnectBackoff::default(),
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BusConfig {
    /// Events buffered per topic for each subscriber before the oldest is dropped.
    pub subscriber_buffer: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProvisioningConfig {
    pub join_timeout_ms: u64,
    /// SSID prefix that identifies a device's own access point.
    pub portal_ssid_prefix: String,
    pub portal_passphrase: Option<String>,
    /// Control endpoint address while joined to the device AP.
    pub portal_url: String,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            join_timeout_ms: 30_000,
            portal_ssid_prefix: "esp32m-".to_string(),
            portal_passphrase: None,
            portal_url: "ws://192.168.4.1/ws".to_string(),
        }
    }
}

impl ProvisioningConfig {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

/// Marks cached values on matching topics stale after `after_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutostaleRule {
    pub pattern: String,
    pub after_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    /// Inactive sessions without a heartbeat for this long are forgotten.
    pub expiry_ms: u64,
    pub housekeeping_interval_ms: u64,
    pub autostale: Vec<AutostaleRule>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            expiry_ms: 120_000,
            housekeeping_interval_ms: 1_000,
            autostale: Vec::new(),
        }
    }
}

impl SessionConfig {
    pub fn expiry(&self) -> Duration {
        Duration::from_millis(self.expiry_ms)
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_millis(self.housekeeping_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_document_uses_defaults() {
        let config = DevlinkConfig::from_json_str(
            r#"{"transport":{"connectTimeoutMs":1000,"backoff":{"maxAttempts":3}}}"#,
        )
        .unwrap();

        assert_eq!(config.transport.connect_timeout(), Duration::from_secs(1));
        assert_eq!(config.transport.backoff.max_attempts, 3);
        assert_eq!(config.transport.backoff.initial_delay_ms, 500);
        assert_eq!(config.bus.subscriber_buffer, 32);
        assert_eq!(config.provisioning.portal_ssid_prefix, "esp32m-");
    }

    #[test]
    fn test_invalid_document() {
        let err = DevlinkConfig::from_json_str("{not json").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidData(_)));
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let path = std::env::temp_dir().join("devlink-config-does-not-exist.json");
        let config = DevlinkConfig::load_or_default(&path).unwrap();
        assert_eq!(config, DevlinkConfig::default());
    }

    #[test]
    fn test_autostale_rules() {
        let config = DevlinkConfig::from_json_str(
            r#"{"session":{"autostale":[{"pattern":"wifi/*","afterMs":15000}]}}"#,
        )
        .unwrap();
        assert_eq!(config.session.autostale.len(), 1);
        assert_eq!(config.session.autostale[0].pattern, "wifi/*");
    }
}
