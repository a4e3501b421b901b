//! Process configuration: the runtime sections plus host-only settings.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use devlink_runtime::DevlinkConfig;

pub const CONFIG_FILE: &str = "devlink.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(flatten)]
    pub runtime: DevlinkConfig,
    pub http: HttpConfig,
    pub network: NetworkConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HttpConfig {
    pub bind: SocketAddr,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 3001)),
        }
    }
}

/// Host WiFi integration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NetworkConfig {
    /// Join portal networks and scan through NetworkManager.
    pub nmcli: bool,
    /// WiFi interface to use; NetworkManager picks one when unset.
    pub interface: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            nmcli: true,
            interface: None,
        }
    }
}

/// `$DEVLINK_HOME`, or `~/.devlink`.
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("DEVLINK_HOME") {
        return PathBuf::from(dir);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".devlink")
}

/// `$DEVLINK_CONFIG`, or `devlink.json` in the config directory.
pub fn config_path(dir: &Path) -> PathBuf {
    std::env::var("DEVLINK_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dir.join(CONFIG_FILE))
}

/// Load `path`, falling back to defaults when it does not exist.
pub fn load(path: &Path) -> anyhow::Result<AppConfig> {
    match std::fs::read_to_string(path) {
        Ok(json) => serde_json::from_str(&json)
            .with_context(|| format!("Invalid configuration in {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!("No configuration at {}, using defaults", path.display());
            Ok(AppConfig::default())
        }
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}
