//! Host network seams used for captive-portal devices.
//!
//! The transport joins a device's own access point through a
//! [`NetworkJoiner`] and discovers such access points through a
//! [`PortalDetector`]. On Linux both are backed by `nmcli`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: &'static str,
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: &'static str,
        status: String,
        stderr: String,
    },
}

/// An access point seen by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessPoint {
    pub ssid: String,
    /// Signal quality in percent, when known.
    pub signal: Option<u8>,
    pub secured: bool,
}

/// Joins and leaves a WiFi network on the host.
#[async_trait]
pub trait NetworkJoiner: Send + Sync {
    async fn join(&self, ssid: &str, passphrase: Option<&str>) -> Result<(), NetworkError>;

    async fn leave(&self, ssid: &str) -> Result<(), NetworkError>;
}

/// Lists access points visible to the host.
#[async_trait]
pub trait PortalDetector: Send + Sync {
    async fn scan(&self) -> Result<Vec<AccessPoint>, NetworkError>;
}

/// Joiner for setups where the host never changes networks.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopJoiner;

#[async_trait]
impl NetworkJoiner for NoopJoiner {
    async fn join(&self, ssid: &str, _passphrase: Option<&str>) -> Result<(), NetworkError> {
        debug!("Not joining '{}': network changes disabled", ssid);
        Ok(())
    }

    async fn leave(&self, _ssid: &str) -> Result<(), NetworkError> {
        Ok(())
    }
}

/// Detector returning a fixed list of access points.
#[derive(Debug, Default, Clone)]
pub struct StaticDetector {
    access_points: Vec<AccessPoint>,
}

impl StaticDetector {
    pub fn new(access_points: Vec<AccessPoint>) -> Self {
        Self { access_points }
    }
}

#[async_trait]
impl PortalDetector for StaticDetector {
    async fn scan(&self) -> Result<Vec<AccessPoint>, NetworkError> {
        Ok(self.access_points.clone())
    }
}

/// NetworkManager-backed joiner.
#[derive(Debug, Default, Clone)]
pub struct NmcliJoiner {
    /// Wireless interface to use; NetworkManager picks one when unset.
    pub interface: Option<String>,
}

impl NmcliJoiner {
    pub fn new(interface: Option<String>) -> Self {
        Self { interface }
    }
}

#[async_trait]
impl NetworkJoiner for NmcliJoiner {
    async fn join(&self, ssid: &str, passphrase: Option<&str>) -> Result<(), NetworkError> {
        let mut args = vec!["device", "wifi", "connect", ssid];
        if let Some(passphrase) = passphrase {
            args.extend(["password", passphrase]);
        }
        if let Some(interface) = &self.interface {
            args.extend(["ifname", interface.as_str()]);
        }
        nmcli(&args).await.map(|_| ())
    }

    async fn leave(&self, ssid: &str) -> Result<(), NetworkError> {
        nmcli(&["connection", "down", "id", ssid]).await.map(|_| ())
    }
}

/// NetworkManager-backed detector.
#[derive(Debug, Default, Clone, Copy)]
pub struct NmcliDetector;

#[async_trait]
impl PortalDetector for NmcliDetector {
    async fn scan(&self) -> Result<Vec<AccessPoint>, NetworkError> {
        let output = nmcli(&[
            "-t",
            "-f",
            "SSID,SIGNAL,SECURITY",
            "device",
            "wifi",
            "list",
            "--rescan",
            "yes",
        ])
        .await?;
        Ok(parse_wifi_list(&output))
    }
}

async fn nmcli(args: &[&str]) -> Result<String, NetworkError> {
    debug!("nmcli {}", args.join(" "));
    let output = Command::new("nmcli")
        .args(args)
        .output()
        .await
        .map_err(|source| NetworkError::Spawn {
            program: "nmcli",
            source,
        })?;

    if !output.status.success() {
        return Err(NetworkError::Failed {
            program: "nmcli",
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse `nmcli -t -f SSID,SIGNAL,SECURITY device wifi list` output.
///
/// Terse mode separates fields with `:` and escapes literal colons in
/// values as `\:`. Hidden networks (empty SSID) are skipped, as are repeated
/// SSIDs from multiple BSSIDs.
pub fn parse_wifi_list(output: &str) -> Vec<AccessPoint> {
    let mut access_points: Vec<AccessPoint> = Vec::new();

    for line in output.lines() {
        let fields = split_terse(line);
        let Some(ssid) = fields.first().filter(|s| !s.is_empty()) else {
            continue;
        };
        if access_points.iter().any(|ap| &ap.ssid == ssid) {
            continue;
        }
        let signal = fields.get(1).and_then(|s| s.parse().ok());
        let secured = fields
            .get(2)
            .map(|s| !s.is_empty() && s != "--")
            .unwrap_or(false);
        access_points.push(AccessPoint {
            ssid: ssid.clone(),
            signal,
            secured,
        });
    }

    access_points
}

fn split_terse(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            ':' => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}
