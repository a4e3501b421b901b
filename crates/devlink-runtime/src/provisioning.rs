//! Provisioning state machine.
//!
//! [`transition`] is the pure state machine; [`Provisioning`] drives it from
//! user actions and device telemetry, issues the resulting commands, runs
//! the join timer and publishes the state through a watch channel and the
//! `provisioning/state` topic.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use devlink_core::{
    topics, Command, CommandSchema, ConnectionState, Endpoint, FaultReason, FieldKind,
    ProvisioningState, TelemetryEvent,
};

use crate::bus::{Bus, SubscriptionHandle};
use crate::config::ProvisioningConfig;
use crate::error::{BusError, ProvisioningError};
use crate::session::SessionDirectory;
use crate::subscription::handler_fn;

/// Ask the device to scan for networks.
pub const WIFI_SCAN: &str = "wifi/scan";
/// Ask the device to join a network.
pub const WIFI_CONNECT: &str = "wifi/connect";
/// Ask the device to drop its stored credentials.
pub const WIFI_FORGET: &str = "wifi/forget";

pub const SSID_MAX_BYTES: usize = 32;
pub const PASSPHRASE_MIN: usize = 8;
pub const PASSPHRASE_MAX: usize = 63;

/// Schemas of the commands the state machine issues.
pub fn command_schemas() -> Vec<(&'static str, CommandSchema)> {
    vec![
        (WIFI_SCAN, CommandSchema::empty()),
        (
            WIFI_CONNECT,
            CommandSchema::empty()
                .required("ssid", FieldKind::String)
                .length(1, SSID_MAX_BYTES)
                .required("password", FieldKind::String)
                .length(0, PASSPHRASE_MAX),
        ),
        (WIFI_FORGET, CommandSchema::empty()),
    ]
}

/// Something that can move the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningInput {
    PortalAdvertised { ssid: String },
    ScanRequested,
    CredentialsSubmitted { ssid: String, password: String },
    Associated { ssid: Option<String>, ip: Option<String> },
    AssociationFailed { reason: String },
    JoinTimedOut,
    FactoryReset,
    RetryRequested,
}

impl ProvisioningInput {
    fn action(&self) -> &'static str {
        match self {
            ProvisioningInput::PortalAdvertised { .. } => "enter AP mode",
            ProvisioningInput::ScanRequested => "scan",
            ProvisioningInput::CredentialsSubmitted { .. } => "submit credentials",
            ProvisioningInput::Associated { .. } => "complete join",
            ProvisioningInput::AssociationFailed { .. } => "fail join",
            ProvisioningInput::JoinTimedOut => "time out join",
            ProvisioningInput::FactoryReset => "factory reset",
            ProvisioningInput::RetryRequested => "retry",
        }
    }
}

/// Side effects requested by a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Issue(Command),
    StartJoinTimer,
    CancelJoinTimer,
    /// The device reported its address on the joined network.
    AdoptAddress(String),
}

/// Check WiFi credentials before they are sent to the device.
pub fn validate_credentials(ssid: &str, password: &str) -> Result<(), ProvisioningError> {
    if ssid.is_empty() || ssid.len() > SSID_MAX_BYTES {
        return Err(ProvisioningError::InvalidCredentials(format!(
            "SSID must be 1 to {} bytes",
            SSID_MAX_BYTES
        )));
    }
    let len = password.len();
    if len != 0 && !(PASSPHRASE_MIN..=PASSPHRASE_MAX).contains(&len) {
        return Err(ProvisioningError::InvalidCredentials(format!(
            "passphrase must be empty or {} to {} characters",
            PASSPHRASE_MIN, PASSPHRASE_MAX
        )));
    }
    Ok(())
}

/// Compute the next state for `input`.
pub fn transition(
    state: &ProvisioningState,
    input: ProvisioningInput,
) -> Result<(ProvisioningState, Vec<Effect>), ProvisioningError> {
    use ProvisioningInput as In;
    use ProvisioningState as St;

    let next = match (state, input) {
        (St::Unconfigured, In::PortalAdvertised { ssid }) => (St::ApMode { ssid }, vec![]),

        (St::ApMode { .. } | St::Scanning, In::ScanRequested) => (
            St::Scanning,
            vec![Effect::Issue(Command::new(WIFI_SCAN, json!({})))],
        ),

        (St::Scanning, In::CredentialsSubmitted { ssid, password }) => {
            validate_credentials(&ssid, &password)?;
            let command = Command::new(WIFI_CONNECT, json!({ "ssid": ssid, "password": password }));
            (
                St::Joining { ssid },
                vec![Effect::Issue(command), Effect::StartJoinTimer],
            )
        }

        (St::Joining { ssid }, In::Associated { ip, .. }) => {
            let mut effects = vec![Effect::CancelJoinTimer];
            effects.extend(ip.map(Effect::AdoptAddress));
            (St::Joined { ssid: ssid.clone() }, effects)
        }

        // Device was already provisioned before we connected.
        (St::Unconfigured, In::Associated { ssid: Some(ssid), .. }) => (St::Joined { ssid }, vec![]),

        (St::Joining { .. }, In::AssociationFailed { reason }) => (
            St::Faulted {
                reason: FaultReason::DeviceRejected { reason },
            },
            vec![Effect::CancelJoinTimer],
        ),

        (St::Joining { .. }, In::JoinTimedOut) => (
            St::Faulted {
                reason: FaultReason::ProvisioningTimeout,
            },
            vec![],
        ),

        (St::Joined { .. }, In::FactoryReset) => (
            St::Unconfigured,
            vec![Effect::Issue(Command::new(WIFI_FORGET, json!({})))],
        ),

        (St::Faulted { .. }, In::RetryRequested) => (
            St::Scanning,
            vec![Effect::Issue(Command::new(WIFI_SCAN, json!({})))],
        ),

        (state, input) => {
            return Err(ProvisioningError::InvalidTransition {
                state: state.name(),
                action: input.action(),
            })
        }
    };

    Ok(next)
}

/// Replace the host of a `ws://host[:port]/path` URL.
fn with_host(url: &str, host: &str) -> String {
    let (scheme, rest) = url.split_once("://").unwrap_or(("ws", url));
    let path = rest.find('/').map(|i| &rest[i..]).unwrap_or("/");
    format!("{}://{}{}", scheme, host, path)
}

struct Driver {
    bus: Bus,
    sessions: Arc<SessionDirectory>,
    join_timeout: Duration,
    portal_url: String,
    state_tx: watch::Sender<ProvisioningState>,
    /// Serializes transitions; holds the armed join timer.
    gate: tokio::sync::Mutex<Option<CancellationToken>>,
    subscriptions: Mutex<Vec<SubscriptionHandle>>,
}

/// Drives the provisioning state machine for the active device.
#[derive(Clone)]
pub struct Provisioning {
    driver: Arc<Driver>,
}

impl Provisioning {
    /// Reserve the provisioning commands and start listening for portal
    /// advertisements and station reports. Once reserved, the WiFi topics can
    /// only be sent through this driver.
    pub fn start(
        bus: Bus,
        sessions: Arc<SessionDirectory>,
        config: &ProvisioningConfig,
    ) -> Result<Self, BusError> {
        for (topic, schema) in command_schemas() {
            bus.reserve(topic, schema);
        }

        let (state_tx, _) = watch::channel(ProvisioningState::Unconfigured);
        let driver = Arc::new(Driver {
            bus: bus.clone(),
            sessions,
            join_timeout: config.join_timeout(),
            portal_url: config.portal_url.clone(),
            state_tx,
            gate: tokio::sync::Mutex::new(None),
            subscriptions: Mutex::new(Vec::new()),
        });

        let mut handles = Vec::new();
        for pattern in [topics::PORTAL_ADVERTISED, topics::WIFI_STA, topics::LINK_STATE] {
            let weak = Arc::downgrade(&driver);
            let handle = bus.subscribe(
                pattern,
                handler_fn(move |event: TelemetryEvent| {
                    let weak = weak.clone();
                    async move {
                        if let Some(driver) = weak.upgrade() {
                            Provisioning { driver }.on_telemetry(event).await;
                        }
                    }
                }),
            )?;
            handles.push(handle);
        }
        *driver
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = handles;

        Ok(Self { driver })
    }

    pub fn state(&self) -> ProvisioningState {
        self.driver.state_tx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<ProvisioningState> {
        self.driver.state_tx.subscribe()
    }

    /// `ApMode → Scanning`; also refreshes the list while scanning.
    pub async fn request_scan(&self) -> Result<(), ProvisioningError> {
        self.apply(ProvisioningInput::ScanRequested).await
    }

    /// `Scanning → Joining`. Invalid credentials leave the state unchanged.
    pub async fn submit_credentials(&self, ssid: &str, password: &str) -> Result<(), ProvisioningError> {
        self.apply(ProvisioningInput::CredentialsSubmitted {
            ssid: ssid.to_string(),
            password: password.to_string(),
        })
        .await
    }

    /// `Joined → Unconfigured`.
    pub async fn factory_reset(&self) -> Result<(), ProvisioningError> {
        self.apply(ProvisioningInput::FactoryReset).await
    }

    /// `Faulted → Scanning`. The only way out of `Faulted`.
    pub async fn retry(&self) -> Result<(), ProvisioningError> {
        self.apply(ProvisioningInput::RetryRequested).await
    }

    /// Start over for a newly selected session. A captive-portal endpoint
    /// means the device is known to be in AP mode.
    pub(crate) async fn reseed(&self, endpoint: Option<&Endpoint>) {
        let mut timer = self.driver.gate.lock().await;
        if let Some(token) = timer.take() {
            token.cancel();
        }
        let state = match endpoint.and_then(Endpoint::portal_ssid) {
            Some(ssid) => ProvisioningState::ApMode {
                ssid: ssid.to_string(),
            },
            None => ProvisioningState::Unconfigured,
        };
        self.publish(state);
    }

    /// Drop telemetry subscriptions and any armed timer.
    pub(crate) async fn stop(&self) {
        if let Some(token) = self.driver.gate.lock().await.take() {
            token.cancel();
        }
        self.driver
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    async fn on_telemetry(&self, event: TelemetryEvent) {
        let input = match event.topic.as_str() {
            topics::PORTAL_ADVERTISED => match event.payload["ssid"].as_str() {
                Some(ssid) => ProvisioningInput::PortalAdvertised {
                    ssid: ssid.to_string(),
                },
                None => return,
            },
            topics::WIFI_STA => station_input(&event.payload),
            topics::LINK_STATE => {
                // Cached values are cleared on reconnect; put ours back.
                if event.payload["state"] == "connected" {
                    let state = self.state();
                    self.driver.bus.emit(topics::PROVISIONING_STATE, state_payload(&state));
                }
                return;
            }
            _ => return,
        };

        if let Err(e) = self.apply(input).await {
            debug!("Ignoring '{}' telemetry: {}", event.topic, e);
        }
    }

    async fn apply(&self, input: ProvisioningInput) -> Result<(), ProvisioningError> {
        let mut timer = self.driver.gate.lock().await;
        let current = self.state();
        let (next, effects) = transition(&current, input)?;

        // A command that cannot be sent leaves the state untouched.
        for effect in &effects {
            if let Effect::Issue(command) = effect {
                self.driver.bus.publish_reserved(command.clone())?;
            }
        }

        for effect in effects {
            match effect {
                Effect::Issue(_) => {}
                Effect::StartJoinTimer => {
                    if let Some(previous) = timer.replace(self.arm_join_timer()) {
                        previous.cancel();
                    }
                }
                Effect::CancelJoinTimer => {
                    if let Some(token) = timer.take() {
                        token.cancel();
                    }
                }
                Effect::AdoptAddress(ip) => self.adopt_address(&ip),
            }
        }

        info!("Provisioning {} -> {}", current.name(), next.name());
        self.publish(next);
        Ok(())
    }

    fn arm_join_timer(&self) -> CancellationToken {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let weak: Weak<Driver> = Arc::downgrade(&self.driver);
        let timeout = self.driver.join_timeout;

        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    if let Some(driver) = weak.upgrade() {
                        warn!("No association within {:?}", timeout);
                        if let Err(e) = (Provisioning { driver })
                            .apply(ProvisioningInput::JoinTimedOut)
                            .await
                        {
                            debug!("Join timer fired late: {}", e);
                        }
                    }
                }
            }
        });

        token
    }

    fn adopt_address(&self, ip: &str) {
        let Some(session) = self.driver.sessions.active() else {
            return;
        };
        let base = match &session.endpoint {
            Endpoint::Captive { .. } => self.driver.portal_url.as_str(),
            Endpoint::Direct { url } => url.as_str(),
        };
        let url = with_host(base, ip);
        self.driver
            .sessions
            .update_endpoint(&session.id, Endpoint::direct(url));
    }

    fn publish(&self, state: ProvisioningState) {
        let payload = state_payload(&state);
        self.driver.state_tx.send_replace(state);
        self.driver.bus.emit(topics::PROVISIONING_STATE, payload);
    }
}

fn station_input(payload: &serde_json::Value) -> ProvisioningInput {
    let text = |key: &str| payload[key].as_str().map(str::to_string);
    if payload["associated"].as_bool().unwrap_or(false) {
        ProvisioningInput::Associated {
            ssid: text("ssid"),
            ip: text("ip"),
        }
    } else {
        ProvisioningInput::AssociationFailed {
            reason: text("reason").unwrap_or_else(|| "association failed".to_string()),
        }
    }
}

fn state_payload(state: &ProvisioningState) -> serde_json::Value {
    serde_json::to_value(state).unwrap_or_default()
}
