//! Shell facade.
//!
//! The shell owns the whole runtime for one process: session directory,
//! transport, bus, provisioning driver and plugin registry. UI front ends
//! talk to the device only through it.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use devlink_core::{
    CachedValue, Command, CommandId, CommandReply, ConfigStorage, ConnectionState, DeviceId,
    DeviceSession, Endpoint, LastValueCache, ProvisioningState, TopicPattern,
};

use crate::bus::{Bus, BusCore, BusDiagnostics, SubscriptionHandle};
use crate::config::DevlinkConfig;
use crate::error::{BusError, ShellError, TransportError};
use crate::network::{NetworkJoiner, NoopJoiner, PortalDetector, StaticDetector};
use crate::provisioning::Provisioning;
use crate::registry::{PluginDescriptor, PluginRegistry, PluginSummary};
use crate::session::SessionDirectory;
use crate::subscription::TelemetryHandler;
use crate::transport::Transport;

/// Host integrations the shell depends on.
pub struct ShellSeams {
    pub storage: Arc<dyn ConfigStorage>,
    pub joiner: Arc<dyn NetworkJoiner>,
    pub detector: Arc<dyn PortalDetector>,
}

impl ShellSeams {
    /// Seams that never touch the host network.
    pub fn new(storage: Arc<dyn ConfigStorage>) -> Self {
        Self {
            storage,
            joiner: Arc::new(NoopJoiner),
            detector: Arc::new(StaticDetector::default()),
        }
    }

    pub fn with_joiner(mut self, joiner: Arc<dyn NetworkJoiner>) -> Self {
        self.joiner = joiner;
        self
    }

    pub fn with_detector(mut self, detector: Arc<dyn PortalDetector>) -> Self {
        self.detector = detector;
        self
    }
}

/// Runtime overview for diagnostics pages.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellDiagnostics {
    pub link: ConnectionState,
    pub provisioning: ProvisioningState,
    pub active: Option<DeviceId>,
    pub sessions: usize,
    pub pending_replies: usize,
    pub plugins_active: usize,
    pub bus: BusDiagnostics,
}

/// The runtime facade handed to UI front ends.
pub struct Shell {
    sessions: Arc<SessionDirectory>,
    transport: Arc<Transport>,
    bus: Bus,
    provisioning: Provisioning,
    registry: Mutex<PluginRegistry>,
    housekeeping: CancellationToken,
    housekeeping_task: Mutex<Option<JoinHandle<()>>>,
}

impl Shell {
    /// Build the runtime, register `plugins` and activate them.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        config: DevlinkConfig,
        seams: ShellSeams,
        plugins: Vec<PluginDescriptor>,
    ) -> Result<Self, ShellError> {
        let mut cache = LastValueCache::new();
        for rule in &config.session.autostale {
            cache = cache.with_autostale(
                TopicPattern::new(&rule.pattern)?,
                std::time::Duration::from_millis(rule.after_ms),
            );
        }

        let sessions = Arc::new(SessionDirectory::new(
            seams.storage,
            config.session.expiry(),
        ));
        let core = Arc::new(BusCore::new(cache, config.bus.subscriber_buffer));
        let transport = Arc::new(Transport::new(
            config.transport.clone(),
            config.provisioning.clone(),
            core.clone(),
            sessions.clone(),
            seams.joiner,
            seams.detector,
        ));
        let bus = Bus::new(core, transport.clone(), config.transport.reply_timeout());
        let provisioning = Provisioning::start(bus.clone(), sessions.clone(), &config.provisioning)?;

        let mut registry = PluginRegistry::new(bus.clone(), provisioning.clone());
        for plugin in plugins {
            registry.register(plugin)?;
        }
        registry.mark_started();
        registry.activate_all()?;

        let housekeeping = CancellationToken::new();
        let task = tokio::spawn(run_housekeeping(
            transport.clone(),
            provisioning.clone(),
            config.session.housekeeping_interval(),
            housekeeping.clone(),
        ));

        info!("Shell started");
        Ok(Self {
            sessions,
            transport,
            bus,
            provisioning,
            registry: Mutex::new(registry),
            housekeeping,
            housekeeping_task: Mutex::new(Some(task)),
        })
    }

    pub fn sessions(&self) -> Vec<DeviceSession> {
        self.sessions.sessions()
    }

    pub fn active_session(&self) -> Option<DeviceSession> {
        self.sessions.active()
    }

    /// Provisioning state of the active device.
    pub fn active_state(&self) -> watch::Receiver<ProvisioningState> {
        self.provisioning.watch()
    }

    pub fn link_state(&self) -> watch::Receiver<ConnectionState> {
        self.transport.watch_state()
    }

    pub fn subscribe<H>(&self, pattern: &str, handler: H) -> Result<SubscriptionHandle, BusError>
    where
        H: TelemetryHandler,
    {
        self.bus.subscribe(pattern, handler)
    }

    pub fn publish(&self, command: Command) -> Result<CommandId, BusError> {
        self.bus.publish_command(command)
    }

    pub async fn request(&self, command: Command) -> Result<CommandReply, BusError> {
        self.bus.request(command).await
    }

    pub fn cached(&self, pattern: &str) -> Result<Vec<CachedValue>, BusError> {
        self.bus.cached(pattern)
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn provisioning(&self) -> &Provisioning {
        &self.provisioning
    }

    /// Select and connect to a device.
    ///
    /// Provisioning is reseeded for the new session before the link reads
    /// its first frame, so early device reports apply to the new state.
    pub async fn connect(&self, endpoint: Endpoint) -> Result<DeviceId, TransportError> {
        let provisioning = &self.provisioning;
        let seed = endpoint.clone();
        let result = self
            .transport
            .connect_with(endpoint, || async move {
                provisioning.reseed(Some(&seed)).await;
            })
            .await;
        match &result {
            // On cancellation a newer connect owns the session now.
            Ok(_) | Err(TransportError::Cancelled) => {}
            Err(_) => self.provisioning.reseed(None).await,
        }
        result
    }

    /// Connect to the persisted last selection, if there is one.
    pub async fn reconnect_last(&self) -> Result<Option<DeviceId>, TransportError> {
        let Some(last) = self.sessions.last_selected() else {
            debug!("No previous device to reconnect to");
            return Ok(None);
        };
        info!("Reconnecting to last device {}", last.device_id);
        self.connect(last.endpoint).await.map(Some)
    }

    /// Discover devices in captive-portal mode.
    pub async fn probe_portal(&self) -> Result<Vec<DeviceSession>, TransportError> {
        self.transport.probe_portal().await
    }

    /// Destroy the session but remember the selection for the next start.
    pub async fn disconnect(&self) {
        self.transport.disconnect().await;
        self.provisioning.reseed(None).await;
    }

    /// Close the session and forget the device.
    pub async fn forget_device(&self) {
        let active = self.sessions.active_id();
        self.transport.disconnect().await;
        if let Some(id) = active {
            self.sessions.forget(&id);
        }
        self.provisioning.reseed(None).await;
    }

    pub fn plugins(&self) -> Vec<PluginSummary> {
        self.registry().summaries()
    }

    pub fn diagnostics(&self) -> ShellDiagnostics {
        ShellDiagnostics {
            link: self.transport.state(),
            provisioning: self.provisioning.state(),
            active: self.sessions.active_id(),
            sessions: self.sessions.sessions().len(),
            pending_replies: self.transport.pending_replies(),
            plugins_active: self.registry().active_count(),
            bus: self.bus.diagnostics(),
        }
    }

    /// Deactivate plugins, close the link and stop background work.
    pub async fn shutdown(&self) {
        info!("Shell shutting down");
        self.registry().dispose();
        self.provisioning.stop().await;
        self.transport.disconnect().await;

        self.housekeeping.cancel();
        let task = self
            .housekeeping_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Housekeeping task failed: {}", e);
            }
        }
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, PluginRegistry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Periodic maintenance: expire idle sessions, sweep unanswered commands.
async fn run_housekeeping(
    transport: Arc<Transport>,
    provisioning: Provisioning,
    interval: std::time::Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let (expired, lost_active) = transport.expire_sessions(Utc::now()).await;
                if !expired.is_empty() {
                    info!("Expired {} idle session(s)", expired.len());
                }
                if lost_active {
                    provisioning.reseed(None).await;
                }
                let swept = transport.sweep_pending();
                if swept > 0 {
                    debug!("Swept {} unanswered command(s)", swept);
                }
            }
        }
    }
}
