//! Device control channel.
//!
//! The transport owns exactly one logical connection, to the active device
//! session. It handles:
//! - Joining the device access point for captive-portal endpoints
//! - The WebSocket connection and hello handshake
//! - Heartbeats and idle detection
//! - Reconnection with back-off until the device is declared unreachable
//! - Correlating device replies with pending commands
//!
//! Every connectivity change is published on the `link/state` topic.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use devlink_core::{
    topics, Command, CommandId, CommandReply, ConnectionState, DeviceId, DeviceSession, Endpoint,
    TelemetryEvent,
};
use devlink_protocol::{
    decode_device_frame, encode_host_frame, CodecError, DeviceFrame, DeviceHello, HostFrame,
    HostHello, RequestFrame,
};

use crate::bus::BusCore;
use crate::config::{ProvisioningConfig, TransportConfig};
use crate::error::TransportError;
use crate::network::{NetworkJoiner, PortalDetector};
use crate::session::SessionDirectory;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

type ReplyResult = Result<CommandReply, TransportError>;

/// A frame waiting for the writer.
struct Outbound {
    id: CommandId,
    frame: HostFrame,
}

/// An open channel that completed the hello handshake.
struct Connection {
    ws: WsStream,
    hello: DeviceHello,
}

/// Why a link run ended.
enum LinkEnd {
    Cancelled,
    Lost(String),
}

struct PendingReply {
    topic: String,
    timeout: Duration,
    deadline: Instant,
    waiter: Option<oneshot::Sender<ReplyResult>>,
}

/// Commands sent to the device and not yet answered.
#[derive(Default)]
pub(crate) struct PendingReplies {
    entries: Mutex<HashMap<CommandId, PendingReply>>,
}

impl PendingReplies {
    fn insert(
        &self,
        id: CommandId,
        topic: &str,
        timeout: Duration,
        waiter: Option<oneshot::Sender<ReplyResult>>,
    ) {
        self.lock().insert(
            id,
            PendingReply {
                topic: topic.to_string(),
                timeout,
                deadline: Instant::now() + timeout,
                waiter,
            },
        );
    }

    fn remove(&self, id: &CommandId) {
        self.lock().remove(id);
    }

    fn complete(&self, reply: CommandReply) {
        let Some(entry) = self.lock().remove(&reply.id) else {
            debug!("Reply for unknown command {}", reply.id);
            return;
        };
        match entry.waiter {
            Some(waiter) => {
                let _ = waiter.send(Ok(reply));
            }
            None if reply.ok => debug!("'{}' acknowledged", entry.topic),
            None => warn!(
                "Device rejected '{}': {}",
                entry.topic,
                reply.error.as_deref().unwrap_or("no reason given")
            ),
        }
    }

    fn fail(&self, id: &CommandId, error: TransportError) {
        if let Some(PendingReply {
            waiter: Some(waiter),
            ..
        }) = self.lock().remove(id)
        {
            let _ = waiter.send(Err(error));
        }
    }

    fn fail_all(&self, error: impl Fn() -> TransportError) {
        let drained: Vec<PendingReply> = self.lock().drain().map(|(_, entry)| entry).collect();
        for entry in drained {
            if let Some(waiter) = entry.waiter {
                let _ = waiter.send(Err(error()));
            }
        }
    }

    /// Drop entries past their deadline. Returns how many were removed.
    fn sweep(&self, now: Instant) -> usize {
        let expired: Vec<PendingReply> = {
            let mut entries = self.lock();
            let ids: Vec<CommandId> = entries
                .iter()
                .filter(|(_, entry)| entry.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| entries.remove(id)).collect()
        };

        for entry in &expired {
            debug!("No reply to '{}' before its deadline", entry.topic);
        }
        let count = expired.len();
        for entry in expired {
            if let Some(waiter) = entry.waiter {
                let _ = waiter.send(Err(TransportError::ReplyTimeout {
                    topic: entry.topic,
                    timeout_ms: entry.timeout.as_millis() as u64,
                }));
            }
        }
        count
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CommandId, PendingReply>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// The running link of the active session.
struct ActiveLink {
    device_id: DeviceId,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Connection to the active device.
pub struct Transport {
    config: TransportConfig,
    portal: ProvisioningConfig,
    telemetry: Arc<BusCore>,
    sessions: Arc<SessionDirectory>,
    joiner: Arc<dyn NetworkJoiner>,
    detector: Arc<dyn PortalDetector>,
    state_tx: watch::Sender<ConnectionState>,
    pending: PendingReplies,
    /// Present while a link is installed.
    outbound: Mutex<Option<mpsc::Sender<Outbound>>>,
    /// Serializes connect and disconnect.
    link: tokio::sync::Mutex<Option<ActiveLink>>,
    /// Cancelled when a newer connect or a disconnect supersedes the
    /// current attempt.
    attempt: Mutex<CancellationToken>,
}

impl Transport {
    pub(crate) fn new(
        config: TransportConfig,
        portal: ProvisioningConfig,
        telemetry: Arc<BusCore>,
        sessions: Arc<SessionDirectory>,
        joiner: Arc<dyn NetworkJoiner>,
        detector: Arc<dyn PortalDetector>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            portal,
            telemetry,
            sessions,
            joiner,
            detector,
            state_tx,
            pending: PendingReplies::default(),
            outbound: Mutex::new(None),
            link: tokio::sync::Mutex::new(None),
            attempt: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Number of commands still waiting for a reply.
    pub fn pending_replies(&self) -> usize {
        self.pending.len()
    }

    /// Connect to `endpoint`, replacing any current session.
    ///
    /// A connect that is still in flight when another connect or a
    /// disconnect starts fails with [`TransportError::Cancelled`] after
    /// releasing what it had acquired.
    pub async fn connect(self: &Arc<Self>, endpoint: Endpoint) -> Result<DeviceId, TransportError> {
        self.connect_with(endpoint, || async {}).await
    }

    /// [`Transport::connect`], running `on_session` once the new session is
    /// active and before any device frame is read from it.
    pub(crate) async fn connect_with<F, Fut>(
        self: &Arc<Self>,
        endpoint: Endpoint,
        on_session: F,
    ) -> Result<DeviceId, TransportError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        let token = self.supersede();
        let mut link = self.link.lock().await;
        if token.is_cancelled() {
            return Err(TransportError::Cancelled);
        }

        self.teardown(&mut link).await;
        self.sessions.deactivate();
        let epoch = self.telemetry.reset_session();
        self.pending.fail_all(|| TransportError::Cancelled);

        info!("Connecting to {}", endpoint);
        let (connection, portal) = match self.open(&endpoint, &token).await {
            Ok(opened) => opened,
            Err(e) => {
                warn!("Connect to {} failed: {}", endpoint, e);
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let device_id = connection.hello.device_id.clone();
        self.sessions.activate(&device_id, &endpoint);
        info!(
            "Connected to {} (firmware {})",
            device_id,
            connection.hello.firmware.as_deref().unwrap_or("unknown")
        );
        on_session().await;

        let (tx, rx) = mpsc::channel(self.config.outbound_queue.max(1));
        *self.outbound_slot() = Some(tx);
        self.set_state(ConnectionState::Connected);

        let task = tokio::spawn(self.clone().supervise(
            connection.ws,
            device_id.clone(),
            endpoint,
            portal,
            rx,
            token.clone(),
            epoch,
        ));
        *link = Some(ActiveLink {
            device_id: device_id.clone(),
            cancel: token,
            task,
        });

        Ok(device_id)
    }

    /// Close the channel, destroy the active session and clear everything
    /// scoped to it. The persisted last selection survives. Calling this
    /// without a session is a no-op.
    pub async fn disconnect(&self) {
        self.supersede();
        let mut link = self.link.lock().await;
        let had_link = link.is_some();

        self.teardown(&mut link).await;
        self.sessions.close();
        self.telemetry.reset_session();
        self.pending.fail_all(|| TransportError::NotConnected);

        if had_link || self.state() != ConnectionState::Disconnected {
            info!("Disconnected");
            self.set_state(ConnectionState::Disconnected);
        }
    }

    /// Enqueue a command. Fails fast instead of queueing when no channel is
    /// open or the outbound queue is full.
    pub fn send(&self, command: &Command) -> Result<(), TransportError> {
        self.enqueue(command, self.config.reply_timeout(), None)
    }

    /// Send a command and wait for the correlated reply.
    pub async fn request(&self, command: &Command, timeout: Duration) -> ReplyResult {
        let (tx, rx) = oneshot::channel();
        self.enqueue(command, timeout, Some(tx))?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::NotConnected),
            Err(_) => {
                self.pending.remove(&command.id);
                Err(TransportError::ReplyTimeout {
                    topic: command.topic.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Look for devices advertising their own access point and register
    /// them as discoverable sessions.
    pub async fn probe_portal(&self) -> Result<Vec<DeviceSession>, TransportError> {
        let access_points = self
            .detector
            .scan()
            .await
            .map_err(|e| TransportError::PortalScan(e.to_string()))?;

        let mut found = Vec::new();
        for ap in access_points
            .into_iter()
            .filter(|ap| ap.ssid.starts_with(&self.portal.portal_ssid_prefix))
        {
            let endpoint = Endpoint::Captive {
                ssid: ap.ssid.clone(),
                passphrase: self.portal.portal_passphrase.clone(),
                url: self.portal.portal_url.clone(),
            };
            found.push(self.sessions.discovered(DeviceId::new(&ap.ssid), endpoint));
            self.telemetry.emit(
                topics::PORTAL_ADVERTISED,
                serde_json::json!({
                    "ssid": ap.ssid,
                    "signal": ap.signal,
                    "secured": ap.secured,
                }),
            );
        }

        debug!("Portal probe found {} device(s)", found.len());
        Ok(found)
    }

    /// Expire idle sessions. An expired active session is unreachable, so its
    /// link is released and the epoch reset as on disconnect. Returns the
    /// expired ids and whether the active session was one of them.
    pub(crate) async fn expire_sessions(&self, now: DateTime<Utc>) -> (Vec<DeviceId>, bool) {
        let mut link = self.link.lock().await;
        let active = self.sessions.active_id();
        let expired = self.sessions.expire_stale(now);
        let lost_active = active.map_or(false, |id| expired.contains(&id));

        if lost_active {
            info!("Unreachable device session expired");
            self.teardown(&mut link).await;
            self.telemetry.reset_session();
            self.pending.fail_all(|| TransportError::NotConnected);
            self.set_state(ConnectionState::Disconnected);
        }
        (expired, lost_active)
    }

    /// Fail commands whose reply deadline has passed.
    pub(crate) fn sweep_pending(&self) -> usize {
        self.pending.sweep(Instant::now())
    }

    fn enqueue(
        &self,
        command: &Command,
        timeout: Duration,
        waiter: Option<oneshot::Sender<ReplyResult>>,
    ) -> Result<(), TransportError> {
        if !self.state().is_connected() {
            return Err(TransportError::NotConnected);
        }
        let sender = self
            .outbound_slot()
            .clone()
            .ok_or(TransportError::NotConnected)?;

        self.pending.insert(command.id, &command.topic, timeout, waiter);
        let outbound = Outbound {
            id: command.id,
            frame: HostFrame::Request(RequestFrame::from(command)),
        };

        match sender.try_send(outbound) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.pending.remove(&command.id);
                Err(TransportError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.pending.remove(&command.id);
                Err(TransportError::NotConnected)
            }
        }
    }

    /// Cancel the current attempt and install a fresh token for the next.
    fn supersede(&self) -> CancellationToken {
        let mut attempt = self.attempt.lock().unwrap_or_else(|e| e.into_inner());
        attempt.cancel();
        *attempt = CancellationToken::new();
        attempt.clone()
    }

    async fn teardown(&self, link: &mut Option<ActiveLink>) {
        *self.outbound_slot() = None;
        if let Some(active) = link.take() {
            active.cancel.cancel();
            if let Err(e) = active.task.await {
                error!("Link task for {} failed: {}", active.device_id, e);
            }
        }
    }

    /// Join the portal network if needed, then open the control channel.
    /// On failure anything joined along the way is left again.
    async fn open(
        &self,
        endpoint: &Endpoint,
        cancel: &CancellationToken,
    ) -> Result<(Connection, Option<String>), TransportError> {
        let portal = match endpoint {
            Endpoint::Direct { .. } => None,
            Endpoint::Captive {
                ssid, passphrase, ..
            } => {
                self.set_state(ConnectionState::JoiningPortal);
                self.join_portal(ssid, passphrase.as_deref(), cancel).await?;
                Some(ssid.clone())
            }
        };

        self.set_state(ConnectionState::Connecting);
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            result = establish(endpoint.url(), &self.config) => result,
        };

        match result {
            Ok(connection) => Ok((connection, portal)),
            Err(e) => {
                if let Some(ssid) = portal {
                    self.leave_portal(&ssid).await;
                }
                Err(e)
            }
        }
    }

    async fn join_portal(
        &self,
        ssid: &str,
        passphrase: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        info!("Joining portal network '{}'", ssid);
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            result = self.joiner.join(ssid, passphrase) => result.map_err(|e| {
                TransportError::PortalJoin {
                    ssid: ssid.to_string(),
                    message: e.to_string(),
                }
            }),
        };
        if result.is_err() {
            // The join may have completed partially.
            self.leave_portal(ssid).await;
        }
        result
    }

    async fn leave_portal(&self, ssid: &str) {
        info!("Leaving portal network '{}'", ssid);
        if let Err(e) = self.joiner.leave(ssid).await {
            warn!("Failed to leave portal network '{}': {}", ssid, e);
        }
    }

    /// Own the link until it is cancelled or the device is unreachable.
    #[allow(clippy::too_many_arguments)]
    async fn supervise(
        self: Arc<Self>,
        ws: WsStream,
        device_id: DeviceId,
        mut endpoint: Endpoint,
        mut portal: Option<String>,
        mut outbound: mpsc::Receiver<Outbound>,
        cancel: CancellationToken,
        mut epoch: u64,
    ) {
        let mut ws = ws;
        loop {
            match self
                .run_link(ws, &device_id, &mut outbound, &cancel, epoch)
                .await
            {
                LinkEnd::Cancelled => break,
                LinkEnd::Lost(reason) => warn!("Link to {} lost: {}", device_id, reason),
            }

            // Replies from the old channel will never arrive.
            self.pending.fail_all(|| TransportError::NotConnected);
            while let Ok(queued) = outbound.try_recv() {
                self.pending.fail(&queued.id, TransportError::NotConnected);
            }
            epoch = self.telemetry.reset_session();

            if let Some(session) = self.sessions.get(&device_id) {
                endpoint = session.endpoint;
            }
            match self
                .reconnect(&device_id, &endpoint, &mut portal, &cancel)
                .await
            {
                Some(connection) => {
                    ws = connection.ws;
                    info!("Reconnected to {}", device_id);
                    self.set_state(ConnectionState::Connected);
                }
                None => break,
            }
        }

        if let Some(ssid) = portal {
            self.leave_portal(&ssid).await;
        }
        debug!("Supervisor for {} finished", device_id);
    }

    /// Retry with back-off. `None` when cancelled or out of attempts.
    async fn reconnect(
        &self,
        device_id: &DeviceId,
        endpoint: &Endpoint,
        portal: &mut Option<String>,
        cancel: &CancellationToken,
    ) -> Option<Connection> {
        let backoff = &self.config.backoff;

        // The device left portal mode, so the host leaves its network too.
        if portal.as_deref() != endpoint.portal_ssid() {
            if let Some(ssid) = portal.take() {
                self.leave_portal(&ssid).await;
            }
        }

        let mut attempt = 0;
        loop {
            if backoff.should_give_up(attempt) {
                error!("Device {} unreachable after {} attempts", device_id, attempt);
                self.set_state(ConnectionState::Unreachable);
                return None;
            }
            self.set_state(ConnectionState::Reconnecting {
                attempt: attempt + 1,
            });

            let delay = backoff.delay_for_attempt(attempt);
            debug!("Reconnect attempt {} in {:?}", attempt + 1, delay);
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;

            if let (Endpoint::Captive { ssid, passphrase, .. }, true) = (endpoint, portal.is_none()) {
                match self.join_portal(ssid, passphrase.as_deref(), cancel).await {
                    Ok(()) => *portal = Some(ssid.clone()),
                    Err(TransportError::Cancelled) => return None,
                    Err(e) => {
                        debug!("Reconnect attempt {} failed: {}", attempt, e);
                        continue;
                    }
                }
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => return None,
                result = establish(endpoint.url(), &self.config) => result,
            };
            match result {
                Ok(connection) if &connection.hello.device_id == device_id => {
                    return Some(connection)
                }
                Ok(connection) => warn!(
                    "Expected {} at {}, found {}",
                    device_id, endpoint, connection.hello.device_id
                ),
                Err(e) => debug!("Reconnect attempt {} failed: {}", attempt, e),
            }
        }
    }

    /// Pump frames in both directions until the link ends.
    async fn run_link(
        &self,
        ws: WsStream,
        device_id: &DeviceId,
        outbound: &mut mpsc::Receiver<Outbound>,
        cancel: &CancellationToken,
        epoch: u64,
    ) -> LinkEnd {
        let (mut ws_tx, mut ws_rx) = ws.split();
        let period = self.config.heartbeat_interval();
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        let idle_timeout = self.config.idle_timeout();
        let mut last_inbound = Instant::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    return LinkEnd::Cancelled;
                }

                _ = tokio::time::sleep_until(last_inbound + idle_timeout) => {
                    return LinkEnd::Lost(format!("no traffic for {:?}", idle_timeout));
                }

                _ = heartbeat.tick() => {
                    if let Err(e) = ws_tx.send(Message::Ping(Vec::new())).await {
                        return LinkEnd::Lost(e.to_string());
                    }
                }

                queued = outbound.recv() => {
                    let Some(queued) = queued else {
                        return LinkEnd::Cancelled;
                    };
                    let text = match encode_host_frame(&queued.frame) {
                        Ok(text) => text,
                        Err(e) => {
                            error!("Failed to encode command {}: {}", queued.id, e);
                            self.pending.fail(&queued.id, e.into());
                            continue;
                        }
                    };
                    if let Err(e) = ws_tx.send(Message::Text(text)).await {
                        self.pending.fail(&queued.id, TransportError::NotConnected);
                        return LinkEnd::Lost(e.to_string());
                    }
                }

                frame = ws_rx.next() => {
                    last_inbound = Instant::now();
                    self.sessions.touch(device_id);
                    match frame {
                        Some(Ok(Message::Text(text))) => self.handle_frame(&text, epoch),
                        Some(Ok(Message::Binary(_))) => {
                            warn!("Ignoring frame from {}: {}", device_id, CodecError::BinaryFrame);
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return LinkEnd::Lost("closed by device".to_string());
                        }
                        Some(Ok(_)) => {} // Ping/pong
                        Some(Err(e)) => return LinkEnd::Lost(e.to_string()),
                    }
                }
            }
        }
    }

    fn handle_frame(&self, text: &str, epoch: u64) {
        match decode_device_frame(text) {
            Ok(DeviceFrame::Event(event)) => {
                debug!("Event '{}' seq {}", event.topic, event.seq);
                self.telemetry.deliver(
                    epoch,
                    TelemetryEvent::new(event.topic, event.seq, event.payload),
                );
            }
            Ok(DeviceFrame::Reply(reply)) => self.pending.complete(reply.into()),
            Ok(DeviceFrame::Hello(hello)) => {
                debug!("Device re-announced itself as {}", hello.device_id);
            }
            Err(e) => warn!("Dropping malformed frame: {}", e),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if let Some(id) = self.sessions.active_id() {
            self.sessions.set_link(&id, state);
        }
        if previous != state {
            debug!("Link state {:?} -> {:?}", previous, state);
        }
        let payload = serde_json::to_value(state).unwrap_or_default();
        self.telemetry.emit(topics::LINK_STATE, payload);
    }

    fn outbound_slot(&self) -> std::sync::MutexGuard<'_, Option<mpsc::Sender<Outbound>>> {
        self.outbound.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Open the channel within the connect timeout.
async fn establish(url: &str, config: &TransportConfig) -> Result<Connection, TransportError> {
    match tokio::time::timeout(config.connect_timeout(), handshake(url, &config.client_name)).await
    {
        Ok(result) => result,
        Err(_) => Err(TransportError::ConnectTimeout {
            url: url.to_string(),
        }),
    }
}

/// Open the WebSocket, announce the host and wait for the device hello.
async fn handshake(url: &str, client_name: &str) -> Result<Connection, TransportError> {
    let (mut ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| connect_error(url, e))?;

    let hello = encode_host_frame(&HostFrame::Hello(HostHello::new(client_name)))?;
    ws.send(Message::Text(hello)).await?;

    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => match decode_device_frame(&text)? {
                DeviceFrame::Hello(hello) => return Ok(Connection { ws, hello }),
                other => debug!("Ignoring frame before hello: {:?}", other),
            },
            Some(Ok(Message::Binary(_))) => return Err(CodecError::BinaryFrame.into()),
            Some(Ok(Message::Close(_))) | None => {
                return Err(TransportError::Handshake(
                    "channel closed before device hello".to_string(),
                ))
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

fn connect_error(url: &str, error: tungstenite::Error) -> TransportError {
    match &error {
        tungstenite::Error::Io(io) if io.kind() == std::io::ErrorKind::ConnectionRefused => {
            TransportError::ConnectRefused {
                url: url.to_string(),
            }
        }
        _ => TransportError::WebSocket(error),
    }
}
