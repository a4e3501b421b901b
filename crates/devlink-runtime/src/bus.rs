//! Command/telemetry bus.
//!
//! Outbound: commands are validated against the schema registered for their
//! topic and handed to the transport. Inbound: telemetry from the transport
//! passes the last-known-value cache (duplicate and epoch filtering) and is
//! fanned out to every subscriber whose pattern matches.
//!
//! Acceptance, fan-out, subscription and session reset all happen under one
//! lock, so a subscriber registered after a session switch can never see a
//! value from the previous session.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, warn};

use devlink_core::{
    Accept, CachedValue, Command, CommandId, CommandReply, CommandSchema, ConnectionState,
    LastValueCache, PluginId, SchemaRegistry, TelemetryEvent, TopicPattern,
};

use crate::error::BusError;
use crate::subscription::{spawn_worker, BusStats, Subscriber, TelemetryHandler};
use crate::transport::Transport;

/// Snapshot of bus counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BusDiagnostics {
    /// Events handed to subscriber queues.
    pub delivered: u64,
    /// Duplicate or out-of-order events rejected.
    pub duplicates: u64,
    /// Events from a previous session rejected.
    pub stale_epoch: u64,
    /// Queued events discarded because a subscriber fell behind.
    pub dropped: u64,
    pub rejected_commands: u64,
    pub handler_panics: u64,
    pub subscribers: usize,
    pub epoch: u64,
    pub high_water_marks: BTreeMap<String, u64>,
}

struct Fanout {
    cache: LastValueCache,
    subscribers: Vec<Arc<Subscriber>>,
}

/// Inbound half of the bus, shared with the transport.
pub(crate) struct BusCore {
    fanout: Mutex<Fanout>,
    per_topic_buffer: usize,
    next_id: AtomicU64,
    /// Sequence counters for host-originated topics.
    local_seq: Mutex<HashMap<String, u64>>,
    stats: Arc<BusStats>,
}

impl BusCore {
    pub fn new(cache: LastValueCache, per_topic_buffer: usize) -> Self {
        Self {
            fanout: Mutex::new(Fanout {
                cache,
                subscribers: Vec::new(),
            }),
            per_topic_buffer,
            next_id: AtomicU64::new(1),
            local_seq: Mutex::new(HashMap::new()),
            stats: Arc::new(BusStats::default()),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.lock().cache.epoch()
    }

    /// Start a new epoch: cached values and queued events are discarded.
    pub fn reset_session(&self) -> u64 {
        let mut fanout = self.lock();
        let epoch = fanout.cache.reset();
        for subscriber in &fanout.subscribers {
            subscriber.clear();
        }
        debug!("Telemetry epoch {} started", epoch);
        epoch
    }

    /// Offer an event received during `epoch` and fan it out if fresh.
    pub fn deliver(&self, epoch: u64, event: TelemetryEvent) -> Accept {
        let mut fanout = self.lock();
        let outcome = fanout.cache.accept(epoch, &event);

        match outcome {
            Accept::Fresh => {
                for subscriber in &fanout.subscribers {
                    if !subscriber.pattern.matches(&event.topic) {
                        continue;
                    }
                    if subscriber.push(event.clone()) {
                        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                }
            }
            Accept::Duplicate { last_seq } => {
                self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Dropping '{}' seq {} (already at {})",
                    event.topic, event.seq, last_seq
                );
            }
            Accept::WrongEpoch => {
                self.stats.stale_epoch.fetch_add(1, Ordering::Relaxed);
                debug!("Dropping '{}' from epoch {}", event.topic, epoch);
            }
        }

        outcome
    }

    /// Publish a host-originated event in the current epoch.
    pub fn emit(&self, topic: &str, payload: serde_json::Value) {
        let seq = {
            let mut seqs = self.local_seq.lock().unwrap_or_else(|e| e.into_inner());
            let seq = seqs.entry(topic.to_string()).or_insert(0);
            *seq += 1;
            *seq
        };
        // A reset between reading the epoch and delivering only means the
        // event is refused as belonging to the old session.
        let epoch = self.epoch();
        self.deliver(epoch, TelemetryEvent::new(topic, seq, payload));
    }

    pub fn subscribe(
        &self,
        pattern: TopicPattern,
        owner: Option<PluginId>,
        handler: Arc<dyn TelemetryHandler>,
        core: Weak<BusCore>,
    ) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let subscriber = Arc::new(Subscriber::new(
            id,
            pattern.clone(),
            owner,
            self.per_topic_buffer,
        ));

        {
            let mut fanout = self.lock();
            for cached in fanout.cache.matching(&pattern, Utc::now()) {
                subscriber.push(cached.event);
            }
            fanout.subscribers.push(subscriber.clone());
        }

        debug!("Subscriber {} registered for '{}'", id, pattern);
        spawn_worker(subscriber, handler, self.stats.clone());

        SubscriptionHandle {
            id,
            pattern: pattern.as_str().to_string(),
            core,
            active: true,
        }
    }

    pub fn unsubscribe(&self, id: u64) {
        let mut fanout = self.lock();
        fanout.subscribers.retain(|s| {
            if s.id == id {
                s.close();
                false
            } else {
                true
            }
        });
    }

    pub fn cached(&self, pattern: &TopicPattern) -> Vec<CachedValue> {
        self.lock().cache.matching(pattern, Utc::now())
    }

    pub fn stats(&self) -> &BusStats {
        &self.stats
    }

    pub fn diagnostics(&self) -> BusDiagnostics {
        let fanout = self.lock();
        BusDiagnostics {
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            duplicates: self.stats.duplicates.load(Ordering::Relaxed),
            stale_epoch: self.stats.stale_epoch.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            rejected_commands: self.stats.rejected_commands.load(Ordering::Relaxed),
            handler_panics: self.stats.handler_panics.load(Ordering::Relaxed),
            subscribers: fanout.subscribers.len(),
            epoch: fanout.cache.epoch(),
            high_water_marks: fanout.cache.high_water_marks(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Fanout> {
        self.fanout.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Keeps a subscription alive. Dropping the handle cancels it.
#[must_use = "dropping the handle cancels the subscription"]
pub struct SubscriptionHandle {
    id: u64,
    pattern: String,
    core: Weak<BusCore>,
    active: bool,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Stop delivery. Events already being handled finish normally.
    pub fn cancel(mut self) {
        self.release();
    }

    /// Keep the subscription for the lifetime of the bus.
    pub fn detach(mut self) {
        self.active = false;
    }

    fn release(&mut self) {
        if !std::mem::take(&mut self.active) {
            return;
        }
        if let Some(core) = self.core.upgrade() {
            core.unsubscribe(self.id);
            debug!("Subscriber {} cancelled", self.id);
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("pattern", &self.pattern)
            .field("active", &self.active)
            .finish()
    }
}

/// Command/telemetry bus for the active device session.
#[derive(Clone)]
pub struct Bus {
    core: Arc<BusCore>,
    transport: Arc<Transport>,
    schemas: Arc<RwLock<SchemaRegistry>>,
    /// Topics only the provisioning driver may send.
    reserved: Arc<RwLock<HashSet<String>>>,
    reply_timeout: Duration,
}

impl Bus {
    pub(crate) fn new(core: Arc<BusCore>, transport: Arc<Transport>, reply_timeout: Duration) -> Self {
        Self {
            core,
            transport,
            schemas: Arc::new(RwLock::new(SchemaRegistry::new())),
            reserved: Arc::new(RwLock::new(HashSet::new())),
            reply_timeout,
        }
    }

    /// Accept payloads for `topic` that satisfy `schema`. Reserved topics
    /// keep their schema.
    pub fn register_schema(&self, topic: &str, schema: CommandSchema) {
        if self.is_reserved(topic) {
            warn!("Ignoring schema for reserved topic '{}'", topic);
            return;
        }
        self.schemas
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(topic, schema);
    }

    /// Register `schema` for `topic` and refuse the topic on the public
    /// publish paths. Only [`Bus::publish_reserved`] can send it.
    pub(crate) fn reserve(&self, topic: &str, schema: CommandSchema) {
        self.schemas
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(topic, schema);
        self.reserved
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(topic.to_string());
    }

    pub fn is_reserved(&self, topic: &str) -> bool {
        self.reserved
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(topic)
    }

    pub fn command_topics(&self) -> Vec<String> {
        let schemas = self.schemas.read().unwrap_or_else(|e| e.into_inner());
        let mut topics: Vec<String> = schemas.topics().map(str::to_string).collect();
        topics.sort();
        topics
    }

    /// Validate and send a command without waiting for the reply.
    pub fn publish_command(&self, command: Command) -> Result<CommandId, BusError> {
        self.check_reserved(&command)?;
        self.publish_reserved(command)
    }

    /// Send a command on a reserved topic.
    pub(crate) fn publish_reserved(&self, command: Command) -> Result<CommandId, BusError> {
        self.validate(&command)?;
        self.transport.send(&command)?;
        debug!("Published '{}' ({})", command.topic, command.id);
        Ok(command.id)
    }

    /// Validate and send a command, then wait for the device reply.
    pub async fn request(&self, command: Command) -> Result<CommandReply, BusError> {
        self.check_reserved(&command)?;
        self.validate(&command)?;
        let reply = self.transport.request(&command, self.reply_timeout).await?;
        if !reply.ok {
            return Err(BusError::Rejected {
                topic: command.topic,
                reason: reply.error.unwrap_or_else(|| "no reason given".to_string()),
            });
        }
        Ok(reply)
    }

    /// Subscribe to telemetry topics matching `pattern`.
    ///
    /// The handler first receives the cached value of every matching topic,
    /// then live events as they arrive.
    pub fn subscribe<H>(&self, pattern: &str, handler: H) -> Result<SubscriptionHandle, BusError>
    where
        H: TelemetryHandler,
    {
        self.subscribe_as(pattern, None, Arc::new(handler))
    }

    pub(crate) fn subscribe_as(
        &self,
        pattern: &str,
        owner: Option<PluginId>,
        handler: Arc<dyn TelemetryHandler>,
    ) -> Result<SubscriptionHandle, BusError> {
        let pattern = TopicPattern::new(pattern)?;
        Ok(self
            .core
            .subscribe(pattern, owner, handler, Arc::downgrade(&self.core)))
    }

    /// Publish a host-originated telemetry event.
    pub fn emit(&self, topic: &str, payload: serde_json::Value) {
        self.core.emit(topic, payload);
    }

    /// Cached values for topics matching `pattern`.
    pub fn cached(&self, pattern: &str) -> Result<Vec<CachedValue>, BusError> {
        let pattern = TopicPattern::new(pattern)?;
        Ok(self.core.cached(&pattern))
    }

    pub fn link_state(&self) -> watch::Receiver<ConnectionState> {
        self.transport.watch_state()
    }

    pub fn diagnostics(&self) -> BusDiagnostics {
        self.core.diagnostics()
    }

    fn check_reserved(&self, command: &Command) -> Result<(), BusError> {
        if !self.is_reserved(&command.topic) {
            return Ok(());
        }
        self.core
            .stats()
            .rejected_commands
            .fetch_add(1, Ordering::Relaxed);
        match &command.issuer {
            Some(issuer) => warn!("'{}' tried to send reserved '{}'", issuer, command.topic),
            None => warn!("Refused reserved topic '{}'", command.topic),
        }
        Err(BusError::Reserved {
            topic: command.topic.clone(),
        })
    }

    fn validate(&self, command: &Command) -> Result<(), BusError> {
        let result = self
            .schemas
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .validate(&command.topic, &command.payload);

        if let Err(violation) = result {
            self.core
                .stats()
                .rejected_commands
                .fetch_add(1, Ordering::Relaxed);
            match &command.issuer {
                Some(issuer) => warn!("Rejected command from '{}': {}", issuer, violation),
                None => warn!("Rejected command: {}", violation),
            }
            return Err(violation.into());
        }
        Ok(())
    }
}
