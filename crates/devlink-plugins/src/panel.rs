//! Panel plugins and the view the UI reads them through.
//!
//! Panels hold no values of their own. A snapshot is read from the bus
//! cache on demand, so a session switch or link loss empties every panel at
//! the same moment it empties the cache.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use devlink_core::{CachedValue, PluginId};
use devlink_runtime::{BusError, Plugin, PluginContext};

/// Latest value of one topic.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PanelValue {
    pub seq: u64,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
    pub stale: bool,
}

impl From<CachedValue> for PanelValue {
    fn from(cached: CachedValue) -> Self {
        Self {
            seq: cached.event.seq,
            payload: cached.event.payload,
            received_at: cached.event.received_at,
            stale: cached.stale,
        }
    }
}

/// Everything one panel currently shows, keyed by topic.
pub type PanelSnapshot = BTreeMap<String, PanelValue>;

struct PanelSource {
    ctx: PluginContext,
    topics: Vec<String>,
}

/// Active panels, shared between the plugins and the UI.
#[derive(Clone, Default)]
pub struct PanelStore {
    panels: Arc<RwLock<BTreeMap<PluginId, PanelSource>>>,
}

impl PanelStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current values of an active panel's topics.
    pub fn snapshot(&self, plugin: &PluginId) -> Option<PanelSnapshot> {
        let panels = self.read();
        let source = panels.get(plugin)?;

        let mut snapshot = PanelSnapshot::new();
        for topic in &source.topics {
            match source.ctx.cached(topic) {
                Ok(values) => {
                    for cached in values {
                        snapshot.insert(cached.event.topic.clone(), cached.into());
                    }
                }
                Err(e) => warn!("Panel {} cannot read '{}': {}", plugin, topic, e),
            }
        }
        Some(snapshot)
    }

    /// Names of the active panels.
    pub fn panels(&self) -> Vec<PluginId> {
        self.read().keys().cloned().collect()
    }

    fn attach(&self, ctx: &PluginContext, topics: &[String]) {
        let source = PanelSource {
            ctx: ctx.clone(),
            topics: topics.to_vec(),
        };
        self.panels
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(ctx.plugin().clone(), source);
    }

    fn detach(&self, plugin: &PluginId) {
        self.panels
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(plugin);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<PluginId, PanelSource>> {
        self.panels.read().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for PanelStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PanelStore")
            .field("panels", &self.panels())
            .finish()
    }
}

/// A plugin that shows the cached values of its topics.
pub struct PanelPlugin {
    store: PanelStore,
    topics: Vec<String>,
    plugin: Option<PluginId>,
}

impl PanelPlugin {
    pub fn new(store: PanelStore, topics: &[&str]) -> Self {
        Self {
            store,
            topics: topics.iter().map(|t| t.to_string()).collect(),
            plugin: None,
        }
    }
}

impl Plugin for PanelPlugin {
    fn on_activate(&mut self, ctx: &PluginContext) -> Result<(), BusError> {
        // Fail activation on a malformed pattern rather than on every read.
        for topic in &self.topics {
            ctx.cached(topic)?;
        }
        self.store.attach(ctx, &self.topics);
        debug!("Panel {} showing {:?}", ctx.plugin(), self.topics);
        self.plugin = Some(ctx.plugin().clone());
        Ok(())
    }

    fn on_deactivate(&mut self) {
        if let Some(plugin) = self.plugin.take() {
            self.store.detach(&plugin);
        }
    }
}
