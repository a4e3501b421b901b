//! Plugin registry.
//!
//! Plugins are described by a [`PluginDescriptor`] (capability tags, topic
//! patterns, command schemas and a factory) and registered before the shell
//! activates them. The registry owns every subscription a plugin makes
//! through its [`PluginContext`], so deactivating a plugin always releases
//! them.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use devlink_core::{
    CachedValue, Command, CommandId, CommandReply, CommandSchema, ConnectionState, PluginId,
    ProvisioningState, TopicPattern,
};

use crate::bus::{Bus, SubscriptionHandle};
use crate::error::{BusError, RegistryError};
use crate::provisioning::Provisioning;
use crate::subscription::TelemetryHandler;

/// A UI plugin instance.
pub trait Plugin: Send {
    /// Called once the shell is running. Subscriptions made through `ctx`
    /// stay active until the plugin is deactivated.
    fn on_activate(&mut self, ctx: &PluginContext) -> Result<(), BusError>;

    fn on_deactivate(&mut self) {}
}

type Factory = Arc<dyn Fn() -> Box<dyn Plugin> + Send + Sync>;

/// Static description of a plugin. Immutable once registered.
#[derive(Clone)]
pub struct PluginDescriptor {
    pub name: PluginId,
    pub title: String,
    pub capabilities: Vec<String>,
    /// May share its capabilities with other composable plugins.
    pub composable: bool,
    pub topics: Vec<String>,
    pub commands: Vec<(String, CommandSchema)>,
    factory: Factory,
}

impl PluginDescriptor {
    pub fn new<F, P>(name: &str, factory: F) -> Self
    where
        F: Fn() -> P + Send + Sync + 'static,
        P: Plugin + 'static,
    {
        Self {
            name: PluginId::new(name),
            title: name.to_string(),
            capabilities: Vec::new(),
            composable: false,
            topics: Vec::new(),
            commands: Vec::new(),
            factory: Arc::new(move || Box::new(factory()) as Box<dyn Plugin>),
        }
    }

    pub fn title(mut self, title: &str) -> Self {
        self.title = title.to_string();
        self
    }

    pub fn capability(mut self, tag: &str) -> Self {
        self.capabilities.push(tag.to_string());
        self
    }

    pub fn composable(mut self) -> Self {
        self.composable = true;
        self
    }

    /// Declare a telemetry topic pattern the plugin listens to.
    pub fn topic(mut self, pattern: &str) -> Self {
        self.topics.push(pattern.to_string());
        self
    }

    /// Declare a command the plugin may issue.
    pub fn command(mut self, topic: &str, schema: CommandSchema) -> Self {
        self.commands.push((topic.to_string(), schema));
        self
    }

    pub fn has_capability(&self, tag: &str) -> bool {
        self.capabilities.iter().any(|c| c == tag)
    }

    fn instantiate(&self) -> Box<dyn Plugin> {
        (self.factory)()
    }
}

impl std::fmt::Debug for PluginDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginDescriptor")
            .field("name", &self.name)
            .field("capabilities", &self.capabilities)
            .field("composable", &self.composable)
            .field("topics", &self.topics)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LifecycleState {
    Registered,
    Active,
    /// `on_activate` failed.
    Failed,
    Inactive,
    Disposed,
}

/// Plugin listing for the UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginSummary {
    pub name: PluginId,
    pub title: String,
    pub capabilities: Vec<String>,
    pub topics: Vec<String>,
    pub commands: Vec<String>,
    pub state: LifecycleState,
}

/// What a plugin can reach while active.
#[derive(Clone)]
pub struct PluginContext {
    plugin: PluginId,
    topics: Vec<String>,
    bus: Bus,
    provisioning: Provisioning,
    subscriptions: Arc<Mutex<Vec<SubscriptionHandle>>>,
}

impl PluginContext {
    pub fn plugin(&self) -> &PluginId {
        &self.plugin
    }

    /// Subscribe to one of the topic patterns the descriptor declares.
    pub fn subscribe<H>(&self, pattern: &str, handler: H) -> Result<(), BusError>
    where
        H: TelemetryHandler,
    {
        let normalized = TopicPattern::new(pattern)?;
        let declared = self.topics.iter().any(|topic| {
            TopicPattern::new(topic)
                .map(|t| t.as_str() == normalized.as_str())
                .unwrap_or(false)
        });
        if !declared {
            return Err(BusError::UndeclaredTopic {
                plugin: self.plugin.clone(),
                pattern: pattern.to_string(),
            });
        }

        let handle = self
            .bus
            .subscribe_as(pattern, Some(self.plugin.clone()), Arc::new(handler))?;
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
        Ok(())
    }

    /// Issue a command on behalf of this plugin.
    pub fn publish(&self, command: Command) -> Result<CommandId, BusError> {
        self.bus
            .publish_command(command.with_issuer(self.plugin.clone()))
    }

    pub async fn request(&self, command: Command) -> Result<CommandReply, BusError> {
        self.bus.request(command.with_issuer(self.plugin.clone())).await
    }

    pub fn cached(&self, pattern: &str) -> Result<Vec<CachedValue>, BusError> {
        self.bus.cached(pattern)
    }

    pub fn provisioning(&self) -> &Provisioning {
        &self.provisioning
    }

    pub fn provisioning_state(&self) -> watch::Receiver<ProvisioningState> {
        self.provisioning.watch()
    }

    pub fn link_state(&self) -> watch::Receiver<ConnectionState> {
        self.bus.link_state()
    }

    /// Number of live subscriptions made through this context.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

struct Entry {
    descriptor: PluginDescriptor,
    state: LifecycleState,
    instance: Option<Box<dyn Plugin>>,
    subscriptions: Arc<Mutex<Vec<SubscriptionHandle>>>,
}

impl Entry {
    fn release_subscriptions(&self) -> usize {
        let mut subscriptions = self
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let count = subscriptions.len();
        // Dropping a handle cancels it.
        subscriptions.clear();
        count
    }
}

/// Registered plugins, in registration order.
pub struct PluginRegistry {
    bus: Bus,
    provisioning: Provisioning,
    entries: Vec<Entry>,
    started: bool,
    disposed: bool,
}

impl PluginRegistry {
    pub fn new(bus: Bus, provisioning: Provisioning) -> Self {
        Self {
            bus,
            provisioning,
            entries: Vec::new(),
            started: false,
            disposed: false,
        }
    }

    /// Register a plugin and the schemas of the commands it issues.
    pub fn register(&mut self, descriptor: PluginDescriptor) -> Result<(), RegistryError> {
        if self.disposed {
            return Err(RegistryError::Disposed);
        }
        if self.get(&descriptor.name).is_some() {
            return Err(RegistryError::DuplicatePlugin(descriptor.name));
        }

        for capability in &descriptor.capabilities {
            let claimed = self
                .entries
                .iter()
                .map(|e| &e.descriptor)
                .find(|d| d.has_capability(capability) && !(d.composable && descriptor.composable));
            if let Some(owner) = claimed {
                return Err(RegistryError::DuplicateCapability {
                    capability: capability.clone(),
                    owner: owner.name.clone(),
                });
            }
        }

        for (topic, schema) in &descriptor.commands {
            self.bus.register_schema(topic, schema.clone());
        }

        debug!(
            "Registered plugin '{}' ({})",
            descriptor.name,
            descriptor.capabilities.join(", ")
        );
        self.entries.push(Entry {
            descriptor,
            state: LifecycleState::Registered,
            instance: None,
            subscriptions: Arc::new(Mutex::new(Vec::new())),
        });
        Ok(())
    }

    pub(crate) fn mark_started(&mut self) {
        self.started = true;
    }

    /// Instantiate and activate every inactive plugin, in registration
    /// order. A plugin that fails to activate is logged and skipped.
    /// Returns the number of active plugins.
    pub fn activate_all(&mut self) -> Result<usize, RegistryError> {
        if self.disposed {
            return Err(RegistryError::Disposed);
        }
        if !self.started {
            return Err(RegistryError::ShellNotStarted);
        }

        for entry in &mut self.entries {
            if entry.state == LifecycleState::Active {
                continue;
            }
            let ctx = PluginContext {
                plugin: entry.descriptor.name.clone(),
                topics: entry.descriptor.topics.clone(),
                bus: self.bus.clone(),
                provisioning: self.provisioning.clone(),
                subscriptions: entry.subscriptions.clone(),
            };

            let mut instance = entry.descriptor.instantiate();
            match instance.on_activate(&ctx) {
                Ok(()) => {
                    entry.state = LifecycleState::Active;
                    entry.instance = Some(instance);
                    debug!("Activated plugin '{}'", entry.descriptor.name);
                }
                Err(e) => {
                    error!("Plugin '{}' failed to activate: {}", entry.descriptor.name, e);
                    entry.release_subscriptions();
                    entry.state = LifecycleState::Failed;
                }
            }
        }

        let active = self.active_count();
        info!("{} of {} plugins active", active, self.entries.len());
        Ok(active)
    }

    /// Deactivate every active plugin in reverse registration order and
    /// cancel their subscriptions.
    pub fn deactivate_all(&mut self) {
        for entry in self.entries.iter_mut().rev() {
            if let Some(mut instance) = entry.instance.take() {
                instance.on_deactivate();
            }
            let released = entry.release_subscriptions();
            if entry.state == LifecycleState::Active {
                debug!(
                    "Deactivated plugin '{}' ({} subscriptions released)",
                    entry.descriptor.name, released
                );
                entry.state = LifecycleState::Inactive;
            }
        }
    }

    /// Deactivate and drop all plugins. The registry cannot be used after.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.deactivate_all();
        for entry in &mut self.entries {
            entry.state = LifecycleState::Disposed;
        }
        self.disposed = true;
        info!("Plugin registry disposed");
    }

    /// Plugins carrying a capability tag.
    pub fn by_capability(&self, tag: &str) -> Vec<&PluginDescriptor> {
        self.entries
            .iter()
            .map(|e| &e.descriptor)
            .filter(|d| d.has_capability(tag))
            .collect()
    }

    pub fn get(&self, name: &PluginId) -> Option<&PluginDescriptor> {
        self.entries
            .iter()
            .map(|e| &e.descriptor)
            .find(|d| &d.name == name)
    }

    pub fn state_of(&self, name: &PluginId) -> Option<LifecycleState> {
        self.entries
            .iter()
            .find(|e| &e.descriptor.name == name)
            .map(|e| e.state)
    }

    pub fn active_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.state == LifecycleState::Active)
            .count()
    }

    pub fn summaries(&self) -> Vec<PluginSummary> {
        self.entries
            .iter()
            .map(|e| PluginSummary {
                name: e.descriptor.name.clone(),
                title: e.descriptor.title.clone(),
                capabilities: e.descriptor.capabilities.clone(),
                topics: e.descriptor.topics.clone(),
                commands: e.descriptor.commands.iter().map(|(t, _)| t.clone()).collect(),
                state: e.state,
            })
            .collect()
    }
}

impl Drop for PluginRegistry {
    fn drop(&mut self) {
        if !self.disposed && self.active_count() > 0 {
            warn!("Plugin registry dropped without dispose");
            self.deactivate_all();
        }
    }
}
