//! # devlink-runtime
//!
//! Async runtime for one host talking to one embedded device at a time.
//!
//! The [`Shell`] owns every piece:
//! - [`Transport`] keeps the single WebSocket control channel alive
//! - [`Bus`] fans device telemetry out to subscribers and routes commands
//! - [`Provisioning`] walks a device from access-point mode onto a network
//! - [`PluginRegistry`] activates feature plugins against the bus
//! - [`SessionDirectory`] remembers known devices and the active one

pub mod backoff;
pub mod bus;
pub mod config;
pub mod error;
pub mod network;
pub mod provisioning;
pub mod registry;
pub mod session;
pub mod shell;
pub mod subscription;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use backoff::ReconnectBackoff;
pub use bus::{Bus, BusDiagnostics, SubscriptionHandle};
pub use config::{
    AutostaleRule, BusConfig, DevlinkConfig, ProvisioningConfig, SessionConfig, TransportConfig,
};
pub use error::{BusError, ProvisioningError, RegistryError, ShellError, TransportError};
pub use network::{
    AccessPoint, NetworkError, NetworkJoiner, NmcliDetector, NmcliJoiner, NoopJoiner,
    PortalDetector, StaticDetector,
};
pub use provisioning::{transition, Effect, Provisioning, ProvisioningInput};
pub use registry::{
    LifecycleState, Plugin, PluginContext, PluginDescriptor, PluginRegistry, PluginSummary,
};
pub use session::SessionDirectory;
pub use shell::{Shell, ShellDiagnostics, ShellSeams};
pub use subscription::{handler_fn, ChannelHandler, FnHandler, TelemetryHandler};
pub use transport::Transport;

pub use devlink_core::{
    topics, CachedValue, Command, CommandId, CommandReply, CommandSchema, ConnectionState,
    DeviceId, DeviceSession, Endpoint, FaultReason, FieldKind, PluginId, ProvisioningState,
    TelemetryEvent,
};
