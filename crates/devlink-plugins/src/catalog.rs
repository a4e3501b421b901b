//! Descriptors of the built-in plugins.
//!
//! Topic and command names follow the device firmware: `<feature>/<item>`
//! for telemetry, `<feature>/<verb>` for commands.

use devlink_core::{topics, CommandSchema, FieldKind};
use devlink_runtime::PluginDescriptor;

use crate::panel::{PanelPlugin, PanelStore};

pub const MQTT_CONFIG: &str = "mqtt/config";
pub const SNTP_CONFIG: &str = "sntp/config";
pub const SNTP_SYNC: &str = "sntp/sync";
pub const NETIF_CONFIG: &str = "netif/config";
pub const BUZZER_PLAY: &str = "buzzer/play";
pub const DEBUG_TASKS_REFRESH: &str = "debug/tasks/refresh";
pub const DEBUG_PINS_SET: &str = "debug/pins/set";
pub const DEBUG_PINS_MODE: &str = "debug/pins/mode";
pub const I2C_SCAN: &str = "i2c/scan";
pub const SYSTEM_INFO: &str = "system/info";
pub const SYSTEM_RESTART: &str = "system/restart";

/// Highest GPIO number on the supported chips.
const MAX_GPIO: i64 = 48;

fn panel(store: &PanelStore, name: &str, topics: &'static [&'static str]) -> PluginDescriptor {
    let store = store.clone();
    let mut descriptor = PluginDescriptor::new(name, move || PanelPlugin::new(store.clone(), topics));
    for topic in topics {
        descriptor = descriptor.topic(topic);
    }
    descriptor
}

/// Captive-portal discovery and provisioning progress.
pub fn captive_portal(store: &PanelStore) -> PluginDescriptor {
    panel(
        store,
        "captive-portal",
        &[topics::PORTAL_ADVERTISED, topics::PROVISIONING_STATE],
    )
    .title("Captive portal")
    .capability("portal")
}

/// Device information and restart.
pub fn system(store: &PanelStore) -> PluginDescriptor {
    panel(store, "system", &["system/*", topics::LINK_STATE])
        .title("System")
        .capability("system")
        .command(SYSTEM_INFO, CommandSchema::empty())
        .command(SYSTEM_RESTART, CommandSchema::empty())
}

/// Station status and scan results. Scans and credentials go through
/// `PluginContext::provisioning`, since the WiFi commands are reserved.
pub fn wifi(store: &PanelStore) -> PluginDescriptor {
    panel(store, "wifi", &["wifi/*"])
        .title("WiFi")
        .capability("wifi")
}

pub fn mqtt(store: &PanelStore) -> PluginDescriptor {
    panel(store, "mqtt", &["mqtt/*"])
        .title("MQTT")
        .capability("mqtt")
        .command(
            MQTT_CONFIG,
            CommandSchema::empty()
                .optional("enabled", FieldKind::Bool)
                .optional("uri", FieldKind::String)
                .length(1, 256)
                .optional("client", FieldKind::String)
                .length(1, 64)
                .optional("username", FieldKind::String)
                .optional("password", FieldKind::String)
                .optional("keepalive", FieldKind::Integer)
                .range(0, 3600),
        )
}

pub fn sntp(store: &PanelStore) -> PluginDescriptor {
    panel(store, "sntp", &["sntp/*"])
        .title("SNTP")
        .capability("sntp")
        .command(
            SNTP_CONFIG,
            CommandSchema::empty()
                .optional("enabled", FieldKind::Bool)
                .optional("host", FieldKind::String)
                .length(1, 255)
                .optional("timezone", FieldKind::String),
        )
        .command(SNTP_SYNC, CommandSchema::empty())
}

pub fn network_interfaces(store: &PanelStore) -> PluginDescriptor {
    panel(store, "network-interfaces", &["netif/*"])
        .title("Network interfaces")
        .capability("netif")
        .command(
            NETIF_CONFIG,
            CommandSchema::empty()
                .required("interface", FieldKind::String)
                .length(1, 16)
                .optional("dhcp", FieldKind::Bool)
                .optional("ip", FieldKind::String)
                .optional("netmask", FieldKind::String)
                .optional("gateway", FieldKind::String)
                .optional("dns", FieldKind::Array),
        )
}

/// A buzzer. Several buzzers may be attached, so the capability is shared.
pub fn buzzer(store: &PanelStore, name: &str) -> PluginDescriptor {
    panel(store, name, &["buzzer/*"])
        .title("Buzzer")
        .capability("buzzer")
        .composable()
        .command(
            BUZZER_PLAY,
            CommandSchema::empty()
                .required("frequency", FieldKind::Integer)
                .range(20, 20_000)
                .required("duration", FieldKind::Integer)
                .range(1, 10_000),
        )
}

pub fn debug_tasks(store: &PanelStore) -> PluginDescriptor {
    panel(store, "debug-tasks", &["debug/tasks"])
        .title("Tasks")
        .capability("debug")
        .composable()
        .command(DEBUG_TASKS_REFRESH, CommandSchema::empty())
}

pub fn debug_pins(store: &PanelStore) -> PluginDescriptor {
    panel(store, "debug-pins", &["debug/pins/*"])
        .title("Pins")
        .capability("debug")
        .composable()
        .command(
            DEBUG_PINS_SET,
            CommandSchema::empty()
                .required("pin", FieldKind::Integer)
                .range(0, MAX_GPIO)
                .required("level", FieldKind::Integer)
                .range(0, 1),
        )
        .command(
            DEBUG_PINS_MODE,
            CommandSchema::empty()
                .required("pin", FieldKind::Integer)
                .range(0, MAX_GPIO)
                .required("mode", FieldKind::String)
                .length(1, 16),
        )
}

pub fn i2c_scanner(store: &PanelStore) -> PluginDescriptor {
    panel(store, "i2c-scanner", &["i2c/*"])
        .title("I2C scanner")
        .capability("i2c")
        .command(
            I2C_SCAN,
            CommandSchema::empty()
                .optional("port", FieldKind::Integer)
                .range(0, 1),
        )
}

/// The default plugin set, in activation order.
pub fn builtin_plugins(store: &PanelStore) -> Vec<PluginDescriptor> {
    vec![
        debug_pins(store),
        captive_portal(store),
        system(store),
        wifi(store),
        mqtt(store),
        sntp(store),
        network_interfaces(store),
        buzzer(store, "buzzer"),
        debug_tasks(store),
        i2c_scanner(store),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    use devlink_core::{MemoryConfigStorage, PluginId};
    use devlink_runtime::{BusError, Command, DevlinkConfig, LifecycleState, Shell, ShellSeams};

    fn start(store: &PanelStore) -> Shell {
        Shell::start(
            DevlinkConfig::default(),
            ShellSeams::new(Arc::new(MemoryConfigStorage::new())),
            builtin_plugins(store),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_builtin_plugins_activate() {
        let store = PanelStore::new();
        let shell = start(&store);

        let plugins = shell.plugins();
        assert_eq!(plugins.len(), 10);
        assert!(plugins.iter().all(|p| p.state == LifecycleState::Active));
        assert_eq!(plugins[0].name, PluginId::new("debug-pins"));

        let topics = shell.bus().command_topics();
        for topic in [BUZZER_PLAY, MQTT_CONFIG, I2C_SCAN, "wifi/connect"] {
            assert!(topics.iter().any(|t| t == topic), "missing {}", topic);
        }
        // WiFi commands belong to the provisioning driver.
        assert!(shell.bus().is_reserved("wifi/connect"));
        assert!(!shell.bus().is_reserved(BUZZER_PLAY));

        shell.shutdown().await;
    }

    #[tokio::test]
    async fn test_panel_receives_telemetry() {
        let store = PanelStore::new();
        let shell = start(&store);
        let system = PluginId::new("system");

        shell.bus().emit("system/heap", json!({"free": 123_456}));

        let snapshot = store.snapshot(&system).expect("system panel is active");
        assert_eq!(snapshot["system/heap"].payload, json!({"free": 123_456}));
        assert!(store
            .snapshot(&PluginId::new("mqtt"))
            .unwrap()
            .is_empty());

        // Losing the session empties the panel along with the bus cache.
        shell.disconnect().await;
        let snapshot = store.snapshot(&system).unwrap();
        assert!(!snapshot.contains_key("system/heap"));

        shell.shutdown().await;
        assert!(store.snapshot(&system).is_none());
    }

    #[tokio::test]
    async fn test_buzzer_schema_enforced() {
        let store = PanelStore::new();
        let shell = start(&store);

        let err = shell
            .publish(Command::new(BUZZER_PLAY, json!({"frequency": 5, "duration": 100})))
            .unwrap_err();
        assert!(matches!(err, BusError::SchemaViolation(_)));

        shell.shutdown().await;
    }

    #[test]
    fn test_shared_capabilities_are_composable() {
        let store = PanelStore::new();
        let debug: Vec<_> = builtin_plugins(&store)
            .into_iter()
            .filter(|p| p.has_capability("debug"))
            .collect();
        assert_eq!(debug.len(), 2);
        assert!(debug.iter().all(|p| p.composable));
    }
}
