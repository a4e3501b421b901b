//! # devlink-plugins
//!
//! Built-in feature plugins for devlink.
//!
//! Each plugin is a [`PluginDescriptor`](devlink_runtime::PluginDescriptor)
//! naming its capability, the telemetry topics it renders and the commands
//! it may issue. All of them are panel plugins: while active they keep the
//! latest value of every topic they listen to in a shared [`PanelStore`],
//! which UI front ends render from.
//!
//! [`builtin_plugins`] returns the default bootstrap list.

pub mod catalog;
pub mod panel;

pub use catalog::*;
pub use panel::{PanelPlugin, PanelSnapshot, PanelStore, PanelValue};
