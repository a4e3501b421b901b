//! # devlink-core
//!
//! Core data model for talking to an embedded device over one shared,
//! unreliable control channel.
//!
//! This crate provides:
//! - Device session, command and telemetry types
//! - Topic pattern matching for subscriptions
//! - The per-topic last-known-value cache with sequence tracking
//! - Command payload schemas
//! - Persisted configuration storage
//!
//! This crate is intentionally runtime-agnostic and contains no async code.

pub mod cache;
pub mod config;
pub mod model;
pub mod schema;
pub mod topic;

pub use cache::{Accept, CachedValue, LastValueCache};
pub use config::{ConfigError, ConfigStorage, FileConfigStorage, LastSession, MemoryConfigStorage};
pub use model::*;
pub use schema::{CommandSchema, FieldKind, SchemaRegistry, SchemaViolation};
pub use topic::{PatternError, TopicPattern};
