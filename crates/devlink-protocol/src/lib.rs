//! # devlink-protocol
//!
//! Frames exchanged with the device control endpoint and their codec.
//!
//! The wire encoding is device-defined; this crate is the single place the
//! rest of the workspace depends on for it.

pub mod codec;
pub mod messages;

pub use codec::*;
pub use messages::*;
