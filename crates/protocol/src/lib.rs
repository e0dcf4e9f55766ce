//! Wire types for the browser control protocol.
//!
//! This crate contains the serde-serializable types used for communication
//! with the browser process over its DevTools WebSocket. These types
//! represent the "protocol layer" - the shapes of data as they appear on
//! the wire.
//!
//! # Design Philosophy
//!
//! Types in this crate are:
//! - **Pure data**: No behavior beyond serialization/deserialization
//! - **1:1 with the wire**: Command/response/event envelopes and the
//!   `Target.*` payloads the runtime consumes
//! - **Stable**: Changes only when the wire protocol changes
//!
//! Higher-level ergonomic APIs are built on top of these types in `tabmux`.

pub mod message;
pub mod target;

pub use message::*;
pub use target::*;
