//! Tabmux - one browser, many isolated clients.
//!
//! Drives a single real browser process on behalf of many concurrent,
//! isolated logical clients. Exactly one live control connection serves
//! N sessions, each containing workers (isolated browsing contexts with
//! separate cookies and storage) and targets (tabs), with commands and
//! events for different tabs interleaving on that one connection.
//!
//! # Layers
//!
//! - [`registry`]: the session -> worker -> target authority
//! - [`refs`]: short-lived opaque handles for previously observed DOM nodes
//! - [`workflow`]: fault-tolerant parallel fan-out with a staleness breaker
//! - [`tools`]: the seam external tool handlers implement
//! - [`Tabmux`]: the composition root owning all of the above
//!
//! The wire and process layers live in `tabmux-runtime`; their key types
//! are re-exported here so most callers depend on this crate alone.

pub mod refs;
pub mod registry;
pub mod tools;
pub mod workflow;

mod tabmux;

pub use refs::{RefHandle, RefStore};
pub use registry::{
    CreateTargetOutcome, DEFAULT_WORKER_ID, Registry, Session, TargetDisposition, TargetHandle,
    Worker, WorkerSpec,
};
pub use tabmux::Tabmux;
pub use tools::{ToolContext, ToolDescriptor, ToolHandler, ToolRegistry, user_facing_error};
pub use workflow::{
    DEFAULT_STALE_THRESHOLD, WorkerResult, WorkerStatus, WorkerTask, Workflow, WorkflowConfig,
    WorkflowPhase,
};

// Re-export the runtime surface callers need.
pub use tabmux_runtime::{
    BoxFuture, ConnectionPool, Error, EventStream, LaunchConfig, ProtocolClient, Result,
};

/// Wire types, for callers that build raw protocol payloads.
pub use tabmux_protocol as protocol;
