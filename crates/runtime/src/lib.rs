//! Tabmux runtime - browser process, transport, connection pool, profiles.
//!
//! This crate provides the low-level infrastructure for driving a single
//! browser process on behalf of many concurrent logical clients:
//!
//! - **Browser management**: Locating, launching, and attaching to the
//!   browser process
//! - **Transport**: Bidirectional communication over the DevTools WebSocket
//! - **Connection**: Command/response correlation and event dispatch
//! - **Pool**: The single shared connection, reconnect policy, timeouts
//! - **Profile**: User-data-directory resolution and tiered cookie sync
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐
//! │   tabmux    │  Registry, refs, workflows (crates/core)
//! └──────┬──────┘
//!        │ consumes ProtocolClient
//! ┌──────▼──────┐
//! │   runtime   │  This crate
//! │  ┌────────┐ │
//! │  │ Pool   │ │  Shared connection, timeouts, reconnect
//! │  └────────┘ │
//! │  ┌────────┐ │
//! │  │ Conn   │ │  Command correlation, event channels
//! │  └────────┘ │
//! │  ┌────────┐ │
//! │  │ Trans  │ │  WebSocket transport
//! │  └────────┘ │
//! │  ┌────────┐ │
//! │  │ Browser│ │  Process + profile management
//! │  └────────┘ │
//! └─────────────┘
//! ```
//!
//! # Decoupling via ProtocolClient
//!
//! The registry and orchestrator in `tabmux` talk to the browser through
//! the [`ProtocolClient`] trait rather than a concrete connection. The
//! [`ConnectionPool`] implements it for production; [`testing::FakeBrowser`]
//! implements it for tests.

pub mod browser;
pub mod connection;
pub mod cookie_sync;
pub mod error;
pub mod pool;
pub mod profile;
pub mod testing;
pub mod transport;

// Re-export key types at crate root
pub use browser::{BrowserProcess, LaunchConfig, find_browser_executable};
pub use connection::{Connection, EventStream};
pub use cookie_sync::{CookieCopyStrategy, copy_cookie_store, default_strategies};
pub use error::{Error, Result};
pub use pool::{BoxFuture, ConnectionPool, DEFAULT_COMMAND_TIMEOUT, ProtocolClient};
pub use profile::{ProfileKind, ProfileManager, ResolvedProfile, SyncMetadata, SyncReport};
pub use transport::{Transport, TransportParts, TransportReceiver, WebSocketTransport};
