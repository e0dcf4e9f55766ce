//! The pooled protocol connection.
//!
//! Exactly one live control connection serves every session, worker, and
//! target. The pool owns that connection: it dials lazily, hands the shared
//! handle to concurrent callers, makes a single best-effort reconnect
//! attempt if the transport drops, and fails fast once that attempt is
//! spent. Every command issued through the pool carries a deadline;
//! deadline misses surface as typed timeout errors with the pending entry
//! already cleaned up.

use crate::connection::{Connection, EventStream};
use crate::error::{Error, Result};
use crate::transport::WebSocketTransport;
use parking_lot::Mutex as ParkingLotMutex;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex as TokioMutex;

/// Default deadline for one provider round-trip.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Type alias for the boxed futures used by [`ProtocolClient`].
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Object-safe client interface for issuing protocol commands and
/// subscribing to provider events.
///
/// This is the seam between the registry/orchestrator and the wire:
/// [`ConnectionPool`] implements it for production, and
/// [`crate::testing::FakeBrowser`] implements it for tests.
pub trait ProtocolClient: Send + Sync {
    /// Issue a command with the default deadline. `session_id` scopes the
    /// command to an attached tab; `None` targets the browser itself.
    fn send_command(
        &self,
        session_id: Option<&str>,
        method: &str,
        params: Value,
    ) -> BoxFuture<'_, Result<Value>>;

    /// Issue a command with an explicit deadline.
    fn send_command_with_timeout(
        &self,
        session_id: Option<&str>,
        method: &str,
        params: Value,
        limit: Duration,
    ) -> BoxFuture<'_, Result<Value>>;

    /// Subscribe to events for a protocol session id ("" = browser-level),
    /// optionally filtered by event method name.
    fn subscribe(&self, session_id: &str, event: Option<&str>)
    -> BoxFuture<'_, Result<EventStream>>;

    /// Drop all event subscriptions for a closed target's session.
    fn clear_session(&self, session_id: &str);
}

/// Owns the single transport connection to the browser.
pub struct ConnectionPool {
    ws_url: String,
    /// The live connection, when one exists.
    current: ParkingLotMutex<Option<Arc<Connection>>>,
    /// Serializes dial attempts so concurrent acquirers share one dial.
    dial_lock: TokioMutex<()>,
    /// Whether the pool ever held a live connection. A dial failure after
    /// that counts as the one reconnect attempt.
    ever_connected: AtomicBool,
    /// Set when the reconnect attempt failed; `acquire` fails fast until
    /// `reset`.
    broken: AtomicBool,
}

impl ConnectionPool {
    /// Create a pool for the given DevTools WebSocket URL. No connection
    /// is dialed until the first `acquire`.
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            current: ParkingLotMutex::new(None),
            dial_lock: TokioMutex::new(()),
            ever_connected: AtomicBool::new(false),
            broken: AtomicBool::new(false),
        }
    }

    /// Returns the (lazily established) shared connection, re-dialing once
    /// if the previous transport dropped. After a failed reconnect the
    /// pool is broken and this fails fast until [`reset`](Self::reset).
    pub async fn acquire(&self) -> Result<Arc<Connection>> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(Error::PoolBroken);
        }

        if let Some(connection) = self.live_connection() {
            return Ok(connection);
        }

        let _dial = self.dial_lock.lock().await;

        // Another acquirer may have dialed while we waited.
        if self.broken.load(Ordering::SeqCst) {
            return Err(Error::PoolBroken);
        }
        if let Some(connection) = self.live_connection() {
            return Ok(connection);
        }

        let reconnecting = self.ever_connected.load(Ordering::SeqCst);
        if reconnecting {
            tracing::warn!(url = %self.ws_url, "transport dropped; attempting reconnect");
        }

        match Self::dial(&self.ws_url).await {
            Ok(connection) => {
                self.ever_connected.store(true, Ordering::SeqCst);
                *self.current.lock() = Some(Arc::clone(&connection));
                Ok(connection)
            }
            Err(e) => {
                if reconnecting {
                    tracing::error!(url = %self.ws_url, "reconnect failed; pool is broken: {}", e);
                    self.broken.store(true, Ordering::SeqCst);
                }
                Err(e)
            }
        }
    }

    fn live_connection(&self) -> Option<Arc<Connection>> {
        let mut current = self.current.lock();
        match current.as_ref() {
            Some(connection) if !connection.is_closed() => Some(Arc::clone(connection)),
            Some(_) => {
                *current = None;
                None
            }
            None => None,
        }
    }

    async fn dial(ws_url: &str) -> Result<Arc<Connection>> {
        let parts = WebSocketTransport::connect(ws_url).await?;
        let connection = Arc::new(Connection::new(parts));
        let conn_for_loop = Arc::clone(&connection);
        tokio::spawn(async move {
            conn_for_loop.run().await;
        });
        Ok(connection)
    }

    /// Whether the pool has given up until an external restart.
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    /// Clear the broken state after an external actor restarted the
    /// browser (typically with a new `ws_url`-equivalent endpoint behind
    /// the same URL).
    pub fn reset(&self) {
        self.broken.store(false, Ordering::SeqCst);
        self.ever_connected.store(false, Ordering::SeqCst);
        *self.current.lock() = None;
    }

    /// Fail all pending commands, then tear the connection down.
    pub async fn shutdown(&self) {
        let connection = self.current.lock().take();
        if let Some(connection) = connection {
            connection.shutdown().await;
        }
    }

    async fn send_timed(
        &self,
        session_id: Option<String>,
        method: String,
        params: Value,
        limit: Duration,
    ) -> Result<Value> {
        let connection = self.acquire().await?;
        let send = connection.send_command(session_id.as_deref(), &method, params);
        match tokio::time::timeout(limit, send).await {
            Ok(result) => result,
            // Dropping the future removed the pending entry; a late
            // response cannot reach us anymore.
            Err(_) => Err(Error::Timeout {
                operation: method,
                limit_ms: limit.as_millis() as u64,
            }),
        }
    }
}

impl ProtocolClient for ConnectionPool {
    fn send_command(
        &self,
        session_id: Option<&str>,
        method: &str,
        params: Value,
    ) -> BoxFuture<'_, Result<Value>> {
        self.send_command_with_timeout(session_id, method, params, DEFAULT_COMMAND_TIMEOUT)
    }

    fn send_command_with_timeout(
        &self,
        session_id: Option<&str>,
        method: &str,
        params: Value,
        limit: Duration,
    ) -> BoxFuture<'_, Result<Value>> {
        let session_id = session_id.map(str::to_string);
        let method = method.to_string();
        Box::pin(async move { self.send_timed(session_id, method, params, limit).await })
    }

    fn subscribe(
        &self,
        session_id: &str,
        event: Option<&str>,
    ) -> BoxFuture<'_, Result<EventStream>> {
        let session_id = session_id.to_string();
        let event = event.map(str::to_string);
        Box::pin(async move {
            let connection = self.acquire().await?;
            Ok(connection.subscribe(&session_id, event.as_deref()))
        })
    }

    fn clear_session(&self, session_id: &str) {
        if let Some(connection) = self.live_connection() {
            connection.clear_session_subscriptions(session_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_fails_fast_once_broken() {
        // Nothing listens on this port; after a simulated prior connection
        // the dial failure must mark the pool broken.
        let pool = ConnectionPool::new("ws://127.0.0.1:1/devtools/browser/none");
        pool.ever_connected.store(true, Ordering::SeqCst);

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, Error::ConnectionFailed(_)), "got {err:?}");
        assert!(pool.is_broken());

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, Error::PoolBroken));
    }

    #[tokio::test]
    async fn initial_dial_failure_does_not_break_the_pool() {
        let pool = ConnectionPool::new("ws://127.0.0.1:1/devtools/browser/none");

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, Error::ConnectionFailed(_)), "got {err:?}");
        assert!(!pool.is_broken(), "first dial is not the reconnect attempt");
    }

    #[tokio::test]
    async fn reset_clears_broken_state() {
        let pool = ConnectionPool::new("ws://127.0.0.1:1/devtools/browser/none");
        pool.broken.store(true, Ordering::SeqCst);

        pool.reset();
        assert!(!pool.is_broken());
    }
}
