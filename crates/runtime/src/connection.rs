//! Command/response correlation layer on top of the transport.
//!
//! It handles:
//! - Generating unique command sequence ids
//! - Correlating responses with pending commands
//! - Distinguishing events from responses
//! - Routing events to per-protocol-session subscriber channels
//!
//! # Message Flow
//!
//! 1. Caller invokes `send_command()` with an optional protocol session id
//! 2. Connection allocates a sequence id and creates a oneshot channel
//! 3. Command is queued to the writer task (the single wire writer)
//! 4. Caller awaits on the oneshot receiver
//! 5. Dispatch loop receives the response from the transport
//! 6. Response is correlated by id and delivered via the oneshot channel
//!
//! Events carry no id; they are routed by protocol session id to whatever
//! subscriber channels exist for that session ("" for browser-level).

use crate::error::{Error, Result};
use crate::transport::{Transport, TransportParts, TransportReceiver};
use parking_lot::Mutex as ParkingLotMutex;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};
use tabmux_protocol::{Command, CommandResponse, EventMessage, Message};
use tokio::sync::Mutex as TokioMutex;
use tokio::sync::{Notify, mpsc, oneshot};

/// Pending command callbacks keyed by sequence id.
type CallbackMap = Arc<TokioMutex<HashMap<u64, oneshot::Sender<Result<Value>>>>>;

/// Event subscriber channels keyed by protocol session id ("" = browser).
type SubscriberMap = Arc<ParkingLotMutex<HashMap<String, Vec<Subscriber>>>>;

struct Subscriber {
    /// Only deliver events with this method name; `None` delivers all.
    event_filter: Option<String>,
    tx: mpsc::UnboundedSender<EventMessage>,
}

/// Stream of provider events for one subscription.
///
/// Dropping the stream ends the subscription; the connection prunes the
/// dead sender on the next delivery for that session.
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<EventMessage>,
}

impl EventStream {
    /// Receive the next event, or `None` once the subscription is closed
    /// (target closed, connection lost, or shutdown).
    pub async fn recv(&mut self) -> Option<EventMessage> {
        self.rx.recv().await
    }

    #[doc(hidden)]
    pub fn from_receiver(rx: mpsc::UnboundedReceiver<EventMessage>) -> Self {
        Self { rx }
    }
}

/// RAII guard ensuring callback cleanup when a command future is dropped.
///
/// This is what keeps a late response from reaching a caller that already
/// timed out: the timeout drops the future, the guard removes the pending
/// entry, and the eventual response finds nothing to deliver to.
struct CancelGuard {
    id: u64,
    callbacks: CallbackMap,
    completed: bool,
}

impl CancelGuard {
    fn new(id: u64, callbacks: CallbackMap) -> Self {
        Self {
            id,
            callbacks,
            completed: false,
        }
    }

    fn complete(&mut self) {
        self.completed = true;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if self.completed {
            return;
        }

        let id = self.id;
        let callbacks = Arc::clone(&self.callbacks);

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if callbacks.lock().await.remove(&id).is_some() {
                    tracing::debug!(id, "CancelGuard: removed orphaned callback");
                }
            });
        }
    }
}

/// Future returned by [`Connection::send_command`] with automatic
/// cancellation cleanup.
struct ResponseFuture {
    rx: oneshot::Receiver<Result<Value>>,
    guard: CancelGuard,
}

impl Future for ResponseFuture {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(result) => {
                self.guard.complete();
                Poll::Ready(result.map_err(|_| Error::ChannelClosed).and_then(|r| r))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// One control connection to the browser.
///
/// Manages command correlation and event routing. All writes to the wire
/// funnel through a single writer task; reads and dispatch run
/// concurrently with callers.
pub struct Connection {
    /// Sequence id counter (atomic for thread safety).
    last_id: AtomicU64,
    /// Pending command callbacks keyed by sequence id.
    callbacks: CallbackMap,
    /// Channel for queueing outbound frames to the writer task.
    outbound_tx: mpsc::UnboundedSender<Value>,
    /// Event subscribers by protocol session id.
    subscribers: SubscriberMap,
    /// Set once the transport is gone; `send_command` fails fast after.
    closed: Arc<AtomicBool>,
    /// Wakes the writer task for shutdown.
    shutdown_notify: Arc<Notify>,
    /// Transport sender (taken by run() to start the writer task).
    transport_sender: TokioMutex<Option<Box<dyn Transport>>>,
    /// Receiver half of the transport (taken by run()).
    transport_receiver: TokioMutex<Option<Box<dyn TransportReceiver>>>,
    /// Parsed inbound frames (taken by run()).
    message_rx: TokioMutex<Option<mpsc::UnboundedReceiver<Value>>>,
    /// Receiver for outbound frames (taken by run()).
    outbound_rx: TokioMutex<Option<mpsc::UnboundedReceiver<Value>>>,
}

impl Connection {
    /// Create a new Connection from transport parts.
    pub fn new(parts: TransportParts) -> Self {
        let TransportParts {
            sender,
            receiver,
            message_rx,
        } = parts;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        Self {
            last_id: AtomicU64::new(0),
            callbacks: Arc::new(TokioMutex::new(HashMap::new())),
            outbound_tx,
            subscribers: Arc::new(ParkingLotMutex::new(HashMap::new())),
            closed: Arc::new(AtomicBool::new(false)),
            shutdown_notify: Arc::new(Notify::new()),
            transport_sender: TokioMutex::new(Some(sender)),
            transport_receiver: TokioMutex::new(Some(receiver)),
            message_rx: TokioMutex::new(Some(message_rx)),
            outbound_rx: TokioMutex::new(Some(outbound_rx)),
        }
    }

    /// True once the transport has dropped or `shutdown` ran.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Sends a command to the browser and awaits its response.
    ///
    /// `session_id` scopes the command to an attached tab; `None` issues a
    /// browser-level command. Commands for the same session from the same
    /// caller are written in issuance order; there is no ordering guarantee
    /// across sessions.
    pub async fn send_command(
        &self,
        session_id: Option<&str>,
        method: &str,
        params: Value,
    ) -> Result<Value> {
        if self.is_closed() {
            return Err(Error::ConnectionLost(format!(
                "connection closed before sending {method}"
            )));
        }

        let id = self.last_id.fetch_add(1, Ordering::SeqCst) + 1;

        tracing::debug!(id, method, session = session_id.unwrap_or(""), "send");

        let (tx, rx) = oneshot::channel();
        {
            // Checked under the lock: a concurrent shutdown drains this
            // map after setting `closed`, so an entry can never be
            // inserted after the final drain and hang its caller.
            let mut callbacks = self.callbacks.lock().await;
            if self.is_closed() {
                return Err(Error::ConnectionLost(format!(
                    "connection closed before sending {method}"
                )));
            }
            callbacks.insert(id, tx);
        }

        let guard = CancelGuard::new(id, Arc::clone(&self.callbacks));

        let command = Command {
            id,
            method: method.to_string(),
            params,
            session_id: session_id.map(str::to_string),
        };

        let command_value = serde_json::to_value(&command)?;

        if self.outbound_tx.send(command_value).is_err() {
            return Err(Error::ConnectionLost(format!(
                "writer gone before sending {method}"
            )));
        }

        ResponseFuture { rx, guard }.await
    }

    /// Register an event subscriber for a protocol session id ("" for
    /// browser-level events). `event` filters by method name; `None`
    /// delivers every event for the session.
    pub fn subscribe(&self, session_id: &str, event: Option<&str>) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .push(Subscriber {
                event_filter: event.map(str::to_string),
                tx,
            });
        EventStream { rx }
    }

    /// Drop all subscriptions for a protocol session. Called when a target
    /// closes so subscriptions do not leak.
    pub fn clear_session_subscriptions(&self, session_id: &str) {
        self.subscribers.lock().remove(session_id);
    }

    /// Proactively fail all pending commands, then tear the socket down.
    ///
    /// Failing pending first means no caller is left awaiting a response
    /// that will never arrive.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.fail_all_pending("connection shutting down").await;
        self.subscribers.lock().clear();
        self.shutdown_notify.notify_waiters();
    }

    async fn fail_all_pending(&self, reason: &str) {
        let pending: Vec<_> = self.callbacks.lock().await.drain().collect();
        if !pending.is_empty() {
            tracing::debug!(count = pending.len(), reason, "failing pending commands");
        }
        for (_, tx) in pending {
            let _ = tx.send(Err(Error::ConnectionLost(reason.to_string())));
        }
    }

    fn mark_lost(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // Dropping the senders ends every EventStream.
        self.subscribers.lock().clear();
        self.shutdown_notify.notify_waiters();
    }

    /// Run the message dispatch loop.
    ///
    /// Spawns the reader and writer tasks, then dispatches inbound frames
    /// until the transport closes. On exit every pending command fails
    /// immediately with a connection-lost error - callers never hang on a
    /// dead socket.
    pub async fn run(self: &Arc<Self>) {
        let transport_receiver = self
            .transport_receiver
            .lock()
            .await
            .take()
            .expect("run() can only be called once - transport receiver already taken");

        let mut transport_sender = self
            .transport_sender
            .lock()
            .await
            .take()
            .expect("run() can only be called once - transport sender already taken");

        let mut outbound_rx = self
            .outbound_rx
            .lock()
            .await
            .take()
            .expect("run() can only be called once - outbound receiver already taken");

        let reader_handle = tokio::spawn(async move {
            if let Err(e) = transport_receiver.run().await {
                tracing::error!("Transport read error: {}", e);
            }
        });

        let shutdown = Arc::clone(&self.shutdown_notify);
        let writer_handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = outbound_rx.recv() => match frame {
                        Some(frame) => {
                            if let Err(e) = transport_sender.send(frame).await {
                                tracing::error!("Transport write error: {}", e);
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = shutdown.notified() => {
                        let _ = transport_sender.close().await;
                        break;
                    }
                }
            }
        });

        let mut message_rx = self
            .message_rx
            .lock()
            .await
            .take()
            .expect("run() can only be called once - message receiver already taken");

        while let Some(frame) = message_rx.recv().await {
            match serde_json::from_value::<Message>(frame) {
                Ok(message) => self.dispatch(message).await,
                Err(e) => {
                    tracing::error!("Failed to parse message: {}", e);
                }
            }
        }

        // Transport is gone. Fail everything still waiting.
        self.mark_lost();
        self.fail_all_pending("transport closed").await;

        let _ = reader_handle.await;
        let _ = writer_handle.await;
    }

    async fn dispatch(self: &Arc<Self>, message: Message) {
        match message {
            Message::Response(response) => self.dispatch_response(response).await,
            Message::Event(event) => self.dispatch_event(event),
            Message::Unknown(value) => {
                tracing::debug!(
                    "Unknown message type (forward-compatible, ignored): {}",
                    serde_json::to_string(&value)
                        .unwrap_or_else(|_| "<serialization failed>".to_string())
                );
            }
        }
    }

    async fn dispatch_response(&self, response: CommandResponse) {
        let callback = self.callbacks.lock().await.remove(&response.id);
        let Some(callback) = callback else {
            // Expected after a caller timed out: its pending entry was
            // already removed by the cancel guard.
            tracing::debug!(id = response.id, "response for unknown command (ignored)");
            return;
        };

        let result = if let Some(error) = response.error {
            Err(Error::Remote {
                code: error.code,
                message: error.message,
                data: error.data,
            })
        } else {
            Ok(response.result.unwrap_or(Value::Null))
        };

        let _ = callback.send(result);
    }

    fn dispatch_event(&self, event: EventMessage) {
        let key = event.session_id.as_deref().unwrap_or("");
        let mut subscribers = self.subscribers.lock();

        let Some(entries) = subscribers.get_mut(key) else {
            tracing::debug!(
                method = %event.method,
                session = key,
                "event with no subscriber (ignored)"
            );
            return;
        };

        // Deliver and prune subscribers whose receiver is gone.
        entries.retain(|subscriber| {
            let wanted = subscriber
                .event_filter
                .as_deref()
                .is_none_or(|filter| filter == event.method);
            if !wanted {
                return true;
            }
            subscriber.tx.send(event.clone()).is_ok()
        });

        if entries.is_empty() {
            subscribers.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::channel_transport;
    use std::time::Duration;

    fn spawn_connection() -> (
        Arc<Connection>,
        mpsc::UnboundedReceiver<Value>,
        mpsc::UnboundedSender<Value>,
    ) {
        let (parts, outbound_rx, inbound_tx) = channel_transport();
        let connection = Arc::new(Connection::new(parts));
        let conn_for_loop = Arc::clone(&connection);
        tokio::spawn(async move {
            conn_for_loop.run().await;
        });
        (connection, outbound_rx, inbound_tx)
    }

    #[tokio::test]
    async fn command_correlates_with_response() {
        let (connection, mut outbound_rx, inbound_tx) = spawn_connection();

        let send = tokio::spawn({
            let connection = Arc::clone(&connection);
            async move {
                connection
                    .send_command(None, "Browser.getVersion", serde_json::json!({}))
                    .await
            }
        });

        let frame = outbound_rx.recv().await.unwrap();
        assert_eq!(frame["method"], "Browser.getVersion");
        let id = frame["id"].as_u64().unwrap();

        inbound_tx
            .send(serde_json::json!({"id": id, "result": {"product": "Chrome/130"}}))
            .unwrap();

        let result = send.await.unwrap().unwrap();
        assert_eq!(result["product"], "Chrome/130");
    }

    #[tokio::test]
    async fn error_response_becomes_remote_error() {
        let (connection, mut outbound_rx, inbound_tx) = spawn_connection();

        let send = tokio::spawn({
            let connection = Arc::clone(&connection);
            async move {
                connection
                    .send_command(Some("s-1"), "Page.navigate", serde_json::json!({"url": "x"}))
                    .await
            }
        });

        let frame = outbound_rx.recv().await.unwrap();
        assert_eq!(frame["sessionId"], "s-1");
        let id = frame["id"].as_u64().unwrap();

        inbound_tx
            .send(serde_json::json!({
                "id": id,
                "error": {"code": -32000, "message": "Cannot navigate"}
            }))
            .unwrap();

        let err = send.await.unwrap().unwrap_err();
        match err {
            Error::Remote { code, message, .. } => {
                assert_eq!(code, -32000);
                assert_eq!(message, "Cannot navigate");
            }
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn pending_commands_fail_when_transport_closes() {
        let (connection, mut outbound_rx, inbound_tx) = spawn_connection();

        let send = tokio::spawn({
            let connection = Arc::clone(&connection);
            async move {
                connection
                    .send_command(None, "Target.createTarget", serde_json::json!({}))
                    .await
            }
        });

        // Wait for the command to hit the wire, then kill the transport.
        let _ = outbound_rx.recv().await.unwrap();
        drop(inbound_tx);

        let err = send.await.unwrap().unwrap_err();
        assert!(err.is_connection_lost(), "got {err:?}");
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn send_after_close_fails_fast() {
        let (connection, _outbound_rx, inbound_tx) = spawn_connection();
        drop(inbound_tx);

        // Give the dispatch loop a moment to observe the closed transport.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = connection
            .send_command(None, "Browser.getVersion", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(err.is_connection_lost());
    }

    #[tokio::test]
    async fn events_route_by_session_and_filter() {
        let (connection, _outbound_rx, inbound_tx) = spawn_connection();

        let mut browser_events = connection.subscribe("", Some("Target.targetDestroyed"));
        let mut tab_events = connection.subscribe("s-1", None);

        inbound_tx
            .send(serde_json::json!({
                "method": "Target.targetDestroyed",
                "params": {"targetId": "t-1"}
            }))
            .unwrap();
        inbound_tx
            .send(serde_json::json!({
                "method": "Page.loadEventFired",
                "params": {},
                "sessionId": "s-1"
            }))
            .unwrap();

        let event = browser_events.recv().await.unwrap();
        assert_eq!(event.method, "Target.targetDestroyed");
        assert_eq!(event.params["targetId"], "t-1");

        let event = tab_events.recv().await.unwrap();
        assert_eq!(event.method, "Page.loadEventFired");
    }

    #[tokio::test]
    async fn clearing_session_subscriptions_ends_streams() {
        let (connection, _outbound_rx, inbound_tx) = spawn_connection();

        let mut tab_events = connection.subscribe("s-1", None);
        connection.clear_session_subscriptions("s-1");

        inbound_tx
            .send(serde_json::json!({
                "method": "Page.loadEventFired",
                "params": {},
                "sessionId": "s-1"
            }))
            .unwrap();

        assert!(tab_events.recv().await.is_none());
    }

    #[tokio::test]
    async fn timed_out_caller_entry_is_removed() {
        let (connection, mut outbound_rx, inbound_tx) = spawn_connection();

        let result = tokio::time::timeout(
            Duration::from_millis(50),
            connection.send_command(None, "Page.printToPDF", serde_json::json!({})),
        )
        .await;
        assert!(result.is_err(), "expected the outer timeout to fire");

        let frame = outbound_rx.recv().await.unwrap();
        let id = frame["id"].as_u64().unwrap();

        // Give the cancel guard's cleanup task a chance to run, then make
        // sure a late response finds no pending entry to deliver to.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!connection.callbacks.lock().await.contains_key(&id));

        inbound_tx
            .send(serde_json::json!({"id": id, "result": {}}))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn shutdown_fails_pending_before_teardown() {
        let (connection, mut outbound_rx, _inbound_tx) = spawn_connection();

        let send = tokio::spawn({
            let connection = Arc::clone(&connection);
            async move {
                connection
                    .send_command(None, "Page.navigate", serde_json::json!({}))
                    .await
            }
        });

        let _ = outbound_rx.recv().await.unwrap();
        connection.shutdown().await;

        let err = send.await.unwrap().unwrap_err();
        assert!(err.is_connection_lost());
    }
}
