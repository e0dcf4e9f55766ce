//! WebSocket transport to the browser process.
//!
//! The transport is split into a sender half (owned by the connection's
//! writer task - the single serialization point for the wire) and a
//! receiver half (a read loop feeding parsed frames into an unbounded
//! channel). The traits exist so tests can substitute channel-backed
//! transports for the real socket.

use crate::error::{Error, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Sender half of a transport. One frame per call; callers serialize
/// access through the connection's writer task.
pub trait Transport: Send {
    /// Send one message frame to the browser.
    fn send(&mut self, message: Value) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Close the transport, flushing any pending frames.
    fn close(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Receiver half of a transport: a read loop that parses inbound frames
/// and forwards them until the peer closes or the consumer goes away.
pub trait TransportReceiver: Send {
    /// Run the read loop to completion.
    fn run(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>>;
}

/// The pieces a [`crate::connection::Connection`] is built from.
pub struct TransportParts {
    /// Sender half, taken by the writer task.
    pub sender: Box<dyn Transport>,
    /// Receiver half, spawned as the read loop.
    pub receiver: Box<dyn TransportReceiver>,
    /// Parsed inbound frames produced by the receiver.
    pub message_rx: mpsc::UnboundedReceiver<Value>,
}

/// WebSocket transport over `tokio-tungstenite`.
pub struct WebSocketTransport;

impl WebSocketTransport {
    /// Dial the browser's DevTools WebSocket endpoint.
    pub async fn connect(ws_url: &str) -> Result<TransportParts> {
        let (stream, _response) = connect_async(ws_url)
            .await
            .map_err(|e| Error::ConnectionFailed(format!("{ws_url}: {e}")))?;

        let (sink, stream) = stream.split();
        let (message_tx, message_rx) = mpsc::unbounded_channel();

        Ok(TransportParts {
            sender: Box::new(WebSocketSender { sink }),
            receiver: Box::new(WebSocketReceiver { stream, message_tx }),
            message_rx,
        })
    }
}

struct WebSocketSender {
    sink: WsSink,
}

impl Transport for WebSocketSender {
    fn send(&mut self, message: Value) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let text = serde_json::to_string(&message)?;
            self.sink
                .send(WsMessage::Text(text))
                .await
                .map_err(|e| Error::TransportError(format!("write failed: {e}")))
        })
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.sink
                .send(WsMessage::Close(None))
                .await
                .map_err(|e| Error::TransportError(format!("close failed: {e}")))
        })
    }
}

struct WebSocketReceiver {
    stream: WsStream,
    message_tx: mpsc::UnboundedSender<Value>,
}

impl TransportReceiver for WebSocketReceiver {
    fn run(mut self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
        Box::pin(async move {
            while let Some(frame) = self.stream.next().await {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(e) => {
                        return Err(Error::TransportError(format!("read failed: {e}")));
                    }
                };

                match frame {
                    WsMessage::Text(text) => match serde_json::from_str::<Value>(&text) {
                        Ok(value) => {
                            if self.message_tx.send(value).is_err() {
                                // Consumer went away; stop reading.
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::error!("Failed to parse inbound frame: {}", e);
                        }
                    },
                    WsMessage::Close(_) => break,
                    // Ping/pong handled by tungstenite; binary frames are
                    // not part of this protocol.
                    _ => {}
                }
            }
            Ok(())
        })
    }
}

/// In-memory transport for tests: frames written by the connection appear
/// on `outbound_rx`, and frames pushed into the returned parts'
/// `message_rx` sender simulate the browser.
pub(crate) struct ChannelTransport {
    pub(crate) outbound_tx: mpsc::UnboundedSender<Value>,
}

impl Transport for ChannelTransport {
    fn send(&mut self, message: Value) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let result = self
            .outbound_tx
            .send(message)
            .map_err(|_| Error::TransportError("test channel closed".to_string()));
        Box::pin(async move { result })
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move { Ok(()) })
    }
}

pub(crate) struct ChannelReceiver;

impl TransportReceiver for ChannelReceiver {
    fn run(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
        // Inbound frames are injected directly into message_rx by the test,
        // so there is nothing to pump here.
        Box::pin(async move { Ok(()) })
    }
}

/// Build a channel-backed [`TransportParts`] for tests. Returns the parts
/// plus (frames written by the connection, sender for simulated browser
/// frames).
pub fn channel_transport() -> (
    TransportParts,
    mpsc::UnboundedReceiver<Value>,
    mpsc::UnboundedSender<Value>,
) {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (inbound_tx, message_rx) = mpsc::unbounded_channel();

    let parts = TransportParts {
        sender: Box::new(ChannelTransport { outbound_tx }),
        receiver: Box::new(ChannelReceiver),
        message_rx,
    };

    (parts, outbound_rx, inbound_tx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_transport_round_trips_frames() {
        let (mut parts, mut outbound_rx, inbound_tx) = channel_transport();

        let frame = serde_json::json!({"id": 1, "method": "Browser.getVersion", "params": {}});
        parts.sender.send(frame.clone()).await.unwrap();
        assert_eq!(outbound_rx.recv().await.unwrap(), frame);

        let event = serde_json::json!({"method": "Target.targetCreated", "params": {}});
        inbound_tx.send(event.clone()).unwrap();
        assert_eq!(parts.message_rx.recv().await.unwrap(), event);
    }
}
