//! Error types for the tabmux runtime.

use thiserror::Error;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the tabmux runtime.
///
/// The variants fall into the classes callers care about when deciding how
/// to react: transport faults (retrying the whole operation may help),
/// resolution misses (retrying will not help), and timeouts (the pending
/// entry has already been cleaned up).
#[derive(Debug, Error)]
pub enum Error {
    /// No usable browser executable was found.
    #[error("Browser executable not found. Set TABMUX_BROWSER or install Chrome/Chromium.")]
    BrowserNotFound,

    /// Failed to launch the browser process.
    #[error("Failed to launch browser: {0}")]
    LaunchFailed(String),

    /// Failed to establish the control connection.
    #[error("Failed to connect to browser: {0}")]
    ConnectionFailed(String),

    /// The control connection dropped while commands were outstanding.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The pool exhausted its reconnect attempt and refuses further work
    /// until an external actor restarts the browser.
    #[error("Connection pool is broken; restart the browser process to recover")]
    PoolBroken,

    /// Transport-level error (WebSocket framing, socket I/O).
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Protocol-level error (malformed or unexpected message).
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Error response from the browser with full context.
    #[error("Browser error {code}: {message}")]
    Remote {
        /// Numeric error code from the browser.
        code: i64,
        /// Human-readable error message.
        message: String,
        /// Additional detail, when the browser provides it.
        data: Option<String>,
    },

    /// A session, worker, target, ref, or tool could not be resolved.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// What kind of thing was looked up ("session", "worker", ...).
        kind: &'static str,
        /// The identifier that failed to resolve.
        id: String,
    },

    /// A provider round-trip exceeded its deadline. The pending entry has
    /// been removed, so a late response cannot reach the caller.
    #[error("Timeout after {limit_ms}ms: {operation}")]
    Timeout {
        /// The operation that was attempted.
        operation: String,
        /// The configured limit in milliseconds.
        limit_ms: u64,
    },

    /// All cookie-sync tiers failed. Non-fatal: callers proceed without
    /// fresh cookies.
    #[error("Cookie sync failed: {0}")]
    CookieSync(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Channel closed unexpectedly.
    #[error("Channel closed unexpectedly")]
    ChannelClosed,

    /// Invalid argument provided to an operation.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// Shorthand for a resolution miss.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Returns true if this is a timeout error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// Returns true if the transport dropped or the pool is unusable.
    /// Retrying the whole operation after a restart may help.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            Error::ConnectionLost(_) | Error::ConnectionFailed(_) | Error::PoolBroken
        )
    }

    /// Returns true if this is a resolution miss. Retrying will not help.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classes_are_distinguishable() {
        let lost = Error::ConnectionLost("socket closed".to_string());
        let missing = Error::not_found("target", "t-1");
        let timeout = Error::Timeout {
            operation: "Page.navigate".to_string(),
            limit_ms: 30_000,
        };

        assert!(lost.is_connection_lost());
        assert!(!lost.is_not_found());
        assert!(missing.is_not_found());
        assert!(!missing.is_connection_lost());
        assert!(timeout.is_timeout());
    }

    #[test]
    fn messages_name_the_operation_and_limit() {
        let timeout = Error::Timeout {
            operation: "Page.printToPDF".to_string(),
            limit_ms: 10_000,
        };
        let text = timeout.to_string();
        assert!(text.contains("Page.printToPDF"));
        assert!(text.contains("10000"));
    }
}
