//! Command/response/event envelopes for the browser control protocol.
//!
//! Every frame on the wire is one of three shapes:
//! - a **command** sent by us: `{id, method, params, sessionId?}`
//! - a **response** from the browser: `{id, result?, error?, sessionId?}`
//! - an **event** pushed by the browser: `{method, params, sessionId?}`
//!
//! A missing `sessionId` means the message is scoped to the browser itself
//! rather than to one attached tab.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Command message sent to the browser.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    /// Sequence id for correlating the response.
    pub id: u64,
    /// Method name to invoke (e.g. `Target.createTarget`).
    pub method: String,
    /// Method parameters as a JSON object.
    pub params: Value,
    /// Protocol session id of the attached tab this command targets.
    /// Absent for browser-level commands.
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Error payload carried inside a failed [`CommandResponse`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Numeric error code assigned by the browser.
    pub code: i64,
    /// Human-readable error message.
    pub message: String,
    /// Additional error detail, when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// Response message from the browser.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    /// Sequence id this response correlates to.
    pub id: u64,
    /// Success result (mutually exclusive with `error`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error result (mutually exclusive with `result`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
    /// Protocol session id the original command was scoped to.
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Unsolicited event message pushed by the browser.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    /// Event method name (e.g. `Target.targetDestroyed`).
    pub method: String,
    /// Event parameters as a JSON object.
    #[serde(default)]
    pub params: Value,
    /// Protocol session id the event belongs to; absent for browser-level
    /// events.
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Discriminated union of inbound protocol messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    /// Response message (has `id` field).
    Response(CommandResponse),
    /// Event message (no `id` field).
    Event(EventMessage),
    /// Unknown message type (forward-compatible catch-all).
    Unknown(Value),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_serializes_without_absent_session_id() {
        let command = Command {
            id: 7,
            method: "Target.createTarget".to_string(),
            params: serde_json::json!({"url": "about:blank"}),
            session_id: None,
        };

        let value = serde_json::to_value(&command).unwrap();
        assert_eq!(value["id"], 7);
        assert_eq!(value["method"], "Target.createTarget");
        assert!(value.get("sessionId").is_none());
    }

    #[test]
    fn command_serializes_session_id_camel_case() {
        let command = Command {
            id: 1,
            method: "Page.navigate".to_string(),
            params: serde_json::json!({"url": "https://example.com"}),
            session_id: Some("session-1".to_string()),
        };

        let value = serde_json::to_value(&command).unwrap();
        assert_eq!(value["sessionId"], "session-1");
    }

    #[test]
    fn response_message_deserializes() {
        let json = r#"{"id": 42, "result": {"targetId": "t-1"}}"#;
        let message: Message = serde_json::from_str(json).unwrap();

        match message {
            Message::Response(response) => {
                assert_eq!(response.id, 42);
                assert_eq!(response.result.unwrap()["targetId"], "t-1");
                assert!(response.error.is_none());
            }
            _ => panic!("Expected Response"),
        }
    }

    #[test]
    fn error_response_deserializes() {
        let json = r#"{"id": 3, "error": {"code": -32000, "message": "No target with given id"}}"#;
        let message: Message = serde_json::from_str(json).unwrap();

        match message {
            Message::Response(response) => {
                let error = response.error.unwrap();
                assert_eq!(error.code, -32000);
                assert_eq!(error.message, "No target with given id");
            }
            _ => panic!("Expected Response"),
        }
    }

    #[test]
    fn event_message_deserializes() {
        let json = r#"{"method": "Target.targetDestroyed", "params": {"targetId": "t-1"}, "sessionId": "s-9"}"#;
        let message: Message = serde_json::from_str(json).unwrap();

        match message {
            Message::Event(event) => {
                assert_eq!(event.method, "Target.targetDestroyed");
                assert_eq!(event.params["targetId"], "t-1");
                assert_eq!(event.session_id.as_deref(), Some("s-9"));
            }
            _ => panic!("Expected Event"),
        }
    }

    #[test]
    fn unknown_message_is_forward_compatible() {
        let json = r#"{"novel": true}"#;
        let message: Message = serde_json::from_str(json).unwrap();
        assert!(matches!(message, Message::Unknown(_)));
    }
}
