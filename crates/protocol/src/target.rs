//! `Target.*` payload types.
//!
//! Only the shapes the runtime actually consumes are modeled; everything
//! else travels as raw [`serde_json::Value`].

use serde::{Deserialize, Serialize};

/// Description of one target (tab, worker, or service worker) as reported
/// by the browser.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    /// Provider-assigned target id.
    pub target_id: String,
    /// Target kind (`page`, `iframe`, `service_worker`, ...).
    #[serde(rename = "type")]
    pub kind: String,
    /// Current document title.
    #[serde(default)]
    pub title: String,
    /// Current document URL.
    #[serde(default)]
    pub url: String,
    /// Whether a protocol session is attached to this target.
    #[serde(default)]
    pub attached: bool,
    /// Isolated browsing context owning this target, when not the default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser_context_id: Option<String>,
}

/// Parameters of the `Target.attachedToTarget` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachedToTargetParams {
    /// Protocol session id assigned to the attachment.
    pub session_id: String,
    /// The target that was attached to.
    pub target_info: TargetInfo,
    /// Whether the target is paused waiting for the debugger.
    #[serde(default)]
    pub waiting_for_debugger: bool,
}

/// Parameters of the `Target.targetDestroyed` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetDestroyedParams {
    /// The target that was destroyed.
    pub target_id: String,
}

/// Parameters of the `Target.detachedFromTarget` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetachedFromTargetParams {
    /// The protocol session that was detached.
    pub session_id: String,
    /// The target it was attached to, when reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_info_deserializes_wire_shape() {
        let json = r#"{
            "targetId": "t-1",
            "type": "page",
            "title": "Example",
            "url": "https://example.com",
            "attached": true,
            "browserContextId": "ctx-1"
        }"#;

        let info: TargetInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.target_id, "t-1");
        assert_eq!(info.kind, "page");
        assert!(info.attached);
        assert_eq!(info.browser_context_id.as_deref(), Some("ctx-1"));
    }

    #[test]
    fn destroyed_params_deserialize() {
        let params: TargetDestroyedParams =
            serde_json::from_str(r#"{"targetId": "t-9"}"#).unwrap();
        assert_eq!(params.target_id, "t-9");
    }
}
