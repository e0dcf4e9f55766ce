//! Tool handler seam.
//!
//! Per-action tool handlers (navigate, click, screenshot, ...) live
//! outside this crate; they are thin translators from a typed argument
//! object to one or two calls against the core. This module defines the
//! interface they implement and the manifest introspection the outer
//! control layer serves.

use crate::refs::RefStore;
use crate::registry::Registry;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tabmux_runtime::{BoxFuture, Error, ProtocolClient, Result};

/// Everything a tool handler may touch.
#[derive(Clone)]
pub struct ToolContext {
    /// Logical session the inbound request named.
    pub session_id: String,
    pub registry: Arc<Registry>,
    pub refs: Arc<RefStore>,
    pub client: Arc<dyn ProtocolClient>,
}

/// Introspection record for one tool.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// JSON schema of the tool's argument object.
    pub input_schema: Value,
}

/// One automation primitive exposed over the control protocol.
pub trait ToolHandler: Send + Sync {
    fn descriptor(&self) -> ToolDescriptor;

    /// Run the tool. Errors are rendered for the user by the dispatch
    /// layer; handlers return the structured result only.
    fn invoke(&self, ctx: ToolContext, args: Value) -> BoxFuture<'_, Result<Value>>;
}

/// Registered tools, keyed by name.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn ToolHandler>) {
        self.tools.insert(tool.descriptor().name, tool);
    }

    /// Descriptors for every registered tool, stable order.
    pub fn manifest(&self) -> Vec<ToolDescriptor> {
        self.tools.values().map(|tool| tool.descriptor()).collect()
    }

    /// Dispatch one call by tool name.
    pub async fn dispatch(&self, name: &str, ctx: ToolContext, args: Value) -> Result<Value> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| Error::not_found("tool", name))?;
        tool.invoke(ctx, args).await
    }
}

/// Render an error as the user-facing text the control layer returns:
/// what was attempted and why it failed, never a raw stack trace.
pub fn user_facing_error(tool_name: &str, error: &Error) -> String {
    format!("{tool_name} failed: {error}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tabmux_runtime::testing::FakeBrowser;

    struct EchoTool;

    impl ToolHandler for EchoTool {
        fn descriptor(&self) -> ToolDescriptor {
            ToolDescriptor {
                name: "echo".to_string(),
                description: "Returns its arguments".to_string(),
                input_schema: json!({"type": "object"}),
            }
        }

        fn invoke(&self, _ctx: ToolContext, args: Value) -> BoxFuture<'_, Result<Value>> {
            Box::pin(async move { Ok(args) })
        }
    }

    fn context() -> ToolContext {
        let fake = FakeBrowser::new();
        let client: Arc<dyn ProtocolClient> = Arc::new(fake);
        ToolContext {
            session_id: "s1".to_string(),
            registry: Arc::new(Registry::new(Arc::clone(&client))),
            refs: Arc::new(RefStore::new()),
            client,
        }
    }

    #[tokio::test]
    async fn dispatch_routes_by_name() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));

        let result = registry
            .dispatch("echo", context(), json!({"x": 1}))
            .await
            .unwrap();
        assert_eq!(result, json!({"x": 1}));
    }

    #[tokio::test]
    async fn unknown_tool_is_a_resolution_error() {
        let registry = ToolRegistry::new();
        let err = registry
            .dispatch("missing", context(), json!({}))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn manifest_lists_descriptors() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));

        let manifest = registry.manifest();
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest[0].name, "echo");
    }

    #[test]
    fn errors_render_as_plain_text() {
        let error = Error::not_found("target", "t-404");
        let text = user_facing_error("browser_click", &error);
        assert_eq!(text, "browser_click failed: target not found: t-404");
    }
}
