//! Test doubles for the protocol layer.
//!
//! [`FakeBrowser`] implements [`ProtocolClient`] against an in-memory
//! context/target table so the registry and orchestrator can be exercised
//! without a browser process. Integration suites in `tabmux` build on it.

use crate::connection::EventStream;
use crate::error::{Error, Result};
use crate::pool::{BoxFuture, ProtocolClient};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tabmux_protocol::EventMessage;
use tokio::sync::mpsc;

/// One recorded command, for assertions.
#[derive(Debug, Clone)]
pub struct RecordedCommand {
    pub session_id: Option<String>,
    pub method: String,
    pub params: Value,
}

#[derive(Debug, Clone)]
struct FakeTarget {
    context_id: Option<String>,
    session_id: String,
    url: String,
    closed: bool,
}

#[derive(Default)]
struct FakeState {
    next_id: u64,
    contexts: Vec<String>,
    targets: HashMap<String, FakeTarget>,
    commands: Vec<RecordedCommand>,
    subscribers: HashMap<String, Vec<(Option<String>, mpsc::UnboundedSender<EventMessage>)>>,
    /// Methods forced to fail, for partial-failure sweeps.
    failing_methods: Vec<String>,
}

/// In-memory stand-in for the browser side of the control connection.
#[derive(Clone, Default)]
pub struct FakeBrowser {
    state: Arc<Mutex<FakeState>>,
}

impl FakeBrowser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Force every subsequent call of `method` to return a remote error.
    pub fn fail_method(&self, method: &str) {
        self.state.lock().failing_methods.push(method.to_string());
    }

    /// All commands issued so far.
    pub fn commands(&self) -> Vec<RecordedCommand> {
        self.state.lock().commands.clone()
    }

    /// Commands with the given method name.
    pub fn commands_named(&self, method: &str) -> Vec<RecordedCommand> {
        self.state
            .lock()
            .commands
            .iter()
            .filter(|c| c.method == method)
            .cloned()
            .collect()
    }

    /// Browsing context ids created so far.
    pub fn context_ids(&self) -> Vec<String> {
        self.state.lock().contexts.clone()
    }

    /// The context a target lives in, if the target exists.
    pub fn context_of_target(&self, target_id: &str) -> Option<String> {
        self.state
            .lock()
            .targets
            .get(target_id)
            .and_then(|t| t.context_id.clone())
    }

    /// Current URL of a target.
    pub fn target_url(&self, target_id: &str) -> Option<String> {
        self.state.lock().targets.get(target_id).map(|t| t.url.clone())
    }

    /// Simulate the browser closing a tab out-of-band: marks the target
    /// closed and pushes `Target.targetDestroyed` to browser-level
    /// subscribers.
    pub fn destroy_target(&self, target_id: &str) {
        let mut state = self.state.lock();
        if let Some(target) = state.targets.get_mut(target_id) {
            target.closed = true;
        }
        let event = EventMessage {
            method: "Target.targetDestroyed".to_string(),
            params: json!({"targetId": target_id}),
            session_id: None,
        };
        deliver(&mut state, "", event);
    }

    fn handle(&self, session_id: Option<&str>, method: &str, params: Value) -> Result<Value> {
        let mut state = self.state.lock();

        state.commands.push(RecordedCommand {
            session_id: session_id.map(str::to_string),
            method: method.to_string(),
            params: params.clone(),
        });

        if state.failing_methods.iter().any(|m| m == method) {
            return Err(Error::Remote {
                code: -32000,
                message: format!("{method} failed (induced)"),
                data: None,
            });
        }

        match method {
            "Target.createBrowserContext" => {
                state.next_id += 1;
                let context_id = format!("ctx-{}", state.next_id);
                state.contexts.push(context_id.clone());
                Ok(json!({"browserContextId": context_id}))
            }
            "Target.disposeBrowserContext" => {
                let context_id = params["browserContextId"].as_str().unwrap_or_default();
                state.contexts.retain(|c| c != context_id);
                Ok(json!({}))
            }
            "Target.createTarget" => {
                state.next_id += 1;
                let target_id = format!("target-{}", state.next_id);
                let session_id = format!("session-{}", state.next_id);
                state.targets.insert(
                    target_id.clone(),
                    FakeTarget {
                        context_id: params["browserContextId"].as_str().map(str::to_string),
                        session_id,
                        url: params["url"].as_str().unwrap_or("about:blank").to_string(),
                        closed: false,
                    },
                );
                Ok(json!({"targetId": target_id}))
            }
            "Target.attachToTarget" => {
                let target_id = params["targetId"].as_str().unwrap_or_default();
                match state.targets.get(target_id) {
                    Some(target) if !target.closed => {
                        Ok(json!({"sessionId": target.session_id}))
                    }
                    _ => Err(Error::Remote {
                        code: -32000,
                        message: format!("No target with given id found: {target_id}"),
                        data: None,
                    }),
                }
            }
            "Target.closeTarget" => {
                let target_id = params["targetId"].as_str().unwrap_or_default();
                match state.targets.get_mut(target_id) {
                    Some(target) => {
                        target.closed = true;
                        Ok(json!({"success": true}))
                    }
                    None => Err(Error::Remote {
                        code: -32000,
                        message: format!("No target with given id found: {target_id}"),
                        data: None,
                    }),
                }
            }
            "Target.getTargetInfo" => {
                let target_id = params["targetId"].as_str().unwrap_or_default();
                match state.targets.get(target_id) {
                    Some(target) if !target.closed => Ok(json!({
                        "targetInfo": {
                            "targetId": target_id,
                            "type": "page",
                            "title": "",
                            "url": target.url,
                            "attached": true,
                            "browserContextId": target.context_id,
                        }
                    })),
                    _ => Err(Error::Remote {
                        code: -32000,
                        message: format!("No target with given id found: {target_id}"),
                        data: None,
                    }),
                }
            }
            "Page.navigate" => {
                let url = params["url"].as_str().unwrap_or_default().to_string();
                let session = session_id.unwrap_or_default();
                let target = state
                    .targets
                    .values_mut()
                    .find(|t| t.session_id == session && !t.closed);
                match target {
                    Some(target) => {
                        target.url = url;
                        Ok(json!({"frameId": "frame-1"}))
                    }
                    None => Err(Error::Remote {
                        code: -32000,
                        message: "Session not found".to_string(),
                        data: None,
                    }),
                }
            }
            // Everything else succeeds with an empty result; the recorded
            // command is what tests assert on.
            _ => Ok(json!({})),
        }
    }
}

fn deliver(state: &mut FakeState, key: &str, event: EventMessage) {
    if let Some(entries) = state.subscribers.get_mut(key) {
        entries.retain(|(filter, tx)| {
            let wanted = filter.as_deref().is_none_or(|f| f == event.method);
            if !wanted {
                return true;
            }
            tx.send(event.clone()).is_ok()
        });
    }
}

impl ProtocolClient for FakeBrowser {
    fn send_command(
        &self,
        session_id: Option<&str>,
        method: &str,
        params: Value,
    ) -> BoxFuture<'_, Result<Value>> {
        let result = self.handle(session_id, method, params);
        Box::pin(async move { result })
    }

    fn send_command_with_timeout(
        &self,
        session_id: Option<&str>,
        method: &str,
        params: Value,
        _limit: Duration,
    ) -> BoxFuture<'_, Result<Value>> {
        self.send_command(session_id, method, params)
    }

    fn subscribe(
        &self,
        session_id: &str,
        event: Option<&str>,
    ) -> BoxFuture<'_, Result<EventStream>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .lock()
            .subscribers
            .entry(session_id.to_string())
            .or_default()
            .push((event.map(str::to_string), tx));
        Box::pin(async move { Ok(EventStream::from_receiver(rx)) })
    }

    fn clear_session(&self, session_id: &str) {
        self.state.lock().subscribers.remove(session_id);
    }
}
