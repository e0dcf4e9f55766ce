//! Tabmux - the composition root.
//!
//! Owns the browser process, the connection pool, the registry, and the
//! ref store, with a clearly scoped lifetime: created at startup, torn
//! down at shutdown. The outer control layer holds one `Tabmux` and calls
//! the facade operations; nothing here is ambient global state.

use crate::refs::RefStore;
use crate::registry::{CreateTargetOutcome, Registry, TargetHandle};
use crate::tools::{ToolContext, ToolDescriptor, ToolRegistry};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tabmux_runtime::profile::{ProfileConfig, ProfileManager, ResolvedProfile};
use tabmux_runtime::{
    BrowserProcess, ConnectionPool, Error, LaunchConfig, ProtocolClient, Result,
    find_browser_executable,
};
use tokio::task::JoinHandle;

/// The process-wide entry point.
///
/// # Example
///
/// ```ignore
/// use tabmux::{LaunchConfig, Tabmux};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mux = Tabmux::launch(LaunchConfig::builder().headless(true).build()).await?;
///
///     let outcome = mux.resolve_or_create_target("s1", "https://example.com", None).await?;
///     let result = mux
///         .issue_command("s1", &outcome.handle.target_id, "Runtime.evaluate",
///             serde_json::json!({"expression": "document.title"}))
///         .await?;
///     println!("{result}");
///
///     mux.shutdown().await?;
///     Ok(())
/// }
/// ```
pub struct Tabmux {
    registry: Arc<Registry>,
    refs: Arc<RefStore>,
    client: Arc<dyn ProtocolClient>,
    /// Present when this instance owns the pooled connection; absent when
    /// built over an externally managed client.
    pool: Option<Arc<ConnectionPool>>,
    tools: ToolRegistry,
    process: Mutex<Option<BrowserProcess>>,
    /// Keeps an ephemeral profile directory alive for the process
    /// lifetime.
    profile: Mutex<Option<ResolvedProfile>>,
    reconciler: Mutex<Option<JoinHandle<()>>>,
}

impl Tabmux {
    /// Resolve a profile, launch the browser, and connect.
    pub async fn launch(config: LaunchConfig) -> Result<Self> {
        let profile_config = ProfileConfig {
            explicit_dir: config.user_data_dir.clone(),
            ephemeral: config.headless,
            ..Default::default()
        };

        // Profile resolution does filesystem work and possibly a
        // subprocess; keep it off the async threads.
        let profile = tokio::task::spawn_blocking(move || {
            ProfileManager::new(profile_config).resolve()
        })
        .await
        .map_err(|e| Error::LaunchFailed(format!("profile resolution panicked: {e}")))??;

        if let Some(sync) = &profile.sync {
            match sync.tier {
                Some(tier) => tracing::debug!(tier, "cookies synchronized"),
                None => tracing::warn!("cookie sync exhausted all tiers; continuing without"),
            }
        }

        let executable = find_browser_executable(&config)?;
        let process = BrowserProcess::launch(&executable, &profile.dir, &config).await?;
        let pool = Arc::new(ConnectionPool::new(process.ws_url.clone()));
        let client: Arc<dyn ProtocolClient> = Arc::clone(&pool) as Arc<dyn ProtocolClient>;

        let mux = Self::assemble(client, Some(pool), Some(process), Some(profile));
        mux.start_reconciler().await?;
        Ok(mux)
    }

    /// Attach to an already-running browser by its DevTools WebSocket URL.
    /// The process is not owned: shutdown closes the connection but does
    /// not kill the browser.
    pub async fn attach(ws_url: &str) -> Result<Self> {
        let pool = Arc::new(ConnectionPool::new(ws_url));
        // Dial eagerly so attach fails fast on a bad endpoint.
        pool.acquire().await?;
        let client: Arc<dyn ProtocolClient> = Arc::clone(&pool) as Arc<dyn ProtocolClient>;

        let mux = Self::assemble(client, Some(pool), None, None);
        mux.start_reconciler().await?;
        Ok(mux)
    }

    /// Build over an externally managed protocol client. No process or
    /// pool is owned; shutdown only sweeps sessions. This is how
    /// integration tests and embedders with their own connection wire the
    /// core up.
    pub async fn with_client(client: Arc<dyn ProtocolClient>) -> Result<Self> {
        let mux = Self::assemble(client, None, None, None);
        mux.start_reconciler().await?;
        Ok(mux)
    }

    fn assemble(
        client: Arc<dyn ProtocolClient>,
        pool: Option<Arc<ConnectionPool>>,
        process: Option<BrowserProcess>,
        profile: Option<ResolvedProfile>,
    ) -> Self {
        Self {
            registry: Arc::new(Registry::new(Arc::clone(&client))),
            refs: Arc::new(RefStore::new()),
            client,
            pool,
            tools: ToolRegistry::new(),
            process: Mutex::new(process),
            profile: Mutex::new(profile),
            reconciler: Mutex::new(None),
        }
    }

    async fn start_reconciler(&self) -> Result<()> {
        let registry = Arc::clone(&self.registry);
        let handle = tokio::spawn(async move {
            if let Err(e) = registry.run_reconciler().await {
                tracing::warn!("target reconciler stopped: {}", e);
            }
        });
        *self.reconciler.lock() = Some(handle);
        Ok(())
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    pub fn refs(&self) -> Arc<RefStore> {
        Arc::clone(&self.refs)
    }

    pub fn client(&self) -> Arc<dyn ProtocolClient> {
        Arc::clone(&self.client)
    }

    pub fn tools_mut(&mut self) -> &mut ToolRegistry {
        &mut self.tools
    }

    /// Facade: resolve (or lazily create) the logical session a request
    /// named.
    pub async fn resolve_session(&self, session_id: &str) -> Result<Arc<crate::registry::Session>> {
        self.registry.get_or_create_session(session_id).await
    }

    /// Facade: resolve a live target for the session, creating (or
    /// reusing) one when needed.
    pub async fn resolve_or_create_target(
        &self,
        session_id: &str,
        url: &str,
        worker_id: Option<&str>,
    ) -> Result<CreateTargetOutcome> {
        self.registry.create_target(session_id, url, worker_id).await
    }

    /// Facade: issue one protocol command against a tab the session owns.
    pub async fn issue_command(
        &self,
        session_id: &str,
        target_id: &str,
        method: &str,
        params: Value,
    ) -> Result<Value> {
        let handle: TargetHandle = self
            .registry
            .get_page(session_id, target_id)
            .ok_or_else(|| Error::not_found("target", target_id))?;
        self.client
            .send_command(Some(&handle.protocol_session_id), method, params)
            .await
    }

    /// Facade: the tool manifest served to the control layer.
    pub fn tool_manifest(&self) -> Vec<ToolDescriptor> {
        self.tools.manifest()
    }

    /// Facade: dispatch one tool call.
    pub async fn dispatch_tool(&self, session_id: &str, name: &str, args: Value) -> Result<Value> {
        self.registry.get_or_create_session(session_id).await?;
        let ctx = ToolContext {
            session_id: session_id.to_string(),
            registry: Arc::clone(&self.registry),
            refs: Arc::clone(&self.refs),
            client: Arc::clone(&self.client),
        };
        self.tools.dispatch(name, ctx, args).await
    }

    /// Tear everything down: sweep sessions, fail pending commands, close
    /// the socket, terminate the owned browser process, discard any
    /// ephemeral profile.
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(handle) = self.reconciler.lock().take() {
            handle.abort();
        }

        self.registry.cleanup_all_sessions().await;
        if let Some(pool) = &self.pool {
            pool.shutdown().await;
        }

        let process = self.process.lock().take();
        if let Some(process) = process {
            process.shutdown().await?;
        }

        // Dropping an ephemeral profile removes its temp directory.
        self.profile.lock().take();
        Ok(())
    }
}

impl Drop for Tabmux {
    /// Last-resort cleanup for callers that never reached `shutdown`.
    fn drop(&mut self) {
        if let Some(handle) = self.reconciler.lock().take() {
            handle.abort();
        }
        if let Some(mut process) = self.process.lock().take() {
            tracing::debug!("Drop: force-killing browser process");
            process.kill();
        }
    }
}
