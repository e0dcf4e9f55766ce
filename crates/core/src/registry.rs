//! Session/worker/target registry.
//!
//! The central authority mapping logical session -> worker (isolated
//! browsing context) -> target (tab). Every context and tab is created and
//! destroyed through the shared protocol client; the registry tracks
//! ownership, liveness, and activity.
//!
//! Concurrency: worker create/delete within one session, and target
//! create/close within one worker, are serialized through per-object async
//! locks so a delete cannot interleave with a create and orphan a tab in a
//! torn-down context. Unrelated sessions and workers mutate fully
//! concurrently.

use dashmap::DashMap;
use parking_lot::Mutex as ParkingLotMutex;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime};
use tabmux_runtime::{Error, ProtocolClient, Result};
use tokio::sync::Mutex as TokioMutex;

/// Id of the worker every session starts with.
pub const DEFAULT_WORKER_ID: &str = "default";

/// Logical isolation unit, one per client conversation.
pub struct Session {
    id: String,
    name: ParkingLotMutex<String>,
    workers: ParkingLotMutex<HashMap<String, Arc<Worker>>>,
    default_worker_id: ParkingLotMutex<Option<String>>,
    /// Serializes worker create/delete within this session.
    mutation: TokioMutex<()>,
    created_at: SystemTime,
    last_activity: ParkingLotMutex<Instant>,
}

impl Session {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: ParkingLotMutex::new(id.to_string()),
            workers: ParkingLotMutex::new(HashMap::new()),
            default_worker_id: ParkingLotMutex::new(None),
            mutation: TokioMutex::new(()),
            created_at: SystemTime::now(),
            last_activity: ParkingLotMutex::new(Instant::now()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn display_name(&self) -> String {
        self.name.lock().clone()
    }

    pub fn set_display_name(&self, name: impl Into<String>) {
        *self.name.lock() = name.into();
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// The default worker id, set once the session has been touched.
    pub fn default_worker_id(&self) -> Option<String> {
        self.default_worker_id.lock().clone()
    }

    pub fn worker(&self, worker_id: &str) -> Option<Arc<Worker>> {
        self.workers.lock().get(worker_id).cloned()
    }

    pub fn worker_ids(&self) -> Vec<String> {
        self.workers.lock().keys().cloned().collect()
    }

    /// Record activity; called on every tool call that resolves this
    /// session.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// How long since the last activity, for idle-timeout sweeps.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    fn find_target(&self, target_id: &str) -> Option<(Arc<Worker>, String)> {
        let workers = self.workers.lock();
        for worker in workers.values() {
            if let Some(protocol_session_id) = worker.protocol_session_of(target_id) {
                return Some((Arc::clone(worker), protocol_session_id));
            }
        }
        None
    }
}

/// An isolated browsing context: separate cookie jar and storage.
///
/// The browser context handle is exclusively owned by the worker; commands
/// against it are only ever issued through registry operations that hold
/// the worker's mutation lock.
#[derive(Debug)]
pub struct Worker {
    id: String,
    name: String,
    context_id: String,
    /// target id -> protocol session id of the attachment.
    targets: ParkingLotMutex<HashMap<String, String>>,
    /// Serializes target create/close against worker deletion.
    mutation: TokioMutex<()>,
    deleted: AtomicBool,
    created_at: SystemTime,
    last_activity: ParkingLotMutex<Instant>,
}

impl Worker {
    fn new(id: String, name: String, context_id: String) -> Self {
        Self {
            id,
            name,
            context_id,
            targets: ParkingLotMutex::new(HashMap::new()),
            mutation: TokioMutex::new(()),
            deleted: AtomicBool::new(false),
            created_at: SystemTime::now(),
            last_activity: ParkingLotMutex::new(Instant::now()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn target_ids(&self) -> Vec<String> {
        self.targets.lock().keys().cloned().collect()
    }

    pub fn owns_target(&self, target_id: &str) -> bool {
        self.targets.lock().contains_key(target_id)
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    fn protocol_session_of(&self, target_id: &str) -> Option<String> {
        self.targets.lock().get(target_id).cloned()
    }

    /// The single (target, protocol session) pair, when the worker owns
    /// exactly one target.
    fn single_target(&self) -> Option<(String, String)> {
        let targets = self.targets.lock();
        if targets.len() == 1 {
            targets.iter().next().map(|(t, s)| (t.clone(), s.clone()))
        } else {
            None
        }
    }
}

/// How a `create_target` request was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetDisposition {
    /// A fresh tab was opened.
    Created,
    /// The worker's only existing tab was re-navigated instead of opening
    /// a new one.
    Reused,
}

/// A resolvable handle on one live tab.
#[derive(Debug, Clone)]
pub struct TargetHandle {
    pub target_id: String,
    pub protocol_session_id: String,
    pub worker_id: String,
}

/// Result of `create_target`, with the reuse decision made explicit so
/// callers can distinguish "created" from "reused".
#[derive(Debug, Clone)]
pub struct CreateTargetOutcome {
    pub handle: TargetHandle,
    pub disposition: TargetDisposition,
}

/// Arguments for `create_worker`.
#[derive(Debug, Clone, Default)]
pub struct WorkerSpec {
    /// Caller-chosen id; collisions fail. Generated when absent.
    pub id: Option<String>,
    /// Display name; defaults to the id.
    pub name: Option<String>,
}

/// The central session/worker/target authority.
///
/// Owned by the composition root and passed by reference; there is no
/// ambient global state.
pub struct Registry {
    client: Arc<dyn ProtocolClient>,
    sessions: DashMap<String, Arc<Session>>,
    worker_seq: AtomicU64,
}

impl Registry {
    pub fn new(client: Arc<dyn ProtocolClient>) -> Self {
        Self {
            client,
            sessions: DashMap::new(),
            worker_seq: AtomicU64::new(0),
        }
    }

    /// The protocol client this registry issues commands through.
    pub fn client(&self) -> Arc<dyn ProtocolClient> {
        Arc::clone(&self.client)
    }

    /// Resolve a session, creating it (with its default worker) on first
    /// use.
    pub async fn get_or_create_session(&self, session_id: &str) -> Result<Arc<Session>> {
        let session = {
            let entry = self
                .sessions
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Session::new(session_id)));
            Arc::clone(entry.value())
        };
        session.touch();
        self.ensure_default_worker(&session).await?;
        Ok(session)
    }

    /// Resolve an existing session without creating one.
    pub fn session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    async fn ensure_default_worker(&self, session: &Arc<Session>) -> Result<()> {
        if session.default_worker_id().is_some() {
            return Ok(());
        }

        let _guard = session.mutation.lock().await;
        if session.default_worker_id().is_some() {
            return Ok(());
        }

        let worker = self
            .spawn_worker(DEFAULT_WORKER_ID.to_string(), DEFAULT_WORKER_ID.to_string())
            .await?;
        session
            .workers
            .lock()
            .insert(DEFAULT_WORKER_ID.to_string(), worker);
        *session.default_worker_id.lock() = Some(DEFAULT_WORKER_ID.to_string());
        tracing::debug!(session = session.id(), "created default worker");
        Ok(())
    }

    async fn spawn_worker(&self, id: String, name: String) -> Result<Arc<Worker>> {
        let result = self
            .client
            .send_command(None, "Target.createBrowserContext", json!({}))
            .await?;
        let context_id = result["browserContextId"]
            .as_str()
            .ok_or_else(|| {
                Error::ProtocolError("createBrowserContext missing browserContextId".to_string())
            })?
            .to_string();
        Ok(Arc::new(Worker::new(id, name, context_id)))
    }

    /// Create a worker in a session. Fails if the caller-chosen id
    /// collides with an existing worker.
    pub async fn create_worker(&self, session_id: &str, spec: WorkerSpec) -> Result<Arc<Worker>> {
        let session = self.get_or_create_session(session_id).await?;
        let _guard = session.mutation.lock().await;

        let id = match spec.id {
            Some(id) => {
                if session.workers.lock().contains_key(&id) {
                    return Err(Error::InvalidArgument(format!(
                        "worker id '{id}' already exists in session '{session_id}'"
                    )));
                }
                id
            }
            None => loop {
                let candidate = format!("w{}", self.worker_seq.fetch_add(1, Ordering::SeqCst) + 1);
                if !session.workers.lock().contains_key(&candidate) {
                    break candidate;
                }
            },
        };

        let name = spec.name.unwrap_or_else(|| id.clone());
        let worker = self.spawn_worker(id.clone(), name).await?;
        session.workers.lock().insert(id.clone(), Arc::clone(&worker));
        session.touch();
        tracing::debug!(session = session_id, worker = %id, "created worker");
        Ok(worker)
    }

    /// Delete a worker, cascading to its targets and context.
    ///
    /// The session's default worker is never deletable. Idempotent: a
    /// second delete of the same worker succeeds without effect.
    pub async fn delete_worker(&self, session_id: &str, worker_id: &str) -> Result<()> {
        let session = self
            .session(session_id)
            .ok_or_else(|| Error::not_found("session", session_id))?;
        session.touch();

        if session.default_worker_id().as_deref() == Some(worker_id) {
            return Err(Error::InvalidArgument(format!(
                "worker '{worker_id}' is the default worker of session '{session_id}' and cannot be deleted"
            )));
        }

        let _session_guard = session.mutation.lock().await;
        let Some(worker) = session.workers.lock().remove(worker_id) else {
            return Ok(());
        };

        let _worker_guard = worker.mutation.lock().await;
        worker.deleted.store(true, Ordering::SeqCst);
        self.teardown_worker(&worker).await;
        tracing::debug!(session = session_id, worker = worker_id, "deleted worker");
        Ok(())
    }

    /// Close every target the worker owns, then dispose its context.
    /// Best-effort: individual failures are logged and do not stop the
    /// cascade.
    async fn teardown_worker(&self, worker: &Worker) {
        let targets: Vec<(String, String)> =
            worker.targets.lock().drain().collect();

        for (target_id, protocol_session_id) in targets {
            if let Err(e) = self
                .client
                .send_command(None, "Target.closeTarget", json!({"targetId": target_id}))
                .await
            {
                tracing::warn!(target = %target_id, "failed to close target: {}", e);
            }
            self.client.clear_session(&protocol_session_id);
        }

        if let Err(e) = self
            .client
            .send_command(
                None,
                "Target.disposeBrowserContext",
                json!({"browserContextId": worker.context_id()}),
            )
            .await
        {
            tracing::warn!(context = worker.context_id(), "failed to dispose context: {}", e);
        }
    }

    /// Allocate (or reuse) a tab inside the resolved worker and navigate
    /// it to `url`.
    ///
    /// When the worker owns exactly one target, that target is
    /// re-navigated instead of opening a new tab; the outcome's
    /// disposition says which happened.
    pub async fn create_target(
        &self,
        session_id: &str,
        url: &str,
        worker_id: Option<&str>,
    ) -> Result<CreateTargetOutcome> {
        let session = self.get_or_create_session(session_id).await?;
        let worker = self.resolve_worker(&session, worker_id)?;

        let _guard = worker.mutation.lock().await;
        if worker.deleted.load(Ordering::SeqCst) {
            return Err(Error::not_found("worker", worker.id()));
        }

        let url = if url.is_empty() { "about:blank" } else { url };

        if let Some((target_id, protocol_session_id)) = worker.single_target() {
            self.client
                .send_command(
                    Some(&protocol_session_id),
                    "Page.navigate",
                    json!({"url": url}),
                )
                .await?;
            worker.touch();
            tracing::debug!(target = %target_id, %url, "reused existing target");
            return Ok(CreateTargetOutcome {
                handle: TargetHandle {
                    target_id,
                    protocol_session_id,
                    worker_id: worker.id().to_string(),
                },
                disposition: TargetDisposition::Reused,
            });
        }

        let created = self
            .client
            .send_command(
                None,
                "Target.createTarget",
                json!({"url": url, "browserContextId": worker.context_id()}),
            )
            .await?;
        let target_id = created["targetId"]
            .as_str()
            .ok_or_else(|| Error::ProtocolError("createTarget missing targetId".to_string()))?
            .to_string();

        let attached = self
            .client
            .send_command(
                None,
                "Target.attachToTarget",
                json!({"targetId": target_id, "flatten": true}),
            )
            .await?;
        let protocol_session_id = attached["sessionId"]
            .as_str()
            .ok_or_else(|| Error::ProtocolError("attachToTarget missing sessionId".to_string()))?
            .to_string();

        worker
            .targets
            .lock()
            .insert(target_id.clone(), protocol_session_id.clone());
        worker.touch();
        tracing::debug!(target = %target_id, %url, "created target");

        Ok(CreateTargetOutcome {
            handle: TargetHandle {
                target_id,
                protocol_session_id,
                worker_id: worker.id().to_string(),
            },
            disposition: TargetDisposition::Created,
        })
    }

    fn resolve_worker(
        &self,
        session: &Arc<Session>,
        worker_id: Option<&str>,
    ) -> Result<Arc<Worker>> {
        match worker_id {
            Some(id) => session
                .worker(id)
                .ok_or_else(|| Error::not_found("worker", id)),
            None => {
                let default_id = session.default_worker_id().ok_or_else(|| {
                    Error::ProtocolError(format!(
                        "session '{}' has no default worker",
                        session.id()
                    ))
                })?;
                session
                    .worker(&default_id)
                    .ok_or_else(|| Error::not_found("worker", default_id))
            }
        }
    }

    /// Resolve a usable handle for a target, or `None` if it is gone.
    pub fn get_page(&self, session_id: &str, target_id: &str) -> Option<TargetHandle> {
        let session = self.session(session_id)?;
        session.touch();
        let (worker, protocol_session_id) = session.find_target(target_id)?;
        Some(TargetHandle {
            target_id: target_id.to_string(),
            protocol_session_id,
            worker_id: worker.id().to_string(),
        })
    }

    /// Liveness probe: is the target still registered and attached?
    pub async fn is_target_valid(&self, target_id: &str) -> bool {
        let owned = self.sessions.iter().any(|entry| {
            entry
                .value()
                .workers
                .lock()
                .values()
                .any(|w| w.owns_target(target_id))
        });
        if !owned {
            return false;
        }

        match self
            .client
            .send_command(None, "Target.getTargetInfo", json!({"targetId": target_id}))
            .await
        {
            Ok(info) => info["targetInfo"]["attached"].as_bool().unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Close one target explicitly.
    pub async fn close_target(&self, session_id: &str, target_id: &str) -> Result<()> {
        let session = self
            .session(session_id)
            .ok_or_else(|| Error::not_found("session", session_id))?;
        session.touch();

        let (worker, protocol_session_id) = session
            .find_target(target_id)
            .ok_or_else(|| Error::not_found("target", target_id))?;

        let _guard = worker.mutation.lock().await;
        if worker.targets.lock().remove(target_id).is_none() {
            // Lost a race with delete_worker or reconciliation.
            return Err(Error::not_found("target", target_id));
        }

        if let Err(e) = self
            .client
            .send_command(None, "Target.closeTarget", json!({"targetId": target_id}))
            .await
        {
            tracing::warn!(target = target_id, "failed to close target: {}", e);
        }
        self.client.clear_session(&protocol_session_id);
        Ok(())
    }

    /// Tear down every session. Called at process shutdown; tolerates
    /// partial failures in child tear-down without aborting the sweep.
    pub async fn cleanup_all_sessions(&self) {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for session in sessions {
            let _guard = session.mutation.lock().await;
            let workers: Vec<Arc<Worker>> =
                session.workers.lock().drain().map(|(_, w)| w).collect();
            for worker in workers {
                let _worker_guard = worker.mutation.lock().await;
                worker.deleted.store(true, Ordering::SeqCst);
                self.teardown_worker(&worker).await;
            }
            *session.default_worker_id.lock() = None;
            self.sessions.remove(session.id());
        }
        tracing::debug!("session sweep complete");
    }

    /// Drop a target the browser reported closed out-of-band, so later
    /// lookups fail cleanly instead of hanging on a dead tab.
    pub fn reconcile_destroyed(&self, target_id: &str) {
        for entry in self.sessions.iter() {
            if let Some((worker, protocol_session_id)) = entry.value().find_target(target_id) {
                worker.targets.lock().remove(target_id);
                self.client.clear_session(&protocol_session_id);
                tracing::debug!(
                    session = entry.key(),
                    worker = worker.id(),
                    target = target_id,
                    "reconciled destroyed target"
                );
                return;
            }
        }
    }

    fn reconcile_detached(&self, protocol_session_id: &str) {
        for entry in self.sessions.iter() {
            let workers: Vec<Arc<Worker>> =
                entry.value().workers.lock().values().cloned().collect();
            for worker in workers {
                let target_id = worker
                    .targets
                    .lock()
                    .iter()
                    .find(|(_, s)| s.as_str() == protocol_session_id)
                    .map(|(t, _)| t.clone());
                if let Some(target_id) = target_id {
                    worker.targets.lock().remove(&target_id);
                    self.client.clear_session(protocol_session_id);
                    tracing::debug!(target = %target_id, "reconciled detached target");
                    return;
                }
            }
        }
    }

    /// Consume browser-level target events and reconcile out-of-band
    /// closures. Runs until the event stream ends (connection lost or
    /// shutdown).
    pub async fn run_reconciler(self: Arc<Self>) -> Result<()> {
        let mut events = self.client.subscribe("", None).await?;
        while let Some(event) = events.recv().await {
            match event.method.as_str() {
                "Target.targetDestroyed" => {
                    if let Some(target_id) = event.params["targetId"].as_str() {
                        self.reconcile_destroyed(target_id);
                    }
                }
                "Target.detachedFromTarget" => {
                    if let Some(protocol_session_id) = event.params["sessionId"].as_str() {
                        self.reconcile_detached(protocol_session_id);
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabmux_runtime::testing::FakeBrowser;

    fn registry() -> (Arc<Registry>, FakeBrowser) {
        let fake = FakeBrowser::new();
        let registry = Arc::new(Registry::new(Arc::new(fake.clone())));
        (registry, fake)
    }

    #[tokio::test]
    async fn session_gets_default_worker_on_first_touch() {
        let (registry, _fake) = registry();

        let session = registry.get_or_create_session("s1").await.unwrap();
        let default_id = session.default_worker_id().unwrap();
        assert_eq!(default_id, DEFAULT_WORKER_ID);
        assert!(session.worker(&default_id).is_some());
    }

    #[tokio::test]
    async fn default_worker_always_resolves_across_mutations() {
        let (registry, _fake) = registry();

        registry.get_or_create_session("s1").await.unwrap();
        let w1 = registry
            .create_worker("s1", WorkerSpec { id: Some("w1".into()), name: None })
            .await
            .unwrap();
        registry.delete_worker("s1", w1.id()).await.unwrap();

        let session = registry.session("s1").unwrap();
        let default_id = session.default_worker_id().unwrap();
        assert!(session.worker(&default_id).is_some());
    }

    #[tokio::test]
    async fn worker_id_collision_fails() {
        let (registry, _fake) = registry();

        registry
            .create_worker("s1", WorkerSpec { id: Some("w1".into()), name: None })
            .await
            .unwrap();
        let err = registry
            .create_worker("s1", WorkerSpec { id: Some("w1".into()), name: None })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn default_worker_is_not_deletable() {
        let (registry, _fake) = registry();

        registry.get_or_create_session("s1").await.unwrap();
        let err = registry
            .delete_worker("s1", DEFAULT_WORKER_ID)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn delete_worker_cascades_and_is_idempotent() {
        let (registry, fake) = registry();

        registry
            .create_worker("s1", WorkerSpec { id: Some("w1".into()), name: None })
            .await
            .unwrap();
        let outcome = registry
            .create_target("s1", "https://a.example", Some("w1"))
            .await
            .unwrap();
        let target_id = outcome.handle.target_id.clone();

        registry.delete_worker("s1", "w1").await.unwrap();

        assert!(!registry.is_target_valid(&target_id).await);
        assert!(registry.get_page("s1", &target_id).is_none());
        assert_eq!(fake.commands_named("Target.closeTarget").len(), 1);
        assert_eq!(fake.commands_named("Target.disposeBrowserContext").len(), 1);

        // Second delete of the same worker: no error, no extra commands.
        registry.delete_worker("s1", "w1").await.unwrap();
        assert_eq!(fake.commands_named("Target.closeTarget").len(), 1);
    }

    #[tokio::test]
    async fn first_target_is_created_then_reused() {
        let (registry, fake) = registry();

        let first = registry
            .create_target("s1", "https://a.example", None)
            .await
            .unwrap();
        assert_eq!(first.disposition, TargetDisposition::Created);

        let second = registry
            .create_target("s1", "https://b.example", None)
            .await
            .unwrap();
        assert_eq!(second.disposition, TargetDisposition::Reused);
        assert_eq!(second.handle.target_id, first.handle.target_id);

        // The reuse navigated rather than opened a tab.
        assert_eq!(fake.commands_named("Target.createTarget").len(), 1);
        assert_eq!(
            fake.target_url(&first.handle.target_id).unwrap(),
            "https://b.example"
        );
    }

    #[tokio::test]
    async fn workers_use_distinct_browser_contexts() {
        let (registry, fake) = registry();

        registry
            .create_worker("s1", WorkerSpec { id: Some("w1".into()), name: None })
            .await
            .unwrap();
        registry
            .create_worker("s1", WorkerSpec { id: Some("w2".into()), name: None })
            .await
            .unwrap();

        let a = registry
            .create_target("s1", "https://a.example", Some("w1"))
            .await
            .unwrap();
        let b = registry
            .create_target("s1", "https://b.example", Some("w2"))
            .await
            .unwrap();

        let ctx_a = fake.context_of_target(&a.handle.target_id).unwrap();
        let ctx_b = fake.context_of_target(&b.handle.target_id).unwrap();
        assert_ne!(ctx_a, ctx_b, "workers must not share a cookie jar");
    }

    #[tokio::test]
    async fn empty_url_opens_blank_tab() {
        let (registry, fake) = registry();

        let outcome = registry.create_target("s1", "", None).await.unwrap();
        assert_eq!(
            fake.target_url(&outcome.handle.target_id).unwrap(),
            "about:blank"
        );
    }

    #[tokio::test]
    async fn get_page_resolves_only_live_targets() {
        let (registry, _fake) = registry();

        let outcome = registry
            .create_target("s1", "https://a.example", None)
            .await
            .unwrap();
        let handle = registry
            .get_page("s1", &outcome.handle.target_id)
            .expect("live target resolves");
        assert_eq!(handle.worker_id, DEFAULT_WORKER_ID);

        registry
            .close_target("s1", &outcome.handle.target_id)
            .await
            .unwrap();
        assert!(registry.get_page("s1", &outcome.handle.target_id).is_none());
    }

    #[tokio::test]
    async fn close_unknown_target_is_a_resolution_error() {
        let (registry, _fake) = registry();

        registry.get_or_create_session("s1").await.unwrap();
        let err = registry.close_target("s1", "target-404").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn reconciler_drops_targets_destroyed_out_of_band() {
        let (registry, fake) = registry();

        let handle = tokio::spawn(Arc::clone(&registry).run_reconciler());
        // Let the reconciler subscribe before anything is destroyed.
        tokio::task::yield_now().await;

        let outcome = registry
            .create_target("s1", "https://a.example", None)
            .await
            .unwrap();
        let target_id = outcome.handle.target_id.clone();
        assert!(registry.get_page("s1", &target_id).is_some());

        fake.destroy_target(&target_id);

        // Reconciliation is asynchronous but prompt.
        for _ in 0..50 {
            if registry.get_page("s1", &target_id).is_none() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(registry.get_page("s1", &target_id).is_none());
        handle.abort();
    }

    #[tokio::test]
    async fn cleanup_tolerates_partial_failures() {
        let (registry, fake) = registry();

        registry
            .create_target("s1", "https://a.example", None)
            .await
            .unwrap();
        registry
            .create_target("s2", "https://b.example", None)
            .await
            .unwrap();

        // Context disposal fails, but the sweep must still finish and
        // clear every session.
        fake.fail_method("Target.disposeBrowserContext");
        registry.cleanup_all_sessions().await;

        assert!(registry.session_ids().is_empty());
        assert_eq!(fake.commands_named("Target.closeTarget").len(), 2);
    }
}
