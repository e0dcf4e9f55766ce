//! Parallel workflow orchestrator.
//!
//! Fans a task out to N workers, runs them concurrently, and collects
//! results either blocking or streaming. Workers report progress
//! explicitly via [`Workflow::update`]; a circuit breaker watches those
//! reports and force-completes any worker that keeps claiming progress
//! with byte-identical payloads, so one hung or looping worker cannot
//! stall the whole batch. A breaker trip is not an error: the worker
//! lands in the `stale-completed` terminal state carrying the last payload
//! it provided.

use crate::registry::{Registry, TargetDisposition, WorkerSpec as RegistryWorkerSpec};
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tabmux_runtime::{Error, Result};
use tokio::sync::Notify;

/// Default number of byte-identical in-progress reports that trips the
/// breaker.
pub const DEFAULT_STALE_THRESHOLD: u32 = 3;

/// Workflow-wide phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowPhase {
    Init,
    Running,
    Collecting,
    PartiallyCollected,
    Completed,
    Aborted,
}

/// Per-worker status. `Success`, `Error`, and `StaleCompleted` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerStatus {
    Pending,
    InProgress,
    Success,
    Error,
    StaleCompleted,
}

impl WorkerStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkerStatus::Success | WorkerStatus::Error | WorkerStatus::StaleCompleted
        )
    }
}

/// One worker requested from [`Workflow::init`].
#[derive(Debug, Clone)]
pub struct WorkerTask {
    /// Worker id within the workflow's session; reused when it already
    /// exists.
    pub name: String,
    /// URL the worker's target starts on.
    pub url: String,
}

/// Final (or partial) result for one worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerResult {
    pub name: String,
    pub status: WorkerStatus,
    pub payload: Option<Value>,
    pub worker_id: String,
    pub target_id: String,
}

/// Workflow tuning.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    /// Consecutive identical in-progress payloads before the breaker
    /// trips.
    pub stale_threshold: u32,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            stale_threshold: DEFAULT_STALE_THRESHOLD,
        }
    }
}

struct WorkerRecord {
    worker_id: String,
    target_id: String,
    status: WorkerStatus,
    payload: Option<Value>,
    /// Serialized form of the last in-progress payload, for the
    /// byte-identity comparison.
    last_payload: Option<String>,
    identical_count: u32,
}

/// One fan-out batch over a session's workers.
pub struct Workflow {
    registry: Arc<Registry>,
    session_id: String,
    config: WorkflowConfig,
    phase: Mutex<WorkflowPhase>,
    records: Mutex<HashMap<String, WorkerRecord>>,
    changed: Notify,
}

impl Workflow {
    /// Create (or reuse) a worker and target per requested task and start
    /// each navigation. Workers whose setup fails land directly in the
    /// `Error` terminal state rather than failing the whole batch.
    pub async fn init(
        registry: Arc<Registry>,
        session_id: &str,
        tasks: Vec<WorkerTask>,
        config: WorkflowConfig,
    ) -> Result<Arc<Self>> {
        if tasks.is_empty() {
            return Err(Error::InvalidArgument(
                "workflow needs at least one worker".to_string(),
            ));
        }

        let workflow = Arc::new(Self {
            registry: Arc::clone(&registry),
            session_id: session_id.to_string(),
            config,
            phase: Mutex::new(WorkflowPhase::Init),
            records: Mutex::new(HashMap::new()),
            changed: Notify::new(),
        });

        // Workers are independent; start them all concurrently.
        let outcomes = join_all(tasks.iter().map(|task| workflow.start_worker(task))).await;
        for (task, outcome) in tasks.iter().zip(outcomes) {
            let record = match outcome {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(worker = %task.name, "worker setup failed: {}", e);
                    WorkerRecord {
                        worker_id: task.name.clone(),
                        target_id: String::new(),
                        status: WorkerStatus::Error,
                        payload: Some(Value::String(e.to_string())),
                        last_payload: None,
                        identical_count: 0,
                    }
                }
            };
            workflow.records.lock().insert(task.name.clone(), record);
        }

        *workflow.phase.lock() = WorkflowPhase::Running;
        Ok(workflow)
    }

    async fn start_worker(&self, task: &WorkerTask) -> Result<WorkerRecord> {
        let session = self.registry.get_or_create_session(&self.session_id).await?;

        let worker = match session.worker(&task.name) {
            Some(existing) => existing,
            None => {
                self.registry
                    .create_worker(
                        &self.session_id,
                        RegistryWorkerSpec {
                            id: Some(task.name.clone()),
                            name: Some(task.name.clone()),
                        },
                    )
                    .await?
            }
        };

        let outcome = self
            .registry
            .create_target(&self.session_id, &task.url, Some(worker.id()))
            .await?;
        if outcome.disposition == TargetDisposition::Reused {
            tracing::debug!(worker = %task.name, "workflow reused existing target");
        }

        Ok(WorkerRecord {
            worker_id: worker.id().to_string(),
            target_id: outcome.handle.target_id,
            status: WorkerStatus::InProgress,
            payload: None,
            last_payload: None,
            identical_count: 0,
        })
    }

    pub fn phase(&self) -> WorkflowPhase {
        *self.phase.lock()
    }

    /// Current status of one worker.
    pub fn worker_status(&self, name: &str) -> Option<WorkerStatus> {
        self.records.lock().get(name).map(|r| r.status)
    }

    /// Record a progress report from a worker.
    ///
    /// `status` must be `InProgress`, `Success`, or `Error`. Returns the
    /// worker's effective status, which is `StaleCompleted` when this
    /// report tripped the circuit breaker. Reports for workers already in
    /// a terminal state are ignored.
    pub fn update(
        &self,
        name: &str,
        status: WorkerStatus,
        payload: Option<Value>,
    ) -> Result<WorkerStatus> {
        if matches!(status, WorkerStatus::Pending | WorkerStatus::StaleCompleted) {
            return Err(Error::InvalidArgument(format!(
                "workers cannot report status {status:?}"
            )));
        }

        let mut records = self.records.lock();
        let record = records
            .get_mut(name)
            .ok_or_else(|| Error::not_found("workflow worker", name))?;

        if record.status.is_terminal() {
            return Ok(record.status);
        }

        match status {
            WorkerStatus::InProgress => {
                let serialized = payload
                    .as_ref()
                    .map(|p| serde_json::to_string(p).unwrap_or_default());

                let identical = match (&serialized, &record.last_payload) {
                    (Some(new), Some(last)) => new == last,
                    _ => false,
                };

                if identical {
                    record.identical_count += 1;
                } else {
                    record.identical_count = 1;
                    record.last_payload = serialized;
                }
                record.payload = payload;
                record.status = WorkerStatus::InProgress;

                if record.identical_count >= self.config.stale_threshold {
                    // The breaker trades a little correctness risk for
                    // bounded batch latency: this worker stops being
                    // waited on, keeping its last payload.
                    record.status = WorkerStatus::StaleCompleted;
                    tracing::warn!(
                        worker = name,
                        reports = record.identical_count,
                        "circuit breaker tripped; worker force-completed"
                    );
                    drop(records);
                    self.changed.notify_waiters();
                    return Ok(WorkerStatus::StaleCompleted);
                }

                Ok(WorkerStatus::InProgress)
            }
            terminal => {
                record.status = terminal;
                record.payload = payload;
                record.last_payload = None;
                record.identical_count = 0;
                drop(records);
                self.changed.notify_waiters();
                Ok(terminal)
            }
        }
    }

    /// Results for every worker currently in a terminal state, without
    /// waiting for the rest. `only_successful` keeps `Success` and
    /// `StaleCompleted` (successful-with-caveat) and drops `Error`.
    pub fn collect_partial(&self, only_successful: bool) -> Vec<WorkerResult> {
        {
            let mut phase = self.phase.lock();
            if matches!(*phase, WorkflowPhase::Running | WorkflowPhase::Collecting) {
                *phase = WorkflowPhase::PartiallyCollected;
            }
        }

        self.results_where(|status| {
            status.is_terminal()
                && (!only_successful
                    || matches!(status, WorkerStatus::Success | WorkerStatus::StaleCompleted))
        })
    }

    /// Block until every worker reaches a terminal state
    /// (`stale-completed` counts), then return the full result set.
    ///
    /// Termination is bounded by the breaker: once a worker trips it is
    /// excluded from further waiting, even if it never reports again.
    pub async fn collect(&self) -> Vec<WorkerResult> {
        {
            let mut phase = self.phase.lock();
            if !matches!(*phase, WorkflowPhase::Aborted) {
                *phase = WorkflowPhase::Collecting;
            }
        }

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            // Register interest before checking, so a report landing
            // between the check and the await cannot be missed.
            notified.as_mut().enable();

            if self.phase() == WorkflowPhase::Aborted || self.all_terminal() {
                break;
            }

            notified.await;
        }

        {
            let mut phase = self.phase.lock();
            if !matches!(*phase, WorkflowPhase::Aborted) {
                *phase = WorkflowPhase::Completed;
            }
        }

        self.results_where(|_| true)
    }

    /// [`collect`](Self::collect) with a deadline, for callers that cannot
    /// tolerate a worker which never reports at all.
    pub async fn collect_within(&self, limit: Duration) -> Result<Vec<WorkerResult>> {
        match tokio::time::timeout(limit, self.collect()).await {
            Ok(results) => Ok(results),
            Err(_) => Err(Error::Timeout {
                operation: "workflow collect".to_string(),
                limit_ms: limit.as_millis() as u64,
            }),
        }
    }

    /// Abort the workflow: collection stops waiting and returns whatever
    /// state the workers are in.
    pub fn abort(&self) {
        *self.phase.lock() = WorkflowPhase::Aborted;
        self.changed.notify_waiters();
    }

    fn all_terminal(&self) -> bool {
        self.records
            .lock()
            .values()
            .all(|record| record.status.is_terminal())
    }

    fn results_where(&self, keep: impl Fn(WorkerStatus) -> bool) -> Vec<WorkerResult> {
        let records = self.records.lock();
        let mut results: Vec<WorkerResult> = records
            .iter()
            .filter(|(_, record)| keep(record.status))
            .map(|(name, record)| WorkerResult {
                name: name.clone(),
                status: record.status,
                payload: record.payload.clone(),
                worker_id: record.worker_id.clone(),
                target_id: record.target_id.clone(),
            })
            .collect();
        results.sort_by(|a, b| a.name.cmp(&b.name));
        results
    }
}
