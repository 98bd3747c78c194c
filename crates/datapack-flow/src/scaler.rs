//! Fleet scaler: adjusts worker capacity to queue load.
//!
//! On a fixed interval the scaler compares each queue's depth and the
//! capacity provider's running-task counts against the configured target,
//! provisioning workers for backlogged queues and draining idle ones.
//! Deprovisioning follows the drain protocol: stop consumption, poll until
//! scheduled plus active counts reach zero, then terminate, so a worker is
//! never killed mid-step. Every capacity-provider failure is logged and
//! retried on the next tick; scaling never blocks step scheduling.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::dispatch::StepQueue;
use crate::error::{Error, Result};
use crate::metrics::FlowMetrics;

/// Shape of a worker to provision.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSpec {
    /// Command line launching the worker.
    pub command: String,
    /// Memory allocation in megabytes.
    pub memory_mb: u64,
    /// Disk allocation in megabytes.
    pub disk_mb: u64,
}

impl Default for WorkerSpec {
    fn default() -> Self {
        Self {
            command: "datapack-worker".to_string(),
            memory_mb: 2048,
            disk_mb: 4096,
        }
    }
}

/// Scheduled and active task counts for one queue's workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskCounts {
    /// Provisioned but not yet running.
    pub scheduled: usize,
    /// Currently running.
    pub active: usize,
}

impl TaskCounts {
    /// Total provisioned capacity.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.scheduled + self.active
    }
}

/// Outcome of a terminate call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// Capacity was terminated.
    Terminated,
    /// Nothing was running for the queue; terminating again is a no-op.
    AlreadyGone,
}

/// A capacity backend that can run worker tasks.
///
/// Two production implementations exist: a container-orchestrator client
/// and a platform task API client. Both are config-driven and
/// interchangeable behind this trait.
#[async_trait]
pub trait CapacityProvider: Send + Sync {
    /// Provisions one worker for a queue; returns a backend task id.
    async fn provision(&self, queue: &str, spec: &WorkerSpec) -> Result<String>;

    /// Returns scheduled/active counts for a queue's workers.
    async fn task_counts(&self, queue: &str) -> Result<TaskCounts>;

    /// Terminates a queue's workers. Idempotent: terminating an
    /// already-terminated queue returns [`TerminateOutcome::AlreadyGone`].
    async fn terminate(&self, queue: &str) -> Result<TerminateOutcome>;
}

/// Container-orchestrator capacity backend (docker CLI).
#[derive(Debug, Clone)]
pub struct ContainerCapacity {
    /// Image the worker containers run.
    pub image: String,
    /// Label prefix identifying containers managed by this scaler.
    pub label_prefix: String,
}

impl ContainerCapacity {
    /// Creates a container capacity backend.
    #[must_use]
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            label_prefix: "datapack.queue".to_string(),
        }
    }

    fn queue_label(&self, queue: &str) -> String {
        format!("{}={queue}", self.label_prefix)
    }

    async fn docker(args: &[String]) -> Result<String> {
        let output = tokio::process::Command::new("docker")
            .args(args)
            .output()
            .await
            .map_err(|e| Error::scaling(format!("docker invocation failed: {e}")))?;
        if !output.status.success() {
            return Err(Error::scaling(format!(
                "docker {} exited with {}: {}",
                args.first().map(String::as_str).unwrap_or(""),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl CapacityProvider for ContainerCapacity {
    async fn provision(&self, queue: &str, spec: &WorkerSpec) -> Result<String> {
        let args = vec![
            "run".to_string(),
            "--detach".to_string(),
            "--label".to_string(),
            self.queue_label(queue),
            "--memory".to_string(),
            format!("{}m", spec.memory_mb),
            self.image.clone(),
            "sh".to_string(),
            "-c".to_string(),
            spec.command.clone(),
        ];
        let container_id = Self::docker(&args).await?;
        tracing::info!(queue, container = %container_id, "worker container provisioned");
        Ok(container_id)
    }

    async fn task_counts(&self, queue: &str) -> Result<TaskCounts> {
        let running = Self::docker(&[
            "ps".to_string(),
            "--quiet".to_string(),
            "--filter".to_string(),
            format!("label={}", self.queue_label(queue)),
        ])
        .await?;
        let created = Self::docker(&[
            "ps".to_string(),
            "--quiet".to_string(),
            "--filter".to_string(),
            format!("label={}", self.queue_label(queue)),
            "--filter".to_string(),
            "status=created".to_string(),
        ])
        .await?;

        let count = |s: &str| s.lines().filter(|l| !l.is_empty()).count();
        let scheduled = count(&created);
        Ok(TaskCounts {
            scheduled,
            active: count(&running).saturating_sub(scheduled),
        })
    }

    async fn terminate(&self, queue: &str) -> Result<TerminateOutcome> {
        let ids = Self::docker(&[
            "ps".to_string(),
            "--all".to_string(),
            "--quiet".to_string(),
            "--filter".to_string(),
            format!("label={}", self.queue_label(queue)),
        ])
        .await?;
        let ids: Vec<String> = ids
            .lines()
            .filter(|l| !l.is_empty())
            .map(ToString::to_string)
            .collect();
        if ids.is_empty() {
            return Ok(TerminateOutcome::AlreadyGone);
        }

        let mut args = vec!["rm".to_string(), "--force".to_string()];
        args.extend(ids);
        Self::docker(&args).await?;
        Ok(TerminateOutcome::Terminated)
    }
}

/// Platform-task-API capacity backend (HTTP, token authenticated).
#[derive(Debug, Clone)]
pub struct PlatformTasksCapacity {
    config: PlatformConfig,
    client: reqwest::Client,
}

/// Configuration for the platform task API backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformConfig {
    /// API base URL.
    pub api_url: String,
    /// Application guid the worker tasks run under.
    pub app_guid: String,
    /// Bearer token.
    pub token: String,
}

#[derive(Debug, Serialize)]
struct CreateTaskRequest<'a> {
    name: &'a str,
    command: &'a str,
    memory_in_mb: u64,
    disk_in_mb: u64,
}

#[derive(Debug, Deserialize)]
struct TaskResource {
    guid: String,
    #[serde(default)]
    state: String,
}

#[derive(Debug, Deserialize)]
struct TaskList {
    #[serde(default)]
    resources: Vec<TaskResource>,
}

impl PlatformTasksCapacity {
    /// Creates a platform capacity backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: PlatformConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::scaling(format!("failed to build platform http client: {e}")))?;
        Ok(Self { config, client })
    }

    fn tasks_url(&self) -> String {
        format!(
            "{}/v3/apps/{}/tasks",
            self.config.api_url.trim_end_matches('/'),
            self.config.app_guid
        )
    }

    async fn list_tasks(&self, queue: &str, states: &str) -> Result<Vec<TaskResource>> {
        let url = format!(
            "{}/v3/tasks?names={queue}&states={states}",
            self.config.api_url.trim_end_matches('/')
        );
        let list: TaskList = self
            .client
            .get(url)
            .bearer_auth(&self.config.token)
            .send()
            .await
            .map_err(|e| Error::scaling(format!("platform task list failed: {e}")))?
            .error_for_status()
            .map_err(|e| Error::scaling(format!("platform task list rejected: {e}")))?
            .json()
            .await
            .map_err(|e| Error::scaling(format!("platform task list unreadable: {e}")))?;
        Ok(list.resources)
    }
}

#[async_trait]
impl CapacityProvider for PlatformTasksCapacity {
    async fn provision(&self, queue: &str, spec: &WorkerSpec) -> Result<String> {
        let request = CreateTaskRequest {
            name: queue,
            command: &spec.command,
            memory_in_mb: spec.memory_mb,
            disk_in_mb: spec.disk_mb,
        };
        let task: TaskResource = self
            .client
            .post(self.tasks_url())
            .bearer_auth(&self.config.token)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::scaling(format!("platform task create failed: {e}")))?
            .error_for_status()
            .map_err(|e| Error::scaling(format!("platform task create rejected: {e}")))?
            .json()
            .await
            .map_err(|e| Error::scaling(format!("platform task create unreadable: {e}")))?;
        tracing::info!(queue, task = %task.guid, "worker task provisioned");
        Ok(task.guid)
    }

    async fn task_counts(&self, queue: &str) -> Result<TaskCounts> {
        let tasks = self.list_tasks(queue, "PENDING,RUNNING").await?;
        let scheduled = tasks.iter().filter(|t| t.state == "PENDING").count();
        let active = tasks.iter().filter(|t| t.state == "RUNNING").count();
        Ok(TaskCounts { scheduled, active })
    }

    async fn terminate(&self, queue: &str) -> Result<TerminateOutcome> {
        let tasks = self.list_tasks(queue, "PENDING,RUNNING").await?;
        if tasks.is_empty() {
            return Ok(TerminateOutcome::AlreadyGone);
        }
        for task in tasks {
            let url = format!(
                "{}/v3/tasks/{}/actions/cancel",
                self.config.api_url.trim_end_matches('/'),
                task.guid
            );
            self.client
                .post(url)
                .bearer_auth(&self.config.token)
                .send()
                .await
                .map_err(|e| Error::scaling(format!("platform task cancel failed: {e}")))?
                .error_for_status()
                .map_err(|e| Error::scaling(format!("platform task cancel rejected: {e}")))?;
        }
        Ok(TerminateOutcome::Terminated)
    }
}

/// Scaler configuration.
#[derive(Debug, Clone)]
pub struct ScalerConfig {
    /// Target worker count per backlogged queue.
    pub target_workers: usize,
    /// Worker shape.
    pub worker_spec: WorkerSpec,
    /// Delay between drain polls.
    pub drain_poll_interval: Duration,
    /// Drain polls before giving up (retried next tick).
    pub drain_poll_limit: u32,
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            target_workers: 1,
            worker_spec: WorkerSpec::default(),
            drain_poll_interval: Duration::from_secs(2),
            drain_poll_limit: 30,
        }
    }
}

/// Summary of one scaler tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScalerTick {
    /// Workers provisioned.
    pub provisioned: usize,
    /// Queues terminated.
    pub terminated: usize,
    /// Errors encountered (all logged, all retried next tick).
    pub errors: usize,
}

/// The control loop.
pub struct FleetScaler {
    provider: Arc<dyn CapacityProvider>,
    queues: Vec<Arc<dyn StepQueue>>,
    config: ScalerConfig,
    metrics: FlowMetrics,
}

impl FleetScaler {
    /// Creates a scaler over the given capacity provider and queues.
    #[must_use]
    pub fn new(
        provider: Arc<dyn CapacityProvider>,
        queues: Vec<Arc<dyn StepQueue>>,
        config: ScalerConfig,
    ) -> Self {
        Self {
            provider,
            queues,
            config,
            metrics: FlowMetrics::new(),
        }
    }

    /// Runs one control-loop tick.
    ///
    /// Never fails outright: every capacity-provider error is logged,
    /// counted and retried on the next tick.
    pub async fn tick(&self) -> ScalerTick {
        let mut tick = ScalerTick::default();

        for queue in &self.queues {
            let name = queue.queue_name().to_string();

            let depth = match queue.queue_depth().await {
                Ok(depth) => depth,
                Err(e) => {
                    tracing::error!(queue = %name, error = %e, "queue depth unavailable");
                    tick.errors += 1;
                    continue;
                }
            };
            self.metrics.set_queue_depth(&name, depth);

            let counts = match self.provider.task_counts(&name).await {
                Ok(counts) => counts,
                Err(e) => {
                    tracing::error!(queue = %name, error = %e, "task counts unavailable");
                    tick.errors += 1;
                    continue;
                }
            };

            if depth > 0 && counts.total() < self.config.target_workers {
                match self
                    .provider
                    .provision(&name, &self.config.worker_spec)
                    .await
                {
                    Ok(task_id) => {
                        tracing::info!(queue = %name, task = %task_id, "provisioned");
                        tick.provisioned += 1;
                    }
                    Err(e) => {
                        tracing::error!(queue = %name, error = %e, "provision failed");
                        tick.errors += 1;
                    }
                }
            } else if depth == 0 && counts.total() > 0 {
                match self.drain_and_terminate(queue.as_ref(), &name).await {
                    Ok(outcome) => {
                        if outcome == TerminateOutcome::Terminated {
                            tick.terminated += 1;
                        }
                    }
                    Err(e) => {
                        tracing::error!(queue = %name, error = %e, "drain failed");
                        tick.errors += 1;
                    }
                }
            }
        }

        self.metrics
            .record_scaler_tick(if tick.errors == 0 { "ok" } else { "degraded" });
        tick
    }

    /// Drains a queue, then terminates its workers.
    ///
    /// Stops consumption first, polls until the provider reports zero
    /// scheduled and active tasks (bounded; gives up and retries next
    /// tick), and only then issues the terminate call.
    async fn drain_and_terminate(
        &self,
        queue: &dyn StepQueue,
        name: &str,
    ) -> Result<TerminateOutcome> {
        queue.cancel_consumers().await?;

        let mut polls = 0;
        loop {
            let counts = self.provider.task_counts(name).await?;
            if counts.scheduled == 0 && counts.active == 0 {
                break;
            }
            polls += 1;
            if polls >= self.config.drain_poll_limit {
                return Err(Error::scaling(format!(
                    "queue {name} did not drain within {polls} polls"
                )));
            }
            tokio::time::sleep(self.config.drain_poll_interval).await;
        }

        self.provider.terminate(name).await
    }
}

/// Best-effort worker self-termination check.
///
/// A worker that just finished its last step may shut itself down when its
/// queue is empty and no in-flight step records target its hostname. The
/// check is approximate: a dispatch can land between the check and the
/// shutdown, so this must never be treated as a guarantee; the lock TTL
/// and requeue-on-conflict paths cover the race.
#[must_use]
pub const fn self_termination_due(queue_depth: usize, inflight_steps_for_host: usize) -> bool {
    queue_depth == 0 && inflight_steps_for_host == 0
}

/// In-memory capacity provider for tests.
#[derive(Debug, Default)]
pub struct InMemoryCapacity {
    state: Mutex<InMemoryCapacityState>,
}

#[derive(Debug, Default)]
struct InMemoryCapacityState {
    counts: std::collections::HashMap<String, TaskCounts>,
    provisions: Vec<String>,
    terminations: Vec<String>,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::scaling("capacity state poisoned")
}

impl InMemoryCapacity {
    /// Creates an empty capacity provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the reported counts for a queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn set_counts(&self, queue: &str, counts: TaskCounts) -> Result<()> {
        let mut state = self.state.lock().map_err(poison_err)?;
        state.counts.insert(queue.to_string(), counts);
        drop(state);
        Ok(())
    }

    /// Returns all provision calls.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn provisions(&self) -> Result<Vec<String>> {
        let state = self.state.lock().map_err(poison_err)?;
        Ok(state.provisions.clone())
    }

    /// Returns all terminate calls that actually terminated capacity.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn terminations(&self) -> Result<Vec<String>> {
        let state = self.state.lock().map_err(poison_err)?;
        Ok(state.terminations.clone())
    }
}

#[async_trait]
impl CapacityProvider for InMemoryCapacity {
    async fn provision(&self, queue: &str, _spec: &WorkerSpec) -> Result<String> {
        let mut state = self.state.lock().map_err(poison_err)?;
        let entry = state.counts.entry(queue.to_string()).or_default();
        entry.scheduled += 1;
        state.provisions.push(queue.to_string());
        drop(state);
        Ok(format!("task-{queue}"))
    }

    async fn task_counts(&self, queue: &str) -> Result<TaskCounts> {
        let state = self.state.lock().map_err(poison_err)?;
        Ok(state.counts.get(queue).copied().unwrap_or_default())
    }

    async fn terminate(&self, queue: &str) -> Result<TerminateOutcome> {
        let mut state = self.state.lock().map_err(poison_err)?;
        if state.counts.remove(queue).is_none() {
            // Already terminated (or never provisioned).
            return Ok(TerminateOutcome::AlreadyGone);
        }
        state.terminations.push(queue.to_string());
        drop(state);
        Ok(TerminateOutcome::Terminated)
    }
}
