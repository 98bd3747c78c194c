//! Worker loop: pulls dispatch messages and executes steps.
//!
//! Every execution is bracketed by the lock cache: acquire the
//! `(kind, correlation, attempt)` lock, execute, release on every exit path
//! (the guard releases on drop, panics included). A duplicate dispatch that
//! loses the lock race is requeued, never dropped. If the envelope is
//! itself a retry, in which case it logs and skips so a stuck lock cannot
//! cause an infinite requeue loop.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use datapack_core::{ExportLayout, LockCache, LockGuard, LockKey, RunId, StepId};

use crate::artifact::Artifact;
use crate::cancel::mark_step_cancelled;
use crate::catalog::StepKind;
use crate::dispatch::{EnqueueOptions, Envelope, InterruptEnvelope, StepEnvelope, StepQueue};
use crate::error::Result;
use crate::finalize::{finalize_provider, FinalizeOutcome, RunFinalizer};
use crate::metrics::FlowMetrics;
use crate::operation::{OperationContext, OperationRegistry};
use crate::proc::ProcessKiller;
use crate::provider::ProviderTaskState;
use crate::step::{FailureKind, FailureRecord, StepState};
use crate::store::{CasResult, Store};

/// Outcome of one worker poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerTick {
    /// Queue was empty (or consumption cancelled).
    Idle,
    /// A step was executed (successfully or not; the store has the detail).
    Executed(StepId),
    /// A lock conflict requeued the dispatch.
    Requeued(StepId),
    /// The dispatch was skipped (already resolved, cancelled, or a retry
    /// that lost its lock race).
    Skipped(StepId),
    /// An interrupt was handled.
    Interrupted(StepId),
    /// Run finalization is still waiting on sibling chains; requeued.
    FinalizeWaiting(StepId),
}

/// A worker process identity plus its collaborators.
pub struct Worker {
    hostname: String,
    store: Arc<dyn Store>,
    queue: Arc<dyn StepQueue>,
    locks: Arc<dyn LockCache>,
    registry: Arc<OperationRegistry>,
    layout: ExportLayout,
    finalizer: RunFinalizer,
    lock_ttl: Duration,
    killer: ProcessKiller,
    metrics: FlowMetrics,
}

impl Worker {
    /// Creates a worker.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hostname: impl Into<String>,
        store: Arc<dyn Store>,
        queue: Arc<dyn StepQueue>,
        locks: Arc<dyn LockCache>,
        registry: Arc<OperationRegistry>,
        layout: ExportLayout,
        finalizer: RunFinalizer,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            store,
            queue,
            locks,
            registry,
            layout,
            finalizer,
            lock_ttl: datapack_core::lock::DEFAULT_LOCK_TTL,
            killer: ProcessKiller::default(),
            metrics: FlowMetrics::new(),
        }
    }

    /// Overrides the execution lock TTL.
    #[must_use]
    pub const fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Overrides the process killer (shorter grace interval in tests).
    #[must_use]
    pub const fn with_killer(mut self, killer: ProcessKiller) -> Self {
        self.killer = killer;
        self
    }

    /// Returns this worker's hostname.
    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Pulls and handles at most one message.
    ///
    /// # Errors
    ///
    /// Returns an error on storage or dispatch failure; execution failures
    /// of the operation itself are recorded on the step, not returned.
    pub async fn poll_once(&self) -> Result<WorkerTick> {
        let Some(entry) = self.queue.take().await? else {
            return Ok(WorkerTick::Idle);
        };
        match entry.envelope {
            Envelope::Step(envelope) => self.handle_step(envelope).await,
            Envelope::Interrupt(envelope) => self.handle_interrupt(envelope).await,
        }
    }

    #[tracing::instrument(
        skip(self, envelope),
        fields(step_id = %envelope.step_id, kind = %envelope.kind, attempt = envelope.attempt, host = %self.hostname)
    )]
    async fn handle_step(&self, envelope: StepEnvelope) -> Result<WorkerTick> {
        let step_id = envelope.step_id;
        let Some(record) = self.store.get_step(&envelope.run_id, &step_id).await? else {
            tracing::warn!("dispatched step no longer exists");
            return Ok(WorkerTick::Skipped(step_id));
        };
        if record.state != StepState::Pending {
            tracing::debug!(state = %record.state, "step already resolved, skipping dispatch");
            return Ok(WorkerTick::Skipped(step_id));
        }

        // At-most-one in-flight execution per logical unit of work.
        let key = LockKey::new(
            envelope.kind.as_label(),
            envelope.correlation_id.clone(),
            envelope.attempt,
        );
        let acquired = self.locks.try_acquire(&key, &self.hostname, self.lock_ttl)?;
        if !acquired.is_acquired() {
            if envelope.attempt > 1 {
                // The retry itself hit a stale lock: log and skip rather
                // than loop forever.
                tracing::warn!(%key, "retry invocation lost its lock, skipping");
                return Ok(WorkerTick::Skipped(step_id));
            }
            self.metrics.record_requeue();
            tracing::info!(%key, "lock held elsewhere, requeuing dispatch");
            self.queue
                .enqueue(Envelope::Step(envelope), EnqueueOptions::new())
                .await?;
            return Ok(WorkerTick::Requeued(step_id));
        }
        let guard = LockGuard::new(Arc::clone(&self.locks), key, self.hostname.clone());

        let tick = match envelope.kind {
            StepKind::FinalizeRun => self.execute_finalize_run(&envelope).await?,
            StepKind::FinalizeProvider => self.execute_finalize_provider(&envelope).await?,
            _ => self.execute_operation(&envelope).await?,
        };

        // Release is unconditional; the guard would also release on drop.
        if let Err(e) = guard.release() {
            tracing::warn!(error = %e, "lock release failed");
        }
        Ok(tick)
    }

    async fn execute_finalize_run(&self, envelope: &StepEnvelope) -> Result<WorkerTick> {
        let step_id = envelope.step_id;

        // Poll, don't block: if siblings are in flight, put the dispatch
        // back and let the next delivery re-check.
        let outcome = self
            .finalizer
            .finalize_run(self.store.as_ref(), &envelope.run_id)
            .await;
        match outcome {
            Ok(FinalizeOutcome::Waiting) => {
                self.queue
                    .enqueue(Envelope::Step(envelope.clone()), EnqueueOptions::new())
                    .await?;
                return Ok(WorkerTick::FinalizeWaiting(step_id));
            }
            Ok(FinalizeOutcome::Finalized(state)) => {
                self.begin_step(envelope).await?;
                self.store
                    .cas_step_state(
                        &envelope.run_id,
                        &step_id,
                        StepState::Running,
                        StepState::Succeeded,
                    )
                    .await?;
                tracing::info!(%state, "run finalize step completed");
            }
            Err(e) => {
                self.begin_step(envelope).await?;
                self.store
                    .record_step_failure(
                        &envelope.run_id,
                        &step_id,
                        FailureRecord::new(FailureKind::Infrastructure, e.to_string()),
                    )
                    .await?;
                self.store
                    .cas_step_state(
                        &envelope.run_id,
                        &step_id,
                        StepState::Running,
                        StepState::Failed,
                    )
                    .await?;
                tracing::error!(error = %e, "run finalize step failed");
            }
        }
        Ok(WorkerTick::Executed(step_id))
    }

    async fn execute_finalize_provider(&self, envelope: &StepEnvelope) -> Result<WorkerTick> {
        let step_id = envelope.step_id;
        if !self.begin_step(envelope).await? {
            return Ok(WorkerTick::Skipped(step_id));
        }

        match finalize_provider(
            self.store.as_ref(),
            &envelope.run_id,
            &envelope.provider_task_id,
        )
        .await
        {
            Ok(state) => {
                tracing::info!(%state, "provider finalized");
                self.store
                    .cas_step_state(
                        &envelope.run_id,
                        &step_id,
                        StepState::Running,
                        StepState::Succeeded,
                    )
                    .await?;
            }
            Err(e) => {
                self.store
                    .record_step_failure(
                        &envelope.run_id,
                        &step_id,
                        FailureRecord::new(FailureKind::Infrastructure, e.to_string()),
                    )
                    .await?;
                self.store
                    .cas_step_state(
                        &envelope.run_id,
                        &step_id,
                        StepState::Running,
                        StepState::Failed,
                    )
                    .await?;
            }
        }
        Ok(WorkerTick::Executed(step_id))
    }

    async fn execute_operation(&self, envelope: &StepEnvelope) -> Result<WorkerTick> {
        let step_id = envelope.step_id;
        let run_id = envelope.run_id;

        // A cancel that landed between dispatch and execution wins.
        let run = self.store.get_run(&run_id).await?;
        let provider = run
            .as_ref()
            .and_then(|r| r.get_provider_task(&envelope.provider_task_id));
        let Some(provider) = provider else {
            tracing::warn!("provider record no longer exists");
            return Ok(WorkerTick::Skipped(step_id));
        };
        if provider.state == ProviderTaskState::Cancelled {
            let cas = self
                .store
                .cas_step_state(&run_id, &step_id, StepState::Pending, StepState::Cancelled)
                .await?;
            tracing::info!(applied = cas.is_success(), "provider cancelled before execution");
            return Ok(WorkerTick::Skipped(step_id));
        }
        let provider_slug = provider.slug.clone();

        if !self.begin_step(envelope).await? {
            return Ok(WorkerTick::Skipped(step_id));
        }

        let stage_dir = self.layout.provider_staging_dir(run_id, &provider_slug);
        let upstream_result = match &envelope.upstream_result_key {
            Some(key) => self
                .store
                .find_step_result(&run_id, &envelope.provider_task_id, key)
                .await?
                .map(|artifact| artifact.path),
            None => None,
        };
        let ctx = OperationContext {
            task_uid: step_id,
            stage_dir,
            upstream_result,
            config: serde_json::Value::Null,
        };

        let Some(operation) = self.registry.get(envelope.kind) else {
            let failure = FailureRecord::new(
                FailureKind::Configuration,
                format!("no operation registered for {}", envelope.kind),
            );
            self.store
                .record_step_failure(&run_id, &step_id, failure)
                .await?;
            self.store
                .cas_step_state(&run_id, &step_id, StepState::Running, StepState::Failed)
                .await?;
            return Ok(WorkerTick::Executed(step_id));
        };

        let started = Instant::now();
        let result = operation.execute(&ctx).await;
        let duration = started.elapsed().as_secs_f64();

        match result {
            Ok(output) => {
                // Publish the output into the download area before staging
                // is cleaned up; archives read artifacts from there.
                let published =
                    publish_artifact(&self.layout, run_id, &provider_slug, &output.result_path);
                let artifact = match published {
                    Ok(artifact) => artifact,
                    Err(e) => {
                        self.store
                            .record_step_failure(
                                &run_id,
                                &step_id,
                                FailureRecord::new(
                                    FailureKind::Infrastructure,
                                    format!("failed to publish artifact: {e}"),
                                ),
                            )
                            .await?;
                        self.store
                            .cas_step_state(
                                &run_id,
                                &step_id,
                                StepState::Running,
                                StepState::Failed,
                            )
                            .await?;
                        self.metrics
                            .observe_step_duration(envelope.kind.as_label(), "failed", duration);
                        return Ok(WorkerTick::Executed(step_id));
                    }
                };
                self.store
                    .record_step_result(&run_id, &step_id, artifact)
                    .await?;
                let cas = self
                    .store
                    .cas_step_state(&run_id, &step_id, StepState::Running, StepState::Succeeded)
                    .await?;
                if !cas.is_success() {
                    // The kill controller won the race; the result stays
                    // recorded but the step keeps its cancelled state.
                    tracing::info!("step was cancelled while running, success discarded");
                }
                self.metrics
                    .observe_step_duration(envelope.kind.as_label(), "succeeded", duration);
            }
            Err(failure) => {
                self.store
                    .record_step_failure(&run_id, &step_id, failure)
                    .await?;
                let cas = self
                    .store
                    .cas_step_state(&run_id, &step_id, StepState::Running, StepState::Failed)
                    .await?;
                if !cas.is_success() {
                    tracing::info!("step was cancelled while running, failure discarded");
                }
                self.metrics
                    .observe_step_duration(envelope.kind.as_label(), "failed", duration);
            }
        }
        Ok(WorkerTick::Executed(step_id))
    }

    /// Transitions the step to running and records this worker's identity.
    ///
    /// Returns false if the step was resolved concurrently.
    async fn begin_step(&self, envelope: &StepEnvelope) -> Result<bool> {
        let pid = i32::try_from(std::process::id()).unwrap_or(-1);
        let cas = self
            .store
            .cas_step_state(
                &envelope.run_id,
                &envelope.step_id,
                StepState::Pending,
                StepState::Running,
            )
            .await?;
        match cas {
            CasResult::Success => {
                self.store
                    .record_step_start(&envelope.run_id, &envelope.step_id, &self.hostname, pid)
                    .await?;
                self.metrics.record_step_transition("pending", "running");
                Ok(true)
            }
            CasResult::StateMismatch { actual } => {
                tracing::debug!(%actual, "step resolved before execution began");
                Ok(false)
            }
            CasResult::NotFound => Ok(false),
        }
    }

    #[tracing::instrument(
        skip(self, envelope),
        fields(step_id = %envelope.step_id, pid = envelope.pid, host = %self.hostname)
    )]
    async fn handle_interrupt(&self, envelope: InterruptEnvelope) -> Result<WorkerTick> {
        let step_id = envelope.step_id;

        // Verify the target is still live and is the same invocation the
        // interrupt was issued for; a reused pid must never be signaled.
        let record = self.store.get_step(&envelope.run_id, &step_id).await?;
        let live = record.as_ref().is_some_and(|r| {
            r.state == StepState::Running && r.correlation_id == envelope.correlation_id
        });
        if !live {
            self.metrics.record_interrupt("stale");
            tracing::info!("interrupt target no longer live, treating as settled");
            return Ok(WorkerTick::Interrupted(step_id));
        }

        let outcome = self.killer.progressive_kill(envelope.pid).await;
        tracing::info!(?outcome, "progressive kill finished");
        self.metrics.record_interrupt("killed");

        mark_step_cancelled(
            self.store.as_ref(),
            &envelope.run_id,
            &envelope.provider_task_id,
            &step_id,
            &envelope.requested_by,
        )
        .await?;
        Ok(WorkerTick::Interrupted(step_id))
    }
}

/// Copies a step output into the per-run download area and returns its
/// artifact handle.
fn publish_artifact(
    layout: &ExportLayout,
    run_id: RunId,
    provider_slug: &str,
    result_path: &Path,
) -> std::io::Result<Artifact> {
    let download_dir = layout.run_download_dir(run_id).join(provider_slug);
    std::fs::create_dir_all(&download_dir)?;
    let file_name = result_path
        .file_name()
        .map_or_else(|| "output".to_string(), |n| n.to_string_lossy().into_owned());
    let dest = download_dir.join(file_name);
    std::fs::copy(result_path, &dest)?;
    Artifact::from_file(&dest)
}
