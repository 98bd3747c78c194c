//! Cancellation controller.
//!
//! `cancel_provider_task` is best-effort and non-blocking: pending steps
//! flip straight to cancelled, running steps get a high-priority interrupt
//! addressed at the worker executing them, and the call returns. Actual
//! process termination is asynchronous and eventually consistent with the
//! persisted state; the interrupt handler (in the worker) re-verifies
//! liveness before signaling anything.

use std::sync::Arc;

use chrono::Utc;

use datapack_core::{ProviderTaskId, RunId};

use crate::dispatch::{EnqueueOptions, Envelope, InterruptEnvelope, Priority, StepQueue};
use crate::error::{Error, Result};
use crate::metrics::FlowMetrics;
use crate::provider::ProviderTaskState;
use crate::step::{FailureKind, FailureRecord, StepState};
use crate::store::{CasResult, Store};

/// Controller delivering cancellation to provider tasks and runs.
pub struct KillController {
    store: Arc<dyn Store>,
    queue: Arc<dyn StepQueue>,
    metrics: FlowMetrics,
}

impl KillController {
    /// Creates a controller over the given store and queue.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, queue: Arc<dyn StepQueue>) -> Self {
        Self {
            store,
            queue,
            metrics: FlowMetrics::new(),
        }
    }

    /// Cancels one provider task.
    ///
    /// Pending steps are cancelled in place; for each running step the
    /// controller captures `{pid, correlation_id}` and enqueues an
    /// interrupt at a priority greater than any normal dispatch. Cancelling
    /// a provider task whose steps are already terminal is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider task is unknown or storage fails.
    #[tracing::instrument(skip(self), fields(provider_task_id = %provider_task_id, requested_by = requested_by))]
    pub async fn cancel_provider_task(
        &self,
        provider_task_id: ProviderTaskId,
        requested_by: &str,
    ) -> Result<()> {
        let run_id = self
            .store
            .run_for_provider(&provider_task_id)
            .await?
            .ok_or(Error::ProviderTaskNotFound { provider_task_id })?;
        let run = self
            .store
            .get_run(&run_id)
            .await?
            .ok_or(Error::RunNotFound { run_id })?;
        let record = run
            .get_provider_task(&provider_task_id)
            .ok_or(Error::ProviderTaskNotFound { provider_task_id })?;

        if record.is_terminal() && record.all_steps_terminal() {
            tracing::info!("provider task already terminal, cancel is a no-op");
            return Ok(());
        }

        for step in &record.steps {
            match step.state {
                StepState::Pending => {
                    let cas = self
                        .store
                        .cas_step_state(
                            &run_id,
                            &step.id,
                            StepState::Pending,
                            StepState::Cancelled,
                        )
                        .await?;
                    if cas.is_success() {
                        self.store
                            .record_step_failure(
                                &run_id,
                                &step.id,
                                cancellation_record(requested_by),
                            )
                            .await?;
                    }
                }
                StepState::Running => {
                    let Some(pid) = step.pid else {
                        tracing::warn!(step_id = %step.id, "running step has no pid recorded");
                        continue;
                    };
                    let envelope = Envelope::Interrupt(InterruptEnvelope {
                        run_id,
                        provider_task_id,
                        step_id: step.id,
                        correlation_id: step.correlation_id.clone(),
                        pid,
                        requested_by: requested_by.to_string(),
                        enqueued_at: Utc::now(),
                    });
                    let options = EnqueueOptions::new()
                        .with_priority(Priority::Interrupt)
                        .with_routing_key(
                            step.worker.clone().unwrap_or_else(|| "default".to_string()),
                        );
                    self.queue.enqueue(envelope, options).await?;
                    self.metrics.record_interrupt("enqueued");
                    tracing::info!(step_id = %step.id, pid, "interrupt enqueued");
                }
                StepState::Succeeded | StepState::Failed | StepState::Cancelled => {}
            }
        }

        // The provider record reflects the request immediately; running
        // steps settle asynchronously when their interrupts land.
        if !record.is_terminal() {
            self.store
                .set_provider_state(&run_id, &provider_task_id, ProviderTaskState::Cancelled)
                .await?;
        }

        Ok(())
    }

    /// Cancels every provider task of a run (soft-delete path).
    ///
    /// # Errors
    ///
    /// Returns an error if the run is unknown or storage fails.
    #[tracing::instrument(skip(self), fields(run_id = %run_id, requested_by = requested_by))]
    pub async fn cancel_run(&self, run_id: RunId, requested_by: &str) -> Result<()> {
        let run = self
            .store
            .get_run(&run_id)
            .await?
            .ok_or(Error::RunNotFound { run_id })?;

        for record in &run.provider_tasks {
            self.cancel_provider_task(record.id, requested_by).await?;
        }
        Ok(())
    }
}

/// Failure record attached to steps cancelled on request.
fn cancellation_record(requested_by: &str) -> FailureRecord {
    FailureRecord::new(
        FailureKind::Cancelled,
        format!("cancelled by {requested_by}"),
    )
}

/// Applies the terminal bookkeeping after an interrupt actually lands.
///
/// Used by the worker's interrupt handler: CAS the step out of `Running`,
/// attach the cancellation record and cancel the owning provider record.
/// Every race (step already terminal, record gone) is a logged no-op.
///
/// # Errors
///
/// Returns an error only on storage failure, never on a race.
pub async fn mark_step_cancelled(
    store: &dyn Store,
    run_id: &RunId,
    provider_task_id: &ProviderTaskId,
    step_id: &datapack_core::StepId,
    requested_by: &str,
) -> Result<bool> {
    let cas = store
        .cas_step_state(run_id, step_id, StepState::Running, StepState::Cancelled)
        .await?;
    match cas {
        CasResult::Success => {
            store
                .record_step_failure(run_id, step_id, cancellation_record(requested_by))
                .await?;
            // Forward-only: ignore the error if the record already settled.
            if let Err(e) = store
                .set_provider_state(run_id, provider_task_id, ProviderTaskState::Cancelled)
                .await
            {
                tracing::debug!(error = %e, "provider record already terminal");
            }
            Ok(true)
        }
        CasResult::StateMismatch { actual } => {
            tracing::info!(%step_id, %actual, "step settled before interrupt landed");
            Ok(false)
        }
        CasResult::NotFound => {
            tracing::info!(%step_id, "step vanished before interrupt landed");
            Ok(false)
        }
    }
}
