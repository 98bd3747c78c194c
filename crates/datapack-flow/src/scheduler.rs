//! Plan-driven execution scheduling.
//!
//! The scheduler walks a [`Plan`] against the persisted state: it
//! dispatches steps whose chain predecessors have succeeded, aborts the
//! remainder of a chain when a step fails or is cancelled (downstream steps
//! are never dispatched), and gates the run-level finalize step on every
//! provider chain being terminal. There is no global lock on the plan; any
//! number of workers drain the queue in parallel, and the queue's
//! idempotency keys plus the store's CAS transitions make repeated ticks
//! safe.

use chrono::Utc;

use datapack_core::ProviderTaskId;

use crate::chain::StepSpec;
use crate::dispatch::{EnqueueOptions, Envelope, StepEnvelope, StepQueue};
use crate::error::{Error, Result};
use crate::finalize::finalize_provider;
use crate::metrics::FlowMetrics;
use crate::plan::Plan;
use crate::run::{Run, RunState};
use crate::step::{StepRecord, StepState};
use crate::store::Store;

/// Summary of one scheduler tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerTick {
    /// Steps dispatched this tick.
    pub dispatched: usize,
    /// Downstream steps cancelled because an upstream failed or was
    /// cancelled.
    pub cancelled: usize,
    /// Whether the run finalize step was dispatched.
    pub finalize_dispatched: bool,
    /// Whether the run finalize step has reached a terminal state.
    pub complete: bool,
}

/// Scheduler for one plan.
#[derive(Debug)]
pub struct Scheduler {
    plan: Plan,
    metrics: FlowMetrics,
}

impl Scheduler {
    /// Creates a scheduler for the given plan.
    #[must_use]
    pub fn new(plan: Plan) -> Self {
        Self {
            plan,
            metrics: FlowMetrics::new(),
        }
    }

    /// Returns the plan being scheduled.
    #[must_use]
    pub const fn plan(&self) -> &Plan {
        &self.plan
    }

    /// Advances the run: dispatches ready steps, aborts broken chains,
    /// finalizes providers whose chains settled and dispatches the run
    /// finalize step once everything else is terminal.
    ///
    /// Safe to call repeatedly; duplicate dispatches are deduplicated by
    /// the queue and resolved steps are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the run is unknown or storage/dispatch fails.
    #[tracing::instrument(skip_all, fields(run_id = %self.plan.run_id))]
    pub async fn tick(&self, store: &dyn Store, queue: &dyn StepQueue) -> Result<SchedulerTick> {
        let run_id = self.plan.run_id;
        let run = store
            .get_run(&run_id)
            .await?
            .ok_or(Error::RunNotFound { run_id })?;

        let mut tick = SchedulerTick::default();

        for chain in &self.plan.chains {
            self.advance_chain(store, queue, &run, chain.provider_task_id, &chain.steps, &mut tick)
                .await?;
        }

        // The finalize step is gated on every provider chain being
        // terminal; until then it is simply not dispatched and the next
        // tick re-checks (poll, not a held worker slot).
        let run = store
            .get_run(&run_id)
            .await?
            .ok_or(Error::RunNotFound { run_id })?;
        let finalize_record = run
            .get_provider_task(&self.plan.finalize.provider_task_id)
            .and_then(|p| p.get_step(&self.plan.finalize.step_id))
            .cloned();

        if let Some(record) = finalize_record {
            if record.is_terminal() {
                tick.complete = true;
            } else if run.all_providers_terminal() && record.state == StepState::Pending {
                self.dispatch_step(store, queue, &run, &self.plan.finalize, &record)
                    .await?;
                tick.finalize_dispatched = true;
            }
        }

        Ok(tick)
    }

    /// Resets a provider's failed and cancelled steps for an explicit
    /// retry; the next tick re-dispatches them with the incremented
    /// attempt.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider task is unknown or storage fails.
    pub async fn retry_provider(
        &self,
        store: &dyn Store,
        provider_task_id: &ProviderTaskId,
    ) -> Result<()> {
        store
            .reset_provider_for_retry(&self.plan.run_id, provider_task_id)
            .await
    }

    async fn advance_chain(
        &self,
        store: &dyn Store,
        queue: &dyn StepQueue,
        run: &Run,
        provider_task_id: ProviderTaskId,
        steps: &[StepSpec],
        tick: &mut SchedulerTick,
    ) -> Result<()> {
        let Some(record) = run.get_provider_task(&provider_task_id) else {
            return Err(Error::ProviderTaskNotFound { provider_task_id });
        };

        for (idx, spec) in steps.iter().enumerate() {
            let Some(step) = record.get_step(&spec.step_id) else {
                return Err(Error::StepNotFound {
                    step_id: spec.step_id,
                });
            };

            match step.state {
                StepState::Succeeded => continue,
                StepState::Failed | StepState::Cancelled if spec.skippable => continue,
                StepState::Failed | StepState::Cancelled => {
                    // Broken chain: downstream steps are never dispatched.
                    let remaining = &steps[idx + 1..];
                    tick.cancelled += self
                        .abort_downstream(store, run, provider_task_id, remaining)
                        .await?;
                    finalize_provider(store, &run.id, &provider_task_id).await?;
                    return Ok(());
                }
                StepState::Running => return Ok(()),
                StepState::Pending => {
                    self.dispatch_step(store, queue, run, spec, step).await?;
                    tick.dispatched += 1;
                    return Ok(());
                }
            }
        }

        // Whole chain settled; make sure the aggregate is recorded even if
        // the finalize step itself was cancelled.
        finalize_provider(store, &run.id, &provider_task_id).await?;
        Ok(())
    }

    async fn abort_downstream(
        &self,
        store: &dyn Store,
        run: &Run,
        provider_task_id: ProviderTaskId,
        remaining: &[StepSpec],
    ) -> Result<usize> {
        let mut cancelled = 0;
        for spec in remaining {
            let cas = store
                .cas_step_state(
                    &run.id,
                    &spec.step_id,
                    StepState::Pending,
                    StepState::Cancelled,
                )
                .await?;
            if cas.is_success() {
                cancelled += 1;
                self.metrics
                    .record_step_transition("pending", "cancelled");
                tracing::info!(
                    step_id = %spec.step_id,
                    provider_task_id = %provider_task_id,
                    "downstream step aborted"
                );
            }
        }
        Ok(cancelled)
    }

    async fn dispatch_step(
        &self,
        store: &dyn Store,
        queue: &dyn StepQueue,
        run: &Run,
        spec: &StepSpec,
        record: &StepRecord,
    ) -> Result<()> {
        let envelope = Envelope::Step(StepEnvelope {
            run_id: run.id,
            provider_task_id: spec.provider_task_id,
            step_id: spec.step_id,
            kind: spec.kind,
            attempt: record.attempt,
            correlation_id: record.correlation_id.clone(),
            upstream_result_key: spec.upstream_result_key.clone(),
            enqueued_at: Utc::now(),
        });

        let mut options = EnqueueOptions::new();
        if let Some(hint) = &self.plan.worker_hint {
            options = options.with_routing_key(hint.clone());
        }

        let result = queue.enqueue(envelope, options).await?;
        if result.is_enqueued() {
            self.metrics.record_dispatch("enqueued");
            tracing::debug!(step_id = %spec.step_id, kind = %spec.kind, "step dispatched");
        } else {
            self.metrics.record_dispatch("deduplicated");
        }

        if run.state == RunState::Submitted {
            store.set_run_state(&run.id, RunState::Running).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ExportFormat, ProviderKind, WorkUnitCatalog};
    use crate::dispatch::memory::InMemoryStepQueue;
    use crate::job::{BoundingBox, Job, ProviderExport};
    use crate::plan::PipelineFactory;
    use crate::store::memory::InMemoryStore;
    use datapack_core::JobId;

    fn two_provider_job() -> Job {
        Job {
            id: JobId::generate(),
            name: "Flood Extent".into(),
            owner: "gis-user".into(),
            event: None,
            extent: BoundingBox::new(5.0, 5.0, 10.0, 10.0).unwrap(),
            projections: vec![],
            provider_exports: vec![
                ProviderExport::new(
                    ProviderKind::Osm,
                    "osm",
                    "OpenStreetMap",
                    vec![ExportFormat::Gpkg],
                ),
                ProviderExport::new(
                    ProviderKind::Wfs,
                    "wfs-hydro",
                    "Hydrography",
                    vec![ExportFormat::Shp],
                ),
            ],
        }
    }

    async fn scheduled(
    ) -> (InMemoryStore, InMemoryStepQueue, Scheduler, datapack_core::RunId) {
        let store = InMemoryStore::new();
        let queue = InMemoryStepQueue::new("datapack.default");
        let job = two_provider_job();
        let factory = PipelineFactory::new(WorkUnitCatalog::new(), 14);
        let run_id = factory
            .create_run(&store, &job, &crate::job::LicenseGrants::new(), "gis-user", None)
            .await
            .unwrap();
        let plan = factory.build_plan(&store, &job, run_id, None).await.unwrap();
        (store, queue, Scheduler::new(plan), run_id)
    }

    #[tokio::test]
    async fn first_tick_dispatches_one_step_per_chain() {
        let (store, queue, scheduler, run_id) = scheduled().await;

        let tick = scheduler.tick(&store, &queue).await.unwrap();
        assert_eq!(tick.dispatched, 2);
        assert!(!tick.finalize_dispatched);
        assert_eq!(queue.queue_depth().await.unwrap(), 2);

        // The run leaves Submitted on first dispatch.
        let run = store.get_run(&run_id).await.unwrap().unwrap();
        assert_eq!(run.state, RunState::Running);
    }

    #[tokio::test]
    async fn repeated_ticks_do_not_double_dispatch() {
        let (store, queue, scheduler, _run_id) = scheduled().await;

        scheduler.tick(&store, &queue).await.unwrap();
        scheduler.tick(&store, &queue).await.unwrap();

        // Same pending steps, same idempotency keys: deduplicated.
        assert_eq!(queue.queue_depth().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn failed_step_aborts_downstream_and_settles_provider() {
        let (store, queue, scheduler, run_id) = scheduled().await;
        scheduler.tick(&store, &queue).await.unwrap();

        // Settle the selection step, then fail the acquisition step of the
        // osm chain.
        let chain = scheduler
            .plan()
            .chains
            .iter()
            .find(|c| c.provider_slug == "osm")
            .unwrap();
        let selection = chain.steps[0].step_id;
        for (step, outcome) in [
            (selection, StepState::Succeeded),
            (chain.steps[1].step_id, StepState::Failed),
        ] {
            store
                .cas_step_state(&run_id, &step, StepState::Pending, StepState::Running)
                .await
                .unwrap();
            store
                .cas_step_state(&run_id, &step, StepState::Running, outcome)
                .await
                .unwrap();
        }

        let tick = scheduler.tick(&store, &queue).await.unwrap();
        assert!(tick.cancelled >= 1);

        let run = store.get_run(&run_id).await.unwrap().unwrap();
        let record = run.get_provider_task(&chain.provider_task_id).unwrap();
        assert_eq!(
            record.state,
            crate::provider::ProviderTaskState::Incomplete
        );
        // Every step after the failed one is cancelled, none dispatched.
        for spec in &chain.steps[2..] {
            let step = record.get_step(&spec.step_id).unwrap();
            assert_eq!(step.state, StepState::Cancelled);
        }
    }

    #[tokio::test]
    async fn finalize_waits_for_all_chains() {
        let (store, queue, scheduler, run_id) = scheduled().await;
        scheduler.tick(&store, &queue).await.unwrap();

        // Settle only the osm chain.
        let chain = scheduler
            .plan()
            .chains
            .iter()
            .find(|c| c.provider_slug == "osm")
            .unwrap()
            .clone();
        for spec in &chain.steps {
            store
                .cas_step_state(&run_id, &spec.step_id, StepState::Pending, StepState::Running)
                .await
                .unwrap();
            store
                .cas_step_state(&run_id, &spec.step_id, StepState::Running, StepState::Succeeded)
                .await
                .unwrap();
        }

        let tick = scheduler.tick(&store, &queue).await.unwrap();
        assert!(
            !tick.finalize_dispatched,
            "finalize must wait for the wfs chain"
        );
    }
}
