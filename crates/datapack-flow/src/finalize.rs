//! Provider and run finalization.
//!
//! Provider finalization aggregates a chain's step records into the
//! provider's final status. Run finalization waits (by polling, never by
//! holding a worker open) until every provider chain is terminal, builds
//! the default DataPack archive, settles the run status from persisted
//! records and notifies the requester. It is idempotent: re-invoking it
//! after a partial completion recomputes everything from the store.

use std::sync::Arc;

use datapack_core::{ExportLayout, ProviderTaskId, RunId};

use crate::archive::{request_archive, ArchiveState, Archiver};
use crate::error::{Error, Result};
use crate::metrics::FlowMetrics;
use crate::notify::{Notification, NotificationLevel, NotificationVerb, Notifier};
use crate::provider::ProviderTaskState;
use crate::run::RunState;
use crate::store::Store;

/// Outcome of a run finalization attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// Sibling provider chains are still in flight; try again later.
    Waiting,
    /// The run settled into this terminal state.
    Finalized(RunState),
}

/// Aggregates one provider's step records into its final status.
///
/// Idempotent: an already-terminal record is left untouched and its state
/// returned.
///
/// # Errors
///
/// Returns an error if the run or record is unknown or storage fails.
#[tracing::instrument(skip(store), fields(run_id = %run_id, provider_task_id = %provider_task_id))]
pub async fn finalize_provider(
    store: &dyn Store,
    run_id: &RunId,
    provider_task_id: &ProviderTaskId,
) -> Result<ProviderTaskState> {
    let run = store
        .get_run(run_id)
        .await?
        .ok_or(Error::RunNotFound { run_id: *run_id })?;
    let record = run
        .get_provider_task(provider_task_id)
        .ok_or(Error::ProviderTaskNotFound {
            provider_task_id: *provider_task_id,
        })?;

    if record.is_terminal() {
        return Ok(record.state);
    }

    let aggregate = record.aggregate_state();
    if aggregate.is_terminal() {
        store
            .set_provider_state(run_id, provider_task_id, aggregate)
            .await?;
        tracing::info!(state = %aggregate, "provider finalized");
    }
    Ok(aggregate)
}

/// Finalizes whole runs.
pub struct RunFinalizer {
    layout: ExportLayout,
    archiver: Archiver,
    notifier: Arc<dyn Notifier>,
    metrics: FlowMetrics,
    /// Keep the staging directory after finalization (debugging aid).
    keep_stage: bool,
}

impl RunFinalizer {
    /// Creates a finalizer over the given layout and notifier.
    #[must_use]
    pub fn new(layout: ExportLayout, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            archiver: Archiver::new(layout.clone()),
            layout,
            notifier,
            metrics: FlowMetrics::new(),
            keep_stage: false,
        }
    }

    /// Keeps staging directories after finalization.
    #[must_use]
    pub const fn with_keep_stage(mut self, keep: bool) -> Self {
        self.keep_stage = keep;
        self
    }

    /// Attempts to finalize a run.
    ///
    /// Returns [`FinalizeOutcome::Waiting`] while any provider chain is
    /// still in flight. Once all are terminal: builds the default archive
    /// over every displayed provider, recomputes the run status from the
    /// persisted records, stamps `finished_at` (exactly once), notifies the
    /// requester and cleans the staging directory (cleanup failure is
    /// logged, not fatal).
    ///
    /// # Errors
    ///
    /// Returns an error if the run is unknown or storage fails. Archive
    /// corruption does not error out of finalization; it degrades the run
    /// to `Incomplete` and alerts the operators.
    #[tracing::instrument(skip(self, store), fields(run_id = %run_id))]
    pub async fn finalize_run(&self, store: &dyn Store, run_id: &RunId) -> Result<FinalizeOutcome> {
        let run = store
            .get_run(run_id)
            .await?
            .ok_or(Error::RunNotFound { run_id: *run_id })?;

        if !run.all_providers_terminal() {
            tracing::debug!("run is waiting for provider chains to finish");
            return Ok(FinalizeOutcome::Waiting);
        }

        let archive_ok = self.build_default_archive(store, run_id).await?;

        // Recompute from the store rather than trusting in-memory state;
        // supports crash recovery and repeated invocations.
        let run = store
            .get_run(run_id)
            .await?
            .ok_or(Error::RunNotFound { run_id: *run_id })?;
        let mut final_state = run.compute_final_state();
        if !archive_ok && final_state == RunState::Completed {
            final_state = RunState::Incomplete;
        }

        store.set_run_state(run_id, final_state).await?;

        let (verb, level, message) = match final_state {
            RunState::Completed => (
                NotificationVerb::RunCompleted,
                NotificationLevel::Success,
                "Your DataPack is ready.",
            ),
            RunState::Cancelled => (
                NotificationVerb::RunCancelled,
                NotificationLevel::Warning,
                "Your DataPack was cancelled.",
            ),
            _ => (
                NotificationVerb::RunFailed,
                NotificationLevel::Warning,
                "Your DataPack finished with errors.",
            ),
        };
        self.notifier.notify(Notification::new(
            run.requested_by.clone(),
            *run_id,
            verb,
            level,
            message,
        ));

        self.cleanup_staging(*run_id);
        tracing::info!(state = %final_state, "run finalized");
        Ok(FinalizeOutcome::Finalized(final_state))
    }

    /// Builds the default archive over all displayed providers.
    ///
    /// Returns false when the archive failed (corruption or assembly
    /// error). Re-finalization after a crash finds the coverage already
    /// archived and treats the recorded state as the outcome.
    async fn build_default_archive(&self, store: &dyn Store, run_id: &RunId) -> Result<bool> {
        let run = store
            .get_run(run_id)
            .await?
            .ok_or(Error::RunNotFound { run_id: *run_id })?;

        let coverage: Vec<ProviderTaskId> = run
            .data_provider_tasks()
            .filter(|p| p.display)
            .map(|p| p.id)
            .collect();

        let record = request_archive(&run, &coverage)?;
        let archive_id = match store.create_archive(record).await {
            Ok(id) => id,
            Err(Error::DuplicateArchive { .. }) => {
                // Already built by a previous finalization attempt.
                let existing = store
                    .archives_for_run(run_id)
                    .await?
                    .into_iter()
                    .find(|a| {
                        a.coverage.len() == coverage.len()
                            && coverage.iter().all(|id| a.coverage.contains(id))
                    });
                return Ok(existing.is_some_and(|a| a.state == ArchiveState::Success));
            }
            Err(e) => return Err(e),
        };

        match self
            .archiver
            .build(store, self.notifier.as_ref(), &run, archive_id)
            .await
        {
            Ok(_) => {
                self.metrics.record_archive("success");
                Ok(true)
            }
            Err(e) => {
                self.metrics.record_archive("failed");
                tracing::error!(error = %e, "default archive failed");
                Ok(false)
            }
        }
    }

    fn cleanup_staging(&self, run_id: RunId) {
        if self.keep_stage {
            return;
        }
        let stage_dir = self.layout.run_staging_dir(run_id);
        if stage_dir.is_dir() {
            if let Err(e) = std::fs::remove_dir_all(&stage_dir) {
                tracing::error!(
                    path = %stage_dir.display(),
                    error = %e,
                    "failed to remove staging directory"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ProviderKind, StepKind};
    use crate::notify::InMemoryNotifier;
    use crate::provider::ProviderTaskRecord;
    use crate::run::Run;
    use crate::step::{FailureKind, FailureRecord, StepRecord, StepState};
    use crate::store::memory::InMemoryStore;
    use datapack_core::{ArtifactId, JobId};

    fn layout(dir: &tempfile::TempDir) -> ExportLayout {
        ExportLayout::new(dir.path().join("stage"), dir.path().join("download"))
    }

    async fn run_with_one_provider(store: &InMemoryStore) -> (RunId, ProviderTaskId) {
        let mut run = Run::new(JobId::generate(), "Flood Extent", "gis-user", 14);
        run.provider_tasks.push(ProviderTaskRecord::run_record());
        let mut provider = ProviderTaskRecord::new(ProviderKind::Osm, "osm", "OpenStreetMap");
        provider.steps.push(StepRecord::new(StepKind::OsmCollection));
        provider.steps.push(StepRecord::new(StepKind::FinalizeProvider));
        let provider_id = provider.id;
        run.provider_tasks.push(provider);
        let run_id = run.id;
        store.save_run(&run).await.unwrap();
        (run_id, provider_id)
    }

    #[tokio::test]
    async fn finalize_provider_aggregates_success() {
        let store = InMemoryStore::new();
        let (run_id, provider_id) = run_with_one_provider(&store).await;

        store
            .cas_step_state(
                &run_id,
                &first_work_step(&store, &run_id, &provider_id).await,
                StepState::Pending,
                StepState::Running,
            )
            .await
            .unwrap();
        let step_id = first_work_step(&store, &run_id, &provider_id).await;
        let mut run = store.get_run(&run_id).await.unwrap().unwrap();
        run.get_provider_task_mut(&provider_id)
            .unwrap()
            .get_step_mut(&step_id)
            .unwrap()
            .succeed(ArtifactId::generate())
            .unwrap();
        store.save_run(&run).await.unwrap();

        let state = finalize_provider(&store, &run_id, &provider_id)
            .await
            .unwrap();
        assert_eq!(state, ProviderTaskState::Completed);

        // Idempotent: a second call returns the settled state.
        let state = finalize_provider(&store, &run_id, &provider_id)
            .await
            .unwrap();
        assert_eq!(state, ProviderTaskState::Completed);
    }

    async fn first_work_step(
        store: &InMemoryStore,
        run_id: &RunId,
        provider_id: &ProviderTaskId,
    ) -> datapack_core::StepId {
        store
            .get_run(run_id)
            .await
            .unwrap()
            .unwrap()
            .get_provider_task(provider_id)
            .unwrap()
            .steps[0]
            .id
    }

    #[tokio::test]
    async fn finalize_run_waits_for_providers() {
        let dir = tempfile::tempdir().unwrap();
        let store = InMemoryStore::new();
        let notifier = Arc::new(InMemoryNotifier::new());
        let (run_id, _) = run_with_one_provider(&store).await;

        let finalizer = RunFinalizer::new(layout(&dir), notifier.clone());
        let outcome = finalizer.finalize_run(&store, &run_id).await.unwrap();
        assert_eq!(outcome, FinalizeOutcome::Waiting);
        assert!(notifier.notifications().is_empty());
    }

    #[tokio::test]
    async fn finalize_run_settles_incomplete_and_notifies() {
        let dir = tempfile::tempdir().unwrap();
        let store = InMemoryStore::new();
        let notifier = Arc::new(InMemoryNotifier::new());
        let (run_id, provider_id) = run_with_one_provider(&store).await;

        // Provider failed; run had started.
        store.set_run_state(&run_id, RunState::Running).await.unwrap();
        let mut run = store.get_run(&run_id).await.unwrap().unwrap();
        {
            let record = run.get_provider_task_mut(&provider_id).unwrap();
            record.steps[0].transition_to(StepState::Running).unwrap();
            record.steps[0]
                .fail(FailureRecord::new(FailureKind::Operation, "boom"))
                .unwrap();
            record.steps[1].cancel().unwrap();
            record.set_state(ProviderTaskState::Incomplete).unwrap();
        }
        store.save_run(&run).await.unwrap();

        let finalizer = RunFinalizer::new(layout(&dir), notifier.clone());
        let outcome = finalizer.finalize_run(&store, &run_id).await.unwrap();
        assert_eq!(outcome, FinalizeOutcome::Finalized(RunState::Incomplete));

        let run = store.get_run(&run_id).await.unwrap().unwrap();
        assert_eq!(run.state, RunState::Incomplete);
        assert!(run.finished_at.is_some());

        let notifications = notifier.notifications();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].verb, NotificationVerb::RunFailed);
    }

    #[tokio::test]
    async fn finalize_run_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = InMemoryStore::new();
        let notifier = Arc::new(InMemoryNotifier::new());
        let (run_id, provider_id) = run_with_one_provider(&store).await;

        store.set_run_state(&run_id, RunState::Running).await.unwrap();
        let mut run = store.get_run(&run_id).await.unwrap().unwrap();
        {
            let record = run.get_provider_task_mut(&provider_id).unwrap();
            record.steps[0].transition_to(StepState::Running).unwrap();
            record.steps[0].succeed(ArtifactId::generate()).unwrap();
            record.steps[1].transition_to(StepState::Running).unwrap();
            record.steps[1].succeed(ArtifactId::generate()).unwrap();
            record.set_state(ProviderTaskState::Completed).unwrap();
        }
        store.save_run(&run).await.unwrap();

        let finalizer = RunFinalizer::new(layout(&dir), notifier.clone());
        let first = finalizer.finalize_run(&store, &run_id).await.unwrap();
        let finished_at = store
            .get_run(&run_id)
            .await
            .unwrap()
            .unwrap()
            .finished_at;

        // Crash-recovery path: invoking again recomputes from the store,
        // reuses the existing archive and leaves the stamp untouched.
        let second = finalizer.finalize_run(&store, &run_id).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(
            store.get_run(&run_id).await.unwrap().unwrap().finished_at,
            finished_at
        );
        assert_eq!(store.archives_for_run(&run_id).await.unwrap().len(), 1);
    }
}
