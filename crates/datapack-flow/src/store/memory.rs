//! In-memory store implementation.
//!
//! Thread-safe, single-process. Suitable for tests and development; state
//! is lost when the process exits.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;

use datapack_core::{ArchiveId, ArtifactId, ProviderTaskId, RunId, StepId};

use super::{CasResult, Store};
use crate::archive::{ArchiveRecord, ArchiveState};
use crate::artifact::Artifact;
use crate::error::{Error, Result};
use crate::provider::ProviderTaskState;
use crate::run::{Run, RunState};
use crate::step::{FailureRecord, StepRecord, StepState};

#[derive(Debug, Default)]
struct Inner {
    runs: HashMap<RunId, Run>,
    artifacts: HashMap<ArtifactId, Artifact>,
    archives: HashMap<ArchiveId, ArchiveRecord>,
    /// `(run, coverage key)` → archive, enforcing coverage uniqueness.
    coverage_index: HashMap<(RunId, String), ArchiveId>,
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("store lock poisoned")
}

fn find_step_mut<'a>(run: &'a mut Run, step_id: &StepId) -> Option<&'a mut StepRecord> {
    run.provider_tasks
        .iter_mut()
        .find_map(|p| p.get_step_mut(step_id))
}

/// In-memory [`Store`].
#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of runs currently stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn run_count(&self) -> Result<usize> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner.runs.len())
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get_run(&self, run_id: &RunId) -> Result<Option<Run>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner.runs.get(run_id).cloned())
    }

    async fn save_run(&self, run: &Run) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        inner.runs.insert(run.id, run.clone());
        drop(inner);
        Ok(())
    }

    async fn delete_run(&self, run_id: &RunId) -> Result<bool> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let removed = inner.runs.remove(run_id).is_some();
        drop(inner);
        Ok(removed)
    }

    async fn list_runs(&self) -> Result<Vec<Run>> {
        let inner = self.inner.read().map_err(poison_err)?;
        let mut runs: Vec<Run> = inner.runs.values().cloned().collect();
        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }

    async fn set_run_state(&self, run_id: &RunId, target: RunState) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let run = inner
            .runs
            .get_mut(run_id)
            .ok_or(Error::RunNotFound { run_id: *run_id })?;
        let result = run.transition_to(target);
        drop(inner);
        result
    }

    async fn run_for_provider(&self, provider_task_id: &ProviderTaskId) -> Result<Option<RunId>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner
            .runs
            .values()
            .find(|run| run.get_provider_task(provider_task_id).is_some())
            .map(|run| run.id))
    }

    async fn cas_step_state(
        &self,
        run_id: &RunId,
        step_id: &StepId,
        expected: StepState,
        target: StepState,
    ) -> Result<CasResult> {
        let mut inner = self.inner.write().map_err(poison_err)?;

        let Some(run) = inner.runs.get_mut(run_id) else {
            return Ok(CasResult::NotFound);
        };
        let Some(step) = find_step_mut(run, step_id) else {
            return Ok(CasResult::NotFound);
        };

        if step.state != expected {
            let actual = step.state;
            return Ok(CasResult::StateMismatch { actual });
        }

        let result = step.transition_to(target);
        drop(inner);
        result.map(|()| CasResult::Success)
    }

    async fn record_step_start(
        &self,
        run_id: &RunId,
        step_id: &StepId,
        worker: &str,
        pid: i32,
    ) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let run = inner
            .runs
            .get_mut(run_id)
            .ok_or(Error::RunNotFound { run_id: *run_id })?;
        let step = find_step_mut(run, step_id).ok_or(Error::StepNotFound { step_id: *step_id })?;
        step.worker = Some(worker.to_string());
        step.pid = Some(pid);
        drop(inner);
        Ok(())
    }

    async fn record_step_result(
        &self,
        run_id: &RunId,
        step_id: &StepId,
        artifact: Artifact,
    ) -> Result<ArtifactId> {
        let artifact_id = artifact.id;
        let mut inner = self.inner.write().map_err(poison_err)?;
        {
            let run = inner
                .runs
                .get_mut(run_id)
                .ok_or(Error::RunNotFound { run_id: *run_id })?;
            let step =
                find_step_mut(run, step_id).ok_or(Error::StepNotFound { step_id: *step_id })?;
            step.result = Some(artifact_id);
        }
        inner.artifacts.insert(artifact_id, artifact);
        drop(inner);
        Ok(artifact_id)
    }

    async fn record_step_failure(
        &self,
        run_id: &RunId,
        step_id: &StepId,
        failure: FailureRecord,
    ) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let run = inner
            .runs
            .get_mut(run_id)
            .ok_or(Error::RunNotFound { run_id: *run_id })?;
        let step = find_step_mut(run, step_id).ok_or(Error::StepNotFound { step_id: *step_id })?;
        step.failures.push(failure);
        drop(inner);
        Ok(())
    }

    async fn get_step(&self, run_id: &RunId, step_id: &StepId) -> Result<Option<StepRecord>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner.runs.get(run_id).and_then(|run| {
            run.provider_tasks
                .iter()
                .find_map(|p| p.get_step(step_id))
                .cloned()
        }))
    }

    async fn find_step_result(
        &self,
        run_id: &RunId,
        provider_task_id: &ProviderTaskId,
        result_key: &str,
    ) -> Result<Option<Artifact>> {
        let inner = self.inner.read().map_err(poison_err)?;
        let artifact = inner
            .runs
            .get(run_id)
            .and_then(|run| run.get_provider_task(provider_task_id))
            .and_then(|provider| {
                provider.steps.iter().find(|s| {
                    s.state == StepState::Succeeded
                        && s.kind.result_key() == result_key
                        && s.result.is_some()
                })
            })
            .and_then(|step| step.result)
            .and_then(|artifact_id| inner.artifacts.get(&artifact_id).cloned());
        Ok(artifact)
    }

    async fn set_provider_state(
        &self,
        run_id: &RunId,
        provider_task_id: &ProviderTaskId,
        target: ProviderTaskState,
    ) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let run = inner
            .runs
            .get_mut(run_id)
            .ok_or(Error::RunNotFound { run_id: *run_id })?;
        let provider =
            run.get_provider_task_mut(provider_task_id)
                .ok_or(Error::ProviderTaskNotFound {
                    provider_task_id: *provider_task_id,
                })?;
        let result = provider.set_state(target);
        drop(inner);
        result
    }

    async fn reset_provider_for_retry(
        &self,
        run_id: &RunId,
        provider_task_id: &ProviderTaskId,
    ) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let run = inner
            .runs
            .get_mut(run_id)
            .ok_or(Error::RunNotFound { run_id: *run_id })?;
        let provider =
            run.get_provider_task_mut(provider_task_id)
                .ok_or(Error::ProviderTaskNotFound {
                    provider_task_id: *provider_task_id,
                })?;

        for step in &mut provider.steps {
            if matches!(step.state, StepState::Failed | StepState::Cancelled) {
                *step = step.for_retry();
            }
        }
        provider.state = ProviderTaskState::Pending;
        provider.finished_at = None;
        run.reopen_for_retry();
        drop(inner);
        Ok(())
    }

    async fn get_artifact(&self, artifact_id: &ArtifactId) -> Result<Option<Artifact>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner.artifacts.get(artifact_id).cloned())
    }

    async fn sweep_artifacts(&self) -> Result<usize> {
        let mut inner = self.inner.write().map_err(poison_err)?;

        let referenced: HashSet<ArtifactId> = inner
            .runs
            .values()
            .filter(|run| !run.deleted)
            .flat_map(|run| {
                run.provider_tasks
                    .iter()
                    .flat_map(|p| p.steps.iter().filter_map(|s| s.result))
            })
            .collect();

        let mut swept = 0;
        for artifact in inner.artifacts.values_mut() {
            if !artifact.deleted && !referenced.contains(&artifact.id) {
                artifact.deleted = true;
                swept += 1;
            }
        }
        drop(inner);
        Ok(swept)
    }

    async fn create_archive(&self, record: ArchiveRecord) -> Result<ArchiveId> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let coverage_key = (record.run_id, record.coverage_key());

        if inner.coverage_index.contains_key(&coverage_key) {
            return Err(Error::DuplicateArchive {
                run_id: record.run_id,
                coverage: coverage_key.1,
            });
        }

        let archive_id = record.id;
        inner.coverage_index.insert(coverage_key, archive_id);
        inner.archives.insert(archive_id, record);
        drop(inner);
        Ok(archive_id)
    }

    async fn get_archive(&self, archive_id: &ArchiveId) -> Result<Option<ArchiveRecord>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner.archives.get(archive_id).cloned())
    }

    async fn archives_for_run(&self, run_id: &RunId) -> Result<Vec<ArchiveRecord>> {
        let inner = self.inner.read().map_err(poison_err)?;
        let mut archives: Vec<ArchiveRecord> = inner
            .archives
            .values()
            .filter(|a| &a.run_id == run_id)
            .cloned()
            .collect();
        archives.sort_by_key(|a| a.created_at);
        Ok(archives)
    }

    async fn update_archive(
        &self,
        archive_id: &ArchiveId,
        state: ArchiveState,
        file_path: Option<PathBuf>,
        size_bytes: Option<u64>,
        message: Option<String>,
    ) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let archive = inner
            .archives
            .get_mut(archive_id)
            .ok_or_else(|| Error::storage(format!("archive {archive_id} not found")))?;
        archive.state = state;
        if file_path.is_some() {
            archive.file_path = file_path;
        }
        if size_bytes.is_some() {
            archive.size_bytes = size_bytes;
        }
        if message.is_some() {
            archive.message = message;
        }
        if !matches!(state, ArchiveState::Pending) && archive.finished_at.is_none() {
            archive.finished_at = Some(Utc::now());
        }
        drop(inner);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ProviderKind, StepKind};
    use crate::provider::ProviderTaskRecord;
    use datapack_core::JobId;

    fn seeded_run() -> Run {
        let mut run = Run::new(JobId::generate(), "Flood Extent", "gis-user", 14);
        run.provider_tasks.push(ProviderTaskRecord::run_record());
        let mut provider = ProviderTaskRecord::new(ProviderKind::Osm, "osm", "OpenStreetMap");
        provider.steps.push(StepRecord::new(StepKind::OsmCollection));
        provider.steps.push(StepRecord::new(StepKind::ConvertShp));
        run.provider_tasks.push(provider);
        run
    }

    fn first_step(run: &Run) -> StepId {
        run.data_provider_tasks().next().unwrap().steps[0].id
    }

    #[tokio::test]
    async fn save_and_get_run() {
        let store = InMemoryStore::new();
        let run = seeded_run();
        let run_id = run.id;

        assert!(store.get_run(&run_id).await.unwrap().is_none());
        store.save_run(&run).await.unwrap();
        assert_eq!(store.get_run(&run_id).await.unwrap().unwrap().id, run_id);
        assert_eq!(store.run_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn cas_step_state_applies_and_guards() {
        let store = InMemoryStore::new();
        let run = seeded_run();
        let run_id = run.id;
        let step_id = first_step(&run);
        store.save_run(&run).await.unwrap();

        let result = store
            .cas_step_state(&run_id, &step_id, StepState::Pending, StepState::Running)
            .await
            .unwrap();
        assert!(result.is_success());

        // Wrong expectation reports the actual state, changes nothing.
        let result = store
            .cas_step_state(&run_id, &step_id, StepState::Pending, StepState::Running)
            .await
            .unwrap();
        assert_eq!(
            result,
            CasResult::StateMismatch {
                actual: StepState::Running
            }
        );
    }

    #[tokio::test]
    async fn cas_rejects_un_terminating_a_terminal_step() {
        let store = InMemoryStore::new();
        let run = seeded_run();
        let run_id = run.id;
        let step_id = first_step(&run);
        store.save_run(&run).await.unwrap();

        store
            .cas_step_state(&run_id, &step_id, StepState::Pending, StepState::Running)
            .await
            .unwrap();
        store
            .cas_step_state(&run_id, &step_id, StepState::Running, StepState::Succeeded)
            .await
            .unwrap();

        // The kill controller racing a finished step: expectation fails.
        let result = store
            .cas_step_state(&run_id, &step_id, StepState::Running, StepState::Cancelled)
            .await
            .unwrap();
        assert_eq!(
            result,
            CasResult::StateMismatch {
                actual: StepState::Succeeded
            }
        );

        // Even a matching expectation cannot leave a terminal state.
        let result = store
            .cas_step_state(&run_id, &step_id, StepState::Succeeded, StepState::Cancelled)
            .await;
        assert!(matches!(result, Err(Error::InvalidStateTransition { .. })));
    }

    #[tokio::test]
    async fn cas_on_unknown_ids_is_not_found() {
        let store = InMemoryStore::new();
        let result = store
            .cas_step_state(
                &RunId::generate(),
                &StepId::generate(),
                StepState::Pending,
                StepState::Running,
            )
            .await
            .unwrap();
        assert_eq!(result, CasResult::NotFound);
    }

    #[tokio::test]
    async fn step_result_links_artifact() {
        let store = InMemoryStore::new();
        let run = seeded_run();
        let run_id = run.id;
        let provider_id = run.data_provider_tasks().next().unwrap().id;
        let step_id = first_step(&run);
        store.save_run(&run).await.unwrap();

        store
            .cas_step_state(&run_id, &step_id, StepState::Pending, StepState::Running)
            .await
            .unwrap();
        let artifact_id = store
            .record_step_result(&run_id, &step_id, Artifact::new("/stage/export.gpkg", 42))
            .await
            .unwrap();
        store
            .cas_step_state(&run_id, &step_id, StepState::Running, StepState::Succeeded)
            .await
            .unwrap();

        let found = store
            .find_step_result(&run_id, &provider_id, "source")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, artifact_id);

        // No shapefile result yet.
        assert!(store
            .find_step_result(&run_id, &provider_id, "shp")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn reset_provider_for_retry_reopens_run() {
        let store = InMemoryStore::new();
        let mut run = seeded_run();
        let run_id = run.id;
        let provider_id = run.data_provider_tasks().next().unwrap().id;

        // Fail the chain and settle the run.
        {
            let provider = run.get_provider_task_mut(&provider_id).unwrap();
            provider.steps[0].transition_to(StepState::Running).unwrap();
            provider.steps[0]
                .fail(FailureRecord::new(
                    crate::step::FailureKind::Operation,
                    "boom",
                ))
                .unwrap();
            provider.steps[1].cancel().unwrap();
            provider.set_state(ProviderTaskState::Incomplete).unwrap();
        }
        run.transition_to(RunState::Running).unwrap();
        run.transition_to(RunState::Incomplete).unwrap();
        store.save_run(&run).await.unwrap();

        store
            .reset_provider_for_retry(&run_id, &provider_id)
            .await
            .unwrap();

        let run = store.get_run(&run_id).await.unwrap().unwrap();
        assert_eq!(run.state, RunState::Running);
        let provider = run.get_provider_task(&provider_id).unwrap();
        assert_eq!(provider.state, ProviderTaskState::Pending);
        for step in &provider.steps {
            assert_eq!(step.state, StepState::Pending);
            assert_eq!(step.attempt, 2);
        }
    }

    #[tokio::test]
    async fn sweep_marks_unreferenced_artifacts() {
        let store = InMemoryStore::new();
        let run = seeded_run();
        let run_id = run.id;
        let step_id = first_step(&run);
        store.save_run(&run).await.unwrap();

        store
            .cas_step_state(&run_id, &step_id, StepState::Pending, StepState::Running)
            .await
            .unwrap();
        let kept = store
            .record_step_result(&run_id, &step_id, Artifact::new("/stage/kept.gpkg", 1))
            .await
            .unwrap();

        // Orphan artifact (as if its run was hard-deleted).
        let orphan = Artifact::new("/stage/orphan.gpkg", 1);
        let orphan_id = orphan.id;
        {
            let mut inner = store.inner.write().unwrap();
            inner.artifacts.insert(orphan_id, orphan);
        }

        assert_eq!(store.sweep_artifacts().await.unwrap(), 1);
        assert!(!store.get_artifact(&kept).await.unwrap().unwrap().deleted);
        assert!(store.get_artifact(&orphan_id).await.unwrap().unwrap().deleted);
    }

    #[tokio::test]
    async fn duplicate_archive_coverage_is_rejected() {
        let store = InMemoryStore::new();
        let run = seeded_run();
        let provider_id = run.data_provider_tasks().next().unwrap().id;
        store.save_run(&run).await.unwrap();

        let record = ArchiveRecord::new(run.id, [provider_id].into_iter().collect());
        store.create_archive(record).await.unwrap();

        let duplicate = ArchiveRecord::new(run.id, [provider_id].into_iter().collect());
        let duplicate_id = duplicate.id;
        let result = store.create_archive(duplicate).await;
        assert!(matches!(result, Err(Error::DuplicateArchive { .. })));

        // Nothing persisted for the duplicate.
        assert!(store.get_archive(&duplicate_id).await.unwrap().is_none());
        assert_eq!(store.archives_for_run(&run.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_archive_stamps_finish() {
        let store = InMemoryStore::new();
        let run = seeded_run();
        store.save_run(&run).await.unwrap();

        let record = ArchiveRecord::new(run.id, std::collections::BTreeSet::new());
        let archive_id = store.create_archive(record).await.unwrap();

        store
            .update_archive(
                &archive_id,
                ArchiveState::Success,
                Some(PathBuf::from("/download/pack.zip")),
                Some(1234),
                None,
            )
            .await
            .unwrap();

        let archive = store.get_archive(&archive_id).await.unwrap().unwrap();
        assert_eq!(archive.state, ArchiveState::Success);
        assert!(archive.finished_at.is_some());
        assert_eq!(archive.size_bytes, Some(1234));
    }
}
