//! Service facade consumed by the web/API layer.
//!
//! The REST surface, authentication and permissions live elsewhere; this
//! facade is the narrow interface they call: create a run, poll its status,
//! cancel a provider task, request an archive over a subset of providers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use datapack_core::{ArchiveId, ExportLayout, ProviderTaskId, RunId, StepId};

use crate::archive::{request_archive, ArchiveState, Archiver};
use crate::cancel::KillController;
use crate::dispatch::StepQueue;
use crate::error::{Error, Result};
use crate::job::{Job, LicenseGrants};
use crate::notify::{Notification, NotificationLevel, NotificationVerb, Notifier};
use crate::plan::PipelineFactory;
use crate::provider::ProviderTaskState;
use crate::run::RunState;
use crate::step::StepState;
use crate::store::Store;

/// Status of one step, as surfaced to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepStatus {
    /// Step identifier.
    pub step_id: StepId,
    /// Display name.
    pub name: String,
    /// Step kind label.
    pub kind: String,
    /// Current state.
    pub state: StepState,
    /// Human-readable summary of the latest failure, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// Status of one provider task, as surfaced to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    /// Provider task identifier.
    pub provider_task_id: ProviderTaskId,
    /// Provider slug.
    pub slug: String,
    /// Display name.
    pub name: String,
    /// Aggregated state.
    pub state: ProviderTaskState,
    /// Estimated output size in megabytes, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_size_mb: Option<f64>,
    /// Displayed steps.
    pub steps: Vec<StepStatus>,
}

/// Status of one archive, as surfaced to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveStatus {
    /// Archive identifier.
    pub archive_id: ArchiveId,
    /// Current state.
    pub state: ArchiveState,
    /// Download path, once produced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    /// Failure message, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Full status of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatus {
    /// Run identifier.
    pub run_id: RunId,
    /// Current state.
    pub state: RunState,
    /// When the run started, if started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the run finished, if finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// When the run expires.
    pub expiration: DateTime<Utc>,
    /// Per-provider statuses (displayed providers only).
    pub providers: Vec<ProviderStatus>,
    /// Archives covering this run.
    pub archives: Vec<ArchiveStatus>,
}

/// The export service facade.
pub struct ExportService {
    store: Arc<dyn Store>,
    factory: PipelineFactory,
    controller: KillController,
    archiver: Archiver,
    notifier: Arc<dyn Notifier>,
}

impl ExportService {
    /// Creates the facade.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn StepQueue>,
        factory: PipelineFactory,
        layout: ExportLayout,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            controller: KillController::new(Arc::clone(&store), queue),
            store,
            factory,
            archiver: Archiver::new(layout),
            notifier,
        }
    }

    /// Creates a run for a job; see [`PipelineFactory::create_run`].
    ///
    /// # Errors
    ///
    /// Returns a validation error for providerless jobs or unaccepted
    /// licenses.
    pub async fn create_run(
        &self,
        job: &Job,
        grants: &LicenseGrants,
        requested_by: &str,
    ) -> Result<RunId> {
        let run_id = self
            .factory
            .create_run(self.store.as_ref(), job, grants, requested_by, None)
            .await?;
        self.notifier.notify(Notification::new(
            requested_by,
            run_id,
            NotificationVerb::RunStarted,
            NotificationLevel::Info,
            format!("Export of {} submitted.", job.name),
        ));
        Ok(run_id)
    }

    /// Returns the full status of a run.
    ///
    /// Status fields are the sole channel for failure visibility: each
    /// failed step carries its human-readable failure summary here.
    ///
    /// # Errors
    ///
    /// Returns an error if the run is unknown.
    pub async fn get_run_status(&self, run_id: RunId) -> Result<RunStatus> {
        let run = self
            .store
            .get_run(&run_id)
            .await?
            .ok_or(Error::RunNotFound { run_id })?;

        let providers = run
            .data_provider_tasks()
            .filter(|p| p.display)
            .map(|p| ProviderStatus {
                provider_task_id: p.id,
                slug: p.slug.clone(),
                name: p.name.clone(),
                state: p.state,
                estimated_size_mb: p.estimated_size_mb,
                steps: p
                    .steps
                    .iter()
                    .filter(|s| s.display)
                    .map(|s| StepStatus {
                        step_id: s.id,
                        name: s.name.clone(),
                        kind: s.kind.as_label().to_string(),
                        state: s.state,
                        failure: s.latest_failure().map(crate::step::FailureRecord::summary),
                    })
                    .collect(),
            })
            .collect();

        let archives = self
            .store
            .archives_for_run(&run_id)
            .await?
            .into_iter()
            .map(|a| ArchiveStatus {
                archive_id: a.id,
                state: a.state,
                file_path: a.file_path.map(|p| p.display().to_string()),
                message: a.message,
            })
            .collect();

        Ok(RunStatus {
            run_id,
            state: run.state,
            started_at: run.started_at,
            finished_at: run.finished_at,
            expiration: run.expiration,
            providers,
            archives,
        })
    }

    /// Cancels one provider task on behalf of a user.
    ///
    /// Best-effort and non-blocking: enqueues interrupts and returns.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider task is unknown.
    pub async fn cancel_provider_task(
        &self,
        provider_task_id: ProviderTaskId,
        user: &str,
    ) -> Result<()> {
        self.controller
            .cancel_provider_task(provider_task_id, user)
            .await
    }

    /// Requests and builds an archive over a subset of provider tasks.
    ///
    /// A request covering an already-archived set fails with a duplicate
    /// error and persists nothing. A zero-provider request produces an
    /// empty, successful DataPack.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateArchive` for repeated coverage and
    /// `ArchiveIntegrity` if the written archive fails verification.
    pub async fn create_archive(
        &self,
        run_id: RunId,
        provider_task_ids: &[ProviderTaskId],
    ) -> Result<ArchiveId> {
        let run = self
            .store
            .get_run(&run_id)
            .await?
            .ok_or(Error::RunNotFound { run_id })?;

        let record = request_archive(&run, provider_task_ids)?;
        let archive_id = self.store.create_archive(record).await?;

        self.archiver
            .build(self.store.as_ref(), self.notifier.as_ref(), &run, archive_id)
            .await?;
        Ok(archive_id)
    }

    /// Soft-deletes runs whose expiration has passed and sweeps artifacts
    /// no live run references any more. Returns how many runs were swept.
    ///
    /// Only terminal runs are swept; an in-flight run past its expiration
    /// is left for cancellation to settle first.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut swept = 0;
        for mut run in self.store.list_runs().await? {
            if !run.deleted && run.is_terminal() && run.is_expired(now) {
                run.soft_delete("expiration-sweep");
                self.store.save_run(&run).await?;
                swept += 1;
                tracing::info!(run_id = %run.id, "expired run swept");
            }
        }
        self.store.sweep_artifacts().await?;
        Ok(swept)
    }

    /// Soft-deletes a run: cancels everything in flight, flags the run.
    ///
    /// # Errors
    ///
    /// Returns an error if the run is unknown.
    pub async fn soft_delete_run(&self, run_id: RunId, user: &str) -> Result<()> {
        self.controller.cancel_run(run_id, user).await?;

        let mut run = self
            .store
            .get_run(&run_id)
            .await?
            .ok_or(Error::RunNotFound { run_id })?;
        run.soft_delete(user);
        self.store.save_run(&run).await?;

        self.notifier.notify(Notification::new(
            user,
            run_id,
            NotificationVerb::RunDeleted,
            NotificationLevel::Warning,
            "Your DataPack was deleted.",
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ExportFormat, ProviderKind, WorkUnitCatalog};
    use crate::dispatch::memory::InMemoryStepQueue;
    use crate::job::{BoundingBox, ProviderExport};
    use crate::notify::InMemoryNotifier;
    use crate::store::memory::InMemoryStore;
    use datapack_core::JobId;

    fn service(dir: &tempfile::TempDir) -> (ExportService, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryStepQueue::new("datapack.default"));
        let layout = ExportLayout::new(dir.path().join("stage"), dir.path().join("download"));
        let service = ExportService::new(
            store.clone(),
            queue,
            PipelineFactory::new(WorkUnitCatalog::new(), 14),
            layout,
            Arc::new(InMemoryNotifier::new()),
        );
        (service, store)
    }

    fn job() -> Job {
        Job {
            id: JobId::generate(),
            name: "Flood Extent".into(),
            owner: "gis-user".into(),
            event: None,
            extent: BoundingBox::new(5.0, 5.0, 10.0, 10.0).unwrap(),
            projections: vec![],
            provider_exports: vec![ProviderExport::new(
                ProviderKind::Osm,
                "osm",
                "OpenStreetMap",
                vec![ExportFormat::Gpkg],
            )],
        }
    }

    #[tokio::test]
    async fn status_reflects_run_shape() {
        let dir = tempfile::tempdir().unwrap();
        let (service, _store) = service(&dir);

        let run_id = service
            .create_run(&job(), &LicenseGrants::new(), "gis-user")
            .await
            .unwrap();

        let status = service.get_run_status(run_id).await.unwrap();
        assert_eq!(status.state, RunState::Submitted);
        assert_eq!(status.providers.len(), 1);
        assert_eq!(status.providers[0].slug, "osm");
        assert!(status.archives.is_empty());
        assert!(status.started_at.is_none());
    }

    #[tokio::test]
    async fn zero_provider_archive_is_a_valid_empty_datapack() {
        let dir = tempfile::tempdir().unwrap();
        let (service, store) = service(&dir);

        let run_id = service
            .create_run(&job(), &LicenseGrants::new(), "gis-user")
            .await
            .unwrap();

        // Everything filtered away by access control: still a success.
        let archive_id = service.create_archive(run_id, &[]).await.unwrap();
        let archive = store.get_archive(&archive_id).await.unwrap().unwrap();
        assert_eq!(archive.state, ArchiveState::Success);
        assert!(archive.file_path.is_some());
    }

    #[tokio::test]
    async fn duplicate_archive_request_fails_without_a_record() {
        let dir = tempfile::tempdir().unwrap();
        let (service, store) = service(&dir);

        let run_id = service
            .create_run(&job(), &LicenseGrants::new(), "gis-user")
            .await
            .unwrap();

        service.create_archive(run_id, &[]).await.unwrap();
        let result = service.create_archive(run_id, &[]).await;
        assert!(matches!(result, Err(Error::DuplicateArchive { .. })));
        assert_eq!(store.archives_for_run(&run_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sweep_deletes_only_expired_terminal_runs() {
        let dir = tempfile::tempdir().unwrap();
        let (service, store) = service(&dir);

        let run_id = service
            .create_run(&job(), &LicenseGrants::new(), "gis-user")
            .await
            .unwrap();

        // Still submitted: never swept, even past expiration.
        let past_expiry = Utc::now() + chrono::Duration::days(15);
        assert_eq!(service.sweep_expired(past_expiry).await.unwrap(), 0);

        // Terminal and expired: swept.
        let mut run = store.get_run(&run_id).await.unwrap().unwrap();
        run.transition_to(RunState::Running).unwrap();
        run.transition_to(RunState::Completed).unwrap();
        store.save_run(&run).await.unwrap();

        assert_eq!(service.sweep_expired(past_expiry).await.unwrap(), 1);
        let run = store.get_run(&run_id).await.unwrap().unwrap();
        assert!(run.deleted);

        // Idempotent: already-deleted runs are not swept twice.
        assert_eq!(service.sweep_expired(past_expiry).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn soft_delete_flags_and_cancels() {
        let dir = tempfile::tempdir().unwrap();
        let (service, store) = service(&dir);

        let run_id = service
            .create_run(&job(), &LicenseGrants::new(), "gis-user")
            .await
            .unwrap();
        service.soft_delete_run(run_id, "gis-user").await.unwrap();

        let run = store.get_run(&run_id).await.unwrap().unwrap();
        assert!(run.deleted);
        assert_eq!(run.delete_requested_by.as_deref(), Some("gis-user"));
    }
}
