//! Archive records and DataPack assembly.
//!
//! An archive aggregates a selected set of provider task records into one
//! downloadable zip. Coverage sets are unique per run: requesting a second
//! archive over the identical set fails with a duplicate error. The written
//! zip is verified by reading every entry back; a corrupt archive is fatal
//! for that archive and raises an operator alert, it is never retried.

use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use datapack_core::{ArchiveId, ExportLayout, ProviderTaskId, RunId};

use crate::artifact::Artifact;
use crate::error::{Error, Result};
use crate::manifest::Manifest;
use crate::notify::Notifier;
use crate::run::Run;
use crate::store::Store;

/// Text placed at the root of every DataPack.
const README_TEXT: &str = "This DataPack was produced by an automated export run.\n\
Data files are grouped by source under the data/ directory; see\n\
MANIFEST/manifest.json for the data sources and file inventory.\n";

/// Archive lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArchiveState {
    /// Requested, not yet written.
    Pending,
    /// Written and verified.
    Success,
    /// Assembly or verification failed; not retried.
    Failed,
}

impl std::fmt::Display for ArchiveState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Success => write!(f, "SUCCESS"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// A requested or produced archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveRecord {
    /// Unique archive identifier.
    pub id: ArchiveId,
    /// Run the archive covers.
    pub run_id: RunId,
    /// Provider task records covered, canonically ordered.
    pub coverage: BTreeSet<ProviderTaskId>,
    /// Current state.
    pub state: ArchiveState,
    /// Path of the written zip, once produced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
    /// Size of the written zip in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    /// Progress or failure message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// When the archive was requested.
    pub created_at: DateTime<Utc>,
    /// When assembly finished (either way).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl ArchiveRecord {
    /// Creates a pending archive record over the given coverage set.
    #[must_use]
    pub fn new(run_id: RunId, coverage: BTreeSet<ProviderTaskId>) -> Self {
        Self {
            id: ArchiveId::generate(),
            run_id,
            coverage,
            state: ArchiveState::Pending,
            file_path: None,
            size_bytes: None,
            message: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Returns the canonical coverage key for duplicate detection.
    ///
    /// The coverage set is ordered, so two requests over the same records
    /// produce the same key regardless of request order.
    #[must_use]
    pub fn coverage_key(&self) -> String {
        self.coverage
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Validates an archive request against a run and builds the pending record.
///
/// The reserved `run` pseudo-provider cannot be covered; every covered id
/// must belong to the run. A zero-provider request (everything filtered by
/// access control) is valid and later produces an empty, successful
/// DataPack.
///
/// # Errors
///
/// Returns a validation error for foreign or pseudo-provider ids.
pub fn request_archive(run: &Run, provider_task_ids: &[ProviderTaskId]) -> Result<ArchiveRecord> {
    let mut coverage = BTreeSet::new();
    for id in provider_task_ids {
        let record = run
            .get_provider_task(id)
            .ok_or(Error::ProviderTaskNotFound {
                provider_task_id: *id,
            })?;
        if record.is_run_record() {
            return Err(Error::validation(
                "the reserved run pseudo-provider cannot be archived",
            ));
        }
        coverage.insert(*id);
    }
    Ok(ArchiveRecord::new(run.id, coverage))
}

/// Assembles DataPack zips from successful artifacts.
#[derive(Debug, Clone)]
pub struct Archiver {
    layout: ExportLayout,
}

impl Archiver {
    /// Creates an archiver over the given filesystem layout.
    #[must_use]
    pub const fn new(layout: ExportLayout) -> Self {
        Self { layout }
    }

    /// Builds, verifies and records the archive.
    ///
    /// Collects every successful display artifact of the covered provider
    /// records (the `run` pseudo-provider is excluded by construction),
    /// deduplicates archive-relative paths first-writer-wins, writes data
    /// files plus manifest, readme and license side-files, and verifies the
    /// result by reading it back. A zero-provider coverage still produces a
    /// valid, successful archive.
    ///
    /// # Errors
    ///
    /// Returns `ArchiveIntegrity` if verification fails (the record is
    /// marked `Failed` and an operator alert raised), or a storage error if
    /// assembly fails.
    #[tracing::instrument(skip(self, store, notifier, run), fields(run_id = %run.id, archive_id = %archive_id))]
    pub async fn build(
        &self,
        store: &dyn Store,
        notifier: &dyn Notifier,
        run: &Run,
        archive_id: ArchiveId,
    ) -> Result<PathBuf> {
        let record = store
            .get_archive(&archive_id)
            .await?
            .ok_or_else(|| Error::storage(format!("archive {archive_id} not found")))?;

        match self.assemble(store, run, &record).await {
            Ok(path) => {
                let size = std::fs::metadata(&path).map(|m| m.len()).ok();
                store
                    .update_archive(&archive_id, ArchiveState::Success, Some(path.clone()), size, None)
                    .await?;
                Ok(path)
            }
            Err(e) => {
                store
                    .update_archive(
                        &archive_id,
                        ArchiveState::Failed,
                        None,
                        None,
                        Some(e.to_string()),
                    )
                    .await?;
                if matches!(e, Error::ArchiveIntegrity { .. }) {
                    notifier.operator_alert(
                        "DataPack archive failed verification",
                        &format!("run {} archive {archive_id}: {e}", run.id),
                    );
                }
                Err(e)
            }
        }
    }

    async fn assemble(
        &self,
        store: &dyn Store,
        run: &Run,
        record: &ArchiveRecord,
    ) -> Result<PathBuf> {
        // Collect successful display artifacts for the covered providers.
        // First writer wins on colliding archive-relative names.
        let mut entries: HashMap<String, Artifact> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        let mut manifest = Manifest::for_run(run);

        for provider in run
            .data_provider_tasks()
            .filter(|p| record.coverage.contains(&p.id))
        {
            let mut file_count = 0;
            for step in &provider.steps {
                let Some(artifact_id) = step.result else {
                    continue;
                };
                if !step.display {
                    continue;
                }
                let Some(artifact) = store.get_artifact(&artifact_id).await? else {
                    tracing::warn!(%artifact_id, "artifact referenced by step is missing");
                    continue;
                };
                let archive_path =
                    ExportLayout::archive_data_path(&provider.slug, &artifact.file_name);
                if entries.contains_key(&archive_path) {
                    tracing::debug!(path = %archive_path, "dropping colliding archive entry");
                    continue;
                }
                manifest.add_file(&archive_path, artifact.size_bytes);
                order.push(archive_path.clone());
                entries.insert(archive_path, artifact);
                file_count += 1;
            }
            manifest.add_source(&provider.slug, &provider.name, file_count);
        }

        let download_dir = self.layout.run_download_dir(run.id);
        std::fs::create_dir_all(&download_dir)
            .map_err(|e| Error::storage(format!("failed to create download dir: {e}")))?;
        let file_name = format!(
            "{}-{}.zip",
            datapack_core::paths::normalize_name(&run.job_name),
            record.id
        );
        let path = download_dir.join(file_name);

        self.write_zip(&path, run, record, &manifest, &entries, &order)?;
        verify_archive(&path)?;
        Ok(path)
    }

    fn write_zip(
        &self,
        path: &PathBuf,
        run: &Run,
        record: &ArchiveRecord,
        manifest: &Manifest,
        entries: &HashMap<String, Artifact>,
        order: &[String],
    ) -> Result<()> {
        let file = File::create(path)
            .map_err(|e| Error::storage(format!("failed to create archive file: {e}")))?;
        let mut writer = ZipWriter::new(file);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        let zip_err = |e: zip::result::ZipError| Error::storage(format!("zip write failed: {e}"));
        let io_err = |e: io::Error| Error::storage(format!("zip write failed: {e}"));

        writer.start_file("README.txt", options).map_err(zip_err)?;
        io::Write::write_all(&mut writer, README_TEXT.as_bytes()).map_err(io_err)?;

        for archive_path in order {
            let artifact = &entries[archive_path];
            let mut source = File::open(&artifact.path).map_err(|e| {
                Error::storage(format!(
                    "artifact {} unreadable at {}: {e}",
                    artifact.id,
                    artifact.path.display()
                ))
            })?;
            writer
                .start_file(archive_path.as_str(), options)
                .map_err(zip_err)?;
            io::copy(&mut source, &mut writer).map_err(io_err)?;
        }

        for provider in run
            .data_provider_tasks()
            .filter(|p| record.coverage.contains(&p.id))
        {
            if let Some(text) = &provider.license_text {
                let license_path = ExportLayout::archive_data_path(
                    &provider.slug,
                    &format!("{}_license.txt", provider.slug),
                );
                if !entries.contains_key(&license_path) {
                    writer
                        .start_file(license_path.as_str(), options)
                        .map_err(zip_err)?;
                    io::Write::write_all(&mut writer, text.as_bytes()).map_err(io_err)?;
                }
            }
        }

        writer
            .start_file("MANIFEST/manifest.json", options)
            .map_err(zip_err)?;
        io::Write::write_all(&mut writer, manifest.to_json()?.as_bytes()).map_err(io_err)?;

        writer.finish().map_err(zip_err)?;
        Ok(())
    }
}

/// Verifies a written archive by reading every entry back.
///
/// # Errors
///
/// Returns `ArchiveIntegrity` if the archive cannot be opened or any entry
/// fails its checksum.
pub fn verify_archive(path: &Path) -> Result<()> {
    let integrity_err = |message: String| Error::ArchiveIntegrity { message };

    let file = File::open(path)
        .map_err(|e| integrity_err(format!("archive unreadable at {}: {e}", path.display())))?;
    let mut archive = ZipArchive::new(file)
        .map_err(|e| integrity_err(format!("archive is not a valid zip: {e}")))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| integrity_err(format!("entry {i} unreadable: {e}")))?;
        let name = entry.name().to_string();
        io::copy(&mut entry, &mut io::sink())
            .map_err(|e| integrity_err(format!("entry {name} failed verification: {e}")))?;
    }
    Ok(())
}
