//! Pluggable persistence for orchestration state.
//!
//! The store is the single source of truth for runs, provider records,
//! step records, artifacts and archives. Status updates are field-scoped
//! and CAS-guarded so that concurrent writers (a worker finishing a step,
//! the kill controller cancelling it) race safely: state only ever moves
//! forward through the machine, and a transition that would un-terminate a
//! terminal record is rejected.

pub mod memory;

use std::path::PathBuf;

use async_trait::async_trait;

use datapack_core::{ArchiveId, ArtifactId, ProviderTaskId, RunId, StepId};

use crate::archive::{ArchiveRecord, ArchiveState};
use crate::artifact::Artifact;
use crate::error::Result;
use crate::provider::ProviderTaskState;
use crate::run::{Run, RunState};
use crate::step::{FailureRecord, StepRecord, StepState};

/// Result of a compare-and-swap step transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasResult {
    /// Transition applied.
    Success,
    /// Run or step not found.
    NotFound,
    /// Current state didn't match the expected value.
    StateMismatch {
        /// The state actually found.
        actual: StepState,
    },
}

impl CasResult {
    /// Returns true if the transition was applied.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Storage abstraction for orchestration state.
///
/// `cas_step_state` is the correctness primitive: it prevents
/// double-execution and lets the worker and the kill controller race on a
/// step without either observing an impossible transition.
#[async_trait]
pub trait Store: Send + Sync {
    // --- Runs ---

    /// Gets a run by id. Returns `None` if it does not exist.
    async fn get_run(&self, run_id: &RunId) -> Result<Option<Run>>;

    /// Saves a run (insert or full replacement).
    ///
    /// Concurrent status updates should go through the field-scoped
    /// methods below instead.
    async fn save_run(&self, run: &Run) -> Result<()>;

    /// Deletes a run outright.
    ///
    /// Used by `create_run`'s validation path to keep run creation atomic
    /// from the caller's perspective; user-facing deletion is the soft
    /// delete on the run itself.
    async fn delete_run(&self, run_id: &RunId) -> Result<bool>;

    /// Lists every run, oldest first (expiration sweep support).
    async fn list_runs(&self) -> Result<Vec<Run>>;

    /// Applies a run state transition (forward-only, exactly-once stamps).
    async fn set_run_state(
        &self,
        run_id: &RunId,
        target: RunState,
    ) -> Result<()>;

    /// Resolves the run owning a provider task record.
    async fn run_for_provider(
        &self,
        provider_task_id: &ProviderTaskId,
    ) -> Result<Option<RunId>>;

    // --- Steps (field-scoped) ---

    /// Atomically transitions a step if its current state matches
    /// `expected`.
    async fn cas_step_state(
        &self,
        run_id: &RunId,
        step_id: &StepId,
        expected: StepState,
        target: StepState,
    ) -> Result<CasResult>;

    /// Records the executing worker's identity on a step.
    async fn record_step_start(
        &self,
        run_id: &RunId,
        step_id: &StepId,
        worker: &str,
        pid: i32,
    ) -> Result<()>;

    /// Registers a produced artifact and links it as the step's result.
    async fn record_step_result(
        &self,
        run_id: &RunId,
        step_id: &StepId,
        artifact: Artifact,
    ) -> Result<ArtifactId>;

    /// Attaches a failure record to a step (the `record_exception` hook).
    async fn record_step_failure(
        &self,
        run_id: &RunId,
        step_id: &StepId,
        failure: FailureRecord,
    ) -> Result<()>;

    /// Gets one step record.
    async fn get_step(
        &self,
        run_id: &RunId,
        step_id: &StepId,
    ) -> Result<Option<StepRecord>>;

    /// Finds the successful artifact published under `result_key` within a
    /// provider's chain.
    async fn find_step_result(
        &self,
        run_id: &RunId,
        provider_task_id: &ProviderTaskId,
        result_key: &str,
    ) -> Result<Option<Artifact>>;

    // --- Provider records ---

    /// Applies a provider state transition (forward-only).
    async fn set_provider_state(
        &self,
        run_id: &RunId,
        provider_task_id: &ProviderTaskId,
        target: ProviderTaskState,
    ) -> Result<()>;

    /// Resets a provider's failed and cancelled steps to fresh pending
    /// records with an incremented attempt, reopening the run.
    ///
    /// This is the explicit provider-level retry path, the only sanctioned
    /// regression through the state machines.
    async fn reset_provider_for_retry(
        &self,
        run_id: &RunId,
        provider_task_id: &ProviderTaskId,
    ) -> Result<()>;

    // --- Artifacts ---

    /// Gets an artifact by id.
    async fn get_artifact(
        &self,
        artifact_id: &ArtifactId,
    ) -> Result<Option<Artifact>>;

    /// Marks artifacts referenced by no live run as deleted
    /// (longest-holder rule). Returns how many were swept.
    async fn sweep_artifacts(&self) -> Result<usize>;

    // --- Archives ---

    /// Persists a pending archive record.
    ///
    /// Fails with `DuplicateArchive` if an archive over the identical
    /// coverage set already exists for the run; nothing is persisted in
    /// that case.
    async fn create_archive(&self, record: ArchiveRecord) -> Result<ArchiveId>;

    /// Gets an archive record by id.
    async fn get_archive(
        &self,
        archive_id: &ArchiveId,
    ) -> Result<Option<ArchiveRecord>>;

    /// Returns all archive records for a run.
    async fn archives_for_run(
        &self,
        run_id: &RunId,
    ) -> Result<Vec<ArchiveRecord>>;

    /// Updates an archive's state and output metadata.
    async fn update_archive(
        &self,
        archive_id: &ArchiveId,
        state: ArchiveState,
        file_path: Option<PathBuf>,
        size_bytes: Option<u64>,
        message: Option<String>,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cas_result_is_success() {
        assert!(CasResult::Success.is_success());
        assert!(!CasResult::NotFound.is_success());
        assert!(!CasResult::StateMismatch {
            actual: StepState::Running
        }
        .is_success());
    }
}
