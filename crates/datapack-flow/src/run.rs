//! Export run tracking.
//!
//! A run is one execution attempt of a job. It owns the provider task
//! records created for it and is the single source of truth for user-visible
//! status. Run status is monotonic: it never regresses except through the
//! explicit provider-retry path.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use datapack_core::{JobId, ProviderTaskId, RunId};

use crate::error::{Error, Result};
use crate::job::BoundingBox;
use crate::provider::{ProviderTaskRecord, ProviderTaskState};

/// Run state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    /// Created, plan not yet executing.
    Submitted,
    /// At least one step has been dispatched.
    Running,
    /// Every displayed provider completed.
    Completed,
    /// At least one provider failed; partial success is user-visible.
    Incomplete,
    /// Every provider was cancelled.
    Cancelled,
}

impl RunState {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Incomplete | Self::Cancelled)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub const fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Submitted => matches!(target, Self::Running | Self::Cancelled),
            Self::Running => matches!(target, Self::Completed | Self::Incomplete | Self::Cancelled),
            Self::Completed | Self::Incomplete | Self::Cancelled => false,
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Incomplete => "incomplete",
            Self::Cancelled => "cancelled",
        }
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::Submitted
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Submitted => write!(f, "SUBMITTED"),
            Self::Running => write!(f, "RUNNING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Incomplete => write!(f, "INCOMPLETE"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// One export attempt for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    /// Unique run identifier.
    pub id: RunId,
    /// The job this run executes.
    pub job_id: JobId,
    /// Job display name, denormalized for status and manifests.
    pub job_name: String,
    /// Geographic extent of the export, denormalized from the job.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extent: Option<BoundingBox>,
    /// Parent run when this run is a re-run/clone.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_run: Option<RunId>,
    /// Current state.
    pub state: RunState,
    /// Who requested the export.
    pub requested_by: String,
    /// When the run was created.
    pub created_at: DateTime<Utc>,
    /// When the run left `Submitted`. Set exactly once.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal state. Set exactly once.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// When the run expires and becomes eligible for the sweep.
    pub expiration: DateTime<Utc>,
    /// Soft-delete flag.
    #[serde(default)]
    pub deleted: bool,
    /// Who requested deletion, when soft-deleted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete_requested_by: Option<String>,
    /// Provider task records owned by this run (including the reserved
    /// `run` pseudo-provider).
    pub provider_tasks: Vec<ProviderTaskRecord>,
}

impl Run {
    /// Creates a new run in `Submitted` with the given expiration window.
    #[must_use]
    pub fn new(
        job_id: JobId,
        job_name: impl Into<String>,
        requested_by: impl Into<String>,
        expiration_days: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: RunId::generate(),
            job_id,
            job_name: job_name.into(),
            extent: None,
            parent_run: None,
            state: RunState::Submitted,
            requested_by: requested_by.into(),
            created_at: now,
            started_at: None,
            finished_at: None,
            expiration: now + Duration::days(i64::from(expiration_days)),
            deleted: false,
            delete_requested_by: None,
            provider_tasks: Vec::new(),
        }
    }

    /// Marks this run as a clone of `parent`.
    #[must_use]
    pub const fn with_parent(mut self, parent: RunId) -> Self {
        self.parent_run = Some(parent);
        self
    }

    /// Sets the denormalized extent.
    #[must_use]
    pub const fn with_extent(mut self, extent: BoundingBox) -> Self {
        self.extent = Some(extent);
        self
    }

    /// Returns true if the run is in a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Returns true if the run has expired.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiration
    }

    /// Returns the provider task record for a given id.
    #[must_use]
    pub fn get_provider_task(&self, id: &ProviderTaskId) -> Option<&ProviderTaskRecord> {
        self.provider_tasks.iter().find(|p| &p.id == id)
    }

    /// Returns mutable provider task record for a given id.
    pub fn get_provider_task_mut(&mut self, id: &ProviderTaskId) -> Option<&mut ProviderTaskRecord> {
        self.provider_tasks.iter_mut().find(|p| &p.id == id)
    }

    /// Returns the real provider records, excluding the `run`
    /// pseudo-provider.
    pub fn data_provider_tasks(&self) -> impl Iterator<Item = &ProviderTaskRecord> {
        self.provider_tasks.iter().filter(|p| !p.is_run_record())
    }

    /// Returns true if every real provider record is terminal.
    #[must_use]
    pub fn all_providers_terminal(&self) -> bool {
        self.data_provider_tasks().all(ProviderTaskRecord::is_terminal)
    }

    /// Computes the final run state from provider aggregates.
    ///
    /// All cancelled → `Cancelled`; any failure or cancellation among
    /// completions → `Incomplete`; otherwise `Completed`. Partial success is
    /// a first-class outcome, never a hard failure.
    #[must_use]
    pub fn compute_final_state(&self) -> RunState {
        let states: Vec<ProviderTaskState> =
            self.data_provider_tasks().map(|p| p.state).collect();

        if states.is_empty() {
            return RunState::Completed;
        }
        if states.iter().all(|s| *s == ProviderTaskState::Cancelled) {
            return RunState::Cancelled;
        }
        if states.iter().any(|s| {
            matches!(
                s,
                ProviderTaskState::Incomplete | ProviderTaskState::Cancelled
            )
        }) {
            return RunState::Incomplete;
        }
        RunState::Completed
    }

    /// Transitions to a new state.
    ///
    /// `started_at` is stamped the first time the run leaves `Submitted`;
    /// `finished_at` the first time it reaches any terminal state. Both are
    /// set exactly once: repeating a terminal transition is an idempotent
    /// no-op, and conflicting transitions are rejected.
    ///
    /// # Errors
    ///
    /// Returns an error if the transition is invalid.
    #[tracing::instrument(skip(self), fields(run_id = %self.id, from = %self.state, to = %target))]
    pub fn transition_to(&mut self, target: RunState) -> Result<()> {
        if self.state == target {
            return Ok(());
        }
        if !self.state.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: target.to_string(),
                reason: if self.state.is_terminal() {
                    "terminal run states accept no transitions".to_string()
                } else {
                    "not a valid run transition".to_string()
                },
            });
        }

        let now = Utc::now();
        if self.started_at.is_none() && target != RunState::Submitted {
            self.started_at = Some(now);
        }
        if target.is_terminal() && self.finished_at.is_none() {
            self.finished_at = Some(now);
        }
        self.state = target;
        Ok(())
    }

    /// Reopens a terminal run for an explicit provider retry.
    ///
    /// This is the single sanctioned regression path through the state
    /// machine. The finish timestamp is cleared so the retried run records
    /// a fresh one.
    pub fn reopen_for_retry(&mut self) {
        if self.state.is_terminal() {
            self.state = RunState::Running;
            self.finished_at = None;
        }
    }

    /// Soft-deletes the run.
    pub fn soft_delete(&mut self, requested_by: impl Into<String>) {
        self.deleted = true;
        self.delete_requested_by = Some(requested_by.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ProviderKind, StepKind};
    use crate::step::StepRecord;

    fn run_with_providers(states: &[ProviderTaskState]) -> Run {
        let mut run = Run::new(JobId::generate(), "Flood Extent", "gis-user", 14);
        run.provider_tasks.push(ProviderTaskRecord::run_record());
        for (i, state) in states.iter().enumerate() {
            let mut record =
                ProviderTaskRecord::new(ProviderKind::Osm, format!("p{i}"), format!("Provider {i}"));
            record.steps.push(StepRecord::new(StepKind::OsmCollection));
            record.state = *state;
            run.provider_tasks.push(record);
        }
        run
    }

    #[test]
    fn started_and_finished_set_exactly_once() {
        let mut run = run_with_providers(&[ProviderTaskState::Completed]);

        run.transition_to(RunState::Running).unwrap();
        let started = run.started_at.expect("started_at set");

        run.transition_to(RunState::Completed).unwrap();
        let finished = run.finished_at.expect("finished_at set");
        assert!(finished >= started);

        // Idempotent repeat: timestamps unchanged.
        run.transition_to(RunState::Completed).unwrap();
        assert_eq!(run.started_at, Some(started));
        assert_eq!(run.finished_at, Some(finished));
    }

    #[test]
    fn terminal_runs_reject_conflicting_transitions() {
        let mut run = run_with_providers(&[ProviderTaskState::Completed]);
        run.transition_to(RunState::Running).unwrap();
        run.transition_to(RunState::Completed).unwrap();

        assert!(run.transition_to(RunState::Running).is_err());
        assert!(run.transition_to(RunState::Incomplete).is_err());
    }

    #[test]
    fn final_state_aggregation() {
        assert_eq!(
            run_with_providers(&[ProviderTaskState::Completed, ProviderTaskState::Completed])
                .compute_final_state(),
            RunState::Completed
        );
        assert_eq!(
            run_with_providers(&[ProviderTaskState::Completed, ProviderTaskState::Incomplete])
                .compute_final_state(),
            RunState::Incomplete
        );
        assert_eq!(
            run_with_providers(&[ProviderTaskState::Cancelled, ProviderTaskState::Cancelled])
                .compute_final_state(),
            RunState::Cancelled
        );
        // Mixed cancellation is incomplete, not cancelled.
        assert_eq!(
            run_with_providers(&[ProviderTaskState::Completed, ProviderTaskState::Cancelled])
                .compute_final_state(),
            RunState::Incomplete
        );
    }

    #[test]
    fn pseudo_provider_is_excluded_from_aggregation() {
        let run = run_with_providers(&[ProviderTaskState::Completed]);
        // The pseudo record is still Pending, yet the run can complete.
        assert!(run.all_providers_terminal());
        assert_eq!(run.compute_final_state(), RunState::Completed);
    }

    #[test]
    fn reopen_for_retry_is_the_only_regression_path() {
        let mut run = run_with_providers(&[ProviderTaskState::Incomplete]);
        run.transition_to(RunState::Running).unwrap();
        run.transition_to(RunState::Incomplete).unwrap();
        let first_finish = run.finished_at;

        run.reopen_for_retry();
        assert_eq!(run.state, RunState::Running);
        assert!(run.finished_at.is_none());
        assert_ne!(run.finished_at, first_finish);
    }

    #[test]
    fn expiration_window() {
        let run = Run::new(JobId::generate(), "job", "user", 14);
        assert!(!run.is_expired(Utc::now()));
        assert!(run.is_expired(Utc::now() + Duration::days(15)));
    }
}
