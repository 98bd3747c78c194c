//! Provider task records: one provider's unit of work within a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use datapack_core::{ProviderTaskId, StepId};

use crate::catalog::ProviderKind;
use crate::error::{Error, Result};
use crate::step::{StepRecord, StepState};

/// Slug of the reserved pseudo-provider that owns run-level steps.
///
/// It is never displayed and never contributes artifacts to an archive's
/// data inventory.
pub const RUN_PROVIDER_SLUG: &str = "run";

/// Aggregated state of one provider's work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderTaskState {
    /// Steps created, none running yet.
    Pending,
    /// At least one step has started.
    Running,
    /// Every non-skippable step succeeded.
    Completed,
    /// At least one step failed.
    Incomplete,
    /// Explicitly interrupted without failures.
    Cancelled,
}

impl ProviderTaskState {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Incomplete | Self::Cancelled)
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Incomplete => "incomplete",
            Self::Cancelled => "cancelled",
        }
    }
}

impl Default for ProviderTaskState {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for ProviderTaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Incomplete => write!(f, "INCOMPLETE"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// One provider's unit of work within a run.
///
/// Owned exclusively by its run and deleted with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderTaskRecord {
    /// Unique identifier.
    pub id: ProviderTaskId,
    /// Service kind; `None` for the reserved run pseudo-provider.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderKind>,
    /// Stable provider slug.
    pub slug: String,
    /// Display name.
    pub name: String,
    /// Whether this record is shown to users.
    pub display: bool,
    /// Current aggregated state.
    pub state: ProviderTaskState,
    /// Estimated output size in megabytes, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_size_mb: Option<f64>,
    /// Estimated duration in seconds, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_duration_secs: Option<u64>,
    /// License text distributed alongside this provider's data, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license_text: Option<String>,
    /// Ordered step records for this provider's chain.
    pub steps: Vec<StepRecord>,
    /// When the first step started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the record reached a terminal state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl ProviderTaskRecord {
    /// Creates a new provider record in `Pending`.
    #[must_use]
    pub fn new(provider: ProviderKind, slug: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: ProviderTaskId::generate(),
            provider: Some(provider),
            slug: slug.into(),
            name: name.into(),
            display: true,
            state: ProviderTaskState::Pending,
            estimated_size_mb: None,
            estimated_duration_secs: None,
            license_text: None,
            steps: Vec::new(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Creates the reserved run pseudo-provider record.
    #[must_use]
    pub fn run_record() -> Self {
        Self {
            id: ProviderTaskId::generate(),
            provider: None,
            slug: RUN_PROVIDER_SLUG.to_string(),
            name: RUN_PROVIDER_SLUG.to_string(),
            display: false,
            state: ProviderTaskState::Pending,
            estimated_size_mb: None,
            estimated_duration_secs: None,
            license_text: None,
            steps: Vec::new(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Sets the size/duration estimates.
    #[must_use]
    pub const fn with_estimates(mut self, size_mb: Option<f64>, duration_secs: Option<u64>) -> Self {
        self.estimated_size_mb = size_mb;
        self.estimated_duration_secs = duration_secs;
        self
    }

    /// Returns true if this is the reserved run pseudo-provider.
    #[must_use]
    pub fn is_run_record(&self) -> bool {
        self.slug == RUN_PROVIDER_SLUG
    }

    /// Returns true if the record is in a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Returns the step record for a given step id.
    #[must_use]
    pub fn get_step(&self, step_id: &StepId) -> Option<&StepRecord> {
        self.steps.iter().find(|s| &s.id == step_id)
    }

    /// Returns mutable step record for a given step id.
    pub fn get_step_mut(&mut self, step_id: &StepId) -> Option<&mut StepRecord> {
        self.steps.iter_mut().find(|s| &s.id == step_id)
    }

    /// Returns all currently running steps.
    #[must_use]
    pub fn running_steps(&self) -> Vec<&StepRecord> {
        self.steps
            .iter()
            .filter(|s| s.state == StepState::Running)
            .collect()
    }

    /// Returns true if every step is terminal.
    #[must_use]
    pub fn all_steps_terminal(&self) -> bool {
        self.steps.iter().all(StepRecord::is_terminal)
    }

    /// Computes the aggregated state from the step records.
    ///
    /// Only conversion steps count: the finalize bookkeeping steps are
    /// orchestration-internal and never gate the aggregate (the finalize
    /// step computes this value, it cannot also be an input to it).
    /// Failures dominate cancellation: if a chain was force-cancelled
    /// because one of its steps failed, the record is `Incomplete`, not
    /// `Cancelled`. A chain cancelled without failures is `Cancelled`.
    /// Skippable steps never hold back completion.
    #[must_use]
    pub fn aggregate_state(&self) -> ProviderTaskState {
        let work_steps: Vec<&StepRecord> = self
            .steps
            .iter()
            .filter(|s| !s.kind.is_finalize())
            .collect();

        if !work_steps.iter().all(|s| s.is_terminal()) {
            if work_steps.iter().any(|s| s.state != StepState::Pending) {
                return ProviderTaskState::Running;
            }
            return ProviderTaskState::Pending;
        }

        let any_failed = work_steps.iter().any(|s| s.state == StepState::Failed);
        if any_failed {
            return ProviderTaskState::Incomplete;
        }

        let any_cancelled = work_steps
            .iter()
            .any(|s| s.state == StepState::Cancelled && !s.kind.is_skippable());
        if any_cancelled {
            return ProviderTaskState::Cancelled;
        }

        let all_required_succeeded = work_steps
            .iter()
            .filter(|s| !s.kind.is_skippable())
            .all(|s| s.state == StepState::Succeeded);
        if all_required_succeeded {
            ProviderTaskState::Completed
        } else {
            ProviderTaskState::Incomplete
        }
    }

    /// Applies a forward-only state transition.
    ///
    /// Terminal records reject every change; `finished_at` is stamped
    /// exactly once, on the first arrival in a terminal state.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is already terminal and the target
    /// differs.
    pub fn set_state(&mut self, target: ProviderTaskState) -> Result<()> {
        if self.state == target {
            return Ok(());
        }
        if self.state.is_terminal() {
            return Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: target.to_string(),
                reason: "provider record is terminal".to_string(),
            });
        }

        let now = Utc::now();
        if self.started_at.is_none() && target != ProviderTaskState::Pending {
            self.started_at = Some(now);
        }
        if target.is_terminal() && self.finished_at.is_none() {
            self.finished_at = Some(now);
        }
        self.state = target;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StepKind;
    use crate::step::{FailureKind, FailureRecord};
    use datapack_core::ArtifactId;

    fn record_with_steps(kinds: &[StepKind]) -> ProviderTaskRecord {
        let mut record = ProviderTaskRecord::new(ProviderKind::Osm, "osm", "OpenStreetMap");
        record.steps = kinds.iter().map(|k| StepRecord::new(*k)).collect();
        record
    }

    fn run_all(record: &mut ProviderTaskRecord, outcome: StepState) {
        for step in &mut record.steps {
            step.transition_to(StepState::Running).unwrap();
            match outcome {
                StepState::Succeeded => step.succeed(ArtifactId::generate()).unwrap(),
                StepState::Failed => step
                    .fail(FailureRecord::new(FailureKind::Operation, "boom"))
                    .unwrap(),
                StepState::Cancelled => step.cancel().unwrap(),
                _ => unreachable!("terminal outcomes only"),
            }
        }
    }

    #[test]
    fn completed_when_all_required_steps_succeed() {
        let mut record = record_with_steps(&[StepKind::OsmCollection, StepKind::ConvertShp]);
        run_all(&mut record, StepState::Succeeded);
        assert_eq!(record.aggregate_state(), ProviderTaskState::Completed);
    }

    #[test]
    fn incomplete_when_any_step_fails() {
        let mut record = record_with_steps(&[StepKind::OsmCollection, StepKind::ConvertShp]);
        record.steps[0]
            .transition_to(StepState::Running)
            .unwrap();
        record.steps[0].succeed(ArtifactId::generate()).unwrap();
        record.steps[1]
            .transition_to(StepState::Running)
            .unwrap();
        record.steps[1]
            .fail(FailureRecord::new(FailureKind::Operation, "ogr2ogr exited 1"))
            .unwrap();

        assert_eq!(record.aggregate_state(), ProviderTaskState::Incomplete);
    }

    #[test]
    fn cancelled_only_without_failures() {
        let mut record = record_with_steps(&[StepKind::OsmCollection, StepKind::ConvertShp]);
        run_all(&mut record, StepState::Cancelled);
        assert_eq!(record.aggregate_state(), ProviderTaskState::Cancelled);

        // A failure anywhere turns cancellation into incomplete.
        let mut record = record_with_steps(&[StepKind::OsmCollection, StepKind::ConvertShp]);
        record.steps[0]
            .transition_to(StepState::Running)
            .unwrap();
        record.steps[0]
            .fail(FailureRecord::new(FailureKind::Operation, "boom"))
            .unwrap();
        record.steps[1].cancel().unwrap();
        assert_eq!(record.aggregate_state(), ProviderTaskState::Incomplete);
    }

    #[test]
    fn skippable_steps_do_not_hold_back_completion() {
        let mut record =
            record_with_steps(&[StepKind::SelectionExport, StepKind::OsmCollection]);
        // Selection export cancelled, the real work succeeded.
        record.steps[0].cancel().unwrap();
        record.steps[1]
            .transition_to(StepState::Running)
            .unwrap();
        record.steps[1].succeed(ArtifactId::generate()).unwrap();

        assert_eq!(record.aggregate_state(), ProviderTaskState::Completed);
    }

    #[test]
    fn set_state_is_forward_only() {
        let mut record = record_with_steps(&[StepKind::OsmCollection]);
        record.set_state(ProviderTaskState::Running).unwrap();
        record.set_state(ProviderTaskState::Completed).unwrap();
        assert!(record.finished_at.is_some());

        let finished = record.finished_at;
        assert!(record.set_state(ProviderTaskState::Running).is_err());
        // Idempotent for the same terminal state; timestamp unchanged.
        record.set_state(ProviderTaskState::Completed).unwrap();
        assert_eq!(record.finished_at, finished);
    }

    #[test]
    fn run_record_is_hidden_pseudo_provider() {
        let record = ProviderTaskRecord::run_record();
        assert!(record.is_run_record());
        assert!(!record.display);
        assert!(record.provider.is_none());
    }
}
