//! Step execution state and lifecycle.
//!
//! This module provides:
//! - `StepState`: The state machine for one executable unit
//! - `StepRecord`: Persisted execution tracking for a step
//! - `FailureRecord`: Structured failure data attached to failed steps
//!
//! The state machine is deliberately small:
//!
//! ```text
//! ┌─────────┐   dispatched & locked   ┌─────────┐
//! │ PENDING │────────────────────────►│ RUNNING │
//! └─────────┘                         └─────────┘
//!      │                                   │
//!      │ upstream failed /        ┌────────┼──────────┐
//!      │ cancelled                │        │          │
//!      ▼                          ▼        ▼          ▼
//! ┌───────────┐            ┌───────────┐ ┌────────┐ ┌───────────┐
//! │ CANCELLED │            │ SUCCEEDED │ │ FAILED │ │ CANCELLED │
//! └───────────┘            └───────────┘ └────────┘ └───────────┘
//! ```
//!
//! Once terminal, a record accepts no further transitions; a duplicate
//! request for the same terminal state is an idempotent no-op.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use datapack_core::{ArtifactId, StepId};

use crate::catalog::StepKind;
use crate::error::{Error, Result};

/// Step execution state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepState {
    /// Created by the pipeline factory, not yet executing.
    Pending,
    /// A worker holds the execution lock and is executing.
    Running,
    /// Completed successfully.
    Succeeded,
    /// Execution failed; a failure record is attached.
    Failed,
    /// Interrupted, or never dispatched because an upstream step failed.
    Cancelled,
}

impl StepState {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub const fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Pending => matches!(target, Self::Running | Self::Cancelled),
            Self::Running => matches!(target, Self::Succeeded | Self::Failed | Self::Cancelled),
            Self::Succeeded | Self::Failed | Self::Cancelled => false,
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl Default for StepState {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Failure categories for step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// The conversion operation itself reported an error.
    Operation,
    /// The operation exceeded its time limit.
    Timeout,
    /// Network, storage or other environment failure.
    Infrastructure,
    /// Invalid provider configuration or missing secrets.
    Configuration,
    /// The step was interrupted by a cancel request.
    Cancelled,
    /// Unclassified failure.
    Unknown,
}

impl Default for FailureKind {
    fn default() -> Self {
        Self::Unknown
    }
}

/// Structured failure data attached to a failed step.
///
/// This is plain serializable data: kind, message and a stack summary as a
/// list of frame strings. Nothing here requires the original runtime to be
/// deserialized or re-raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    /// Failure category.
    pub kind: FailureKind,
    /// Human-readable message, surfaced through the status query interface.
    pub message: String,
    /// Condensed stack frames or context lines (may be empty).
    #[serde(default)]
    pub stack_summary: Vec<String>,
    /// When the failure was captured.
    pub occurred_at: DateTime<Utc>,
}

impl FailureRecord {
    /// Creates a new failure record.
    #[must_use]
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stack_summary: Vec::new(),
            occurred_at: Utc::now(),
        }
    }

    /// Attaches a stack summary.
    #[must_use]
    pub fn with_stack(mut self, frames: Vec<String>) -> Self {
        self.stack_summary = frames;
        self
    }

    /// Returns a one-line human-readable summary.
    #[must_use]
    pub fn summary(&self) -> String {
        format!("{:?}: {}", self.kind, self.message)
    }
}

/// Persisted execution record for one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    /// Unique step identifier.
    pub id: StepId,
    /// What this step does.
    pub kind: StepKind,
    /// Display name shown to users.
    pub name: String,
    /// Current state.
    pub state: StepState,
    /// Attempt number (1-indexed; incremented by provider-level retry).
    pub attempt: u32,
    /// Correlation id used by the locking layer and the kill controller.
    pub correlation_id: String,
    /// Hostname of the worker executing this step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    /// OS process id of the executing worker process.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    /// Result artifact handle (if succeeded).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ArtifactId>,
    /// Every failure captured for this step, latest last.
    #[serde(default)]
    pub failures: Vec<FailureRecord>,
    /// Whether this step's output is shown to users.
    pub display: bool,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When execution started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When execution finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    /// Creates a new pending step record.
    #[must_use]
    pub fn new(kind: StepKind) -> Self {
        Self {
            id: StepId::generate(),
            kind,
            name: kind.display_name().to_string(),
            state: StepState::Pending,
            attempt: 1,
            correlation_id: Ulid::new().to_string(),
            worker: None,
            pid: None,
            result: None,
            failures: Vec::new(),
            display: kind.is_display(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Creates a fresh record for a retry of this step.
    ///
    /// The new record keeps the identity (id, kind, name) but resets
    /// execution state, increments the attempt counter and rotates the
    /// correlation id so stale locks and interrupts cannot touch the retry.
    #[must_use]
    pub fn for_retry(&self) -> Self {
        Self {
            id: self.id,
            kind: self.kind,
            name: self.name.clone(),
            state: StepState::Pending,
            attempt: self.attempt + 1,
            correlation_id: Ulid::new().to_string(),
            worker: None,
            pid: None,
            result: None,
            failures: self.failures.clone(),
            display: self.display,
            created_at: self.created_at,
            started_at: None,
            finished_at: None,
        }
    }

    /// Returns true if the step is in a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Returns the latest failure, if any.
    #[must_use]
    pub fn latest_failure(&self) -> Option<&FailureRecord> {
        self.failures.last()
    }

    /// Transitions to a new state, stamping timestamps.
    ///
    /// # Errors
    ///
    /// Returns an error if the transition is invalid.
    #[tracing::instrument(
        skip(self),
        fields(step_id = %self.id, kind = %self.kind, from = %self.state, to = %target)
    )]
    pub fn transition_to(&mut self, target: StepState) -> Result<()> {
        if !self.state.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: target.to_string(),
                reason: if self.state.is_terminal() {
                    "terminal states accept no transitions".to_string()
                } else {
                    "not a valid step transition".to_string()
                },
            });
        }

        let now = Utc::now();
        match target {
            StepState::Running => {
                self.started_at = Some(now);
            }
            StepState::Succeeded | StepState::Failed | StepState::Cancelled => {
                self.finished_at = Some(now);
            }
            StepState::Pending => {}
        }
        self.state = target;
        Ok(())
    }

    /// Attempts a terminal transition idempotently.
    ///
    /// Returns `Ok(true)` if the transition was applied, `Ok(false)` if the
    /// record was already in the requested terminal state (no-op) or the
    /// request is for an older attempt. A request for a *different* terminal
    /// state than the one already recorded is an error.
    ///
    /// # Errors
    ///
    /// Returns an error if `target` is not terminal or conflicts with an
    /// existing terminal state.
    pub fn try_terminal_transition(&mut self, target: StepState, attempt: u32) -> Result<bool> {
        if !target.is_terminal() {
            return Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: target.to_string(),
                reason: "try_terminal_transition requires a terminal state".to_string(),
            });
        }

        // Late report from a previous attempt: ignore.
        if attempt < self.attempt {
            return Ok(false);
        }

        if self.state.is_terminal() {
            if self.state == target {
                return Ok(false);
            }
            return Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: target.to_string(),
                reason: "cannot move between terminal states".to_string(),
            });
        }

        self.transition_to(target)?;
        Ok(true)
    }

    /// Marks the step succeeded with its result artifact.
    ///
    /// # Errors
    ///
    /// Returns an error if the transition is invalid.
    pub fn succeed(&mut self, artifact: ArtifactId) -> Result<()> {
        self.result = Some(artifact);
        self.transition_to(StepState::Succeeded)
    }

    /// Marks the step failed with a failure record.
    ///
    /// # Errors
    ///
    /// Returns an error if the transition is invalid.
    pub fn fail(&mut self, failure: FailureRecord) -> Result<()> {
        self.failures.push(failure);
        self.result = None;
        self.transition_to(StepState::Failed)
    }

    /// Marks the step cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if the transition is invalid.
    pub fn cancel(&mut self) -> Result<()> {
        self.transition_to(StepState::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let mut step = StepRecord::new(StepKind::ConvertGpkg);
        assert_eq!(step.state, StepState::Pending);

        step.transition_to(StepState::Running).unwrap();
        assert!(step.started_at.is_some());

        step.succeed(ArtifactId::generate()).unwrap();
        assert_eq!(step.state, StepState::Succeeded);
        assert!(step.finished_at.is_some());
        assert!(step.result.is_some());
    }

    #[test]
    fn pending_cannot_jump_to_succeeded() {
        let mut step = StepRecord::new(StepKind::ConvertGpkg);
        assert!(step.transition_to(StepState::Succeeded).is_err());
    }

    #[test]
    fn terminal_states_accept_no_transitions() {
        let mut step = StepRecord::new(StepKind::ConvertShp);
        step.transition_to(StepState::Running).unwrap();
        step.fail(FailureRecord::new(FailureKind::Operation, "boom"))
            .unwrap();

        assert!(step.transition_to(StepState::Running).is_err());
        assert!(step.transition_to(StepState::Succeeded).is_err());
        assert!(step.transition_to(StepState::Cancelled).is_err());
        assert_eq!(step.state, StepState::Failed);
    }

    #[test]
    fn terminal_transition_is_idempotent_for_same_state() {
        let mut step = StepRecord::new(StepKind::ConvertShp);
        step.transition_to(StepState::Running).unwrap();

        assert!(step.try_terminal_transition(StepState::Cancelled, 1).unwrap());
        // Duplicate: no-op, not an error.
        assert!(!step.try_terminal_transition(StepState::Cancelled, 1).unwrap());
        // Conflicting terminal state: error.
        assert!(step.try_terminal_transition(StepState::Failed, 1).is_err());
    }

    #[test]
    fn terminal_transition_ignores_old_attempts() {
        let mut step = StepRecord::new(StepKind::ConvertGpkg);
        let retry = step.for_retry();
        assert_eq!(retry.attempt, 2);
        assert_ne!(retry.correlation_id, step.correlation_id);

        step = retry;
        step.transition_to(StepState::Running).unwrap();

        // A late report from attempt 1 must not affect attempt 2.
        assert!(!step.try_terminal_transition(StepState::Failed, 1).unwrap());
        assert_eq!(step.state, StepState::Running);
    }

    #[test]
    fn failures_accumulate() {
        let mut step = StepRecord::new(StepKind::WfsQuery);
        step.transition_to(StepState::Running).unwrap();
        step.fail(
            FailureRecord::new(FailureKind::Infrastructure, "connection reset")
                .with_stack(vec!["wfs_query:142".into()]),
        )
        .unwrap();

        let retry = step.for_retry();
        assert_eq!(retry.failures.len(), 1);
        assert_eq!(
            retry.latest_failure().unwrap().summary(),
            "Infrastructure: connection reset"
        );
    }

    #[test]
    fn pending_can_be_cancelled_directly() {
        let mut step = StepRecord::new(StepKind::ConvertKml);
        step.cancel().unwrap();
        assert_eq!(step.state, StepState::Cancelled);
        assert!(step.finished_at.is_some());
    }
}
