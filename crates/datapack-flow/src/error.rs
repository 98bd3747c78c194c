//! Error types for the export orchestration domain.

use datapack_core::{ProviderTaskId, RunId, StepId};

/// The result type used throughout datapack-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in orchestration operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A request was rejected synchronously before anything persisted.
    #[error("validation error: {message}")]
    Validation {
        /// Why the request was rejected.
        message: String,
    },

    /// A cycle was detected in the dependency graph.
    #[error("cycle detected in dependency graph: {cycle:?}")]
    CycleDetected {
        /// The cycle path (step names or ids).
        cycle: Vec<String>,
    },

    /// A run was not found.
    #[error("run not found: {run_id}")]
    RunNotFound {
        /// The run id that was not found.
        run_id: RunId,
    },

    /// A provider task record was not found.
    #[error("provider task not found: {provider_task_id}")]
    ProviderTaskNotFound {
        /// The provider task id that was not found.
        provider_task_id: ProviderTaskId,
    },

    /// A step record was not found in the plan or run.
    #[error("step not found: {step_id}")]
    StepNotFound {
        /// The step id that was not found.
        step_id: StepId,
    },

    /// An invalid state transition was attempted.
    #[error("invalid state transition: {from} -> {to} ({reason})")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
        /// Why the transition is invalid.
        reason: String,
    },

    /// A DAG node was not found (internal graph operation error).
    #[error("DAG node not found: {node}")]
    DagNodeNotFound {
        /// The node identifier (index or value).
        node: String,
    },

    /// Plan generation failed.
    #[error("plan generation failed: {message}")]
    PlanGenerationFailed {
        /// Description of the failure.
        message: String,
    },

    /// The plan exceeds the per-run step cap.
    #[error("plan too large: {step_count} steps exceeds cap of {max_steps}")]
    PlanTooLarge {
        /// Number of steps in the attempted plan.
        step_count: usize,
        /// The configured cap.
        max_steps: usize,
    },

    /// An archive covering this exact provider set already exists.
    #[error("duplicate archive: coverage {coverage} already archived for run {run_id}")]
    DuplicateArchive {
        /// The run whose coverage collided.
        run_id: RunId,
        /// Canonical coverage description.
        coverage: String,
    },

    /// A written archive failed integrity verification. Fatal for that
    /// archive; never retried automatically.
    #[error("archive integrity error: {message}")]
    ArchiveIntegrity {
        /// Description of the corruption.
        message: String,
    },

    /// A dispatch operation failed.
    #[error("dispatch error: {message}")]
    Dispatch {
        /// Description of the dispatch failure.
        message: String,
    },

    /// A capacity provider call failed. Logged by the scaler loop and
    /// retried on the next tick; never blocks step scheduling.
    #[error("fleet scaling error: {message}")]
    Scaling {
        /// Description of the scaling failure.
        message: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An error from datapack-core.
    #[error("core error: {0}")]
    Core(#[from] datapack_core::Error),
}

impl Error {
    /// Creates a new validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new dispatch error.
    #[must_use]
    pub fn dispatch(message: impl Into<String>) -> Self {
        Self::Dispatch {
            message: message.into(),
        }
    }

    /// Creates a new scaling error.
    #[must_use]
    pub fn scaling(message: impl Into<String>) -> Self {
        Self::Scaling {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_display() {
        let err = Error::validation("licenses not accepted: osm-odbl");
        assert!(err.to_string().contains("licenses not accepted"));
    }

    #[test]
    fn duplicate_archive_display() {
        let err = Error::DuplicateArchive {
            run_id: RunId::generate(),
            coverage: "a,b".into(),
        };
        assert!(err.to_string().contains("duplicate archive"));
    }

    #[test]
    fn state_transition_error_display() {
        let err = Error::InvalidStateTransition {
            from: "SUCCEEDED".into(),
            to: "RUNNING".into(),
            reason: "terminal states accept no transitions".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("SUCCEEDED"));
        assert!(msg.contains("RUNNING"));
    }
}
