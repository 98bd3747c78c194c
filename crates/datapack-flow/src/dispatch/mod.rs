//! Step dispatch abstraction.
//!
//! This module provides:
//!
//! - [`Envelope`]: Serializable dispatch payloads (execution and interrupt)
//! - [`Priority`]: The dispatch priority ladder; interrupts preempt all
//!   normal work
//! - [`StepQueue`]: Trait for queue backends (in-memory for tests, broker
//!   management API for production)
//!
//! ## Design Principles
//!
//! - **Backend agnostic**: The scheduler and workers never see queue
//!   internals
//! - **Idempotent dispatch**: `(step, attempt)` keys deduplicate repeat
//!   enqueues of the same invocation
//! - **Priority preemption**: Interrupt messages carry a priority strictly
//!   greater than any normal dispatch priority

pub mod broker;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use datapack_core::{ProviderTaskId, RunId, StepId};

use crate::catalog::StepKind;
use crate::error::Result;

/// Dispatch priority ladder.
///
/// Higher values win. [`Priority::Interrupt`] is strictly greater than every
/// normal dispatch priority so kill messages preempt queued work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Normal step execution.
    Task,
    /// Provider finalization.
    FinalizeProvider,
    /// Run finalization.
    FinalizeRun,
    /// Cancellation interrupt; preempts everything else.
    Interrupt,
}

impl Priority {
    /// Returns the wire priority value (higher wins).
    #[must_use]
    pub const fn value(self) -> u8 {
        match self {
            Self::Task => 50,
            Self::FinalizeProvider => 70,
            Self::FinalizeRun => 80,
            Self::Interrupt => 90,
        }
    }

    /// Returns the dispatch priority for a step kind.
    #[must_use]
    pub const fn for_kind(kind: StepKind) -> Self {
        match kind {
            StepKind::FinalizeProvider => Self::FinalizeProvider,
            StepKind::FinalizeRun => Self::FinalizeRun,
            _ => Self::Task,
        }
    }
}

/// Payload dispatching one step execution to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepEnvelope {
    /// Run the step belongs to.
    pub run_id: RunId,
    /// Provider record the step belongs to.
    pub provider_task_id: ProviderTaskId,
    /// The step to execute.
    pub step_id: StepId,
    /// What the step does.
    pub kind: StepKind,
    /// Attempt number (1-indexed; >1 marks a retry invocation).
    pub attempt: u32,
    /// Correlation id for locking and cancellation.
    pub correlation_id: String,
    /// Result key of the upstream output this step consumes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_result_key: Option<String>,
    /// When the envelope was enqueued.
    pub enqueued_at: DateTime<Utc>,
}

/// Payload asking a worker to terminate a running step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterruptEnvelope {
    /// Run the step belongs to.
    pub run_id: RunId,
    /// Provider record the step belongs to.
    pub provider_task_id: ProviderTaskId,
    /// The step to interrupt.
    pub step_id: StepId,
    /// Correlation id captured when the interrupt was requested; the
    /// handler refuses to signal if the persisted record no longer matches.
    pub correlation_id: String,
    /// OS process id captured when the interrupt was requested.
    pub pid: i32,
    /// Who requested the cancellation.
    pub requested_by: String,
    /// When the interrupt was enqueued.
    pub enqueued_at: DateTime<Utc>,
}

/// A dispatch message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// Execute a step.
    Step(StepEnvelope),
    /// Terminate a running step.
    Interrupt(InterruptEnvelope),
}

impl Envelope {
    /// Returns the idempotency key deduplicating repeat enqueues.
    ///
    /// Step keys include the attempt so retries are distinguishable from
    /// duplicate dispatches of the same invocation.
    #[must_use]
    pub fn idempotency_key(&self) -> String {
        match self {
            Self::Step(e) => format!("step-{}-{}", e.step_id, e.attempt),
            Self::Interrupt(e) => format!("kill-{}-{}", e.step_id, e.pid),
        }
    }

    /// Returns the default priority for this envelope.
    #[must_use]
    pub const fn default_priority(&self) -> Priority {
        match self {
            Self::Step(e) => Priority::for_kind(e.kind),
            Self::Interrupt(_) => Priority::Interrupt,
        }
    }

    /// Returns the run this envelope targets.
    #[must_use]
    pub const fn run_id(&self) -> RunId {
        match self {
            Self::Step(e) => e.run_id,
            Self::Interrupt(e) => e.run_id,
        }
    }
}

/// Options for enqueueing.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Wire priority; defaults to the envelope's own priority when `None`.
    pub priority: Option<u8>,
    /// Backend routing key (e.g. a worker hostname queue).
    pub routing_key: Option<String>,
    /// Delay before the message becomes visible.
    pub delay: Option<Duration>,
}

impl EnqueueOptions {
    /// Creates default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the wire priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority.value());
        self
    }

    /// Sets a routing key.
    #[must_use]
    pub fn with_routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_key = Some(key.into());
        self
    }
}

/// Result of enqueuing a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueResult {
    /// Message was enqueued.
    Enqueued {
        /// Queue-specific message id.
        message_id: String,
    },
    /// Message was deduplicated against an already-enqueued invocation.
    Deduplicated {
        /// The existing message id.
        existing_message_id: String,
    },
    /// Queue is at capacity.
    QueueFull,
}

impl EnqueueResult {
    /// Returns true if the message was newly enqueued.
    #[must_use]
    pub const fn is_enqueued(&self) -> bool {
        matches!(self, Self::Enqueued { .. })
    }
}

/// A message taken from a queue.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    /// Queue-specific message id.
    pub message_id: String,
    /// Idempotency key the entry was deduplicated under.
    pub idempotency_key: String,
    /// Wire priority the entry was enqueued with.
    pub priority: u8,
    /// The payload.
    pub envelope: Envelope,
}

/// Queue abstraction for dispatching steps to workers.
///
/// Implementations target an in-memory queue (tests, single node) or a
/// message broker's management API. All methods are `Send + Sync` so queues
/// can be shared behind an `Arc`.
#[async_trait]
pub trait StepQueue: Send + Sync {
    /// Enqueues a message.
    async fn enqueue(&self, envelope: Envelope, options: EnqueueOptions) -> Result<EnqueueResult>;

    /// Takes the highest-priority message, if any.
    ///
    /// Returns `None` when the queue is empty or this client has cancelled
    /// its consumption (drain protocol).
    async fn take(&self) -> Result<Option<QueueEntry>>;

    /// Returns the approximate number of queued messages.
    async fn queue_depth(&self) -> Result<usize>;

    /// Stops this client's consumption: subsequent `take` calls return
    /// `None` while already-queued messages stay put for depth accounting.
    ///
    /// First stage of the scaler's drain protocol.
    async fn cancel_consumers(&self) -> Result<()>;

    /// Returns the queue's name.
    fn queue_name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step_envelope(attempt: u32) -> StepEnvelope {
        StepEnvelope {
            run_id: RunId::generate(),
            provider_task_id: ProviderTaskId::generate(),
            step_id: StepId::generate(),
            kind: StepKind::ConvertGpkg,
            attempt,
            correlation_id: "01ARZ3NDEKTSV4RRFFQ69G5FAV".into(),
            upstream_result_key: Some("source".into()),
            enqueued_at: Utc::now(),
        }
    }

    #[test]
    fn interrupt_priority_exceeds_all_normal_priorities() {
        for p in [Priority::Task, Priority::FinalizeProvider, Priority::FinalizeRun] {
            assert!(Priority::Interrupt.value() > p.value());
        }
    }

    #[test]
    fn finalize_priorities_exceed_task_priority() {
        assert!(Priority::FinalizeProvider.value() > Priority::Task.value());
        assert!(Priority::FinalizeRun.value() > Priority::FinalizeProvider.value());
    }

    #[test]
    fn idempotency_key_distinguishes_attempts() {
        let e1 = Envelope::Step(step_envelope(1));
        let mut inner = step_envelope(1);
        inner.attempt = 2;
        let mut e2 = Envelope::Step(inner);
        if let (Envelope::Step(a), Envelope::Step(b)) = (&e1, &mut e2) {
            b.step_id = a.step_id;
        }
        assert_ne!(e1.idempotency_key(), e2.idempotency_key());
    }

    #[test]
    fn envelope_serializes_tagged() {
        let envelope = Envelope::Step(step_envelope(1));
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("\"type\":\"step\""));
        let parsed: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.idempotency_key(), envelope.idempotency_key());
    }

    #[test]
    fn step_priority_follows_kind() {
        let mut inner = step_envelope(1);
        inner.kind = StepKind::FinalizeRun;
        assert_eq!(
            Envelope::Step(inner).default_priority(),
            Priority::FinalizeRun
        );
        assert_eq!(
            Envelope::Step(step_envelope(1)).default_priority(),
            Priority::Task
        );
    }
}
