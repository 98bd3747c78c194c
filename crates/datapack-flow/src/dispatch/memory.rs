//! In-memory step queue.
//!
//! Priority-ordered, deduplicating, single-process. Suitable for tests and
//! single-node deployments; messages are not visible across process
//! boundaries and are lost when the process exits.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use ulid::Ulid;

use super::{EnqueueOptions, EnqueueResult, Envelope, QueueEntry, StepQueue};
use crate::error::{Error, Result};

/// Internal queue state protected by a single lock.
#[derive(Debug, Default)]
struct QueueState {
    /// Entries with their insertion sequence for FIFO tie-breaking.
    entries: Vec<(u64, QueueEntry)>,
    seen_keys: HashMap<String, String>,
    next_seq: u64,
    consuming: bool,
}

/// Converts a lock poison error to a dispatch error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::dispatch("step queue lock poisoned")
}

/// In-memory priority queue implementing [`StepQueue`].
///
/// Delivery order is highest wire priority first, FIFO within a priority.
/// An interrupt enqueued behind a backlog of normal dispatches is therefore
/// taken first.
#[derive(Debug)]
pub struct InMemoryStepQueue {
    name: String,
    state: RwLock<QueueState>,
    max_capacity: Option<usize>,
}

impl Default for InMemoryStepQueue {
    fn default() -> Self {
        Self::new("default")
    }
}

impl InMemoryStepQueue {
    /// Creates a new queue.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(QueueState {
                consuming: true,
                ..QueueState::default()
            }),
            max_capacity: None,
        }
    }

    /// Creates a queue with a maximum capacity.
    #[must_use]
    pub fn with_capacity(name: impl Into<String>, max_capacity: usize) -> Self {
        let mut queue = Self::new(name);
        queue.max_capacity = Some(max_capacity);
        queue
    }

    /// Returns true if this client is still consuming.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn is_consuming(&self) -> Result<bool> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.consuming)
    }

    /// Resumes consumption after a `cancel_consumers` call.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn resume_consumers(&self) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.consuming = true;
        drop(state);
        Ok(())
    }
}

#[async_trait]
impl StepQueue for InMemoryStepQueue {
    async fn enqueue(&self, envelope: Envelope, options: EnqueueOptions) -> Result<EnqueueResult> {
        let idempotency_key = envelope.idempotency_key();
        let priority = options
            .priority
            .unwrap_or_else(|| envelope.default_priority().value());

        let mut state = self.state.write().map_err(poison_err)?;

        if let Some(existing) = state.seen_keys.get(&idempotency_key) {
            return Ok(EnqueueResult::Deduplicated {
                existing_message_id: existing.clone(),
            });
        }

        if let Some(max) = self.max_capacity {
            if state.entries.len() >= max {
                return Ok(EnqueueResult::QueueFull);
            }
        }

        let message_id = Ulid::new().to_string();
        let seq = state.next_seq;
        state.next_seq += 1;
        state
            .seen_keys
            .insert(idempotency_key.clone(), message_id.clone());
        state.entries.push((
            seq,
            QueueEntry {
                message_id: message_id.clone(),
                idempotency_key,
                priority,
                envelope,
            },
        ));
        drop(state);

        Ok(EnqueueResult::Enqueued { message_id })
    }

    async fn take(&self) -> Result<Option<QueueEntry>> {
        let mut state = self.state.write().map_err(poison_err)?;
        if !state.consuming || state.entries.is_empty() {
            return Ok(None);
        }

        // Highest priority wins; FIFO within a priority.
        let best = state
            .entries
            .iter()
            .enumerate()
            .max_by(|(_, (seq_a, a)), (_, (seq_b, b))| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| seq_b.cmp(seq_a))
            })
            .map(|(idx, _)| idx);

        let entry = best.map(|idx| state.entries.remove(idx).1);
        if let Some(ref entry) = entry {
            state.seen_keys.remove(&entry.idempotency_key);
        }
        drop(state);
        Ok(entry)
    }

    async fn queue_depth(&self) -> Result<usize> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.entries.len())
    }

    async fn cancel_consumers(&self) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.consuming = false;
        drop(state);
        Ok(())
    }

    fn queue_name(&self) -> &str {
        &self.name
    }
}
