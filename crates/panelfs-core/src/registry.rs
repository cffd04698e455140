//! In-memory task registry.
//!
//! The registry is the single owner of every [`TaskRecord`]. Records live in
//! a concurrent map keyed by id with one lock per record, so mutations of a
//! given task are serialized while unrelated tasks never contend. Every
//! applied transition is published on a broadcast channel.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{RegistryError, TaskError, TaskFailure};
use crate::task::{TaskId, TaskKind, TaskPayload, TaskRecord, TaskStatus};
use crate::TASK_EVENT_CHANNEL_SIZE;

/// Status filter for [`TaskRegistry::list`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    /// Accepted statuses; empty accepts all.
    pub statuses: Vec<TaskStatus>,
}

impl TaskFilter {
    /// Match every task.
    pub fn all() -> Self {
        Self::default()
    }

    /// Match pending and running tasks.
    pub fn active() -> Self {
        Self::with_statuses([TaskStatus::Pending, TaskStatus::Running])
    }

    /// Match the given statuses.
    pub fn with_statuses(statuses: impl IntoIterator<Item = TaskStatus>) -> Self {
        Self {
            statuses: statuses.into_iter().collect(),
        }
    }

    /// Check a record against the filter.
    pub fn matches(&self, record: &TaskRecord) -> bool {
        self.statuses.is_empty() || self.statuses.contains(&record.status)
    }
}

impl FromStr for TaskFilter {
    type Err = TaskError;

    /// Parse a comma-separated status list such as `"running,pending"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let statuses = s
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                part.parse::<TaskStatus>()
                    .map_err(|_| TaskError::InvalidPayload(format!("unknown status '{part}'")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { statuses })
    }
}

#[derive(Debug)]
struct TaskSlot {
    record: Mutex<TaskRecord>,
    cancel: CancellationToken,
}

/// Arena of task records keyed by id.
#[derive(Debug)]
pub struct TaskRegistry {
    tasks: DashMap<TaskId, Arc<TaskSlot>>,
    events: broadcast::Sender<TaskRecord>,
}

impl TaskRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(TASK_EVENT_CHANNEL_SIZE);
        Self {
            tasks: DashMap::new(),
            events,
        }
    }

    /// Subscribe to record snapshots published on every transition.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskRecord> {
        self.events.subscribe()
    }

    /// Allocate a pending record for `payload`.
    pub fn create(&self, kind: TaskKind, payload: TaskPayload) -> Result<TaskId, RegistryError> {
        if payload.kind() != kind {
            return Err(TaskError::PayloadMismatch {
                expected: kind,
                found: payload.kind(),
            }
            .into());
        }
        payload.validate()?;

        let record = TaskRecord::new(payload);
        let id = record.id;
        let slot = Arc::new(TaskSlot {
            record: Mutex::new(record.clone()),
            cancel: CancellationToken::new(),
        });
        self.tasks.insert(id, slot);

        info!(task_id = %id, %kind, "task created");
        let _ = self.events.send(record);
        Ok(id)
    }

    /// Snapshot of a record.
    pub fn get(&self, id: TaskId) -> Result<TaskRecord, RegistryError> {
        let slot = self.slot(id)?;
        let record = slot.record.lock().clone();
        Ok(record)
    }

    /// The cancellation token associated with a task.
    pub fn cancellation_token(&self, id: TaskId) -> Result<CancellationToken, RegistryError> {
        Ok(self.slot(id)?.cancel.clone())
    }

    /// Move a pending task to running and hand out its cancellation token.
    pub fn start(&self, id: TaskId) -> Result<CancellationToken, RegistryError> {
        let slot = self.slot(id)?;
        let snapshot = {
            let mut record = slot.record.lock();
            if !record.transition(TaskStatus::Running) {
                return Err(RegistryError::NotPending {
                    id,
                    status: record.status,
                });
            }
            record.message = "Starting".to_string();
            record.clone()
        };

        debug!(task_id = %id, "task running");
        let _ = self.events.send(snapshot);
        Ok(slot.cancel.clone())
    }

    /// Record progress and the current phase. Ignored once the task is
    /// terminal; returns whether the update was applied.
    pub fn update_progress(&self, id: TaskId, progress: u8, message: impl Into<String>) -> bool {
        let message = message.into();
        self.apply(id, |record| record.set_progress(progress, message))
    }

    /// Transition to completed. Idempotent.
    pub fn complete(&self, id: TaskId) -> bool {
        let applied = self.apply(id, |record| {
            if record.transition(TaskStatus::Completed) {
                record.message = "Completed".to_string();
                true
            } else {
                false
            }
        });
        if applied {
            info!(task_id = %id, "task completed");
        }
        applied
    }

    /// Transition to failed with `failure`. Idempotent.
    pub fn fail(&self, id: TaskId, failure: TaskFailure) -> bool {
        let message = failure.to_string();
        let applied = self.apply(id, |record| {
            if record.transition(TaskStatus::Failed) {
                record.message = message.clone();
                record.error = Some(failure);
                true
            } else {
                false
            }
        });
        if applied {
            tracing::error!(task_id = %id, error = %message, "task failed");
        }
        applied
    }

    /// Transition to cancelled and signal the executor. Idempotent; returns
    /// whether this call changed the status.
    pub fn cancel(&self, id: TaskId) -> Result<bool, RegistryError> {
        let slot = self.slot(id)?;
        let snapshot = {
            let mut record = slot.record.lock();
            if !record.transition(TaskStatus::Cancelled) {
                return Ok(false);
            }
            record.message = "Cancelled".to_string();
            record.clone()
        };
        slot.cancel.cancel();

        info!(task_id = %id, "task cancelled");
        let _ = self.events.send(snapshot);
        Ok(true)
    }

    /// Records matching `filter`, oldest first.
    pub fn list(&self, filter: &TaskFilter) -> Vec<TaskRecord> {
        let mut records: Vec<TaskRecord> = self
            .tasks
            .iter()
            .map(|entry| entry.value().record.lock().clone())
            .filter(|record| filter.matches(record))
            .collect();
        records.sort_by_key(|record| record.created_at);
        records
    }

    /// Remove a terminal record.
    pub fn delete(&self, id: TaskId) -> Result<TaskRecord, RegistryError> {
        let slot = self.slot(id)?;
        let record = slot.record.lock().clone();
        if !record.is_terminal() {
            return Err(RegistryError::NotTerminal {
                id,
                status: record.status,
            });
        }
        self.tasks.remove(&id);
        debug!(task_id = %id, "task record deleted");
        Ok(record)
    }

    /// Drop terminal records not updated within `older_than`. Returns the
    /// number of records removed.
    pub fn prune_finished(&self, older_than: Duration) -> usize {
        let Ok(window) = chrono::Duration::from_std(older_than) else {
            return 0;
        };
        let cutoff = Utc::now() - window;
        let before = self.tasks.len();
        self.tasks.retain(|_, slot| {
            let record = slot.record.lock();
            !(record.is_terminal() && record.updated_at < cutoff)
        });
        let removed = before.saturating_sub(self.tasks.len());
        if removed > 0 {
            debug!(removed, "pruned finished tasks");
        }
        removed
    }

    /// Number of records held.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Check if the registry holds no records.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn slot(&self, id: TaskId) -> Result<Arc<TaskSlot>, RegistryError> {
        self.tasks
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(RegistryError::NotFound(id))
    }

    /// Apply `f` under the record's lock and publish the result if it changed.
    fn apply(&self, id: TaskId, f: impl FnOnce(&mut TaskRecord) -> bool) -> bool {
        let Ok(slot) = self.slot(id) else {
            return false;
        };
        let snapshot = {
            let mut record = slot.record.lock();
            if !f(&mut record) {
                return false;
            }
            record.clone()
        };
        let _ = self.events.send(snapshot);
        true
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}
