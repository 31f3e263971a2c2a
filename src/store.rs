//! In-memory task store — the only shared mutable structure in the core.
//!
//! All mutation goes through atomic operations taken under a single write
//! guard, so a poller can never observe a half-updated task. `get` returns
//! a cloned snapshot; callers cannot corrupt in-flight state. Transitions
//! are validated against the state machine in [`crate::task::TaskStatus`],
//! which is what makes terminal tasks immutable.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::errors::StoreError;
use crate::task::{ArtifactSet, IterationRecord, Task, TaskError, TaskStatus};

/// Fields updated together with a status transition. Only `Some` fields are
/// written; everything else on the task is left untouched.
#[derive(Debug, Default, Clone)]
pub struct TaskFields {
    pub spec: Option<String>,
    pub code: Option<String>,
    pub artifacts: Option<ArtifactSet>,
    pub error: Option<TaskError>,
}

/// Keyed storage for tasks, internally synchronized. Cheap to clone; all
/// clones share the same map.
#[derive(Clone, Default)]
pub struct TaskStore {
    inner: Arc<RwLock<HashMap<Uuid, Task>>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a task in `Created` state and return its snapshot.
    pub async fn create(&self, prompt: &str, max_iterations: u32) -> Task {
        let task = Task::new(prompt, max_iterations);
        let snapshot = task.clone();
        self.inner.write().await.insert(task.id, task);
        snapshot
    }

    /// Immutable snapshot of a task. `NotFound` if the id is unknown or the
    /// task has been swept after its retention window.
    pub async fn get(&self, id: Uuid) -> Result<Task, StoreError> {
        self.inner
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    /// Append one iteration record to the ledger. The store owns the
    /// sequence numbering so the ledger is always gapless and ordered.
    pub async fn append_iteration(
        &self,
        id: Uuid,
        mut record: IterationRecord,
    ) -> Result<Task, StoreError> {
        let mut tasks = self.inner.write().await;
        let task = tasks.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if task.status.is_terminal() {
            return Err(StoreError::Terminal(id));
        }
        record.sequence = task.iterations.len() as u32 + 1;
        task.iterations.push(record);
        task.updated_at = Utc::now();
        Ok(task.clone())
    }

    /// Move a task to `new_status` and apply `fields`, atomically with
    /// respect to concurrent readers. Rejects transitions the state machine
    /// does not permit, including any mutation of a terminal task.
    pub async fn transition(
        &self,
        id: Uuid,
        new_status: TaskStatus,
        fields: TaskFields,
    ) -> Result<Task, StoreError> {
        let mut tasks = self.inner.write().await;
        let task = tasks.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if task.status.is_terminal() {
            return Err(StoreError::Terminal(id));
        }
        if !task.status.can_transition_to(new_status) {
            return Err(StoreError::InvalidTransition {
                from: task.status,
                to: new_status,
            });
        }
        task.status = new_status;
        if let Some(spec) = fields.spec {
            task.spec = Some(spec);
        }
        if let Some(code) = fields.code {
            task.code = Some(code);
        }
        if let Some(artifacts) = fields.artifacts {
            task.artifacts = Some(artifacts);
        }
        if let Some(error) = fields.error {
            task.error = Some(error);
        }
        task.updated_at = Utc::now();
        Ok(task.clone())
    }

    /// Drop terminal tasks whose last update is older than `retention`.
    /// Returns how many were removed. In-flight tasks are never swept.
    pub async fn sweep_expired(&self, retention: Duration) -> usize {
        let cutoff = Utc::now() - retention;
        let mut tasks = self.inner.write().await;
        let before = tasks.len();
        tasks.retain(|_, task| !(task.status.is_terminal() && task.updated_at < cutoff));
        before - tasks.len()
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{ExecutionOutcome, FailureKind};

    fn exec_failure_record() -> IterationRecord {
        IterationRecord {
            sequence: 0,
            code: "bad code".to_string(),
            execution: ExecutionOutcome::Failure {
                error: "NameError".to_string(),
            },
            review: None,
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_create_and_get_snapshot() {
        let store = TaskStore::new();
        let task = store.create("a cube", 3).await;
        let fetched = store.get(task.id).await.unwrap();
        assert_eq!(fetched.id, task.id);
        assert_eq!(fetched.prompt, "a cube");
        assert_eq!(fetched.status, TaskStatus::Created);
        assert_eq!(fetched.max_iterations, 3);
    }

    #[tokio::test]
    async fn test_get_unknown_id_is_not_found() {
        let store = TaskStore::new();
        let id = Uuid::new_v4();
        assert_eq!(store.get(id).await.unwrap_err(), StoreError::NotFound(id));
    }

    #[tokio::test]
    async fn test_snapshot_is_detached_from_stored_state() {
        let store = TaskStore::new();
        let task = store.create("a cube", 3).await;
        let mut snapshot = store.get(task.id).await.unwrap();
        snapshot.prompt = "mutated".to_string();
        snapshot.status = TaskStatus::Approved;
        let fresh = store.get(task.id).await.unwrap();
        assert_eq!(fresh.prompt, "a cube");
        assert_eq!(fresh.status, TaskStatus::Created);
    }

    #[tokio::test]
    async fn test_transition_applies_fields() {
        let store = TaskStore::new();
        let task = store.create("a cube", 3).await;
        store
            .transition(task.id, TaskStatus::Specifying, TaskFields::default())
            .await
            .unwrap();
        let updated = store
            .transition(
                task.id,
                TaskStatus::Coding,
                TaskFields {
                    spec: Some("10x10x10 cube".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.status, TaskStatus::Coding);
        assert_eq!(updated.spec.as_deref(), Some("10x10x10 cube"));
    }

    #[tokio::test]
    async fn test_invalid_transition_rejected() {
        let store = TaskStore::new();
        let task = store.create("a cube", 3).await;
        let err = store
            .transition(task.id, TaskStatus::Reviewing, TaskFields::default())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::InvalidTransition {
                from: TaskStatus::Created,
                to: TaskStatus::Reviewing,
            }
        );
    }

    #[tokio::test]
    async fn test_terminal_task_is_immutable() {
        let store = TaskStore::new();
        let task = store.create("a cube", 3).await;
        store
            .transition(
                task.id,
                TaskStatus::Failed,
                TaskFields {
                    error: Some(TaskError::cancelled()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let err = store
            .transition(task.id, TaskStatus::Specifying, TaskFields::default())
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::Terminal(task.id));

        let err = store
            .append_iteration(task.id, exec_failure_record())
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::Terminal(task.id));

        let stored = store.get(task.id).await.unwrap();
        assert_eq!(stored.error.as_ref().unwrap().kind, FailureKind::Cancelled);
        assert_eq!(stored.error.as_ref().unwrap().message, "cancelled");
    }

    #[tokio::test]
    async fn test_append_assigns_sequence_numbers() {
        let store = TaskStore::new();
        let task = store.create("a cube", 5).await;
        store.append_iteration(task.id, exec_failure_record()).await.unwrap();
        let updated = store
            .append_iteration(task.id, exec_failure_record())
            .await
            .unwrap();
        assert_eq!(updated.iterations.len(), 2);
        assert_eq!(updated.iterations[0].sequence, 1);
        assert_eq!(updated.iterations[1].sequence, 2);
        assert_eq!(updated.iteration_count(), 2);
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired_terminal_tasks() {
        let store = TaskStore::new();
        let active = store.create("active", 3).await;
        let done = store.create("done", 3).await;
        store
            .transition(done.id, TaskStatus::Failed, TaskFields::default())
            .await
            .unwrap();

        // Nothing is old enough yet.
        assert_eq!(store.sweep_expired(Duration::seconds(3600)).await, 0);

        // With a zero retention window the terminal task goes, the active
        // one stays.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert_eq!(store.sweep_expired(Duration::zero()).await, 1);
        assert!(store.get(active.id).await.is_ok());
        assert_eq!(
            store.get(done.id).await.unwrap_err(),
            StoreError::NotFound(done.id)
        );
    }
}
