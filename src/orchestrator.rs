//! Task lifecycle owner: one asynchronous worker per task.
//!
//! The orchestrator is the only writer of a task after creation. Each
//! worker queues for an admission permit (tasks beyond the concurrency
//! limit wait in `Created`), then drives the iteration engine until a
//! terminal state. Cancellation is checked between capability calls, never
//! mid-call; a cancelled task is finalized as `Failed`/"cancelled".
//!
//! Capability errors are classified here: whatever the engine lets escape
//! is an infrastructure fault, terminal and non-retried. The raw error is
//! logged, not stored on the task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::capability::CapabilitySet;
use crate::engine::IterationEngine;
use crate::errors::{EngineError, StoreError};
use crate::store::{TaskFields, TaskStore};
use crate::task::{TaskError, TaskStatus};

pub struct Orchestrator {
    store: TaskStore,
    engine: IterationEngine,
    admission: Arc<Semaphore>,
    workers: Mutex<HashMap<Uuid, CancellationToken>>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        store: TaskStore,
        capabilities: CapabilitySet,
        max_concurrent: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            engine: IterationEngine::new(store.clone(), capabilities),
            store,
            admission: Arc::new(Semaphore::new(max_concurrent)),
            workers: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Fire-and-continue: start a worker for the task and return
    /// immediately. The protocol server calls this right after creating
    /// the store record.
    pub fn spawn(self: &Arc<Self>, id: Uuid) {
        let token = self.shutdown.child_token();
        self.workers.lock().unwrap().insert(id, token.clone());
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            orchestrator.run_task(id, token).await;
            orchestrator.workers.lock().unwrap().remove(&id);
        });
    }

    async fn run_task(&self, id: Uuid, token: CancellationToken) {
        // Admission control: the task stays Created while queued.
        let _permit = tokio::select! {
            _ = token.cancelled() => {
                self.finalize(id, TaskError::cancelled()).await;
                return;
            }
            permit = self.admission.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        tracing::info!(task = %id, "task admitted");
        if let Err(e) = self
            .store
            .transition(id, TaskStatus::Specifying, TaskFields::default())
            .await
        {
            tracing::warn!(task = %id, error = %e, "could not start task");
            return;
        }

        loop {
            // Suspension point between capability calls; in-flight calls
            // are never killed mid-call.
            if token.is_cancelled() {
                tracing::info!(task = %id, "task cancelled");
                self.finalize(id, TaskError::cancelled()).await;
                break;
            }
            match self.engine.step(id).await {
                Ok(status) if status.is_terminal() => {
                    tracing::info!(task = %id, status = %status, "task finished");
                    break;
                }
                Ok(_) => {}
                Err(EngineError::Capability(err)) => {
                    tracing::error!(task = %id, error = %err, "capability failure");
                    self.finalize(
                        id,
                        TaskError::infrastructure(format!(
                            "{} capability failed",
                            err.capability()
                        )),
                    )
                    .await;
                    break;
                }
                Err(err) => {
                    tracing::error!(task = %id, error = %err, "orchestration failure");
                    self.finalize(id, TaskError::infrastructure("internal orchestration error"))
                        .await;
                    break;
                }
            }
        }
    }

    /// Mark the task failed with `error`. A task that is already terminal
    /// stays exactly as it is.
    async fn finalize(&self, id: Uuid, error: TaskError) {
        match self
            .store
            .transition(
                id,
                TaskStatus::Failed,
                TaskFields {
                    error: Some(error),
                    ..Default::default()
                },
            )
            .await
        {
            Ok(_) | Err(StoreError::Terminal(_)) => {}
            Err(e) => tracing::warn!(task = %id, error = %e, "could not finalize task"),
        }
    }

    /// Client-initiated cancellation. The worker stops before its next
    /// capability call.
    pub async fn cancel(&self, id: Uuid) -> Result<(), StoreError> {
        let task = self.store.get(id).await?;
        if task.status.is_terminal() {
            return Err(StoreError::Terminal(id));
        }
        let token = self.workers.lock().unwrap().get(&id).cloned();
        match token {
            Some(token) => token.cancel(),
            // No live worker (e.g. a crash between create and spawn):
            // finalize directly so the client still gets a terminal state.
            None => self.finalize(id, TaskError::cancelled()).await,
        }
        Ok(())
    }

    /// Server shutdown: cancel every worker. Each stops before its next
    /// capability call and finalizes its task.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
