//! The iteration engine: exactly one capability invocation per step.
//!
//! Each call to [`IterationEngine::step`] performs the single capability
//! call the task's current status demands, records the result, and returns
//! the next status. Keeping steps this small makes every stage of the loop
//! independently observable and keeps the retry-budget check a hard
//! precondition in one place.
//!
//! Retry routing is deliberately asymmetric and must stay that way:
//! execution errors go straight back to code synthesis (cheap, localized
//! fix); visual mismatches re-enter through the specification capability so
//! that spec drift gets corrected, not just code bugs.

use chrono::Utc;
use uuid::Uuid;

use crate::capability::{CapabilitySet, RenderOutcome};
use crate::errors::EngineError;
use crate::store::{TaskFields, TaskStore};
use crate::task::{
    ArtifactSet, ExecutionOutcome, Feedback, IterationRecord, ReviewOutcome, Task, TaskError,
    TaskStatus,
};

pub struct IterationEngine {
    store: TaskStore,
    capabilities: CapabilitySet,
}

impl IterationEngine {
    pub fn new(store: TaskStore, capabilities: CapabilitySet) -> Self {
        Self {
            store,
            capabilities,
        }
    }

    /// Run the one capability call for the task's current status and move
    /// it to the next state. Returns the status the task is now in.
    ///
    /// Capability errors escape unclassified by design; the orchestrator
    /// turns them into terminal infrastructure failures.
    pub async fn step(&self, id: Uuid) -> Result<TaskStatus, EngineError> {
        let task = self.store.get(id).await?;
        match task.status {
            TaskStatus::Specifying => self.specify(&task).await,
            TaskStatus::Coding => self.code(&task).await,
            TaskStatus::Rendering => self.render(&task).await,
            TaskStatus::Reviewing => self.review(&task).await,
            other => Err(EngineError::Inconsistent {
                id,
                detail: format!("no engine step for status {}", other),
            }),
        }
    }

    async fn specify(&self, task: &Task) -> Result<TaskStatus, EngineError> {
        // Only visual-mismatch feedback re-enters through specification.
        let feedback = match task.last_feedback() {
            Some(Feedback::VisualMismatch(text)) => Some(text),
            _ => None,
        };
        let spec = self
            .capabilities
            .specification
            .produce_spec(&task.prompt, task.spec.as_deref(), feedback.as_deref())
            .await?;
        tracing::debug!(task = %task.id, "specification produced");
        self.store
            .transition(
                task.id,
                TaskStatus::Coding,
                TaskFields {
                    spec: Some(spec),
                    ..Default::default()
                },
            )
            .await?;
        Ok(TaskStatus::Coding)
    }

    async fn code(&self, task: &Task) -> Result<TaskStatus, EngineError> {
        let spec = task.spec.as_deref().ok_or_else(|| EngineError::Inconsistent {
            id: task.id,
            detail: "coding without a specification".to_string(),
        })?;
        // Execution-error text goes to the coder verbatim; after a spec
        // revision the fresh spec itself carries the guidance.
        let feedback = match task.last_feedback() {
            Some(Feedback::ExecutionError(text)) => Some(text),
            _ => None,
        };
        let code = self
            .capabilities
            .code_synthesis
            .produce_code(spec, task.code.as_deref(), feedback.as_deref())
            .await?;
        tracing::debug!(task = %task.id, "source produced");
        self.store
            .transition(
                task.id,
                TaskStatus::Rendering,
                TaskFields {
                    code: Some(code),
                    ..Default::default()
                },
            )
            .await?;
        Ok(TaskStatus::Rendering)
    }

    async fn render(&self, task: &Task) -> Result<TaskStatus, EngineError> {
        let code = task.code.as_deref().ok_or_else(|| EngineError::Inconsistent {
            id: task.id,
            detail: "rendering without source".to_string(),
        })?;
        match self.capabilities.execution.execute(code).await? {
            RenderOutcome::Produced(model) => {
                self.store
                    .transition(
                        task.id,
                        TaskStatus::Reviewing,
                        TaskFields {
                            artifacts: Some(ArtifactSet {
                                step_path: model.step_path,
                                stl_path: model.stl_path,
                                image_path: model.image_path,
                            }),
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(TaskStatus::Reviewing)
            }
            RenderOutcome::ExecutionError(error) => {
                tracing::info!(task = %task.id, "execution failed, routing error to code synthesis");
                // Partial record: the reviewer never ran.
                let updated = self
                    .store
                    .append_iteration(
                        task.id,
                        IterationRecord {
                            sequence: 0,
                            code: code.to_string(),
                            execution: ExecutionOutcome::Failure { error },
                            review: None,
                            recorded_at: Utc::now(),
                        },
                    )
                    .await?;
                self.retry_or_exhaust(&updated, TaskStatus::Coding).await
            }
        }
    }

    async fn review(&self, task: &Task) -> Result<TaskStatus, EngineError> {
        let spec = task.spec.as_deref().ok_or_else(|| EngineError::Inconsistent {
            id: task.id,
            detail: "reviewing without a specification".to_string(),
        })?;
        let artifacts = task
            .artifacts
            .as_ref()
            .ok_or_else(|| EngineError::Inconsistent {
                id: task.id,
                detail: "reviewing without rendered artifacts".to_string(),
            })?;

        let review = self
            .capabilities
            .review
            .review(spec, &artifacts.image_path)
            .await?;

        let updated = self
            .store
            .append_iteration(
                task.id,
                IterationRecord {
                    sequence: 0,
                    code: task.code.clone().unwrap_or_default(),
                    execution: ExecutionOutcome::Success {
                        image: artifacts.image_path.clone(),
                    },
                    review: Some(ReviewOutcome {
                        approved: review.approved,
                        feedback: review.feedback.clone(),
                    }),
                    recorded_at: Utc::now(),
                },
            )
            .await?;

        if review.approved {
            tracing::info!(task = %task.id, "design approved");
            self.store
                .transition(task.id, TaskStatus::Approved, TaskFields::default())
                .await?;
            Ok(TaskStatus::Approved)
        } else {
            tracing::info!(task = %task.id, "design rejected, routing feedback to specification");
            self.retry_or_exhaust(&updated, TaskStatus::Specifying).await
        }
    }

    /// Budget precondition for every retry edge. Checked here, never inside
    /// a capability call, so the loop cannot run unbounded.
    async fn retry_or_exhaust(
        &self,
        task: &Task,
        retry_state: TaskStatus,
    ) -> Result<TaskStatus, EngineError> {
        if task.budget_exhausted() {
            tracing::warn!(
                task = %task.id,
                iterations = task.iteration_count(),
                "iteration budget exhausted"
            );
            self.store
                .transition(
                    task.id,
                    TaskStatus::Failed,
                    TaskFields {
                        error: Some(TaskError::budget_exhausted()),
                        ..Default::default()
                    },
                )
                .await?;
            Ok(TaskStatus::Failed)
        } else {
            self.store
                .transition(task.id, retry_state, TaskFields::default())
                .await?;
            Ok(retry_state)
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted capability doubles shared by engine and orchestrator tests.

    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use crate::capability::{
        CapabilityKind, CapabilitySet, CodeSynthesisCapability, ExecutionRenderCapability,
        RenderOutcome, RenderedModel, Review, SpecificationCapability, VisualReviewCapability,
    };
    use crate::errors::CapabilityError;

    /// Records the order of capability invocations across all four doubles.
    #[derive(Clone, Default)]
    pub struct CallLog(Arc<Mutex<Vec<String>>>);

    impl CallLog {
        pub fn push(&self, entry: impl Into<String>) {
            self.0.lock().unwrap().push(entry.into());
        }

        pub fn calls(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    pub struct ScriptedSpecification {
        pub log: CallLog,
        pub fail_with_timeout: bool,
    }

    #[async_trait]
    impl SpecificationCapability for ScriptedSpecification {
        async fn produce_spec(
            &self,
            prompt: &str,
            _prior_spec: Option<&str>,
            feedback: Option<&str>,
        ) -> Result<String, CapabilityError> {
            if self.fail_with_timeout {
                return Err(CapabilityError::Timeout {
                    capability: CapabilityKind::Specification,
                    seconds: 1,
                });
            }
            self.log.push(match feedback {
                Some(_) => "specification(revise)",
                None => "specification",
            });
            Ok(format!("spec for: {}", prompt))
        }
    }

    pub struct ScriptedCodeSynthesis {
        pub log: CallLog,
    }

    #[async_trait]
    impl CodeSynthesisCapability for ScriptedCodeSynthesis {
        async fn produce_code(
            &self,
            _spec: &str,
            _prior_code: Option<&str>,
            feedback: Option<&str>,
        ) -> Result<String, CapabilityError> {
            self.log.push(match feedback {
                Some(_) => "code-synthesis(fix)",
                None => "code-synthesis",
            });
            Ok("with BuildPart() as part: Box(10, 10, 10)".to_string())
        }
    }

    pub struct ScriptedExecution {
        pub log: CallLog,
        /// Outcomes consumed in order; when exhausted, every call succeeds.
        pub outcomes: Mutex<VecDeque<RenderOutcome>>,
    }

    impl ScriptedExecution {
        pub fn always_succeeds(log: CallLog) -> Self {
            Self {
                log,
                outcomes: Mutex::new(VecDeque::new()),
            }
        }

        pub fn success_outcome() -> RenderOutcome {
            RenderOutcome::Produced(RenderedModel {
                step_path: "model.step".to_string(),
                stl_path: "model.stl".to_string(),
                image_path: "model.png".to_string(),
            })
        }
    }

    #[async_trait]
    impl ExecutionRenderCapability for ScriptedExecution {
        async fn execute(&self, _source: &str) -> Result<RenderOutcome, CapabilityError> {
            self.log.push("execution-render");
            let scripted = self.outcomes.lock().unwrap().pop_front();
            Ok(scripted.unwrap_or_else(Self::success_outcome))
        }
    }

    pub struct ScriptedReview {
        pub log: CallLog,
        /// Verdicts consumed in order; when exhausted, every call approves.
        pub verdicts: Mutex<VecDeque<Review>>,
    }

    impl ScriptedReview {
        pub fn always_approves(log: CallLog) -> Self {
            Self {
                log,
                verdicts: Mutex::new(VecDeque::new()),
            }
        }

        pub fn rejection(feedback: &str) -> Review {
            Review {
                approved: false,
                feedback: Some(feedback.to_string()),
            }
        }
    }

    #[async_trait]
    impl VisualReviewCapability for ScriptedReview {
        async fn review(&self, _spec: &str, _image: &str) -> Result<Review, CapabilityError> {
            self.log.push("visual-review");
            let scripted = self.verdicts.lock().unwrap().pop_front();
            Ok(scripted.unwrap_or(Review {
                approved: true,
                feedback: None,
            }))
        }
    }

    /// Specification double that takes a while, to hold a worker slot or
    /// keep a task visibly in flight.
    pub struct SlowSpecification {
        pub delay: std::time::Duration,
    }

    #[async_trait]
    impl SpecificationCapability for SlowSpecification {
        async fn produce_spec(
            &self,
            prompt: &str,
            _prior_spec: Option<&str>,
            _feedback: Option<&str>,
        ) -> Result<String, CapabilityError> {
            tokio::time::sleep(self.delay).await;
            Ok(format!("spec for: {}", prompt))
        }
    }

    /// A capability set where everything succeeds on the first try.
    pub fn happy_capabilities(log: &CallLog) -> CapabilitySet {
        CapabilitySet {
            specification: Arc::new(ScriptedSpecification {
                log: log.clone(),
                fail_with_timeout: false,
            }),
            code_synthesis: Arc::new(ScriptedCodeSynthesis { log: log.clone() }),
            execution: Arc::new(ScriptedExecution::always_succeeds(log.clone())),
            review: Arc::new(ScriptedReview::always_approves(log.clone())),
        }
    }

    /// Like `happy_capabilities` but the first capability call dawdles.
    pub fn slow_capabilities(log: &CallLog, delay: std::time::Duration) -> CapabilitySet {
        let mut capabilities = happy_capabilities(log);
        capabilities.specification = Arc::new(SlowSpecification { delay });
        capabilities
    }
}
