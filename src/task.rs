//! Task domain model: the state machine, the iteration ledger, and the
//! fault taxonomy.
//!
//! A task moves `Created → Specifying → Coding → Rendering → Reviewing`
//! and from there either terminates in `Approved` or loops back on one of
//! two retry edges: `Rendering → Coding` (the sandbox reported an execution
//! error) and `Reviewing → Specifying` (the reviewer rejected the render).
//! Both edges draw on one shared iteration budget. Terminal states are
//! absorbing; nothing mutates an `Approved` or `Failed` task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle states. The serialized names are the polling protocol's
/// status strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Created,
    Specifying,
    Coding,
    Rendering,
    Reviewing,
    Approved,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Approved | TaskStatus::Failed)
    }

    /// The full transition table. Retry edges (`Rendering → Coding`,
    /// `Reviewing → Specifying`) are ordinary transitions here; the budget
    /// precondition lives in the iteration engine.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Created, Specifying) => true,
            (Specifying, Coding) => true,
            (Coding, Rendering) => true,
            (Rendering, Reviewing) | (Rendering, Coding) => true,
            (Reviewing, Approved) | (Reviewing, Specifying) => true,
            // Any live state can fail.
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Created => "Created",
            TaskStatus::Specifying => "Specifying",
            TaskStatus::Coding => "Coding",
            TaskStatus::Rendering => "Rendering",
            TaskStatus::Reviewing => "Reviewing",
            TaskStatus::Approved => "Approved",
            TaskStatus::Failed => "Failed",
        };
        write!(f, "{}", s)
    }
}

/// Why a task ended in `Failed`. Content faults never appear here: an
/// execution error or visual mismatch either gets retried or, once the
/// budget is gone, surfaces as `BudgetExhausted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    BudgetExhausted,
    Infrastructure,
    Cancelled,
}

/// Terminal failure stored on the task and surfaced to pollers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: FailureKind,
    pub message: String,
}

impl TaskError {
    pub fn budget_exhausted() -> Self {
        Self {
            kind: FailureKind::BudgetExhausted,
            message: "iteration budget exhausted".to_string(),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: FailureKind::Cancelled,
            message: "cancelled".to_string(),
        }
    }

    pub fn infrastructure(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Infrastructure,
            message: message.into(),
        }
    }
}

/// Paths of the rendered model files, relative to the output directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactSet {
    pub step_path: String,
    pub stl_path: String,
    pub image_path: String,
}

/// What the sandbox run produced, as recorded in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum ExecutionOutcome {
    Success { image: String },
    Failure { error: String },
}

/// The reviewer's verdict, as recorded in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewOutcome {
    pub approved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

/// One completed pass of the loop. Records are append-only; a render that
/// never reached review is a partial record with `review: None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationRecord {
    /// 1-based position in the ledger, assigned by the store.
    pub sequence: u32,
    pub code: String,
    pub execution: ExecutionOutcome,
    pub review: Option<ReviewOutcome>,
    pub recorded_at: DateTime<Utc>,
}

/// Pending critique for the next attempt, derived from the last ledger
/// entry. The two kinds route differently: execution errors go back to
/// code synthesis, visual mismatches re-enter through specification.
#[derive(Debug, Clone, PartialEq)]
pub enum Feedback {
    ExecutionError(String),
    VisualMismatch(String),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: Uuid,
    pub prompt: String,
    pub status: TaskStatus,
    pub max_iterations: u32,
    pub spec: Option<String>,
    pub code: Option<String>,
    pub artifacts: Option<ArtifactSet>,
    pub error: Option<TaskError>,
    pub iterations: Vec<IterationRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(prompt: &str, max_iterations: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            prompt: prompt.to_string(),
            status: TaskStatus::Created,
            max_iterations,
            spec: None,
            code: None,
            artifacts: None,
            error: None,
            iterations: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Completed passes so far. The ledger is the single source of truth;
    /// there is no separate counter to drift out of sync.
    pub fn iteration_count(&self) -> u32 {
        self.iterations.len() as u32
    }

    pub fn budget_exhausted(&self) -> bool {
        self.iteration_count() >= self.max_iterations
    }

    /// Critique to feed into the next attempt, if the last pass left one.
    pub fn last_feedback(&self) -> Option<Feedback> {
        let record = self.iterations.last()?;
        match &record.review {
            Some(review) if review.approved => None,
            Some(review) => Some(Feedback::VisualMismatch(
                review
                    .feedback
                    .clone()
                    .unwrap_or_else(|| "render does not match the specification".to_string()),
            )),
            None => match &record.execution {
                ExecutionOutcome::Failure { error } => {
                    Some(Feedback::ExecutionError(error.clone()))
                }
                ExecutionOutcome::Success { .. } => None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(execution: ExecutionOutcome, review: Option<ReviewOutcome>) -> IterationRecord {
        IterationRecord {
            sequence: 1,
            code: "code".to_string(),
            execution,
            review,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(TaskStatus::Approved.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        for status in [
            TaskStatus::Created,
            TaskStatus::Specifying,
            TaskStatus::Coding,
            TaskStatus::Rendering,
            TaskStatus::Reviewing,
        ] {
            assert!(!status.is_terminal());
        }
    }

    #[test]
    fn test_forward_transitions() {
        assert!(TaskStatus::Created.can_transition_to(TaskStatus::Specifying));
        assert!(TaskStatus::Specifying.can_transition_to(TaskStatus::Coding));
        assert!(TaskStatus::Coding.can_transition_to(TaskStatus::Rendering));
        assert!(TaskStatus::Rendering.can_transition_to(TaskStatus::Reviewing));
        assert!(TaskStatus::Reviewing.can_transition_to(TaskStatus::Approved));
    }

    #[test]
    fn test_retry_edges() {
        assert!(TaskStatus::Rendering.can_transition_to(TaskStatus::Coding));
        assert!(TaskStatus::Reviewing.can_transition_to(TaskStatus::Specifying));
    }

    #[test]
    fn test_skipping_states_is_rejected() {
        assert!(!TaskStatus::Created.can_transition_to(TaskStatus::Coding));
        assert!(!TaskStatus::Specifying.can_transition_to(TaskStatus::Rendering));
        assert!(!TaskStatus::Coding.can_transition_to(TaskStatus::Approved));
        assert!(!TaskStatus::Rendering.can_transition_to(TaskStatus::Specifying));
    }

    #[test]
    fn test_any_live_state_can_fail() {
        for status in [
            TaskStatus::Created,
            TaskStatus::Specifying,
            TaskStatus::Coding,
            TaskStatus::Rendering,
            TaskStatus::Reviewing,
        ] {
            assert!(status.can_transition_to(TaskStatus::Failed));
        }
    }

    #[test]
    fn test_terminal_states_are_absorbing() {
        for terminal in [TaskStatus::Approved, TaskStatus::Failed] {
            for next in [
                TaskStatus::Created,
                TaskStatus::Specifying,
                TaskStatus::Coding,
                TaskStatus::Rendering,
                TaskStatus::Reviewing,
                TaskStatus::Approved,
                TaskStatus::Failed,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_new_task_starts_clean() {
        let task = Task::new("a cube", 3);
        assert_eq!(task.status, TaskStatus::Created);
        assert_eq!(task.iteration_count(), 0);
        assert!(!task.budget_exhausted());
        assert!(task.last_feedback().is_none());
    }

    #[test]
    fn test_budget_tracks_ledger_length() {
        let mut task = Task::new("a cube", 2);
        task.iterations.push(record(
            ExecutionOutcome::Failure {
                error: "boom".to_string(),
            },
            None,
        ));
        assert!(!task.budget_exhausted());
        task.iterations.push(record(
            ExecutionOutcome::Failure {
                error: "boom again".to_string(),
            },
            None,
        ));
        assert_eq!(task.iteration_count(), 2);
        assert!(task.budget_exhausted());
    }

    #[test]
    fn test_feedback_from_execution_failure() {
        let mut task = Task::new("a cube", 3);
        task.iterations.push(record(
            ExecutionOutcome::Failure {
                error: "NameError: Bx".to_string(),
            },
            None,
        ));
        assert_eq!(
            task.last_feedback(),
            Some(Feedback::ExecutionError("NameError: Bx".to_string()))
        );
    }

    #[test]
    fn test_feedback_from_rejection() {
        let mut task = Task::new("a cube", 3);
        task.iterations.push(record(
            ExecutionOutcome::Success {
                image: "model.png".to_string(),
            },
            Some(ReviewOutcome {
                approved: false,
                feedback: Some("hole is off-center".to_string()),
            }),
        ));
        assert_eq!(
            task.last_feedback(),
            Some(Feedback::VisualMismatch("hole is off-center".to_string()))
        );
    }

    #[test]
    fn test_approval_leaves_no_feedback() {
        let mut task = Task::new("a cube", 3);
        task.iterations.push(record(
            ExecutionOutcome::Success {
                image: "model.png".to_string(),
            },
            Some(ReviewOutcome {
                approved: true,
                feedback: None,
            }),
        ));
        assert!(task.last_feedback().is_none());
    }

    #[test]
    fn test_ledger_record_wire_format() {
        let json = serde_json::to_value(record(
            ExecutionOutcome::Success {
                image: "model.png".to_string(),
            },
            Some(ReviewOutcome {
                approved: true,
                feedback: None,
            }),
        ))
        .unwrap();
        assert_eq!(json["sequence"], 1);
        assert_eq!(json["execution"]["outcome"], "success");
        assert_eq!(json["execution"]["image"], "model.png");
        assert_eq!(json["review"]["approved"], true);
        assert!(json["recordedAt"].is_string());

        let failure = serde_json::to_value(record(
            ExecutionOutcome::Failure {
                error: "boom".to_string(),
            },
            None,
        ))
        .unwrap();
        assert_eq!(failure["execution"]["outcome"], "failure");
        assert!(failure["review"].is_null());
    }

    #[test]
    fn test_failure_kind_wire_format() {
        assert_eq!(
            serde_json::to_value(FailureKind::BudgetExhausted).unwrap(),
            "budgetExhausted"
        );
        assert_eq!(
            serde_json::to_value(FailureKind::Infrastructure).unwrap(),
            "infrastructure"
        );
        assert_eq!(
            serde_json::to_value(FailureKind::Cancelled).unwrap(),
            "cancelled"
        );
    }

    #[test]
    fn test_error_constructors() {
        assert_eq!(
            TaskError::budget_exhausted().message,
            "iteration budget exhausted"
        );
        assert_eq!(TaskError::cancelled().message, "cancelled");
        let err = TaskError::infrastructure("specification capability failed");
        assert_eq!(err.kind, FailureKind::Infrastructure);
        assert_eq!(err.message, "specification capability failed");
    }
}
