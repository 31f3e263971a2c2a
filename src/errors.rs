//! Typed error hierarchy for the forma orchestration core.
//!
//! Three enums cover the three seams:
//! - `CapabilityError` — adapter-level failures when calling an external
//!   capability; always classified as infrastructure faults
//! - `StoreError` — task store lookup and transition failures
//! - `EngineError` — iteration engine failures, wrapping the other two

use thiserror::Error;
use uuid::Uuid;

use crate::capability::CapabilityKind;
use crate::task::TaskStatus;

/// Failures at the capability adapter boundary. Content-level outcomes
/// (execution errors, review rejections) are *not* errors; they arrive as
/// values inside the capability response types.
#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("{capability} call timed out after {seconds}s")]
    Timeout {
        capability: CapabilityKind,
        seconds: u64,
    },

    #[error("{capability} returned a malformed response: {detail}")]
    Malformed {
        capability: CapabilityKind,
        detail: String,
    },

    #[error("{capability} transport failure: {detail}")]
    Transport {
        capability: CapabilityKind,
        detail: String,
    },
}

impl CapabilityError {
    pub fn capability(&self) -> CapabilityKind {
        match self {
            CapabilityError::Timeout { capability, .. }
            | CapabilityError::Malformed { capability, .. }
            | CapabilityError::Transport { capability, .. } => *capability,
        }
    }
}

/// Failures from the task store.
#[derive(Debug, Error, PartialEq)]
pub enum StoreError {
    #[error("task {0} not found")]
    NotFound(Uuid),

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("task {0} is terminal and immutable")]
    Terminal(Uuid),
}

/// Failures from one iteration engine step.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("task {id} is in an inconsistent state: {detail}")]
    Inconsistent { id: Uuid, detail: String },
}
