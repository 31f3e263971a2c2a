//! Typed boundary to the four external capabilities.
//!
//! Each capability is one generative or evaluative function behind a fixed
//! trait — specification, code synthesis, execution/render, visual review.
//! Exactly one implementation is bound per deployment (the HTTP adapters in
//! [`http`]); tests bind scripted doubles instead. New backends are added by
//! implementing a trait, never by touching the orchestration loop.

pub mod http;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::CapabilityError;

pub use http::HttpCapabilities;

/// Which external collaborator an adapter talks to. Used for error
/// attribution and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CapabilityKind {
    Specification,
    CodeSynthesis,
    ExecutionRender,
    VisualReview,
}

impl std::fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CapabilityKind::Specification => "specification",
            CapabilityKind::CodeSynthesis => "code-synthesis",
            CapabilityKind::ExecutionRender => "execution-render",
            CapabilityKind::VisualReview => "visual-review",
        };
        write!(f, "{}", s)
    }
}

/// Artifacts produced by a successful sandbox execution. Paths are relative
/// to the shared output directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderedModel {
    pub step_path: String,
    pub stl_path: String,
    pub image_path: String,
}

/// What came back from running generated source in the sandbox. A reported
/// execution failure is a content fault and feeds the retry loop; it is not
/// an adapter error.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderOutcome {
    Produced(RenderedModel),
    ExecutionError(String),
}

/// Verdict from comparing a rendered image against the specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub approved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

/// Produces or revises a technical specification from a prompt.
/// `feedback` carries visual-mismatch critique when a prior attempt was
/// rejected by review.
#[async_trait]
pub trait SpecificationCapability: Send + Sync {
    async fn produce_spec(
        &self,
        prompt: &str,
        prior_spec: Option<&str>,
        feedback: Option<&str>,
    ) -> Result<String, CapabilityError>;
}

/// Produces source text implementing a specification. `feedback` carries
/// raw execution-error text when the previous attempt failed in the sandbox.
#[async_trait]
pub trait CodeSynthesisCapability: Send + Sync {
    async fn produce_code(
        &self,
        spec: &str,
        prior_code: Option<&str>,
        feedback: Option<&str>,
    ) -> Result<String, CapabilityError>;
}

/// Executes source text in a single-tenant sandbox and rasterizes the
/// resulting model. Sandbox isolation is the implementation's hard
/// requirement, not this core's.
#[async_trait]
pub trait ExecutionRenderCapability: Send + Sync {
    async fn execute(&self, source: &str) -> Result<RenderOutcome, CapabilityError>;
}

/// Compares a rendered image to the specification and approves or rejects
/// with structured feedback.
#[async_trait]
pub trait VisualReviewCapability: Send + Sync {
    async fn review(&self, spec: &str, image_path: &str) -> Result<Review, CapabilityError>;
}

/// The full set of bound capabilities, shared across workers.
#[derive(Clone)]
pub struct CapabilitySet {
    pub specification: Arc<dyn SpecificationCapability>,
    pub code_synthesis: Arc<dyn CodeSynthesisCapability>,
    pub execution: Arc<dyn ExecutionRenderCapability>,
    pub review: Arc<dyn VisualReviewCapability>,
}

impl CapabilitySet {
    /// Bind all four capabilities to one HTTP adapter.
    pub fn over_http(adapter: HttpCapabilities) -> Self {
        let adapter = Arc::new(adapter);
        Self {
            specification: adapter.clone(),
            code_synthesis: adapter.clone(),
            execution: adapter.clone(),
            review: adapter,
        }
    }
}
