//! HTTP-backed capability adapters.
//!
//! Each capability is a JSON POST to its configured endpoint with an
//! explicit per-request timeout. Anything other than a well-formed response
//! body — timeout, connection failure, non-2xx status, undecodable JSON —
//! is normalized to a [`CapabilityError`] and treated upstream as an
//! infrastructure fault. A *reported* execution failure comes back inside a
//! successful response body and is a content fault, not an error.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{
    CapabilityKind, CodeSynthesisCapability, ExecutionRenderCapability, RenderOutcome,
    RenderedModel, Review, SpecificationCapability, VisualReviewCapability,
};
use crate::config::CapabilityConfig;
use crate::errors::CapabilityError;

// ── Wire types ────────────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SpecificationRequest<'a> {
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    prior_spec: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    feedback: Option<&'a str>,
}

#[derive(Deserialize)]
struct SpecificationResponse {
    spec: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CodeSynthesisRequest<'a> {
    spec: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    prior_code: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    feedback: Option<&'a str>,
}

#[derive(Deserialize)]
struct CodeSynthesisResponse {
    source: String,
}

#[derive(Serialize)]
struct ExecutionRequest<'a> {
    source: &'a str,
}

/// Either all three artifact paths or an execution error; anything else is
/// malformed.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecutionResponse {
    step_path: Option<String>,
    stl_path: Option<String>,
    image_path: Option<String>,
    execution_error: Option<String>,
}

#[derive(Serialize)]
struct ReviewRequest<'a> {
    spec: &'a str,
    image: &'a str,
}

// ── Adapter ───────────────────────────────────────────────────────────

/// One reqwest client serving all four capability endpoints.
pub struct HttpCapabilities {
    client: reqwest::Client,
    endpoints: CapabilityConfig,
}

impl HttpCapabilities {
    pub fn new(endpoints: CapabilityConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(endpoints.timeout_secs))
            .build()?;
        Ok(Self { client, endpoints })
    }

    async fn post<Req, Resp>(
        &self,
        kind: CapabilityKind,
        url: &str,
        body: &Req,
    ) -> Result<Resp, CapabilityError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.normalize(kind, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CapabilityError::Transport {
                capability: kind,
                detail: format!("unexpected status {}", status),
            });
        }

        response.json::<Resp>().await.map_err(|e| {
            if e.is_timeout() {
                CapabilityError::Timeout {
                    capability: kind,
                    seconds: self.endpoints.timeout_secs,
                }
            } else {
                CapabilityError::Malformed {
                    capability: kind,
                    detail: e.to_string(),
                }
            }
        })
    }

    fn normalize(&self, kind: CapabilityKind, err: reqwest::Error) -> CapabilityError {
        if err.is_timeout() {
            CapabilityError::Timeout {
                capability: kind,
                seconds: self.endpoints.timeout_secs,
            }
        } else {
            CapabilityError::Transport {
                capability: kind,
                detail: err.to_string(),
            }
        }
    }
}

#[async_trait]
impl SpecificationCapability for HttpCapabilities {
    async fn produce_spec(
        &self,
        prompt: &str,
        prior_spec: Option<&str>,
        feedback: Option<&str>,
    ) -> Result<String, CapabilityError> {
        let response: SpecificationResponse = self
            .post(
                CapabilityKind::Specification,
                &self.endpoints.specification_url,
                &SpecificationRequest {
                    prompt,
                    prior_spec,
                    feedback,
                },
            )
            .await?;
        Ok(response.spec)
    }
}

#[async_trait]
impl CodeSynthesisCapability for HttpCapabilities {
    async fn produce_code(
        &self,
        spec: &str,
        prior_code: Option<&str>,
        feedback: Option<&str>,
    ) -> Result<String, CapabilityError> {
        let response: CodeSynthesisResponse = self
            .post(
                CapabilityKind::CodeSynthesis,
                &self.endpoints.code_synthesis_url,
                &CodeSynthesisRequest {
                    spec,
                    prior_code,
                    feedback,
                },
            )
            .await?;
        Ok(response.source)
    }
}

#[async_trait]
impl ExecutionRenderCapability for HttpCapabilities {
    async fn execute(&self, source: &str) -> Result<RenderOutcome, CapabilityError> {
        let response: ExecutionResponse = self
            .post(
                CapabilityKind::ExecutionRender,
                &self.endpoints.execution_url,
                &ExecutionRequest { source },
            )
            .await?;

        if let Some(error) = response.execution_error {
            return Ok(RenderOutcome::ExecutionError(error));
        }
        match (response.step_path, response.stl_path, response.image_path) {
            (Some(step_path), Some(stl_path), Some(image_path)) => {
                Ok(RenderOutcome::Produced(RenderedModel {
                    step_path,
                    stl_path,
                    image_path,
                }))
            }
            _ => Err(CapabilityError::Malformed {
                capability: CapabilityKind::ExecutionRender,
                detail: "response has neither full artifact set nor executionError".to_string(),
            }),
        }
    }
}

#[async_trait]
impl VisualReviewCapability for HttpCapabilities {
    async fn review(&self, spec: &str, image_path: &str) -> Result<Review, CapabilityError> {
        self.post(
            CapabilityKind::VisualReview,
            &self.endpoints.review_url,
            &ReviewRequest {
                spec,
                image: image_path,
            },
        )
        .await
    }
}
