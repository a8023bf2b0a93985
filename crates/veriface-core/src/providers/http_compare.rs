use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use veriface_config::ProviderKind;

use super::http::HttpEngineClient;
use super::{CandidateSet, ProviderAdapter, ProviderClient, ProviderError, ProviderInput, ProviderOutcome};
use crate::capture::encode_jpeg;

/// External 1:N comparison engine. Candidates carry both the raw image
/// reference and the template embedding so the engine can use either.
#[derive(Debug, Clone)]
pub struct HttpCompareAdapter {
    id: String,
    client: ProviderClient<HttpEngineClient>,
}

#[derive(Serialize)]
struct CompareRequest<'a> {
    image: String,
    candidates: Vec<CompareCandidate<'a>>,
}

#[derive(Serialize)]
struct CompareCandidate<'a> {
    subject_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_ref: Option<&'a str>,
    embedding: String,
}

#[derive(Debug, Deserialize)]
struct CompareResponse {
    #[serde(default)]
    subject_id: Option<String>,
    confidence: f64,
}

impl HttpCompareAdapter {
    pub fn new(id: impl Into<String>, client: ProviderClient<HttpEngineClient>) -> Self {
        Self {
            id: id.into(),
            client,
        }
    }
}

#[async_trait]
impl ProviderAdapter for HttpCompareAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::HttpCompare
    }

    async fn evaluate(
        &self,
        input: &ProviderInput,
        pool: &CandidateSet,
    ) -> Result<ProviderOutcome, ProviderError> {
        let client = self.client.get()?;
        if pool.is_empty() {
            return Ok(ProviderOutcome {
                confidence: 0.0,
                matched_subject_id: None,
            });
        }

        let jpeg = encode_jpeg(&input.frame).map_err(|err| ProviderError::Internal(err.to_string()))?;
        let request = CompareRequest {
            image: general_purpose::STANDARD.encode(jpeg),
            candidates: pool
                .iter()
                .map(|template| CompareCandidate {
                    subject_id: &template.subject_id,
                    image_ref: template.raw_image_ref.as_deref(),
                    embedding: template.embedding.to_encoded(),
                })
                .collect(),
        };

        let response: CompareResponse = client.post_json("compare", &request).await?;

        let matched_subject_id = match response.subject_id {
            Some(subject) if pool.iter().any(|t| t.subject_id == subject) => Some(subject),
            Some(subject) => {
                return Err(ProviderError::InvalidResponse(format!(
                    "engine matched '{subject}', which is not in the candidate pool"
                )))
            }
            None => None,
        };

        Ok(ProviderOutcome {
            confidence: response.confidence,
            matched_subject_id,
        })
    }
}
