use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use veriface_config::ProviderKind;

use super::http::HttpEngineClient;
use super::{CandidateSet, ProviderAdapter, ProviderClient, ProviderError, ProviderInput, ProviderOutcome};
use crate::capture::encode_jpeg;

/// External detection/liveness engine. Its confidence is the engine's
/// liveness score; it never names a subject.
#[derive(Debug, Clone)]
pub struct HttpLivenessAdapter {
    id: String,
    client: ProviderClient<HttpEngineClient>,
}

#[derive(Serialize)]
struct LivenessRequest {
    image: String,
}

#[derive(Debug, Deserialize)]
struct LivenessResponse {
    face_detected: bool,
    #[serde(default)]
    liveness: f64,
}

impl HttpLivenessAdapter {
    pub fn new(id: impl Into<String>, client: ProviderClient<HttpEngineClient>) -> Self {
        Self {
            id: id.into(),
            client,
        }
    }
}

#[async_trait]
impl ProviderAdapter for HttpLivenessAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::HttpLiveness
    }

    async fn evaluate(
        &self,
        input: &ProviderInput,
        _pool: &CandidateSet,
    ) -> Result<ProviderOutcome, ProviderError> {
        let client = self.client.get()?;
        let jpeg = encode_jpeg(&input.frame).map_err(|err| ProviderError::Internal(err.to_string()))?;
        let request = LivenessRequest {
            image: general_purpose::STANDARD.encode(jpeg),
        };

        let response: LivenessResponse = client.post_json("liveness", &request).await?;
        if !response.face_detected {
            return Err(ProviderError::NoFaceDetected);
        }

        Ok(ProviderOutcome {
            confidence: response.liveness,
            matched_subject_id: None,
        })
    }
}
