use std::env;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;
use veriface_config::ProviderSettings;

use super::{ProviderClient, ProviderError};

/// JSON-over-HTTP connection to an external engine.
#[derive(Debug, Clone)]
pub struct HttpEngineClient {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpEngineClient {
    pub fn new(endpoint: &str, api_key: Option<String>, timeout: Duration) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| format!("failed to build HTTP client: {err}"))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    /// Resolve endpoint and credentials once at startup.
    pub fn from_settings(settings: &ProviderSettings) -> ProviderClient<Self> {
        let Some(endpoint) = settings.endpoint.as_deref().filter(|e| !e.trim().is_empty()) else {
            return ProviderClient::not_configured(format!(
                "provider '{}' has no endpoint",
                settings.id
            ));
        };

        let api_key = match settings.api_key_env.as_deref() {
            Some(var) => match env::var(var) {
                Ok(value) if !value.trim().is_empty() => Some(value),
                _ => {
                    return ProviderClient::not_configured(format!(
                        "credential ${var} for provider '{}' is not set",
                        settings.id
                    ))
                }
            },
            None => None,
        };

        match Self::new(endpoint, api_key, settings.timeout) {
            Ok(client) => ProviderClient::Ready(client),
            Err(reason) => ProviderClient::NotConfigured { reason },
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn post_json<B, R>(&self, path: &str, body: &B) -> Result<R, ProviderError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = format!("{}/{}", self.endpoint, path.trim_start_matches('/'));
        let mut request = self.client.post(&url).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|err| ProviderError::Transport(err.to_string()))?;
        let status = response.status();
        debug!(%url, status = status.as_u16(), "engine responded");

        if status == StatusCode::UNPROCESSABLE_ENTITY {
            let detail = response.text().await.unwrap_or_default();
            return Err(ProviderError::InsufficientConfidence(if detail.is_empty() {
                status.to_string()
            } else {
                detail
            }));
        }
        if !status.is_success() {
            return Err(ProviderError::Transport(format!("{url} returned {status}")));
        }

        response
            .json::<R>()
            .await
            .map_err(|err| ProviderError::InvalidResponse(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veriface_config::ProviderKind;

    fn settings(endpoint: Option<&str>, api_key_env: Option<&str>) -> ProviderSettings {
        ProviderSettings {
            id: "remote".into(),
            kind: ProviderKind::HttpCompare,
            weight: 1.0,
            vote_weight: 1.0,
            timeout: Duration::from_millis(500),
            endpoint: endpoint.map(str::to_string),
            api_key_env: api_key_env.map(str::to_string),
        }
    }

    #[test]
    fn missing_endpoint_is_not_configured() {
        let client = HttpEngineClient::from_settings(&settings(None, None));
        match client {
            ProviderClient::NotConfigured { reason } => assert!(reason.contains("no endpoint")),
            ProviderClient::Ready(_) => panic!("expected not configured"),
        }
    }

    #[test]
    fn missing_credential_is_not_configured() {
        let client = HttpEngineClient::from_settings(&settings(
            Some("http://127.0.0.1:9"),
            Some("VERIFACE_TEST_KEY_THAT_IS_NEVER_SET"),
        ));
        assert!(!client.is_ready());
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let client = HttpEngineClient::from_settings(&settings(Some("http://engine.local/v1/"), None));
        let ready = client.get().unwrap();
        assert_eq!(ready.endpoint(), "http://engine.local/v1");
    }
}
