use std::sync::Arc;

use tracing::{debug, warn};
use veriface_config::{ModelSettings, ProviderKind, ResolvedConfig};

use super::http::HttpEngineClient;
use super::http_compare::HttpCompareAdapter;
use super::http_liveness::HttpLivenessAdapter;
use super::local::LocalMatcherAdapter;
use super::{BoundedProvider, ProviderAdapter, ProviderClient};
use crate::faces::extractor::{FaceEmbeddingBackend, OnnxFaceBackend};

/// Shared on-device backend, or the reason it could not be loaded.
pub type BackendHandle = ProviderClient<Arc<dyn FaceEmbeddingBackend>>;

pub fn load_backend(settings: &ModelSettings) -> BackendHandle {
    match OnnxFaceBackend::from_settings(settings) {
        Ok(backend) => ProviderClient::Ready(Arc::new(backend)),
        Err(err) => {
            warn!(error = %err, "on-device face backend unavailable");
            ProviderClient::not_configured(err.to_string())
        }
    }
}

impl BackendHandle {
    pub fn ready(&self) -> Option<Arc<dyn FaceEmbeddingBackend>> {
        match self {
            ProviderClient::Ready(backend) => Some(Arc::clone(backend)),
            ProviderClient::NotConfigured { .. } => None,
        }
    }
}

/// One bounded provider per configured entry, in configuration order.
pub fn build_providers(config: &ResolvedConfig, backend: &BackendHandle) -> Vec<BoundedProvider> {
    config
        .providers
        .iter()
        .map(|settings| {
            let adapter: Arc<dyn ProviderAdapter> = match settings.kind {
                ProviderKind::Local => Arc::new(LocalMatcherAdapter::new(
                    settings.id.clone(),
                    backend.clone(),
                    &config.matcher,
                )),
                ProviderKind::HttpCompare => Arc::new(HttpCompareAdapter::new(
                    settings.id.clone(),
                    HttpEngineClient::from_settings(settings),
                )),
                ProviderKind::HttpLiveness => Arc::new(HttpLivenessAdapter::new(
                    settings.id.clone(),
                    HttpEngineClient::from_settings(settings),
                )),
            };
            debug!(
                provider = %settings.id,
                kind = settings.kind.as_str(),
                timeout_ms = settings.timeout.as_millis() as u64,
                weight = settings.weight,
                vote_weight = settings.vote_weight,
                "provider configured"
            );
            BoundedProvider::from_settings(adapter, settings)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use veriface_config::{ConfigFile, ProviderEntry};

    fn entry(id: &str, kind: ProviderKind, weight: f64) -> ProviderEntry {
        ProviderEntry {
            id: id.into(),
            kind,
            weight: Some(weight),
            vote_weight: None,
            timeout_ms: Some(700),
            endpoint: None,
            api_key_env: None,
            enabled: None,
        }
    }

    #[test]
    fn builds_in_configuration_order_with_weights() {
        let raw = ConfigFile {
            providers: vec![
                entry("remote", ProviderKind::HttpCompare, 0.45),
                entry("local", ProviderKind::Local, 0.25),
                entry("live", ProviderKind::HttpLiveness, 0.30),
            ],
            ..ConfigFile::default()
        };
        let config = ResolvedConfig::from_raw(raw);
        let backend: BackendHandle = ProviderClient::not_configured("no models in tests");

        let providers = build_providers(&config, &backend);
        let ids: Vec<&str> = providers.iter().map(|p| p.id()).collect();
        assert_eq!(ids, vec!["remote", "local", "live"]);
        assert_eq!(providers[0].kind(), ProviderKind::HttpCompare);
        assert!((providers[0].weight() - 0.45).abs() < 1e-12);
        assert!((providers[0].vote_weight() - 0.45).abs() < 1e-12);
        assert_eq!(providers[1].timeout().as_millis(), 700);
    }

    #[test]
    fn unloadable_models_leave_backend_not_configured() {
        let settings = ModelSettings {
            detector_model: Some("/nonexistent/det.onnx".into()),
            embedder_model: Some("/nonexistent/emb.onnx".into()),
            ..ResolvedConfig::default().models
        };
        let handle = load_backend(&settings);
        assert!(handle.ready().is_none());
    }
}
