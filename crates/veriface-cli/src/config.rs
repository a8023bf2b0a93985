use std::env;
use std::path::Path;

use base64::{engine::general_purpose, Engine as _};
use tracing::{debug, info};
use veriface_config::{load_resolved_config, ResolvedConfig};
use veriface_core::errors::{AppError, AppResult};
use veriface_core::faces::{EnvStoreDirResolver, FilesystemTemplateStore};

pub const STORE_KEY_ENV: &str = "VERIFACE_STORE_KEY";
const STORE_KEY_LEN: usize = 32;

pub fn load_config(explicit: Option<&Path>) -> AppResult<ResolvedConfig> {
    let loaded = load_resolved_config(explicit)?;
    match &loaded.source {
        Some(path) => debug!(path = %path.display(), "loaded configuration"),
        None => info!("no configuration file found; using built-in defaults"),
    }
    Ok(loaded.resolved)
}

/// Template encryption key from `$VERIFACE_STORE_KEY` (base64, 32 bytes).
/// Unset means the store is written in the clear.
pub fn store_key_from_env() -> AppResult<Option<Vec<u8>>> {
    match env::var(STORE_KEY_ENV) {
        Ok(value) if !value.trim().is_empty() => decode_store_key(value.trim()).map(Some),
        _ => Ok(None),
    }
}

fn decode_store_key(encoded: &str) -> AppResult<Vec<u8>> {
    let key = general_purpose::STANDARD
        .decode(encoded)
        .map_err(|err| AppError::Encryption(format!("${STORE_KEY_ENV} is not base64: {err}")))?;
    if key.len() != STORE_KEY_LEN {
        return Err(AppError::Encryption(format!(
            "${STORE_KEY_ENV} must decode to {STORE_KEY_LEN} bytes, got {}",
            key.len()
        )));
    }
    Ok(key)
}

pub fn open_store(config: &ResolvedConfig) -> AppResult<FilesystemTemplateStore> {
    let key = store_key_from_env()?;
    let store =
        FilesystemTemplateStore::resolve(&EnvStoreDirResolver, config.store_dir.as_deref(), key);
    debug!(?store, "template store resolved");
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn key_must_be_32_bytes() {
        let short = general_purpose::STANDARD.encode([1u8; 16]);
        assert!(matches!(
            decode_store_key(&short),
            Err(AppError::Encryption(_))
        ));
        let ok = general_purpose::STANDARD.encode([1u8; 32]);
        assert_eq!(decode_store_key(&ok).unwrap().len(), 32);
    }

    #[test]
    fn key_must_be_base64() {
        assert!(decode_store_key("not base64 !!").is_err());
    }

    #[test]
    fn configured_store_dir_is_used() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "store_dir = \"/srv/veriface\"").unwrap();

        let config = load_config(Some(&path)).unwrap();
        let store = FilesystemTemplateStore::resolve(
            &EnvStoreDirResolver,
            config.store_dir.as_deref(),
            None,
        );
        assert_eq!(store.dir(), Path::new("/srv/veriface"));
    }

    #[test]
    fn explicit_config_errors_surface() {
        let dir = tempdir().unwrap();
        let err = load_config(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }
}
