use std::env;
use std::fs;
use std::io::{BufWriter, Cursor, Write};
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use image::{ImageFormat, RgbImage};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::{AppError, AppResult};
use crate::faces::embedding::FaceEmbedding;
use crate::faces::enrollment::validate_subject_id;

const DEFAULT_STORE_DIR: &str = veriface_config::DEFAULT_STORE_DIR;
pub const TEMPLATE_STORE_ENV: &str = "VERIFACE_STORE_DIR";
const IMAGE_DIR: &str = "images";
const STORE_VERSION: u32 = 1;
const STORE_ALGORITHM: &str = "AES-256-GCM";
const STORE_NONCE_LEN: usize = 12;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnrolledTemplate {
    pub subject_id: String,
    pub embedding: FaceEmbedding,
    pub captured_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_image_ref: Option<String>,
}

/// Read side: the set of templates considered during identification.
pub trait CandidatePool: Send + Sync {
    fn list_enrolled_templates(&self) -> AppResult<Vec<EnrolledTemplate>>;
}

/// Write side used by enrollment.
pub trait TemplateStore: Send + Sync {
    /// Persist a representative frame and return a reference to it.
    fn save_raw_image(&self, subject_id: &str, image: &RgbImage) -> AppResult<String>;

    fn save_template(
        &self,
        subject_id: &str,
        embedding: &FaceEmbedding,
        raw_image_ref: Option<&str>,
    ) -> AppResult<EnrolledTemplate>;

    /// Returns `false` when the subject had no template.
    fn remove_template(&self, subject_id: &str) -> AppResult<bool>;
}

pub trait StoreDirResolver {
    fn resolve(&self, override_dir: Option<&Path>) -> PathBuf;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EnvStoreDirResolver;

impl StoreDirResolver for EnvStoreDirResolver {
    fn resolve(&self, override_dir: Option<&Path>) -> PathBuf {
        if let Some(dir) = override_dir {
            dir.to_path_buf()
        } else if let Ok(env_value) = env::var(TEMPLATE_STORE_ENV) {
            PathBuf::from(env_value)
        } else {
            PathBuf::from(DEFAULT_STORE_DIR)
        }
    }
}

/// One JSON file per subject plus an `images/` directory of raw frames.
///
/// Template files are optionally sealed with AES-256-GCM. Raw images stay in
/// the clear so that image-comparison engines can fetch them by reference.
#[derive(Clone)]
pub struct FilesystemTemplateStore {
    dir: PathBuf,
    key: Option<Vec<u8>>,
}

impl std::fmt::Debug for FilesystemTemplateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilesystemTemplateStore")
            .field("dir", &self.dir)
            .field("encrypted", &self.key.is_some())
            .finish()
    }
}

impl FilesystemTemplateStore {
    pub fn new(dir: impl Into<PathBuf>, key: Option<Vec<u8>>) -> Self {
        Self {
            dir: dir.into(),
            key,
        }
    }

    pub fn resolve<R: StoreDirResolver>(
        resolver: &R,
        override_dir: Option<&Path>,
        key: Option<Vec<u8>>,
    ) -> Self {
        Self::new(resolver.resolve(override_dir), key)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn template_path(&self, subject_id: &str) -> PathBuf {
        self.dir.join(format!("{subject_id}.json"))
    }

    pub fn raw_image_path(&self, reference: &str) -> PathBuf {
        self.dir.join(reference)
    }

    pub fn load_template(&self, subject_id: &str) -> AppResult<Option<EnrolledTemplate>> {
        validate_subject_id(subject_id)?;
        let path = self.template_path(subject_id);
        if !path.exists() {
            return Ok(None);
        }
        read_template_file(&path, self.key.as_deref()).map(Some)
    }
}

impl CandidatePool for FilesystemTemplateStore {
    fn list_enrolled_templates(&self) -> AppResult<Vec<EnrolledTemplate>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.dir).map_err(|source| AppError::StoreRead {
            path: self.dir.clone(),
            source,
        })?;

        let mut templates = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| AppError::StoreRead {
                path: self.dir.clone(),
                source,
            })?;
            let path = entry.path();
            if !path.is_file() || path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match read_template_file(&path, self.key.as_deref()) {
                Ok(template) => templates.push(template),
                // Foreign or damaged files are skipped.
                Err(AppError::InvalidTemplateFile { path, message }) => {
                    warn!(path = %path.display(), %message, "skipping unreadable template");
                }
                Err(err) => return Err(err),
            }
        }
        templates.sort_by(|a, b| a.subject_id.cmp(&b.subject_id));
        debug!(dir = %self.dir.display(), count = templates.len(), "listed enrolled templates");
        Ok(templates)
    }
}

impl TemplateStore for FilesystemTemplateStore {
    fn save_raw_image(&self, subject_id: &str, image: &RgbImage) -> AppResult<String> {
        validate_subject_id(subject_id)?;
        let reference = format!("{IMAGE_DIR}/{subject_id}-{}.png", Uuid::new_v4());
        let mut encoded = Cursor::new(Vec::new());
        image
            .write_to(&mut encoded, ImageFormat::Png)
            .map_err(AppError::ImageEncode)?;
        write_atomic(&self.raw_image_path(&reference), encoded.get_ref())?;
        Ok(reference)
    }

    fn save_template(
        &self,
        subject_id: &str,
        embedding: &FaceEmbedding,
        raw_image_ref: Option<&str>,
    ) -> AppResult<EnrolledTemplate> {
        validate_subject_id(subject_id)?;
        let path = self.template_path(subject_id);
        let previous = if path.exists() {
            read_template_file(&path, self.key.as_deref()).ok()
        } else {
            None
        };

        let template = EnrolledTemplate {
            subject_id: subject_id.to_string(),
            embedding: embedding.clone(),
            captured_at: Utc::now(),
            raw_image_ref: raw_image_ref.map(str::to_string),
        };
        let serialized = match self.key.as_deref() {
            Some(key) => seal(&serde_json::to_vec(&template)?, key)?,
            None => serde_json::to_vec_pretty(&template)?,
        };
        write_atomic(&path, &serialized)?;

        if let Some(stale) = previous
            .and_then(|old| old.raw_image_ref)
            .filter(|old| Some(old.as_str()) != raw_image_ref)
        {
            self.remove_raw_image(&stale);
        }
        Ok(template)
    }

    fn remove_template(&self, subject_id: &str) -> AppResult<bool> {
        let Some(existing) = self.load_template(subject_id)? else {
            return Ok(false);
        };
        let path = self.template_path(subject_id);
        fs::remove_file(&path).map_err(|source| AppError::StoreWrite {
            path: path.clone(),
            source,
        })?;
        if let Some(reference) = existing.raw_image_ref {
            self.remove_raw_image(&reference);
        }
        Ok(true)
    }
}

impl FilesystemTemplateStore {
    fn remove_raw_image(&self, reference: &str) {
        let path = self.raw_image_path(reference);
        if let Err(err) = fs::remove_file(&path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %err, "failed to remove raw image");
            }
        }
    }
}

pub fn read_template_file(path: &Path, key: Option<&[u8]>) -> AppResult<EnrolledTemplate> {
    let data = fs::read(path).map_err(|source| AppError::StoreRead {
        path: path.to_path_buf(),
        source,
    })?;

    if let Ok(wrapper) = serde_json::from_slice::<EncryptedTemplate>(&data) {
        let plaintext = open(path, wrapper, key)?;
        return serde_json::from_slice(&plaintext).map_err(|err| AppError::InvalidTemplateFile {
            path: path.to_path_buf(),
            message: format!("invalid decrypted template contents: {err}"),
        });
    }

    serde_json::from_slice(&data).map_err(|err| AppError::InvalidTemplateFile {
        path: path.to_path_buf(),
        message: format!("invalid template contents: {err}"),
    })
}

/// Write `bytes` via a sibling temp file and rename, leaving 0600 permissions.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> AppResult<()> {
    let write_error = |source| AppError::StoreWrite {
        path: path.to_path_buf(),
        source,
    };

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|source| AppError::StoreWrite {
        path: parent.to_path_buf(),
        source,
    })?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(write_error)?;
    {
        let file = tmp.as_file_mut();
        {
            let mut writer = BufWriter::new(&mut *file);
            writer.write_all(bytes).map_err(write_error)?;
            writer.flush().map_err(write_error)?;
        }
        file.sync_all().map_err(write_error)?;
    }

    let file = tmp.persist(path).map_err(|err| write_error(err.error))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = file.metadata().map_err(write_error)?.permissions();
        perms.set_mode(0o600);
        file.set_permissions(perms).map_err(write_error)?;
    }
    #[cfg(not(unix))]
    drop(file);

    Ok(())
}

fn seal(plaintext: &[u8], key: &[u8]) -> AppResult<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| AppError::Encryption("invalid AES-GCM key length".into()))?;
    let mut nonce = [0u8; STORE_NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|err| AppError::Encryption(format!("failed to encrypt template: {err}")))?;
    let wrapper = EncryptedTemplate {
        version: STORE_VERSION,
        algorithm: STORE_ALGORITHM.to_string(),
        nonce: general_purpose::STANDARD.encode(nonce),
        ciphertext: general_purpose::STANDARD.encode(ciphertext),
    };
    serde_json::to_vec_pretty(&wrapper).map_err(AppError::from)
}

fn open(path: &Path, wrapper: EncryptedTemplate, key: Option<&[u8]>) -> AppResult<Vec<u8>> {
    if wrapper.algorithm != STORE_ALGORITHM {
        return Err(AppError::Encryption(format!(
            "unsupported template algorithm '{}'",
            wrapper.algorithm
        )));
    }
    if wrapper.version != STORE_VERSION {
        return Err(AppError::Encryption(format!(
            "unsupported template store version {}",
            wrapper.version
        )));
    }

    let key_bytes = key.ok_or_else(|| AppError::EncryptedStoreRequiresKey {
        path: path.to_path_buf(),
    })?;

    let nonce_bytes = general_purpose::STANDARD
        .decode(wrapper.nonce.trim())
        .map_err(|err| AppError::Encryption(format!("invalid nonce encoding: {err}")))?;
    if nonce_bytes.len() != STORE_NONCE_LEN {
        return Err(AppError::Encryption(format!(
            "expected nonce of {} bytes but found {}",
            STORE_NONCE_LEN,
            nonce_bytes.len()
        )));
    }

    let ciphertext = general_purpose::STANDARD
        .decode(wrapper.ciphertext.trim())
        .map_err(|err| AppError::Encryption(format!("invalid ciphertext encoding: {err}")))?;

    let cipher = Aes256Gcm::new_from_slice(key_bytes)
        .map_err(|_| AppError::Encryption("invalid AES-GCM key length".into()))?;
    cipher
        .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_slice())
        .map_err(|err| AppError::Encryption(format!("failed to decrypt template: {err}")))
}

#[derive(Serialize, Deserialize)]
struct EncryptedTemplate {
    version: u32,
    algorithm: String,
    nonce: String,
    ciphertext: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn embedding() -> FaceEmbedding {
        FaceEmbedding::from_raw(vec![0.1, 0.2, 0.3]).unwrap()
    }

    #[test]
    fn round_trip_without_encryption() {
        let tmp = TempDir::new().unwrap();
        let store = FilesystemTemplateStore::new(tmp.path(), None);
        let saved = store.save_template("alice", &embedding(), None).unwrap();

        let listed = store.list_enrolled_templates().unwrap();
        assert_eq!(listed, vec![saved]);
        let raw = fs::read_to_string(store.template_path("alice")).unwrap();
        assert!(raw.contains("\"subject_id\": \"alice\""));
    }

    #[test]
    fn round_trip_with_encryption() {
        let tmp = TempDir::new().unwrap();
        let key = vec![0x22u8; 32];
        let store = FilesystemTemplateStore::new(tmp.path(), Some(key));
        let saved = store.save_template("alice", &embedding(), None).unwrap();

        let raw = fs::read_to_string(store.template_path("alice")).unwrap();
        assert!(raw.contains(STORE_ALGORITHM));
        assert!(!raw.contains("alice"));

        assert_eq!(store.load_template("alice").unwrap(), Some(saved));
    }

    #[test]
    fn encrypted_template_requires_key() {
        let tmp = TempDir::new().unwrap();
        FilesystemTemplateStore::new(tmp.path(), Some(vec![7u8; 32]))
            .save_template("alice", &embedding(), None)
            .unwrap();

        let keyless = FilesystemTemplateStore::new(tmp.path(), None);
        let err = keyless.list_enrolled_templates().unwrap_err();
        assert!(matches!(err, AppError::EncryptedStoreRequiresKey { .. }));
    }

    #[test]
    fn listing_is_sorted_and_skips_image_dir() {
        let tmp = TempDir::new().unwrap();
        let store = FilesystemTemplateStore::new(tmp.path(), None);
        store
            .save_raw_image("zoe", &RgbImage::new(2, 2))
            .unwrap();
        store.save_template("zoe", &embedding(), None).unwrap();
        store.save_template("adam", &embedding(), None).unwrap();

        let ids: Vec<String> = store
            .list_enrolled_templates()
            .unwrap()
            .into_iter()
            .map(|t| t.subject_id)
            .collect();
        assert_eq!(ids, vec!["adam", "zoe"]);
    }

    #[test]
    fn remove_deletes_template_and_image() {
        let tmp = TempDir::new().unwrap();
        let store = FilesystemTemplateStore::new(tmp.path(), None);
        let reference = store.save_raw_image("alice", &RgbImage::new(4, 4)).unwrap();
        assert!(reference.starts_with("images/alice-"));
        store
            .save_template("alice", &embedding(), Some(&reference))
            .unwrap();
        assert!(store.raw_image_path(&reference).exists());

        assert!(store.remove_template("alice").unwrap());
        assert!(!store.template_path("alice").exists());
        assert!(!store.raw_image_path(&reference).exists());
        assert!(!store.remove_template("alice").unwrap());
    }

    #[test]
    fn re_enrollment_replaces_stale_image() {
        let tmp = TempDir::new().unwrap();
        let store = FilesystemTemplateStore::new(tmp.path(), None);
        let first = store.save_raw_image("alice", &RgbImage::new(4, 4)).unwrap();
        store.save_template("alice", &embedding(), Some(&first)).unwrap();
        let second = store.save_raw_image("alice", &RgbImage::new(4, 4)).unwrap();
        store.save_template("alice", &embedding(), Some(&second)).unwrap();

        assert!(!store.raw_image_path(&first).exists());
        assert!(store.raw_image_path(&second).exists());
    }

    #[test]
    fn invalid_subject_is_rejected_before_touching_disk() {
        let tmp = TempDir::new().unwrap();
        let store = FilesystemTemplateStore::new(tmp.path(), None);
        let err = store
            .save_template("../etc/passwd", &embedding(), None)
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidSubject { .. }));
    }

    #[test]
    fn corrupt_template_is_skipped_when_listing() {
        let tmp = TempDir::new().unwrap();
        let store = FilesystemTemplateStore::new(tmp.path(), None);
        store.save_template("alice", &embedding(), None).unwrap();
        fs::write(tmp.path().join("broken.json"), b"{ not json").unwrap();
        fs::write(tmp.path().join("foreign.json"), br#"{"name": "other tool"}"#).unwrap();

        let ids: Vec<String> = store
            .list_enrolled_templates()
            .unwrap()
            .into_iter()
            .map(|t| t.subject_id)
            .collect();
        assert_eq!(ids, vec!["alice"]);
    }

    #[test]
    fn missing_directory_lists_nothing() {
        let tmp = TempDir::new().unwrap();
        let store = FilesystemTemplateStore::new(tmp.path().join("absent"), None);
        assert!(store.list_enrolled_templates().unwrap().is_empty());
    }

    #[test]
    fn resolver_prefers_override() {
        let tmp = TempDir::new().unwrap();
        let override_dir = tmp.path().join("override");
        let store =
            FilesystemTemplateStore::resolve(&EnvStoreDirResolver, Some(&override_dir), None);
        assert_eq!(store.dir(), override_dir.as_path());
    }
}
