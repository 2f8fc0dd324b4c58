//! Object storage for source videos and keyframe images.
//!
//! Objects are addressed by `(bucket, key)`. Keys may contain `/` but never
//! empty, `.` or `..` segments.

use std::collections::BTreeMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use sha2::{Digest, Sha256};

use crate::error::{PipelineError, Result};

pub const JPEG_CONTENT_TYPE: &str = "image/jpeg";

pub trait ObjectStore: Send + Sync {
    /// Fetch an object. A missing object is a transient failure: uploads and
    /// their notifications are not ordered.
    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;

    fn put(&self, bucket: &str, key: &str, bytes: &[u8], content_type: &str) -> Result<()>;
}

/// Result of a version-conditional write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConditionalPut {
    /// Written; carries the new version token.
    Written(String),
    /// The object's current version did not match the expected one.
    VersionMismatch,
}

/// Blob store with per-object version tokens and conditional writes.
pub trait VersionedBlobStore: Send + Sync {
    /// Current bytes and version token, or `None` if absent.
    fn get_versioned(&self, bucket: &str, key: &str) -> Result<Option<(Vec<u8>, String)>>;

    /// Write only if the current version equals `expected`; `None` means
    /// "only if the object does not exist".
    fn put_if(
        &self,
        bucket: &str,
        key: &str,
        bytes: &[u8],
        expected: Option<&str>,
    ) -> Result<ConditionalPut>;
}

fn version_token(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn validate_bucket(bucket: &str) -> Result<&str> {
    let trimmed = bucket.trim();
    if trimmed.is_empty() {
        return Err(PipelineError::InvalidKey("bucket name cannot be empty".into()));
    }
    if !trimmed
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.'))
        || trimmed.starts_with('.')
    {
        return Err(PipelineError::InvalidKey(format!(
            "bucket '{}' must be lowercase [a-z0-9._-] only",
            bucket
        )));
    }
    Ok(trimmed)
}

fn validate_key(key: &str) -> Result<&str> {
    if key.is_empty() {
        return Err(PipelineError::InvalidKey("object key cannot be empty".into()));
    }
    if key.contains('\\') || key.contains('\0') {
        return Err(PipelineError::InvalidKey(format!(
            "object key '{}' contains a forbidden character",
            key
        )));
    }
    if key
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(PipelineError::InvalidKey(format!(
            "object key '{}' has an empty or relative segment",
            key
        )));
    }
    Ok(key)
}

/// Buckets are directories under `root`; keys are relative paths inside them.
pub struct FilesystemObjectStore {
    root: PathBuf,
}

impl FilesystemObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        let bucket = validate_bucket(bucket)?;
        let key = validate_key(key)?;
        Ok(self.root.join(bucket).join(key))
    }
}

impl ObjectStore for FilesystemObjectStore {
    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let path = self.object_path(bucket, key)?;
        fs::read(&path).map_err(|err| match err.kind() {
            ErrorKind::NotFound => {
                PipelineError::transient(format!("object {}/{} not found", bucket, key))
            }
            _ => PipelineError::transient(format!("read {}: {}", path.display(), err)),
        })
    }

    fn put(&self, bucket: &str, key: &str, bytes: &[u8], _content_type: &str) -> Result<()> {
        let path = self.object_path(bucket, key)?;
        write_atomic(&path, bytes)
    }
}

/// Write through a temporary sibling and rename into place, so readers never
/// observe a partial object.
fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| PipelineError::InvalidKey(format!("{} has no parent", path.display())))?;
    fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| PipelineError::from(err.error))?;
    Ok(())
}

#[derive(Clone, Debug)]
struct StoredObject {
    bytes: Vec<u8>,
    content_type: String,
    version: String,
}

/// Process-local object store. Implements both the plain and the versioned
/// interfaces.
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<BTreeMap<(String, String), StoredObject>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.lock()
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }

    pub fn content_type(&self, bucket: &str, key: &str) -> Option<String> {
        self.lock()
            .get(&(bucket.to_string(), key.to_string()))
            .map(|obj| obj.content_type.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<(String, String), StoredObject>> {
        // A poisoned map is still structurally valid.
        self.objects.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        self.lock()
            .get(&(bucket.to_string(), key.to_string()))
            .map(|obj| obj.bytes.clone())
            .ok_or_else(|| PipelineError::transient(format!("object {}/{} not found", bucket, key)))
    }

    fn put(&self, bucket: &str, key: &str, bytes: &[u8], content_type: &str) -> Result<()> {
        validate_bucket(bucket)?;
        validate_key(key)?;
        self.lock().insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                bytes: bytes.to_vec(),
                content_type: content_type.to_string(),
                version: version_token(bytes),
            },
        );
        Ok(())
    }
}

impl VersionedBlobStore for InMemoryObjectStore {
    fn get_versioned(&self, bucket: &str, key: &str) -> Result<Option<(Vec<u8>, String)>> {
        Ok(self
            .lock()
            .get(&(bucket.to_string(), key.to_string()))
            .map(|obj| (obj.bytes.clone(), obj.version.clone())))
    }

    fn put_if(
        &self,
        bucket: &str,
        key: &str,
        bytes: &[u8],
        expected: Option<&str>,
    ) -> Result<ConditionalPut> {
        validate_bucket(bucket)?;
        validate_key(key)?;
        let mut objects = self.lock();
        let slot = (bucket.to_string(), key.to_string());
        let current = objects.get(&slot).map(|obj| obj.version.as_str());
        if current != expected {
            return Ok(ConditionalPut::VersionMismatch);
        }
        let version = version_token(bytes);
        objects.insert(
            slot,
            StoredObject {
                bytes: bytes.to_vec(),
                content_type: "application/json".to_string(),
                version: version.clone(),
            },
        );
        Ok(ConditionalPut::Written(version))
    }
}
