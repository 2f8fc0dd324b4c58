use std::sync::Arc;

use serde_json::{Map, Value};

use super::{apply_status, now_ms, validate_segment, AnnotationRecord, AnnotationStore};
use crate::error::{PipelineError, Result};
use crate::storage::{ConditionalPut, VersionedBlobStore};

pub const DEFAULT_CAS_ATTEMPTS: u32 = 8;

/// Records kept as JSON blobs, updated by read / modify / conditional write.
///
/// A write only lands if the blob still carries the version token it was
/// read with; on mismatch the merge is re-applied to a fresh read, up to
/// `max_attempts` times.
pub struct CasAnnotationStore {
    blobs: Arc<dyn VersionedBlobStore>,
    bucket: String,
    max_attempts: u32,
}

impl CasAnnotationStore {
    pub fn new(blobs: Arc<dyn VersionedBlobStore>, bucket: &str) -> Self {
        Self {
            blobs,
            bucket: bucket.to_string(),
            max_attempts: DEFAULT_CAS_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Stream ids are arbitrary text (empty included), so they are hex
    /// encoded into the object key.
    fn blob_key(stream_id: &str) -> String {
        format!("streams/{}.json", hex::encode(stream_id.as_bytes()))
    }

    fn read(&self, stream_id: &str) -> Result<Option<(Map<String, Value>, String)>> {
        let Some((bytes, version)) = self
            .blobs
            .get_versioned(&self.bucket, &Self::blob_key(stream_id))?
        else {
            return Ok(None);
        };
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(Value::Object(document)) => Ok(Some((document, version))),
            Ok(_) | Err(_) => Err(PipelineError::transient(format!(
                "annotation blob for '{}' is not a json object",
                stream_id
            ))),
        }
    }
}

impl AnnotationStore for CasAnnotationStore {
    fn merge(&self, stream_id: &str, field: &str, frame_id: &str, status: &Value) -> Result<()> {
        validate_segment(field)?;
        validate_segment(frame_id)?;
        let key = Self::blob_key(stream_id);

        for attempt in 1..=self.max_attempts {
            let (mut document, expected) = match self.read(stream_id)? {
                Some((document, version)) => (document, Some(version)),
                None => (Map::new(), None),
            };
            if !apply_status(&mut document, field, frame_id, status, now_ms()) {
                return Ok(());
            }
            let bytes = serde_json::to_vec(&Value::Object(document))
                .map_err(|err| PipelineError::transient(format!("encode annotation: {}", err)))?;
            match self
                .blobs
                .put_if(&self.bucket, &key, &bytes, expected.as_deref())?
            {
                ConditionalPut::Written(_) => return Ok(()),
                ConditionalPut::VersionMismatch => {
                    log::debug!(
                        "aggregate: version conflict on stream '{}' (attempt {}/{})",
                        stream_id,
                        attempt,
                        self.max_attempts
                    );
                }
            }
        }

        let message = format!(
            "merge conflict on stream '{}' after {} attempts",
            stream_id, self.max_attempts
        );
        log::warn!("aggregate: {}", message);
        Err(PipelineError::TransientIo(message))
    }

    fn fetch(&self, stream_id: &str) -> Result<Option<AnnotationRecord>> {
        match self.read(stream_id)? {
            Some((document, _)) => {
                AnnotationRecord::from_document(stream_id, &Value::Object(document)).map(Some)
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryObjectStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Never lets a conditional write through.
    struct AlwaysConflicting {
        attempts: AtomicU32,
    }

    impl VersionedBlobStore for AlwaysConflicting {
        fn get_versioned(&self, _: &str, _: &str) -> Result<Option<(Vec<u8>, String)>> {
            Ok(Some((b"{}".to_vec(), "v0".into())))
        }

        fn put_if(&self, _: &str, _: &str, _: &[u8], _: Option<&str>) -> Result<ConditionalPut> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Ok(ConditionalPut::VersionMismatch)
        }
    }

    /// Lets another writer land a different field between the first read and
    /// the first conditional write.
    struct InterleavedWriter {
        inner: InMemoryObjectStore,
        interfered: AtomicU32,
    }

    impl VersionedBlobStore for InterleavedWriter {
        fn get_versioned(&self, bucket: &str, key: &str) -> Result<Option<(Vec<u8>, String)>> {
            self.inner.get_versioned(bucket, key)
        }

        fn put_if(
            &self,
            bucket: &str,
            key: &str,
            bytes: &[u8],
            expected: Option<&str>,
        ) -> Result<ConditionalPut> {
            if self.interfered.fetch_add(1, Ordering::SeqCst) == 0 {
                let other = json!({"fall_status": {"9": "fall detected"}, "updated_at": 1});
                self.inner
                    .put_if(bucket, key, other.to_string().as_bytes(), None)?;
            }
            self.inner.put_if(bucket, key, bytes, expected)
        }
    }

    #[test]
    fn conflict_bound_surfaces_transient_error() {
        let blobs = Arc::new(AlwaysConflicting {
            attempts: AtomicU32::new(0),
        });
        let store = CasAnnotationStore::new(blobs.clone(), "annotations");
        let err = store
            .merge("s", "fire_status", "1", &json!("fire detected"))
            .unwrap_err();
        assert!(
            matches!(&err, PipelineError::TransientIo(msg) if msg.contains("merge conflict")),
            "{}",
            err
        );
        assert!(err.is_retryable());
        assert_eq!(blobs.attempts.load(Ordering::SeqCst), DEFAULT_CAS_ATTEMPTS);
    }

    #[test]
    fn retry_preserves_concurrent_field() {
        let blobs = Arc::new(InterleavedWriter {
            inner: InMemoryObjectStore::new(),
            interfered: AtomicU32::new(0),
        });
        let store = CasAnnotationStore::new(blobs, "annotations");
        store
            .merge("s", "fire_status", "9", &json!("fire not detected"))
            .unwrap();
        let record = store.fetch("s").unwrap().unwrap();
        assert_eq!(record.status("fall_status", "9"), Some(&json!("fall detected")));
        assert_eq!(record.status("fire_status", "9"), Some(&json!("fire not detected")));
    }

    #[test]
    fn remerge_does_not_write() {
        let blobs = Arc::new(InMemoryObjectStore::new());
        let store = CasAnnotationStore::new(blobs.clone(), "annotations");
        let status = json!("fire not detected");
        store.merge("", "fire_status", "f", &status).unwrap();
        let before = blobs
            .get_versioned("annotations", &CasAnnotationStore::blob_key(""))
            .unwrap();
        store.merge("", "fire_status", "f", &status).unwrap();
        let after = blobs
            .get_versioned("annotations", &CasAnnotationStore::blob_key(""))
            .unwrap();
        assert_eq!(before, after);
    }
}
