//! Per-stream annotation records.
//!
//! A record is one JSON document per stream:
//!
//! ```json
//! { "fire_status": { "0007": "fire not detected" },
//!   "human_status": { "0007": [ { "label": "person" } ] },
//!   "updated_at": 1700000000000 }
//! ```
//!
//! Every merge sets exactly one `<field>.<frame>` entry and never touches any
//! other, so detectors writing to the same stream concurrently cannot lose
//! each other's results. Re-merging a value that is already present leaves
//! the document untouched, `updated_at` included.

mod cas;
mod sqlite;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::detect::DetectorKind;
use crate::error::{PipelineError, Result};

pub use cas::{CasAnnotationStore, DEFAULT_CAS_ATTEMPTS};
pub use sqlite::SqliteAnnotationStore;

pub const UPDATED_AT_FIELD: &str = "updated_at";

/// Decoded view of a stream's document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AnnotationRecord {
    pub stream_id: String,
    /// field → frame → status
    pub fields: BTreeMap<String, BTreeMap<String, Value>>,
    /// Milliseconds since the Unix epoch of the last effective merge.
    pub updated_at: Option<i64>,
}

impl AnnotationRecord {
    pub fn from_document(stream_id: &str, document: &Value) -> Result<Self> {
        let object = document.as_object().ok_or_else(|| {
            PipelineError::transient(format!("annotation document for '{}' is not an object", stream_id))
        })?;
        let mut record = AnnotationRecord {
            stream_id: stream_id.to_string(),
            ..Default::default()
        };
        for (name, value) in object {
            if name == UPDATED_AT_FIELD {
                record.updated_at = value.as_i64();
            } else if let Some(frames) = value.as_object() {
                record.fields.insert(
                    name.clone(),
                    frames.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                );
            }
        }
        Ok(record)
    }

    pub fn status(&self, field: &str, frame_id: &str) -> Option<&Value> {
        self.fields.get(field).and_then(|frames| frames.get(frame_id))
    }
}

/// Storage for annotation records with an atomic single-field merge.
pub trait AnnotationStore: Send + Sync {
    /// Create the stream's record if absent and set `field.frame_id` to
    /// `status`, as one indivisible operation.
    fn merge(&self, stream_id: &str, field: &str, frame_id: &str, status: &Value) -> Result<()>;

    fn fetch(&self, stream_id: &str) -> Result<Option<AnnotationRecord>>;
}

/// Merges normalized detector statuses into per-stream records.
#[derive(Clone)]
pub struct AnnotationAggregator {
    store: Arc<dyn AnnotationStore>,
}

impl AnnotationAggregator {
    pub fn new(store: Arc<dyn AnnotationStore>) -> Self {
        Self { store }
    }

    pub fn merge(
        &self,
        stream_id: &str,
        frame_id: &str,
        kind: DetectorKind,
        status: Value,
    ) -> Result<()> {
        validate_segment(frame_id)?;
        self.store
            .merge(stream_id, kind.status_field(), frame_id, &status)?;
        log::debug!(
            "aggregate: {}.{} merged into stream '{}'",
            kind.status_field(),
            frame_id,
            stream_id
        );
        Ok(())
    }

    pub fn fetch(&self, stream_id: &str) -> Result<Option<AnnotationRecord>> {
        self.store.fetch(stream_id)
    }
}

/// Field and frame names become document keys and JSON path labels.
pub(crate) fn validate_segment(segment: &str) -> Result<()> {
    if segment.is_empty() {
        return Err(PipelineError::InvalidKey("empty annotation key".into()));
    }
    if segment.contains('"') || segment.contains('\\') || segment == UPDATED_AT_FIELD {
        return Err(PipelineError::InvalidKey(format!(
            "annotation key '{}' cannot be addressed",
            segment
        )));
    }
    Ok(())
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Set `field.frame_id` in `document`. Returns `false` (and leaves the
/// document untouched) when the value is already present.
pub(crate) fn apply_status(
    document: &mut Map<String, Value>,
    field: &str,
    frame_id: &str,
    status: &Value,
    now: i64,
) -> bool {
    let current = document
        .get(field)
        .and_then(Value::as_object)
        .and_then(|frames| frames.get(frame_id));
    if current == Some(status) {
        return false;
    }
    let frames = document
        .entry(field.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !frames.is_object() {
        *frames = Value::Object(Map::new());
    }
    if let Value::Object(frames) = frames {
        frames.insert(frame_id.to_string(), status.clone());
    }
    document.insert(UPDATED_AT_FIELD.to_string(), Value::from(now));
    true
}

/// Process-local store; each merge runs under one lock.
#[derive(Debug, Default)]
pub struct InMemoryAnnotationStore {
    documents: Mutex<BTreeMap<String, Map<String, Value>>>,
}

impl InMemoryAnnotationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AnnotationStore for InMemoryAnnotationStore {
    fn merge(&self, stream_id: &str, field: &str, frame_id: &str, status: &Value) -> Result<()> {
        validate_segment(field)?;
        validate_segment(frame_id)?;
        let mut documents = self
            .documents
            .lock()
            .map_err(|_| PipelineError::transient("annotation store lock poisoned"))?;
        let document = documents.entry(stream_id.to_string()).or_default();
        apply_status(document, field, frame_id, status, now_ms());
        Ok(())
    }

    fn fetch(&self, stream_id: &str) -> Result<Option<AnnotationRecord>> {
        let documents = self
            .documents
            .lock()
            .map_err(|_| PipelineError::transient("annotation store lock poisoned"))?;
        documents
            .get(stream_id)
            .map(|doc| AnnotationRecord::from_document(stream_id, &Value::Object(doc.clone())))
            .transpose()
    }
}
