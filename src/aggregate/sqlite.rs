use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use super::{now_ms, validate_segment, AnnotationRecord, AnnotationStore};
use crate::error::{PipelineError, Result};

/// One row per stream, the record held as a JSON document.
///
/// A merge is a single `INSERT … ON CONFLICT DO UPDATE` statement, so it is
/// atomic with respect to every other connection on the same file. When the
/// target entry already holds the value, the row is rewritten with itself.
pub struct SqliteAnnotationStore {
    conn: Mutex<Connection>,
}

const MERGE_SQL: &str = r#"
INSERT INTO annotations (stream_id, document, updated_at)
VALUES (?1, json_object(?2, json_object(?3, json(?4)), 'updated_at', ?5), ?5)
ON CONFLICT(stream_id) DO UPDATE SET
  document = CASE
    WHEN (annotations.document -> ?6) = json(?4) THEN annotations.document
    ELSE json_set(
      annotations.document,
      ?7, json(COALESCE(annotations.document -> ?7, '{}')),
      ?6, json(?4),
      '$.updated_at', ?5
    )
  END,
  updated_at = CASE
    WHEN (annotations.document -> ?6) = json(?4) THEN annotations.updated_at
    ELSE ?5
  END
"#;

impl SqliteAnnotationStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| PipelineError::transient("annotation connection lock poisoned"))
    }

    fn ensure_schema(&self) -> Result<()> {
        self.lock()?.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS annotations (
              stream_id TEXT PRIMARY KEY,
              document TEXT NOT NULL,
              updated_at INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    /// Stream ids with a record, most recently updated first.
    pub fn streams(&self, limit: usize) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT stream_id FROM annotations ORDER BY updated_at DESC LIMIT ?1")?;
        let rows = stmt.query_map(params![limit as i64], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn field_path(field: &str) -> String {
    format!("$.\"{}\"", field)
}

fn entry_path(field: &str, frame_id: &str) -> String {
    format!("$.\"{}\".\"{}\"", field, frame_id)
}

impl AnnotationStore for SqliteAnnotationStore {
    fn merge(&self, stream_id: &str, field: &str, frame_id: &str, status: &Value) -> Result<()> {
        validate_segment(field)?;
        validate_segment(frame_id)?;
        let status_json = serde_json::to_string(status)
            .map_err(|err| PipelineError::InvalidKey(format!("status not serializable: {}", err)))?;
        self.lock()?.execute(
            MERGE_SQL,
            params![
                stream_id,
                field,
                frame_id,
                status_json,
                now_ms(),
                entry_path(field, frame_id),
                field_path(field),
            ],
        )?;
        Ok(())
    }

    fn fetch(&self, stream_id: &str) -> Result<Option<AnnotationRecord>> {
        let document: Option<String> = self
            .lock()?
            .query_row(
                "SELECT document FROM annotations WHERE stream_id = ?1",
                params![stream_id],
                |row| row.get(0),
            )
            .optional()?;
        match document {
            Some(text) => {
                let value: Value = serde_json::from_str(&text).map_err(|err| {
                    PipelineError::transient(format!("corrupt annotation document: {}", err))
                })?;
                AnnotationRecord::from_document(stream_id, &value).map(Some)
            }
            None => Ok(None),
        }
    }
}
