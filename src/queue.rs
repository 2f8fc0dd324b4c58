//! Job queues with at-least-once delivery.
//!
//! A received job stays hidden for the visibility timeout. It is removed
//! only by `delete` or `dead_letter` with the delivery's receipt; otherwise
//! it becomes visible again and is redelivered. Receipts are single-use: a redelivery
//! gets a fresh one and the old one stops working.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PipelineError, Result};
use crate::identity::decode_object_key;

/// One received job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub receipt: String,
    pub body: String,
    /// 1 on first delivery.
    pub receive_count: u32,
}

pub trait JobQueue: Send + Sync {
    fn name(&self) -> &str;

    fn send(&self, body: &str) -> Result<()>;

    /// Next visible job, or `None` when the queue has nothing to hand out.
    fn receive(&self) -> Result<Option<Delivery>>;

    /// Acknowledge. Returns `false` when the receipt is stale (the job was
    /// redelivered, or already deleted).
    fn delete(&self, receipt: &str) -> Result<bool>;

    /// Move a job that can never succeed out of the delivery path. It is kept
    /// as a dead letter and never handed out again. Returns `false` when the
    /// receipt is stale.
    fn dead_letter(&self, receipt: &str) -> Result<bool>;

    /// Jobs in the queue, visible or in flight.
    fn depth(&self) -> Result<usize>;
}

fn new_receipt() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Durable queue in a SQLite file. Several named queues can share one file.
///
/// With `max_receives` set, a job that has already been handed out that many
/// times is moved to the `dead_jobs` table instead of being delivered again.
pub struct SqliteJobQueue {
    conn: Mutex<Connection>,
    queue: String,
    visibility_timeout: Duration,
    max_receives: Option<u32>,
}

impl SqliteJobQueue {
    pub fn open(db_path: &str, queue: &str, visibility_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let store = Self {
            conn: Mutex::new(conn),
            queue: queue.to_string(),
            visibility_timeout,
            max_receives: None,
        };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn with_max_receives(mut self, max_receives: u32) -> Self {
        self.max_receives = if max_receives == 0 {
            None
        } else {
            Some(max_receives)
        };
        self
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| PipelineError::transient("queue connection lock poisoned"))
    }

    fn ensure_schema(&self) -> Result<()> {
        self.lock()?.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS jobs (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              queue TEXT NOT NULL,
              body TEXT NOT NULL,
              enqueued_at INTEGER NOT NULL,
              visible_at INTEGER NOT NULL,
              receive_count INTEGER NOT NULL DEFAULT 0,
              receipt TEXT
            );

            CREATE TABLE IF NOT EXISTS dead_jobs (
              id INTEGER PRIMARY KEY,
              queue TEXT NOT NULL,
              body TEXT NOT NULL,
              enqueued_at INTEGER NOT NULL,
              receive_count INTEGER NOT NULL,
              dead_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_visible ON jobs(queue, visible_at);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_receipt ON jobs(receipt);
            "#,
        )?;
        Ok(())
    }

    /// Bodies of jobs moved aside, either rejected outright or after
    /// exhausting `max_receives`.
    pub fn dead_letters(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT body FROM dead_jobs WHERE queue = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![self.queue], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

impl JobQueue for SqliteJobQueue {
    fn name(&self) -> &str {
        &self.queue
    }

    fn send(&self, body: &str) -> Result<()> {
        let now = now_ms();
        self.lock()?.execute(
            "INSERT INTO jobs (queue, body, enqueued_at, visible_at) VALUES (?1, ?2, ?3, ?3)",
            params![self.queue, body, now],
        )?;
        Ok(())
    }

    fn receive(&self) -> Result<Option<Delivery>> {
        let now = now_ms();
        let hidden_until = now.saturating_add(self.visibility_timeout.as_millis() as i64);
        let receipt = new_receipt();

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        if let Some(max) = self.max_receives {
            let moved = tx.execute(
                "INSERT INTO dead_jobs (id, queue, body, enqueued_at, receive_count, dead_at)
                 SELECT id, queue, body, enqueued_at, receive_count, ?3 FROM jobs
                 WHERE queue = ?1 AND visible_at <= ?3 AND receive_count >= ?2",
                params![self.queue, max, now],
            )?;
            if moved > 0 {
                tx.execute(
                    "DELETE FROM jobs WHERE queue = ?1 AND visible_at <= ?3 AND receive_count >= ?2",
                    params![self.queue, max, now],
                )?;
                log::warn!("queue {}: moved {} job(s) to dead letters", self.queue, moved);
            }
        }

        let delivery = tx
            .query_row(
                "UPDATE jobs
                 SET visible_at = ?1, receive_count = receive_count + 1, receipt = ?2
                 WHERE id = (
                   SELECT id FROM jobs WHERE queue = ?3 AND visible_at <= ?4
                   ORDER BY visible_at, id LIMIT 1
                 )
                 RETURNING body, receive_count",
                params![hidden_until, receipt, self.queue, now],
                |row| {
                    Ok(Delivery {
                        receipt: receipt.clone(),
                        body: row.get(0)?,
                        receive_count: row.get(1)?,
                    })
                },
            )
            .optional()?;
        tx.commit()?;
        Ok(delivery)
    }

    fn delete(&self, receipt: &str) -> Result<bool> {
        let deleted = self
            .lock()?
            .execute("DELETE FROM jobs WHERE receipt = ?1", params![receipt])?;
        Ok(deleted > 0)
    }

    fn dead_letter(&self, receipt: &str) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let moved = tx.execute(
            "INSERT INTO dead_jobs (id, queue, body, enqueued_at, receive_count, dead_at)
             SELECT id, queue, body, enqueued_at, receive_count, ?2 FROM jobs WHERE receipt = ?1",
            params![receipt, now_ms()],
        )?;
        if moved > 0 {
            tx.execute("DELETE FROM jobs WHERE receipt = ?1", params![receipt])?;
        }
        tx.commit()?;
        Ok(moved > 0)
    }

    fn depth(&self) -> Result<usize> {
        let count: i64 = self.lock()?.query_row(
            "SELECT COUNT(*) FROM jobs WHERE queue = ?1",
            params![self.queue],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

#[derive(Clone, Debug)]
struct InMemoryJob {
    body: String,
    visible_at: Instant,
    receive_count: u32,
    receipt: Option<String>,
}

/// Process-local queue with the same visibility semantics.
pub struct InMemoryJobQueue {
    name: String,
    visibility_timeout: Duration,
    jobs: Mutex<VecDeque<InMemoryJob>>,
    dead: Mutex<Vec<String>>,
}

impl InMemoryJobQueue {
    pub fn new(name: &str, visibility_timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            visibility_timeout,
            jobs: Mutex::new(VecDeque::new()),
            dead: Mutex::new(Vec::new()),
        }
    }

    pub fn dead_letters(&self) -> Result<Vec<String>> {
        self.dead
            .lock()
            .map(|dead| dead.clone())
            .map_err(|_| PipelineError::transient("dead-letter lock poisoned"))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, VecDeque<InMemoryJob>>> {
        self.jobs
            .lock()
            .map_err(|_| PipelineError::transient("queue lock poisoned"))
    }
}

impl JobQueue for InMemoryJobQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, body: &str) -> Result<()> {
        self.lock()?.push_back(InMemoryJob {
            body: body.to_string(),
            visible_at: Instant::now(),
            receive_count: 0,
            receipt: None,
        });
        Ok(())
    }

    fn receive(&self) -> Result<Option<Delivery>> {
        let now = Instant::now();
        let mut jobs = self.lock()?;
        let Some(job) = jobs.iter_mut().find(|job| job.visible_at <= now) else {
            return Ok(None);
        };
        let receipt = new_receipt();
        job.visible_at = now + self.visibility_timeout;
        job.receive_count += 1;
        job.receipt = Some(receipt.clone());
        Ok(Some(Delivery {
            receipt,
            body: job.body.clone(),
            receive_count: job.receive_count,
        }))
    }

    fn delete(&self, receipt: &str) -> Result<bool> {
        let mut jobs = self.lock()?;
        let before = jobs.len();
        jobs.retain(|job| job.receipt.as_deref() != Some(receipt));
        Ok(jobs.len() < before)
    }

    fn dead_letter(&self, receipt: &str) -> Result<bool> {
        let mut jobs = self.lock()?;
        let Some(position) = jobs
            .iter()
            .position(|job| job.receipt.as_deref() == Some(receipt))
        else {
            return Ok(false);
        };
        let Some(job) = jobs.remove(position) else {
            return Ok(false);
        };
        self.dead
            .lock()
            .map_err(|_| PipelineError::transient("dead-letter lock poisoned"))?
            .push(job.body);
        Ok(true)
    }

    fn depth(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }
}

/// A storage-event notification: one object landed in one bucket.
///
/// Wire form: `{"Records":[{"s3":{"bucket":{"name":…},"object":{"key":…}}}]}`
/// with the key URL-encoded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageEvent {
    pub bucket: String,
    /// Decoded object key.
    pub key: String,
}

impl StorageEvent {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    pub fn encode(&self) -> String {
        serde_json::json!({
            "Records": [{
                "s3": {
                    "bucket": { "name": self.bucket },
                    "object": { "key": encode_object_key(&self.key) }
                }
            }]
        })
        .to_string()
    }

    /// Decode the first record of an envelope.
    pub fn decode(body: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(body)
            .map_err(|err| PipelineError::MalformedJob(format!("not json: {}", err)))?;
        let record = value
            .get("Records")
            .and_then(Value::as_array)
            .and_then(|records| records.first())
            .ok_or_else(|| PipelineError::MalformedJob("missing Records[0]".into()))?;
        let bucket = record
            .pointer("/s3/bucket/name")
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| PipelineError::MalformedJob("missing s3.bucket.name".into()))?;
        let key = record
            .pointer("/s3/object/key")
            .and_then(Value::as_str)
            .filter(|key| !key.is_empty())
            .ok_or_else(|| PipelineError::MalformedJob("missing s3.object.key".into()))?;
        Ok(Self::new(bucket, decode_object_key(key)))
    }
}

/// Bytes escaped in notification keys: all but unreserved characters, `/`
/// and space (which becomes `+`).
const OBJECT_KEY_ESCAPES: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/')
    .remove(b' ');

/// Inverse of `decode_object_key`.
fn encode_object_key(key: &str) -> String {
    utf8_percent_encode(key, OBJECT_KEY_ESCAPES)
        .to_string()
        .replace(' ', "+")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise_visibility(queue: &dyn JobQueue) {
        queue.send("a").unwrap();
        let first = queue.receive().unwrap().unwrap();
        assert_eq!(first.body, "a");
        assert_eq!(first.receive_count, 1);

        // Zero visibility timeout: the unacked job is immediately redelivered.
        let second = queue.receive().unwrap().unwrap();
        assert_eq!(second.receive_count, 2);
        assert_ne!(first.receipt, second.receipt);

        assert!(!queue.delete(&first.receipt).unwrap());
        assert!(queue.delete(&second.receipt).unwrap());
        assert_eq!(queue.depth().unwrap(), 0);
        assert!(queue.receive().unwrap().is_none());
    }

    #[test]
    fn in_memory_queue_redelivers_unacked_jobs() {
        exercise_visibility(&InMemoryJobQueue::new("q", Duration::ZERO));
    }

    #[test]
    fn sqlite_queue_redelivers_unacked_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let queue = SqliteJobQueue::open(path.to_str().unwrap(), "q", Duration::ZERO).unwrap();
        exercise_visibility(&queue);
    }

    #[test]
    fn in_flight_jobs_are_hidden() {
        let queue = InMemoryJobQueue::new("q", Duration::from_secs(60));
        queue.send("a").unwrap();
        assert!(queue.receive().unwrap().is_some());
        assert!(queue.receive().unwrap().is_none());
        assert_eq!(queue.depth().unwrap(), 1);
    }

    #[test]
    fn sqlite_queues_share_a_file_but_not_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let path = path.to_str().unwrap();
        let fire = SqliteJobQueue::open(path, "fire", Duration::ZERO).unwrap();
        let fall = SqliteJobQueue::open(path, "fall", Duration::ZERO).unwrap();
        fire.send("x").unwrap();
        assert!(fall.receive().unwrap().is_none());
        assert_eq!(fire.receive().unwrap().unwrap().body, "x");
    }

    #[test]
    fn exhausted_jobs_move_to_dead_letters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let queue = SqliteJobQueue::open(path.to_str().unwrap(), "q", Duration::ZERO)
            .unwrap()
            .with_max_receives(2);
        queue.send("poison").unwrap();
        assert!(queue.receive().unwrap().is_some());
        assert!(queue.receive().unwrap().is_some());
        assert!(queue.receive().unwrap().is_none());
        assert_eq!(queue.dead_letters().unwrap(), vec!["poison".to_string()]);
        assert_eq!(queue.depth().unwrap(), 0);
    }

    fn exercise_dead_letter(queue: &dyn JobQueue) -> String {
        queue.send("poison").unwrap();
        let delivery = queue.receive().unwrap().unwrap();
        assert!(queue.dead_letter(&delivery.receipt).unwrap());
        assert!(!queue.dead_letter(&delivery.receipt).unwrap());
        assert!(queue.receive().unwrap().is_none());
        assert_eq!(queue.depth().unwrap(), 0);
        delivery.body
    }

    #[test]
    fn dead_lettered_jobs_are_never_redelivered() {
        let memory = InMemoryJobQueue::new("q", Duration::ZERO);
        let body = exercise_dead_letter(&memory);
        assert_eq!(memory.dead_letters().unwrap(), vec![body]);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let sqlite = SqliteJobQueue::open(path.to_str().unwrap(), "q", Duration::ZERO).unwrap();
        let body = exercise_dead_letter(&sqlite);
        assert_eq!(sqlite.dead_letters().unwrap(), vec![body]);
    }

    #[test]
    fn envelope_keys_are_url_decoded() {
        let body = r#"{"Records":[{"s3":{"bucket":{"name":"frames"},"object":{"key":"lobby+cam/frame_0001%2B.jpg"}}}]}"#;
        let event = StorageEvent::decode(body).unwrap();
        assert_eq!(event, StorageEvent::new("frames", "lobby cam/frame_0001+.jpg"));
        assert_eq!(StorageEvent::decode(&event.encode()).unwrap(), event);
    }

    #[test]
    fn envelope_keys_are_url_encoded() {
        assert_eq!(
            encode_object_key("lobby cam/frame+1 é.jpg"),
            "lobby+cam/frame%2B1+%C3%A9.jpg"
        );
        assert_eq!(encode_object_key("a-b_c.d~e/f"), "a-b_c.d~e/f");
    }

    #[test]
    fn malformed_envelopes_are_fatal() {
        for body in [
            "not json",
            "{}",
            r#"{"Records":[]}"#,
            r#"{"Records":[{"s3":{"bucket":{"name":"b"}}}]}"#,
        ] {
            let err = StorageEvent::decode(body).unwrap_err();
            assert!(matches!(err, PipelineError::MalformedJob(_)), "{}", body);
            assert!(!err.is_retryable());
        }
    }
}
