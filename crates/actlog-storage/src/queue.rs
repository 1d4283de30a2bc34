//! Durable FIFO lists used to stage events before bulk persistence.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::Row;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        QueueError::Unavailable(err.to_string())
    }
}

/// Append-at-tail, remove-from-head list keyed by stream name.
///
/// `drain` is atomic per call: two concurrent drains never return the same item.
#[async_trait]
pub trait DurableQueue: Send + Sync {
    async fn append(&self, stream: &str, items: &[String]) -> Result<(), QueueError>;
    async fn drain(&self, stream: &str, max: usize) -> Result<Vec<String>, QueueError>;
    async fn len(&self, stream: &str) -> Result<usize, QueueError>;
}

#[derive(Debug)]
pub struct MemoryQueue {
    streams: Mutex<HashMap<String, VecDeque<String>>>,
    available: AtomicBool,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Current contents of a stream, head first.
    pub fn snapshot(&self, stream: &str) -> Vec<String> {
        self.streams
            .lock()
            .map(|s| s.get(stream).map(|q| q.iter().cloned().collect()).unwrap_or_default())
            .unwrap_or_default()
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, VecDeque<String>>>, QueueError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable("memory queue marked unavailable".into()));
        }
        self.streams
            .lock()
            .map_err(|_| QueueError::Unavailable("memory queue lock poisoned".into()))
    }
}

#[async_trait]
impl DurableQueue for MemoryQueue {
    async fn append(&self, stream: &str, items: &[String]) -> Result<(), QueueError> {
        let mut streams = self.lock()?;
        streams
            .entry(stream.to_string())
            .or_default()
            .extend(items.iter().cloned());
        Ok(())
    }

    async fn drain(&self, stream: &str, max: usize) -> Result<Vec<String>, QueueError> {
        let mut streams = self.lock()?;
        let Some(queue) = streams.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let take = max.min(queue.len());
        Ok(queue.drain(..take).collect())
    }

    async fn len(&self, stream: &str) -> Result<usize, QueueError> {
        Ok(self.lock()?.get(stream).map_or(0, VecDeque::len))
    }
}

/// Queue backed by the `event_queue` table.
#[derive(Debug, Clone)]
pub struct PgQueue {
    pool: PgPool,
}

impl PgQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DurableQueue for PgQueue {
    async fn append(&self, stream: &str, items: &[String]) -> Result<(), QueueError> {
        if items.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            INSERT INTO event_queue (stream, item)
            SELECT $1, u.item
              FROM UNNEST($2::text[]) WITH ORDINALITY AS u(item, ord)
             ORDER BY u.ord
            "#,
        )
        .bind(stream)
        .bind(items)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn drain(&self, stream: &str, max: usize) -> Result<Vec<String>, QueueError> {
        if max == 0 {
            return Ok(Vec::new());
        }
        // SKIP LOCKED keeps concurrent drains disjoint.
        let rows = sqlx::query(
            r#"
            WITH head AS (
                SELECT id FROM event_queue
                 WHERE stream = $1
                 ORDER BY id
                 LIMIT $2
                 FOR UPDATE SKIP LOCKED
            )
            DELETE FROM event_queue q
             USING head
             WHERE q.id = head.id
            RETURNING q.id, q.item
            "#,
        )
        .bind(stream)
        .bind(i64::try_from(max).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let mut drained = rows
            .iter()
            .map(|row| Ok((row.try_get::<i64, _>("id")?, row.try_get::<String, _>("item")?)))
            .collect::<Result<Vec<_>, sqlx::Error>>()?;
        drained.sort_by_key(|(id, _)| *id);
        Ok(drained.into_iter().map(|(_, item)| item).collect())
    }

    async fn len(&self, stream: &str) -> Result<usize, QueueError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM event_queue WHERE stream = $1")
            .bind(stream)
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(usize::try_from(n).unwrap_or_default())
    }
}
