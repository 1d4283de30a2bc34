//! Queue-backed bulk ingestion.
//!
//! Events are appended to a durable queue and flushed into the store in
//! batches, either when the queue reaches `batch_size` or when the flush
//! interval elapses. A batch whose transaction fails goes back on the queue.

use std::sync::Arc;
use std::time::Duration;

use actlog_core::{CanonicalEvent, NewEventRecord};
use actlog_storage::{DurableQueue, EventStore, QueueError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("encoding queued event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Queue(#[from] QueueError),
    /// The batch failed to commit and could not be put back on the queue either.
    #[error("requeue of {count} items failed: {source}")]
    RequeueFailed {
        count: usize,
        #[source]
        source: QueueError,
    },
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub stream: String,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval: Duration::from_secs(5),
            stream: "events".to_string(),
        }
    }
}

/// Queue item: the event plus what the live path knew when it arrived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedEvent {
    pub event: CanonicalEvent,
    pub delivery_id: Option<String>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    pub drained: usize,
    pub inserted: usize,
    pub duplicates: usize,
    /// Items that could not be decoded; dropped.
    pub malformed: usize,
    /// Items put back on the queue after a failed transaction.
    pub requeued: usize,
}

pub struct BatchPipeline {
    store: Arc<dyn EventStore>,
    queue: Arc<dyn DurableQueue>,
    config: BatchConfig,
    flush_needed: Notify,
    span: Span,
}

impl BatchPipeline {
    pub fn new(store: Arc<dyn EventStore>, queue: Arc<dyn DurableQueue>, config: BatchConfig) -> Self {
        let config = BatchConfig {
            batch_size: config.batch_size.max(1),
            ..config
        };
        Self {
            store,
            queue,
            config,
            flush_needed: Notify::new(),
            span: info_span!("batch_pipeline"),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Appends one event and wakes the flush loop once the size threshold is reached.
    pub async fn enqueue(
        &self,
        event: &CanonicalEvent,
        delivery_id: Option<&str>,
        received_at: DateTime<Utc>,
    ) -> Result<(), BatchError> {
        let item = serde_json::to_string(&QueuedEvent {
            event: event.clone(),
            delivery_id: delivery_id.map(ToString::to_string),
            received_at,
        })?;
        let stream = &self.config.stream;
        self.queue.append(stream, std::slice::from_ref(&item)).await?;
        if self.queue.len(stream).await? >= self.config.batch_size {
            self.flush_needed.notify_one();
        }
        Ok(())
    }

    /// Drains up to `batch_size` items and bulk-inserts them in enqueue order.
    pub async fn flush(&self) -> Result<FlushOutcome, BatchError> {
        self.flush_inner().instrument(self.span.clone()).await
    }

    async fn flush_inner(&self) -> Result<FlushOutcome, BatchError> {
        let stream = &self.config.stream;
        let raw = self.queue.drain(stream, self.config.batch_size).await?;
        let mut outcome = FlushOutcome {
            drained: raw.len(),
            ..FlushOutcome::default()
        };
        if raw.is_empty() {
            return Ok(outcome);
        }

        let mut records = Vec::with_capacity(raw.len());
        let mut kept = Vec::with_capacity(raw.len());
        for item in raw {
            let decoded = serde_json::from_str::<QueuedEvent>(&item).and_then(|queued| {
                NewEventRecord::webhook(&queued.event, queued.delivery_id, queued.received_at)
            });
            match decoded {
                Ok(record) => {
                    records.push(record);
                    kept.push(item);
                }
                Err(err) => {
                    warn!(error = %err, "dropping malformed queue item");
                    outcome.malformed += 1;
                }
            }
        }

        match self.store.bulk_insert(&records).await {
            Ok(result) => {
                outcome.inserted = result.inserted.len();
                outcome.duplicates = result.duplicates;
                if result.duplicates > 0 {
                    debug!(duplicates = result.duplicates, "batch contained duplicates");
                }
                info!(
                    drained = outcome.drained,
                    inserted = outcome.inserted,
                    duplicates = outcome.duplicates,
                    malformed = outcome.malformed,
                    "batch flushed"
                );
                Ok(outcome)
            }
            Err(err) => {
                error!(error = %err, count = kept.len(), "bulk insert failed; requeueing batch");
                let count = kept.len();
                self.queue
                    .append(stream, &kept)
                    .await
                    .map_err(|source| BatchError::RequeueFailed { count, source })?;
                outcome.requeued = count;
                Ok(outcome)
            }
        }
    }

    /// Flushes on every interval tick or size notification until `shutdown` flips
    /// to true, then performs one last flush.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.flush_needed.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if let Err(err) = self.flush().await {
                error!(parent: &self.span, error = %err, "flush failed");
            }
        }

        if let Err(err) = self.flush().await {
            error!(parent: &self.span, error = %err, "final flush failed");
        }
        info!(parent: &self.span, "flush loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actlog_core::{EventPayload, IssueOpened, Provider, RepositoryRef};
    use actlog_storage::{MemoryEventStore, MemoryQueue};

    fn issue(issue_id: i64) -> CanonicalEvent {
        CanonicalEvent::new(
            Provider::Github,
            Utc::now(),
            RepositoryRef {
                id: 1,
                full_name: "acme/widgets".into(),
            },
            EventPayload::IssueOpened(IssueOpened {
                issue_id,
                number: issue_id,
                title: format!("issue {issue_id}"),
                author: "octocat".into(),
                html_url: String::new(),
            }),
        )
    }

    fn pipeline(batch_size: usize) -> (Arc<MemoryEventStore>, Arc<MemoryQueue>, BatchPipeline) {
        let store = Arc::new(MemoryEventStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let pipeline = BatchPipeline::new(
            store.clone(),
            queue.clone(),
            BatchConfig {
                batch_size,
                flush_interval: Duration::from_secs(3600),
                stream: "events".into(),
            },
        );
        (store, queue, pipeline)
    }

    #[tokio::test]
    async fn flush_commits_new_rows_and_counts_duplicates() {
        let (store, queue, pipeline) = pipeline(10);
        store.save(&issue(1), Some("d-1")).await.unwrap();
        for id in [1, 2, 3, 2] {
            pipeline.enqueue(&issue(id), None, Utc::now()).await.unwrap();
        }

        let outcome = pipeline.flush().await.unwrap();
        assert_eq!(outcome.drained, 4);
        assert_eq!(outcome.inserted, 2);
        assert_eq!(outcome.duplicates, 2);
        assert_eq!(outcome.requeued, 0);
        assert_eq!(store.count().await.unwrap(), 3);
        assert_eq!(queue.len("events").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_transaction_requeues_the_whole_batch() {
        let (store, queue, pipeline) = pipeline(10);
        for id in 1..=4 {
            pipeline.enqueue(&issue(id), None, Utc::now()).await.unwrap();
        }
        let before = queue.snapshot("events");

        store.set_available(false);
        let outcome = pipeline.flush().await.unwrap();
        assert_eq!(outcome.requeued, 4);
        assert_eq!(queue.snapshot("events"), before);

        store.set_available(true);
        assert_eq!(store.count().await.unwrap(), 0);
        let outcome = pipeline.flush().await.unwrap();
        assert_eq!(outcome.inserted, 4);
        assert_eq!(store.count().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn flush_takes_at_most_one_batch_in_order() {
        let (store, queue, pipeline) = pipeline(3);
        for id in 1..=5 {
            pipeline.enqueue(&issue(id), None, Utc::now()).await.unwrap();
        }
        pipeline.flush().await.unwrap();

        let ids: Vec<String> = store.rows().iter().map(|r| r.resource_id.clone()).collect();
        assert_eq!(ids, ["1", "2", "3"]);
        assert_eq!(queue.len("events").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn malformed_items_are_dropped_without_failing_the_batch() {
        let (store, queue, pipeline) = pipeline(10);
        queue.append("events", &["{not json".to_string()]).await.unwrap();
        pipeline.enqueue(&issue(9), Some("d-9"), Utc::now()).await.unwrap();

        let outcome = pipeline.flush().await.unwrap();
        assert_eq!(outcome.malformed, 1);
        assert_eq!(outcome.inserted, 1);
        let row = &store.rows()[0];
        assert_eq!(row.delivery_id.as_deref(), Some("d-9"));
    }

    #[tokio::test]
    async fn size_threshold_wakes_the_flush_loop() {
        let (store, _queue, pipeline) = pipeline(2);
        let pipeline = Arc::new(pipeline);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&pipeline).run(rx));

        pipeline.enqueue(&issue(1), None, Utc::now()).await.unwrap();
        pipeline.enqueue(&issue(2), None, Utc::now()).await.unwrap();

        for _ in 0..100 {
            if store.count().await.unwrap() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.count().await.unwrap(), 2);

        pipeline.enqueue(&issue(3), None, Utc::now()).await.unwrap();
        tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(store.count().await.unwrap(), 3, "shutdown performs a final flush");
    }
    #[tokio::test(start_paused = true)]
    async fn interval_tick_flushes_a_partial_batch() {
        let store = Arc::new(MemoryEventStore::new());
        let pipeline = Arc::new(BatchPipeline::new(
            store.clone(),
            Arc::new(MemoryQueue::new()),
            BatchConfig {
                batch_size: 100,
                flush_interval: Duration::from_secs(5),
                stream: "events".into(),
            },
        ));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&pipeline).run(rx));
        // Let the immediate first tick pass on an empty queue.
        tokio::time::sleep(Duration::from_millis(1)).await;

        pipeline.enqueue(&issue(1), None, Utc::now()).await.unwrap();
        pipeline.enqueue(&issue(2), None, Utc::now()).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(store.count().await.unwrap(), 0, "below the size threshold");

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(store.count().await.unwrap(), 2);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
