//! Idempotent event persistence.
//!
//! Every ingestion path goes through [`EventStore`]. Uniqueness of the
//! idempotency key is the only arbiter between concurrent writers: for one key
//! exactly one insert succeeds and every other attempt sees
//! [`StoreError::Duplicate`].

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use actlog_core::{
    CanonicalEvent, EventKind, IdempotencyKey, NewEventRecord, Provider, ResourceType,
    StoredEventRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The idempotency key (or the legacy delivery pair) already exists.
    #[error("duplicate event")]
    Duplicate,
    #[error("store unavailable: {message}")]
    Unavailable { message: String },
    #[error("malformed stored row: {message}")]
    Malformed { message: String },
    #[error("encoding event payload: {0}")]
    Encode(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, StoreError::Duplicate)
    }

    /// Connectivity failures are worth retrying; bad data is not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkInsertOutcome {
    /// Keys of the rows committed by this call, in submission order.
    pub inserted: Vec<IdempotencyKey>,
    /// Rows skipped because their key was already taken.
    pub duplicates: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter {
    pub provider: Option<Provider>,
    pub kind: Option<EventKind>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: u32,
    pub offset: u32,
}

impl Default for EventFilter {
    fn default() -> Self {
        Self {
            provider: None,
            kind: None,
            since: None,
            until: None,
            limit: 50,
            offset: 0,
        }
    }
}

impl EventFilter {
    pub fn matches(&self, record: &StoredEventRecord) -> bool {
        self.provider.map_or(true, |p| record.provider == p)
            && self.kind.map_or(true, |k| record.kind == k)
            && self.since.map_or(true, |since| record.received_at >= since)
            && self.until.map_or(true, |until| record.received_at < until)
    }
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Inserts one row, failing with [`StoreError::Duplicate`] on any unique conflict.
    async fn insert(&self, record: NewEventRecord) -> Result<StoredEventRecord, StoreError>;

    /// Inserts a batch in one transaction. Conflicting rows are skipped and
    /// counted; any other failure commits nothing.
    async fn bulk_insert(&self, batch: &[NewEventRecord])
        -> Result<BulkInsertOutcome, StoreError>;

    async fn find_by_delivery(
        &self,
        provider: Provider,
        delivery_id: &str,
    ) -> Result<Option<StoredEventRecord>, StoreError>;

    async fn list(&self, filter: &EventFilter) -> Result<Vec<StoredEventRecord>, StoreError>;

    async fn exists(&self, key: &IdempotencyKey) -> Result<bool, StoreError>;

    /// Returns the guids, in input order, that have no local record.
    async fn find_lost_deliveries(
        &self,
        provider: Provider,
        guids: &[String],
    ) -> Result<Vec<String>, StoreError>;

    async fn count(&self) -> Result<i64, StoreError>;

    /// Records a delivery whose event was already stored under another guid,
    /// so the lost-delivery lookup stops reporting it.
    async fn mark_delivery_seen(
        &self,
        provider: Provider,
        delivery_id: &str,
    ) -> Result<(), StoreError>;

    /// Live-path insert tagged `webhook`.
    async fn save(
        &self,
        event: &CanonicalEvent,
        delivery_id: Option<&str>,
    ) -> Result<StoredEventRecord, StoreError> {
        let record =
            NewEventRecord::webhook(event, delivery_id.map(ToString::to_string), Utc::now())?;
        match self.insert(record).await {
            Err(StoreError::Duplicate) => {
                if let Some(delivery_id) = delivery_id {
                    self.mark_delivery_seen(event.provider(), delivery_id).await?;
                }
                Err(StoreError::Duplicate)
            }
            other => other,
        }
    }

    /// Backfill insert tagged `historical`, sharing the live identity space.
    async fn save_historical(
        &self,
        event: &CanonicalEvent,
        resource_type: ResourceType,
        resource_id: &str,
    ) -> Result<StoredEventRecord, StoreError> {
        let record = NewEventRecord::historical(event, resource_type, resource_id, Utc::now())?;
        self.insert(record).await
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: Vec<StoredEventRecord>,
    keys: HashSet<IdempotencyKey>,
    deliveries: HashSet<(Provider, String)>,
    seen: HashSet<(Provider, String)>,
}

impl MemoryState {
    fn conflicts(&self, record: &NewEventRecord) -> bool {
        self.keys.contains(&record.event_key)
            || record
                .delivery_id
                .as_ref()
                .is_some_and(|d| self.deliveries.contains(&(record.provider, d.clone())))
    }

    fn is_known(&self, provider: Provider, delivery_id: &str) -> bool {
        let pair = (provider, delivery_id.to_string());
        self.deliveries.contains(&pair) || self.seen.contains(&pair)
    }

    fn push(&mut self, record: NewEventRecord) -> StoredEventRecord {
        let seq = self.rows.len() as i64 + 1;
        self.keys.insert(record.event_key.clone());
        if let Some(delivery_id) = &record.delivery_id {
            self.deliveries.insert((record.provider, delivery_id.clone()));
        }
        let stored = StoredEventRecord::from_new(seq, record);
        self.rows.push(stored.clone());
        stored
    }
}

/// In-process store with the same uniqueness rules as the Postgres schema.
#[derive(Debug)]
pub struct MemoryEventStore {
    state: Mutex<MemoryState>,
    available: AtomicBool,
}

impl Default for MemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulates losing the connection: every call fails until re-enabled.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn rows(&self) -> Vec<StoredEventRecord> {
        self.lock().map(|s| s.rows.clone()).unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, StoreError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable {
                message: "memory store marked unavailable".into(),
            });
        }
        self.state.lock().map_err(|_| StoreError::Unavailable {
            message: "memory store lock poisoned".into(),
        })
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn insert(&self, record: NewEventRecord) -> Result<StoredEventRecord, StoreError> {
        let mut state = self.lock()?;
        if state.conflicts(&record) {
            return Err(StoreError::Duplicate);
        }
        Ok(state.push(record))
    }

    async fn bulk_insert(
        &self,
        batch: &[NewEventRecord],
    ) -> Result<BulkInsertOutcome, StoreError> {
        let mut state = self.lock()?;
        let mut outcome = BulkInsertOutcome::default();
        for record in batch {
            if state.conflicts(record) {
                if let Some(delivery_id) = &record.delivery_id {
                    state.seen.insert((record.provider, delivery_id.clone()));
                }
                outcome.duplicates += 1;
                continue;
            }
            outcome.inserted.push(record.event_key.clone());
            state.push(record.clone());
        }
        Ok(outcome)
    }

    async fn find_by_delivery(
        &self,
        provider: Provider,
        delivery_id: &str,
    ) -> Result<Option<StoredEventRecord>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .rows
            .iter()
            .find(|r| r.provider == provider && r.delivery_id.as_deref() == Some(delivery_id))
            .cloned())
    }

    async fn list(&self, filter: &EventFilter) -> Result<Vec<StoredEventRecord>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .rows
            .iter()
            .filter(|r| filter.matches(r))
            .skip(filter.offset as usize)
            .take(filter.limit as usize)
            .cloned()
            .collect())
    }

    async fn exists(&self, key: &IdempotencyKey) -> Result<bool, StoreError> {
        Ok(self.lock()?.keys.contains(key))
    }

    async fn find_lost_deliveries(
        &self,
        provider: Provider,
        guids: &[String],
    ) -> Result<Vec<String>, StoreError> {
        let state = self.lock()?;
        let mut seen = HashSet::new();
        Ok(guids
            .iter()
            .filter(|g| !state.is_known(provider, g))
            .filter(|g| seen.insert((*g).clone()))
            .cloned()
            .collect())
    }

    async fn count(&self) -> Result<i64, StoreError> {
        Ok(self.lock()?.rows.len() as i64)
    }

    async fn mark_delivery_seen(
        &self,
        provider: Provider,
        delivery_id: &str,
    ) -> Result<(), StoreError> {
        self.lock()?
            .seen
            .insert((provider, delivery_id.to_string()));
        Ok(())
    }
}
