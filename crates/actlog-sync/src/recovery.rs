//! Delivery recovery: diff the provider's delivery log against stored events
//! and ask the provider to redeliver what never arrived.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use actlog_adapters::{DeliveryLog, HookTarget, ProviderAdapter};
use actlog_core::DeliveryDescriptor;
use actlog_storage::EventStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

/// Share of the scheduling interval a single run may use.
pub const RUN_DEADLINE_FRACTION: f64 = 0.8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("a recovery run is already in progress")]
    AlreadyRunning,
}

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub interval: Duration,
    pub page_size: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            page_size: 100,
        }
    }
}

impl RecoveryConfig {
    pub fn run_budget(&self) -> Duration {
        self.interval.mul_f64(RUN_DEADLINE_FRACTION)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceStats {
    pub hook: String,
    pub pages: u32,
    pub scanned: usize,
    pub lost: usize,
    pub recovered: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryRunStats {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub recovered: usize,
    pub failed: usize,
    /// The deadline cut the run short.
    pub partial: bool,
    pub sources: Vec<SourceStats>,
    pub errors: Vec<String>,
}

/// Clears the running flag however the run ends.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct DeliveryReconciler {
    log: Arc<dyn DeliveryLog>,
    store: Arc<dyn EventStore>,
    adapter: Arc<dyn ProviderAdapter>,
    hooks: Vec<HookTarget>,
    config: RecoveryConfig,
    running: AtomicBool,
    span: Span,
}

enum PageEnd {
    Continue,
    Done,
    DeadlineExceeded,
}

impl DeliveryReconciler {
    pub fn new(
        log: Arc<dyn DeliveryLog>,
        store: Arc<dyn EventStore>,
        adapter: Arc<dyn ProviderAdapter>,
        hooks: Vec<HookTarget>,
        config: RecoveryConfig,
    ) -> Self {
        let config = RecoveryConfig {
            page_size: config.page_size.max(1),
            ..config
        };
        Self {
            log,
            store,
            adapter,
            hooks,
            config,
            running: AtomicBool::new(false),
            span: info_span!("delivery_reconciler"),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// One reconciliation pass over every configured hook. Rejected, not queued,
    /// while another pass is in flight.
    pub async fn run_once(&self) -> Result<RecoveryRunStats, ReconcileError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ReconcileError::AlreadyRunning);
        }
        let _guard = RunGuard(&self.running);
        let deadline = Instant::now() + self.config.run_budget();
        Ok(self.run_until(deadline).instrument(self.span.clone()).await)
    }

    async fn run_until(&self, deadline: Instant) -> RecoveryRunStats {
        let mut stats = RecoveryRunStats {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            recovered: 0,
            failed: 0,
            partial: false,
            sources: Vec::with_capacity(self.hooks.len()),
            errors: Vec::new(),
        };
        // Redelivery prepends to the log and shifts later pages.
        let mut attempted = HashSet::new();

        for hook in &self.hooks {
            if Instant::now() >= deadline {
                stats.partial = true;
                stats
                    .errors
                    .push(format!("{}: skipped, run deadline exceeded", hook.label()));
                continue;
            }
            let (source, cut_short) = self.reconcile_hook(hook, deadline, &mut attempted).await;
            stats.recovered += source.recovered;
            stats.failed += source.failed;
            if cut_short {
                stats.partial = true;
            }
            stats
                .errors
                .extend(source.errors.iter().map(|e| format!("{}: {e}", source.hook)));
            stats.sources.push(source);
        }

        stats.finished_at = Utc::now();
        info!(
            run_id = %stats.run_id,
            recovered = stats.recovered,
            failed = stats.failed,
            sources = stats.sources.len(),
            partial = stats.partial,
            errors = ?stats.errors,
            "recovery run finished"
        );
        stats
    }

    async fn reconcile_hook(
        &self,
        hook: &HookTarget,
        deadline: Instant,
        attempted: &mut HashSet<String>,
    ) -> (SourceStats, bool) {
        let mut stats = SourceStats {
            hook: hook.label(),
            ..SourceStats::default()
        };
        let page_size = self.config.page_size;
        let mut page = 1u32;

        loop {
            if Instant::now() >= deadline {
                stats
                    .errors
                    .push(format!("deadline exceeded before page {page}"));
                return (stats, true);
            }
            let deliveries =
                match timeout_at(deadline, self.log.list_deliveries(hook, page, page_size)).await {
                    Ok(Ok(deliveries)) => deliveries,
                    Ok(Err(err)) => {
                        warn!(hook = %stats.hook, page, error = %err, "listing deliveries failed");
                        stats.errors.push(format!("listing page {page}: {err}"));
                        return (stats, false);
                    }
                    Err(_) => {
                        stats
                            .errors
                            .push(format!("deadline exceeded while listing page {page}"));
                        return (stats, true);
                    }
                };
            stats.pages += 1;
            let fetched = deliveries.len();

            match self
                .recover_page(hook, &deliveries, deadline, attempted, &mut stats)
                .await {
                PageEnd::Continue => {}
                PageEnd::Done => return (stats, false),
                PageEnd::DeadlineExceeded => return (stats, true),
            }

            if fetched < page_size as usize {
                return (stats, false);
            }
            page += 1;
        }
    }

    async fn recover_page(
        &self,
        hook: &HookTarget,
        deliveries: &[DeliveryDescriptor],
        deadline: Instant,
        attempted: &mut HashSet<String>,
        stats: &mut SourceStats,
    ) -> PageEnd {
        // Redelivery attempts reuse the guid; keep the first descriptor seen.
        let mut ids: HashMap<&str, i64> = HashMap::new();
        let mut guids = Vec::new();
        for delivery in deliveries {
            if !self
                .adapter
                .is_handled(&delivery.event, delivery.action.as_deref())
            {
                continue;
            }
            if ids.insert(delivery.guid.as_str(), delivery.id).is_none() {
                guids.push(delivery.guid.clone());
            }
        }
        stats.scanned += guids.len();
        if guids.is_empty() {
            return PageEnd::Continue;
        }

        let lookup = self
            .store
            .find_lost_deliveries(self.adapter.provider(), &guids);
        let lost = match timeout_at(deadline, lookup).await {
            Ok(Ok(lost)) => lost,
            Ok(Err(err)) => {
                warn!(hook = %stats.hook, error = %err, "lost-delivery lookup failed");
                stats.errors.push(format!("lost-delivery lookup: {err}"));
                return PageEnd::Done;
            }
            Err(_) => {
                stats
                    .errors
                    .push("deadline exceeded during lost-delivery lookup".to_string());
                return PageEnd::DeadlineExceeded;
            }
        };

        for guid in lost {
            let Some(&delivery_id) = ids.get(guid.as_str()) else {
                continue;
            };
            if !attempted.insert(guid.clone()) {
                debug!(hook = %stats.hook, %guid, "already redelivered this run");
                continue;
            }
            stats.lost += 1;
            match timeout_at(deadline, self.log.redeliver(hook, delivery_id)).await {
                Ok(Ok(())) => {
                    debug!(hook = %stats.hook, %guid, delivery_id, "redelivery requested");
                    stats.recovered += 1;
                }
                Ok(Err(err)) => {
                    warn!(hook = %stats.hook, %guid, delivery_id, error = %err, "redelivery failed");
                    stats.failed += 1;
                    stats.errors.push(format!("redeliver {guid}: {err}"));
                }
                Err(_) => {
                    stats.failed += 1;
                    stats
                        .errors
                        .push(format!("deadline exceeded while redelivering {guid}"));
                    return PageEnd::DeadlineExceeded;
                }
            }
        }
        PageEnd::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use actlog_adapters::{ClientError, GithubAdapter};
    use actlog_core::{
        CanonicalEvent, EventPayload, IdempotencyKey, IssueOpened, NewEventRecord, Provider,
        RepositoryRef, StoredEventRecord,
    };
    use actlog_storage::{
        BulkInsertOutcome, EventFilter, FetchError, MemoryEventStore, StoreError,
    };
    use async_trait::async_trait;
    use tokio::sync::Semaphore;

    #[derive(Default)]
    struct FakeLog {
        deliveries: Vec<DeliveryDescriptor>,
        failing: Vec<i64>,
        list_calls: Mutex<Vec<u32>>,
        redelivered: Mutex<Vec<i64>>,
        gate: Option<Semaphore>,
        /// Page whose listing stalls, and for how long.
        list_delay: Option<(u32, Duration)>,
        redeliver_delay: Option<(i64, Duration)>,
    }

    fn delivery(id: i64, guid: &str, event: &str, action: Option<&str>) -> DeliveryDescriptor {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "guid": guid,
            "delivered_at": "2024-03-01T10:00:00Z",
            "redelivery": false,
            "duration": 0.1,
            "status": "OK",
            "status_code": 200,
            "event": event,
            "action": action,
        }))
        .unwrap()
    }

    #[async_trait]
    impl DeliveryLog for FakeLog {
        async fn list_deliveries(
            &self,
            _hook: &HookTarget,
            page: u32,
            per_page: u32,
        ) -> Result<Vec<DeliveryDescriptor>, ClientError> {
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            self.list_calls.lock().unwrap().push(page);
            if let Some((slow_page, delay)) = self.list_delay {
                if slow_page == page {
                    tokio::time::sleep(delay).await;
                }
            }
            let start = ((page - 1) * per_page) as usize;
            Ok(self
                .deliveries
                .iter()
                .skip(start)
                .take(per_page as usize)
                .cloned()
                .collect())
        }

        async fn redeliver(&self, _hook: &HookTarget, delivery_id: i64) -> Result<(), ClientError> {
            self.redelivered.lock().unwrap().push(delivery_id);
            if let Some((slow_id, delay)) = self.redeliver_delay {
                if slow_id == delivery_id {
                    tokio::time::sleep(delay).await;
                }
            }
            if self.failing.contains(&delivery_id) {
                return Err(ClientError::Fetch(FetchError::HttpStatus {
                    status: 422,
                    url: format!("/deliveries/{delivery_id}/attempts"),
                }));
            }
            Ok(())
        }
    }

    /// Memory store whose lost-delivery lookup hangs.
    struct StalledLookupStore {
        inner: MemoryEventStore,
        delay: Duration,
    }

    #[async_trait]
    impl EventStore for StalledLookupStore {
        async fn insert(&self, record: NewEventRecord) -> Result<StoredEventRecord, StoreError> {
            self.inner.insert(record).await
        }

        async fn bulk_insert(
            &self,
            batch: &[NewEventRecord],
        ) -> Result<BulkInsertOutcome, StoreError> {
            self.inner.bulk_insert(batch).await
        }

        async fn find_by_delivery(
            &self,
            provider: Provider,
            delivery_id: &str,
        ) -> Result<Option<StoredEventRecord>, StoreError> {
            self.inner.find_by_delivery(provider, delivery_id).await
        }

        async fn list(&self, filter: &EventFilter) -> Result<Vec<StoredEventRecord>, StoreError> {
            self.inner.list(filter).await
        }

        async fn exists(&self, key: &IdempotencyKey) -> Result<bool, StoreError> {
            self.inner.exists(key).await
        }

        async fn find_lost_deliveries(
            &self,
            provider: Provider,
            guids: &[String],
        ) -> Result<Vec<String>, StoreError> {
            tokio::time::sleep(self.delay).await;
            self.inner.find_lost_deliveries(provider, guids).await
        }

        async fn count(&self) -> Result<i64, StoreError> {
            self.inner.count().await
        }

        async fn mark_delivery_seen(
            &self,
            provider: Provider,
            delivery_id: &str,
        ) -> Result<(), StoreError> {
            self.inner.mark_delivery_seen(provider, delivery_id).await
        }
    }

    fn issue_opened(issue_id: i64) -> CanonicalEvent {
        CanonicalEvent::new(
            Provider::Github,
            Utc::now(),
            RepositoryRef {
                id: 1,
                full_name: "acme/widgets".into(),
            },
            EventPayload::IssueOpened(IssueOpened {
                issue_id,
                number: 1,
                title: "t".into(),
                author: "a".into(),
                html_url: String::new(),
            }),
        )
    }

    fn hook() -> HookTarget {
        HookTarget {
            owner: "acme".into(),
            repo: "widgets".into(),
            hook_id: 12,
            token: None,
        }
    }

    fn reconciler(
        log: Arc<FakeLog>,
        store: Arc<MemoryEventStore>,
        page_size: u32,
    ) -> DeliveryReconciler {
        DeliveryReconciler::new(
            log,
            store,
            Arc::new(GithubAdapter),
            vec![hook()],
            RecoveryConfig {
                interval: Duration::from_secs(60),
                page_size,
            },
        )
    }

    #[tokio::test]
    async fn pagination_stops_on_the_first_short_page() {
        let page_size = 5;
        let deliveries = (0..(3 * page_size + 1) as i64)
            .map(|i| delivery(i, &format!("g-{i}"), "ping", None))
            .collect();
        let log = Arc::new(FakeLog {
            deliveries,
            ..FakeLog::default()
        });
        let stats = reconciler(log.clone(), Arc::new(MemoryEventStore::new()), page_size)
            .run_once()
            .await
            .unwrap();

        assert_eq!(log.list_calls.lock().unwrap().as_slice(), [1, 2, 3, 4]);
        assert_eq!(stats.sources[0].pages, 4);
        assert_eq!(stats.recovered, 0, "ping deliveries are never redelivered");
    }

    #[tokio::test]
    async fn one_failed_redelivery_does_not_stop_the_rest() {
        let deliveries = (1..=5)
            .map(|i| delivery(i, &format!("lost-{i}"), "pull_request", Some("opened")))
            .collect();
        let log = Arc::new(FakeLog {
            deliveries,
            failing: vec![3],
            ..FakeLog::default()
        });
        let stats = reconciler(log.clone(), Arc::new(MemoryEventStore::new()), 100)
            .run_once()
            .await
            .unwrap();

        assert_eq!(log.redelivered.lock().unwrap().as_slice(), [1, 2, 3, 4, 5]);
        assert_eq!(stats.recovered, 4);
        assert_eq!(stats.failed, 1);
        assert!(!stats.partial);
        assert_eq!(stats.errors.len(), 1);
        assert!(stats.errors[0].contains("lost-3"));
    }

    #[tokio::test]
    async fn stored_unhandled_and_repeated_deliveries_are_not_redelivered() {
        let store = Arc::new(MemoryEventStore::new());
        store.save(&issue_opened(1), Some("seen")).await.unwrap();

        let log = Arc::new(FakeLog {
            deliveries: vec![
                delivery(1, "seen", "issues", Some("opened")),
                delivery(2, "labeled", "issues", Some("labeled")),
                delivery(3, "lost", "issues", Some("closed")),
                delivery(4, "lost", "issues", Some("closed")),
            ],
            ..FakeLog::default()
        });
        let stats = reconciler(log.clone(), store, 100).run_once().await.unwrap();

        assert_eq!(log.redelivered.lock().unwrap().as_slice(), [3]);
        assert_eq!(stats.sources[0].scanned, 2);
        assert_eq!(stats.sources[0].lost, 1);
        assert_eq!(stats.recovered, 1);
    }

    #[tokio::test]
    async fn duplicate_deliveries_stay_recovered_across_runs() {
        let store = Arc::new(MemoryEventStore::new());
        store.save(&issue_opened(7), Some("g-1")).await.unwrap();
        assert!(store
            .save(&issue_opened(7), Some("g-2"))
            .await
            .unwrap_err()
            .is_duplicate());

        let log = Arc::new(FakeLog {
            deliveries: vec![
                delivery(2, "g-2", "issues", Some("opened")),
                delivery(1, "g-1", "issues", Some("opened")),
            ],
            ..FakeLog::default()
        });
        let reconciler = reconciler(log.clone(), store, 100);
        for _ in 0..3 {
            let stats = reconciler.run_once().await.unwrap();
            assert_eq!(stats.recovered, 0);
            assert_eq!(stats.sources[0].lost, 0);
        }
        assert!(log.redelivered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn a_guid_shifted_onto_a_later_page_is_redelivered_once() {
        let log = Arc::new(FakeLog {
            deliveries: vec![
                delivery(1, "lost-1", "pull_request", Some("opened")),
                delivery(2, "lost-2", "pull_request", Some("opened")),
                delivery(3, "lost-1", "pull_request", Some("opened")),
            ],
            ..FakeLog::default()
        });
        let stats = reconciler(log.clone(), Arc::new(MemoryEventStore::new()), 2)
            .run_once()
            .await
            .unwrap();

        assert_eq!(log.list_calls.lock().unwrap().as_slice(), [1, 2]);
        assert_eq!(log.redelivered.lock().unwrap().as_slice(), [1, 2]);
        assert_eq!(stats.recovered, 2);
        assert_eq!(stats.sources[0].lost, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_lookup_is_cut_off_at_the_run_deadline() {
        let log = Arc::new(FakeLog {
            deliveries: vec![delivery(1, "lost-1", "pull_request", Some("opened"))],
            ..FakeLog::default()
        });
        let store = Arc::new(StalledLookupStore {
            inner: MemoryEventStore::new(),
            delay: Duration::from_secs(600),
        });
        let reconciler = DeliveryReconciler::new(
            log.clone(),
            store,
            Arc::new(GithubAdapter),
            vec![hook()],
            RecoveryConfig {
                interval: Duration::from_secs(60),
                page_size: 10,
            },
        );

        let started = Instant::now();
        let stats = reconciler.run_once().await.unwrap();

        assert!(started.elapsed() <= Duration::from_secs(48));
        assert!(stats.partial);
        assert!(log.redelivered.lock().unwrap().is_empty());
        assert!(stats.errors[0].contains("deadline exceeded during lost-delivery lookup"));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_during_a_later_page_listing_stops_paging() {
        let deliveries = (1..=5)
            .map(|i| delivery(i, &format!("lost-{i}"), "pull_request", Some("opened")))
            .collect();
        let log = Arc::new(FakeLog {
            deliveries,
            list_delay: Some((2, Duration::from_secs(600))),
            ..FakeLog::default()
        });
        let stats = reconciler(log.clone(), Arc::new(MemoryEventStore::new()), 2)
            .run_once()
            .await
            .unwrap();

        assert!(stats.partial);
        assert_eq!(log.list_calls.lock().unwrap().as_slice(), [1, 2]);
        assert_eq!(stats.sources[0].pages, 1);
        assert_eq!(log.redelivered.lock().unwrap().as_slice(), [1, 2]);
        assert_eq!(stats.recovered, 2);
        assert_eq!(stats.errors.len(), 1);
        assert!(stats.errors[0].contains("deadline exceeded while listing page 2"));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_during_a_redelivery_marks_the_run_partial() {
        let deliveries = (1..=3)
            .map(|i| delivery(i, &format!("lost-{i}"), "pull_request", Some("opened")))
            .collect();
        let log = Arc::new(FakeLog {
            deliveries,
            redeliver_delay: Some((2, Duration::from_secs(600))),
            ..FakeLog::default()
        });
        let stats = reconciler(log.clone(), Arc::new(MemoryEventStore::new()), 100)
            .run_once()
            .await
            .unwrap();

        assert!(stats.partial);
        assert_eq!(log.list_calls.lock().unwrap().as_slice(), [1]);
        assert_eq!(log.redelivered.lock().unwrap().as_slice(), [1, 2]);
        assert_eq!(stats.recovered, 1);
        assert_eq!(stats.failed, 1);
        assert!(stats.errors[0].contains("deadline exceeded while redelivering lost-2"));
    }

    #[tokio::test]
    async fn overlapping_runs_are_rejected() {
        let log = Arc::new(FakeLog {
            gate: Some(Semaphore::new(0)),
            ..FakeLog::default()
        });
        let reconciler = Arc::new(reconciler(log.clone(), Arc::new(MemoryEventStore::new()), 10));

        let first = tokio::spawn({
            let reconciler = Arc::clone(&reconciler);
            async move { reconciler.run_once().await }
        });
        while !reconciler.is_running() {
            tokio::task::yield_now().await;
        }
        assert_eq!(
            reconciler.run_once().await.unwrap_err(),
            ReconcileError::AlreadyRunning
        );

        if let Some(gate) = &log.gate {
            gate.add_permits(1);
        }
        first.await.unwrap().unwrap();
        assert!(!reconciler.is_running());

        if let Some(gate) = &log.gate {
            gate.add_permits(1);
        }
        reconciler.run_once().await.unwrap();
    }

    #[tokio::test]
    async fn exhausted_deadline_is_reported_as_partial() {
        let log = Arc::new(FakeLog::default());
        let reconciler = DeliveryReconciler::new(
            log.clone(),
            Arc::new(MemoryEventStore::new()),
            Arc::new(GithubAdapter),
            vec![hook(), hook()],
            RecoveryConfig {
                interval: Duration::ZERO,
                page_size: 10,
            },
        );
        let stats = reconciler.run_once().await.unwrap();

        assert!(stats.partial);
        assert!(log.list_calls.lock().unwrap().is_empty());
        assert_eq!(stats.errors.len(), 2);
    }

    #[test]
    fn run_budget_is_eighty_percent_of_the_interval() {
        let config = RecoveryConfig {
            interval: Duration::from_secs(3600),
            page_size: 100,
        };
        assert_eq!(config.run_budget(), Duration::from_secs(2880));
    }
}
