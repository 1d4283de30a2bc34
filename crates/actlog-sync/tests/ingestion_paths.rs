//! Cross-component behaviour: backfill, batch and live saves share one identity space.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use actlog_adapters::{
    ClientError, DeliveryLog, GhIssue, GhPullRequest, GhReview, GithubAdapter, HistoricalSource,
    HookTarget, RepoTarget,
};
use actlog_core::{DeliveryDescriptor, EventKind, EventSource, Provider, RepositoryRef, ResourceType};
use actlog_storage::{EventStore, MemoryEventStore, MemoryQueue};
use actlog_sync::{
    BackfillFetcher, BackfillOptions, BackfillSelection, BatchConfig, BatchPipeline,
    DeliveryReconciler, RecoveryConfig, RecoveryScheduler,
};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

#[derive(Default)]
struct FakeHistory {
    prs: Vec<GhPullRequest>,
    reviews: HashMap<i64, Vec<GhReview>>,
    issues: Vec<GhIssue>,
    pr_pages: AtomicU32,
}

fn slice_page<T: Clone>(items: &[T], page: u32, per_page: u32) -> Vec<T> {
    items
        .iter()
        .skip(((page - 1) * per_page) as usize)
        .take(per_page as usize)
        .cloned()
        .collect()
}

#[async_trait]
impl HistoricalSource for FakeHistory {
    async fn repository(&self, _target: &RepoTarget) -> Result<RepositoryRef, ClientError> {
        Ok(RepositoryRef {
            id: 99,
            full_name: "acme/widgets".into(),
        })
    }

    async fn list_pull_requests(
        &self,
        _target: &RepoTarget,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<GhPullRequest>, ClientError> {
        self.pr_pages.fetch_add(1, Ordering::SeqCst);
        Ok(slice_page(&self.prs, page, per_page))
    }

    async fn list_reviews(
        &self,
        _target: &RepoTarget,
        pr_number: i64,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<GhReview>, ClientError> {
        let reviews = self.reviews.get(&pr_number).cloned().unwrap_or_default();
        Ok(slice_page(&reviews, page, per_page))
    }

    async fn list_issues(
        &self,
        _target: &RepoTarget,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<GhIssue>, ClientError> {
        Ok(slice_page(&self.issues, page, per_page))
    }
}

fn pull_request(number: i64, closed_and_merged: bool) -> GhPullRequest {
    let (state, closed_at) = if closed_and_merged {
        ("closed", json!("2024-03-02T09:00:00Z"))
    } else {
        ("open", json!(null))
    };
    serde_json::from_value(json!({
        "id": 1_000_000 + number,
        "number": number,
        "title": format!("PR {number}"),
        "user": {"login": "octocat"},
        "state": state,
        "html_url": format!("https://github.com/acme/widgets/pull/{number}"),
        "merged_at": closed_at.clone(),
        "head": {"ref": "feature"},
        "base": {"ref": "main"},
        "created_at": "2024-03-01T10:00:00Z",
        "closed_at": closed_at
    }))
    .unwrap()
}

fn review(id: i64, state: &str) -> GhReview {
    serde_json::from_value(json!({
        "id": id,
        "user": {"login": "reviewer"},
        "state": state,
        "body": "looks good",
        "submitted_at": "2024-03-01T12:00:00Z"
    }))
    .unwrap()
}

fn options(selection: BackfillSelection, per_page: u32) -> BackfillOptions {
    BackfillOptions {
        target: RepoTarget {
            owner: "acme".into(),
            repo: "widgets".into(),
            token: None,
        },
        selection,
        per_page,
        dry_run: false,
    }
}

#[tokio::test]
async fn merged_pr_with_two_reviews_backfills_four_events_once() {
    let history = Arc::new(FakeHistory {
        prs: vec![pull_request(7, true)],
        reviews: HashMap::from([(7, vec![review(701, "APPROVED"), review(702, "COMMENTED")])]),
        ..FakeHistory::default()
    });
    let store = Arc::new(MemoryEventStore::new());
    let fetcher = BackfillFetcher::new(history, store.clone());
    let opts = options(BackfillSelection::default(), 50);

    let first = fetcher.run(&opts).await.unwrap();
    assert_eq!(first.progress.success, 4);
    assert_eq!(first.progress.skipped, 0);
    let mut kinds: Vec<EventKind> = store.rows().iter().map(|r| r.kind).collect();
    kinds.sort_by_key(|k| k.as_str());
    assert_eq!(
        kinds,
        [
            EventKind::PrClosed,
            EventKind::PrOpened,
            EventKind::ReviewSubmitted,
            EventKind::ReviewSubmitted
        ]
    );
    assert!(store.rows().iter().all(|r| r.source == EventSource::Historical));

    let second = fetcher.run(&opts).await.unwrap();
    assert_eq!(second.progress.success, 0);
    assert_eq!(second.progress.skipped, 4);
    assert_eq!(second.progress.failure, 0);
    assert_eq!(store.count().await.unwrap(), 4);
}

#[tokio::test]
async fn backfill_pagination_stops_after_the_short_page() {
    let per_page = 4;
    let history = Arc::new(FakeHistory {
        prs: (1..=(3 * per_page as i64 + 1))
            .map(|n| pull_request(n, false))
            .collect(),
        ..FakeHistory::default()
    });
    let store = Arc::new(MemoryEventStore::new());
    let fetcher = BackfillFetcher::new(history.clone(), store.clone());
    let selection: BackfillSelection = "pull_requests".parse().unwrap();

    let summary = fetcher.run(&options(selection, per_page)).await.unwrap();
    assert_eq!(history.pr_pages.load(Ordering::SeqCst), 4);
    assert_eq!(summary.resources, 13);
    assert_eq!(store.count().await.unwrap(), 13);
}

#[tokio::test]
async fn store_outage_fails_each_resource_without_aborting_the_run() {
    let history = Arc::new(FakeHistory {
        prs: vec![pull_request(1, false), pull_request(2, false)],
        ..FakeHistory::default()
    });
    let store = Arc::new(MemoryEventStore::new());
    store.set_available(false);
    let fetcher = BackfillFetcher::new(history, store);

    let summary = fetcher
        .run(&options(BackfillSelection::default(), 10))
        .await
        .unwrap();
    assert_eq!(summary.resources, 2);
    assert_eq!(summary.progress.failure, 2);
    assert_eq!(summary.progress.success, 0);
}

#[tokio::test]
async fn issue_backfill_skips_pull_requests_and_dedups_against_live_saves() {
    let issue = |id: i64, is_pr: bool| -> GhIssue {
        let pull_request = if is_pr { json!({"url": "x"}) } else { json!(null) };
        serde_json::from_value(json!({
            "id": id,
            "number": id,
            "title": "bug",
            "user": {"login": "mona"},
            "state": "closed",
            "created_at": "2024-03-01T10:00:00Z",
            "closed_at": "2024-03-01T11:00:00Z",
            "state_reason": "completed",
            "pull_request": pull_request
        }))
        .unwrap()
    };
    let history = Arc::new(FakeHistory {
        issues: vec![issue(31, false), issue(32, true)],
        ..FakeHistory::default()
    });
    let store = Arc::new(MemoryEventStore::new());

    // The live path already saw issue 31 being opened.
    let repo = RepositoryRef {
        id: 99,
        full_name: "acme/widgets".into(),
    };
    let opened = actlog_adapters::github::issue_opened(&history.issues[0], &repo).unwrap();
    store.save(&opened, Some("live-guid")).await.unwrap();

    let fetcher = BackfillFetcher::new(history, store.clone());
    let summary = fetcher
        .run(&options("issues".parse().unwrap(), 10))
        .await
        .unwrap();

    assert_eq!(summary.resources, 1);
    assert_eq!(summary.progress.skipped, 1);
    assert_eq!(summary.progress.success, 1);
    assert_eq!(store.count().await.unwrap(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_paths_store_exactly_one_row_per_key() {
    let store = Arc::new(MemoryEventStore::new());
    let queue = Arc::new(MemoryQueue::new());
    let pipeline = Arc::new(BatchPipeline::new(
        store.clone(),
        queue,
        BatchConfig {
            batch_size: 1,
            flush_interval: Duration::from_secs(3600),
            stream: "events".into(),
        },
    ));
    let repo = RepositoryRef {
        id: 99,
        full_name: "acme/widgets".into(),
    };
    let event = actlog_adapters::github::pull_request_opened(&pull_request(42, false), &repo).unwrap();
    let info = event.resource_info();

    let duplicates = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for i in 0..24 {
        let (store, pipeline, event, info, duplicates) = (
            store.clone(),
            pipeline.clone(),
            event.clone(),
            info.clone(),
            duplicates.clone(),
        );
        handles.push(tokio::spawn(async move {
            match i % 3 {
                0 => {
                    let delivery = format!("d-{i}");
                    if let Err(err) = store.save(&event, Some(delivery.as_str())).await {
                        assert!(err.is_duplicate());
                        duplicates.fetch_add(1, Ordering::SeqCst);
                    }
                }
                1 => {
                    if let Err(err) = store
                        .save_historical(&event, info.resource_type, &info.id)
                        .await
                    {
                        assert!(err.is_duplicate());
                        duplicates.fetch_add(1, Ordering::SeqCst);
                    }
                }
                _ => {
                    pipeline.enqueue(&event, None, Utc::now()).await.unwrap();
                    let outcome = pipeline.flush().await.unwrap();
                    duplicates.fetch_add(outcome.duplicates, Ordering::SeqCst);
                }
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(store.count().await.unwrap(), 1);
    assert_eq!(duplicates.load(Ordering::SeqCst), 23);
    let row = &store.rows()[0];
    assert_eq!(row.resource_type, ResourceType::PullRequest);
    assert_eq!(row.provider, Provider::Github);
}

struct CountingLog {
    calls: AtomicUsize,
}

#[async_trait]
impl DeliveryLog for CountingLog {
    async fn list_deliveries(
        &self,
        _hook: &HookTarget,
        _page: u32,
        _per_page: u32,
    ) -> Result<Vec<DeliveryDescriptor>, ClientError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Vec::new())
    }

    async fn redeliver(&self, _hook: &HookTarget, _delivery_id: i64) -> Result<(), ClientError> {
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scheduler_runs_the_reconciler_until_stopped() {
    let log = Arc::new(CountingLog {
        calls: AtomicUsize::new(0),
    });
    let reconciler = Arc::new(DeliveryReconciler::new(
        log.clone(),
        Arc::new(MemoryEventStore::new()),
        Arc::new(GithubAdapter),
        vec![HookTarget {
            owner: "acme".into(),
            repo: "widgets".into(),
            hook_id: 12,
            token: None,
        }],
        RecoveryConfig {
            interval: Duration::from_secs(1),
            page_size: 10,
        },
    ));
    let scheduler = RecoveryScheduler::start(reconciler, Duration::from_secs(1))
        .await
        .unwrap();

    for _ in 0..50 {
        if log.calls.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    scheduler.stop().await.unwrap();
    assert!(log.calls.load(Ordering::SeqCst) > 0);
}
