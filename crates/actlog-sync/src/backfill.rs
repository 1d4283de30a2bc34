//! Operator-triggered replay of historical provider data through the
//! historical save path. Safe to re-run: already stored events are skipped.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use actlog_adapters::github::{issue_events, pull_request_events, review_submitted};
use actlog_adapters::{ClientError, GhPullRequest, HistoricalSource, NormalizeError, RepoTarget};
use actlog_core::{CanonicalEvent, RepositoryRef};
use actlog_storage::{EventStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

/// Minimum spacing between progress reports.
pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum BackfillError {
    #[error("looking up repository {repo}: {source}")]
    Repository {
        repo: String,
        #[source]
        source: ClientError,
    },
    #[error("listing {what} page {page}: {source}")]
    Listing {
        what: &'static str,
        page: u32,
        #[source]
        source: ClientError,
    },
    #[error("unknown backfill type: {0}")]
    UnknownType(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillSelection {
    pub pull_requests: bool,
    pub reviews: bool,
    pub issues: bool,
}

impl Default for BackfillSelection {
    fn default() -> Self {
        Self {
            pull_requests: true,
            reviews: true,
            issues: false,
        }
    }
}

impl FromStr for BackfillSelection {
    type Err = BackfillError;

    /// Comma-separated list of `pull_requests`, `reviews`, `issues`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut selection = BackfillSelection {
            pull_requests: false,
            reviews: false,
            issues: false,
        };
        for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match part {
                "pull_requests" | "prs" => selection.pull_requests = true,
                "reviews" => selection.reviews = true,
                "issues" => selection.issues = true,
                other => return Err(BackfillError::UnknownType(other.to_string())),
            }
        }
        Ok(selection)
    }
}

impl fmt::Display for BackfillSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<&str> = [
            (self.pull_requests, "pull_requests"),
            (self.reviews, "reviews"),
            (self.issues, "issues"),
        ]
        .into_iter()
        .filter_map(|(on, name)| on.then_some(name))
        .collect();
        f.write_str(&parts.join(","))
    }
}

#[derive(Debug, Clone)]
pub struct BackfillOptions {
    pub target: RepoTarget,
    pub selection: BackfillSelection,
    pub per_page: u32,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub success: usize,
    pub failure: usize,
    pub skipped: usize,
    pub elapsed: Duration,
    /// Saved events per second.
    pub throughput: f64,
}

/// Counters plus a throttle so progress is reported at most once per interval.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    started: Instant,
    last_report: Instant,
    interval: Duration,
    success: usize,
    failure: usize,
    skipped: usize,
}

impl ProgressTracker {
    pub fn new(started: Instant, interval: Duration) -> Self {
        Self {
            started,
            last_report: started,
            interval,
            success: 0,
            failure: 0,
            skipped: 0,
        }
    }

    pub fn record_success(&mut self) {
        self.success += 1;
    }

    pub fn record_failure(&mut self) {
        self.failure += 1;
    }

    pub fn record_skip(&mut self) {
        self.skipped += 1;
    }

    pub fn snapshot(&self, now: Instant) -> ProgressSnapshot {
        let elapsed = now.saturating_duration_since(self.started);
        let secs = elapsed.as_secs_f64();
        ProgressSnapshot {
            success: self.success,
            failure: self.failure,
            skipped: self.skipped,
            elapsed,
            throughput: if secs > 0.0 {
                self.success as f64 / secs
            } else {
                0.0
            },
        }
    }

    /// Returns a snapshot only if `interval` has passed since the last one.
    pub fn maybe_snapshot(&mut self, now: Instant) -> Option<ProgressSnapshot> {
        if now.saturating_duration_since(self.last_report) < self.interval {
            return None;
        }
        self.last_report = now;
        Some(self.snapshot(now))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackfillSummary {
    pub run_id: Uuid,
    pub repository: String,
    pub selection: String,
    pub dry_run: bool,
    /// Top-level resources processed (pull requests and issues).
    pub resources: usize,
    pub progress: ProgressSnapshot,
}

enum Saved {
    Stored,
    Skipped,
}

pub struct BackfillFetcher {
    source: Arc<dyn HistoricalSource>,
    store: Arc<dyn EventStore>,
    progress_interval: Duration,
    span: Span,
}

impl BackfillFetcher {
    pub fn new(source: Arc<dyn HistoricalSource>, store: Arc<dyn EventStore>) -> Self {
        Self {
            source,
            store,
            progress_interval: PROGRESS_INTERVAL,
            span: info_span!("backfill"),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub async fn run(&self, options: &BackfillOptions) -> Result<BackfillSummary, BackfillError> {
        self.run_inner(options).instrument(self.span.clone()).await
    }

    async fn run_inner(&self, options: &BackfillOptions) -> Result<BackfillSummary, BackfillError> {
        let target = &options.target;
        let per_page = options.per_page.max(1);
        let repo = self
            .source
            .repository(target)
            .await
            .map_err(|source| BackfillError::Repository {
                repo: target.full_name(),
                source,
            })?;

        let mut progress = ProgressTracker::new(Instant::now(), self.progress_interval);
        let mut resources = 0usize;
        info!(
            repo = %repo.full_name,
            selection = %options.selection,
            dry_run = options.dry_run,
            "backfill started"
        );

        if options.selection.pull_requests || options.selection.reviews {
            let mut page = 1u32;
            loop {
                let prs = self
                    .source
                    .list_pull_requests(target, page, per_page)
                    .await
                    .map_err(|source| BackfillError::Listing {
                        what: "pull requests",
                        page,
                        source,
                    })?;
                for pr in &prs {
                    resources += 1;
                    self.pull_request(target, &repo, pr, options, per_page, &mut progress)
                        .await;
                    self.report(&mut progress);
                }
                if prs.len() < per_page as usize {
                    break;
                }
                page += 1;
            }
        }

        if options.selection.issues {
            let mut page = 1u32;
            loop {
                let issues = self
                    .source
                    .list_issues(target, page, per_page)
                    .await
                    .map_err(|source| BackfillError::Listing {
                        what: "issues",
                        page,
                        source,
                    })?;
                for issue in issues.iter().filter(|i| !i.is_pull_request()) {
                    resources += 1;
                    let label = format!("issue #{}", issue.number);
                    let events = issue_events(issue, &repo);
                    self.persist(&label, events, options.dry_run, &mut progress)
                        .await;
                    self.report(&mut progress);
                }
                if issues.len() < per_page as usize {
                    break;
                }
                page += 1;
            }
        }

        let summary = BackfillSummary {
            run_id: Uuid::new_v4(),
            repository: repo.full_name.clone(),
            selection: options.selection.to_string(),
            dry_run: options.dry_run,
            resources,
            progress: progress.snapshot(Instant::now()),
        };
        info!(
            run_id = %summary.run_id,
            repo = %summary.repository,
            resources = summary.resources,
            saved = summary.progress.success,
            skipped = summary.progress.skipped,
            failed = summary.progress.failure,
            elapsed_secs = summary.progress.elapsed.as_secs_f64(),
            throughput = summary.progress.throughput,
            "backfill finished"
        );
        Ok(summary)
    }

    fn report(&self, progress: &mut ProgressTracker) {
        if let Some(snapshot) = progress.maybe_snapshot(Instant::now()) {
            info!(
                saved = snapshot.success,
                skipped = snapshot.skipped,
                failed = snapshot.failure,
                throughput = snapshot.throughput,
                "backfill progress"
            );
        }
    }

    async fn pull_request(
        &self,
        target: &RepoTarget,
        repo: &RepositoryRef,
        pr: &GhPullRequest,
        options: &BackfillOptions,
        per_page: u32,
        progress: &mut ProgressTracker,
    ) {
        let label = format!("pull request #{}", pr.number);
        if options.selection.pull_requests {
            let events = pull_request_events(pr, repo);
            if !self.persist(&label, events, options.dry_run, progress).await {
                return;
            }
        }
        if !options.selection.reviews {
            return;
        }

        let mut page = 1u32;
        loop {
            let reviews = match self
                .source
                .list_reviews(target, pr.number, page, per_page)
                .await
            {
                Ok(reviews) => reviews,
                Err(err) => {
                    warn!(resource = %label, page, error = %err, "listing reviews failed");
                    progress.record_failure();
                    return;
                }
            };
            for review in &reviews {
                let events = review_submitted(review, pr, repo).map(|e| e.into_iter().collect());
                let label = format!("review {} on #{}", review.id, pr.number);
                self.persist(&label, events, options.dry_run, progress).await;
            }
            if reviews.len() < per_page as usize {
                return;
            }
            page += 1;
        }
    }

    /// Saves one resource's events in order. Returns false if the resource was
    /// abandoned because of a transform or store failure.
    async fn persist(
        &self,
        label: &str,
        events: Result<Vec<CanonicalEvent>, NormalizeError>,
        dry_run: bool,
        progress: &mut ProgressTracker,
    ) -> bool {
        let events = match events {
            Ok(events) => events,
            Err(err) => {
                warn!(resource = %label, error = %err, "skipping resource that failed to normalize");
                progress.record_failure();
                return false;
            }
        };

        for event in &events {
            match self.save(event, dry_run).await {
                Ok(Saved::Stored) => progress.record_success(),
                Ok(Saved::Skipped) => {
                    debug!(resource = %label, key = %event.idempotency_key(), "already stored; skipping");
                    progress.record_skip();
                }
                Err(err) => {
                    warn!(resource = %label, key = %event.idempotency_key(), error = %err, "save failed; abandoning resource");
                    progress.record_failure();
                    return false;
                }
            }
        }
        true
    }

    async fn save(&self, event: &CanonicalEvent, dry_run: bool) -> Result<Saved, StoreError> {
        let info = event.resource_info();
        if dry_run {
            return Ok(if self.store.exists(&event.idempotency_key()).await? {
                Saved::Skipped
            } else {
                Saved::Stored
            });
        }
        match self
            .store
            .save_historical(event, info.resource_type, &info.id)
            .await
        {
            Ok(_) => Ok(Saved::Stored),
            Err(StoreError::Duplicate) => Ok(Saved::Skipped),
            Err(err) => Err(err),
        }
    }
}
