//! GitHub REST client for the delivery log and historical listings.

use actlog_core::{DeliveryDescriptor, RepositoryRef};
use actlog_storage::{ApiRequest, FetchError, HttpFetcher};
use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::github::{GhIssue, GhPullRequest, GhRepository, GhReview};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

impl ClientError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Fetch(err) => err.is_retryable(),
        }
    }
}

/// A repository webhook whose delivery log is reconciled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookTarget {
    pub owner: String,
    pub repo: String,
    pub hook_id: i64,
    pub token: Option<String>,
}

impl HookTarget {
    pub fn label(&self) -> String {
        format!("{}/{}#{}", self.owner, self.repo, self.hook_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoTarget {
    pub owner: String,
    pub repo: String,
    pub token: Option<String>,
}

impl RepoTarget {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

/// The provider's record of webhook delivery attempts.
#[async_trait]
pub trait DeliveryLog: Send + Sync {
    /// One page of deliveries, newest first. `page` starts at 1.
    async fn list_deliveries(
        &self,
        hook: &HookTarget,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<DeliveryDescriptor>, ClientError>;

    /// Asks the provider to send a delivery again. Any 2xx is success.
    async fn redeliver(&self, hook: &HookTarget, delivery_id: i64) -> Result<(), ClientError>;
}

/// Read-only listings used by backfill. Pages start at 1.
#[async_trait]
pub trait HistoricalSource: Send + Sync {
    async fn repository(&self, target: &RepoTarget) -> Result<RepositoryRef, ClientError>;

    async fn list_pull_requests(
        &self,
        target: &RepoTarget,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<GhPullRequest>, ClientError>;

    async fn list_reviews(
        &self,
        target: &RepoTarget,
        pr_number: i64,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<GhReview>, ClientError>;

    /// Includes pull requests; callers filter them with `GhIssue::is_pull_request`.
    async fn list_issues(
        &self,
        target: &RepoTarget,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<GhIssue>, ClientError>;
}

#[derive(Debug)]
pub struct GithubClient {
    http: HttpFetcher,
    api_base: String,
}

impl GithubClient {
    pub fn new(http: HttpFetcher, api_base: impl Into<String>) -> Self {
        Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    fn repo_url(&self, owner: &str, repo: &str) -> String {
        format!("{}/repos/{owner}/{repo}", self.api_base)
    }
}

#[async_trait]
impl DeliveryLog for GithubClient {
    async fn list_deliveries(
        &self,
        hook: &HookTarget,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<DeliveryDescriptor>, ClientError> {
        let url = format!(
            "{}/hooks/{}/deliveries?page={page}&per_page={per_page}",
            self.repo_url(&hook.owner, &hook.repo),
            hook.hook_id
        );
        let request = ApiRequest::get(url).with_bearer(hook.token.as_deref());
        let deliveries: Vec<DeliveryDescriptor> =
            self.http.get_json(&hook.label(), &request).await?;
        debug!(hook = %hook.label(), page, count = deliveries.len(), "listed deliveries");
        Ok(deliveries)
    }

    async fn redeliver(&self, hook: &HookTarget, delivery_id: i64) -> Result<(), ClientError> {
        let url = format!(
            "{}/hooks/{}/deliveries/{delivery_id}/attempts",
            self.repo_url(&hook.owner, &hook.repo),
            hook.hook_id
        );
        let request = ApiRequest::post(url).with_bearer(hook.token.as_deref());
        self.http.send(&hook.label(), &request).await?;
        Ok(())
    }
}

#[async_trait]
impl HistoricalSource for GithubClient {
    async fn repository(&self, target: &RepoTarget) -> Result<RepositoryRef, ClientError> {
        let request = ApiRequest::get(self.repo_url(&target.owner, &target.repo))
            .with_bearer(target.token.as_deref());
        let repo: GhRepository = self.http.get_json(&target.full_name(), &request).await?;
        Ok(repo.into())
    }

    async fn list_pull_requests(
        &self,
        target: &RepoTarget,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<GhPullRequest>, ClientError> {
        let url = format!(
            "{}/pulls?state=all&sort=created&direction=asc&page={page}&per_page={per_page}",
            self.repo_url(&target.owner, &target.repo)
        );
        let request = ApiRequest::get(url).with_bearer(target.token.as_deref());
        Ok(self.http.get_json(&target.full_name(), &request).await?)
    }

    async fn list_reviews(
        &self,
        target: &RepoTarget,
        pr_number: i64,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<GhReview>, ClientError> {
        let url = format!(
            "{}/pulls/{pr_number}/reviews?page={page}&per_page={per_page}",
            self.repo_url(&target.owner, &target.repo)
        );
        let request = ApiRequest::get(url).with_bearer(target.token.as_deref());
        Ok(self.http.get_json(&target.full_name(), &request).await?)
    }

    async fn list_issues(
        &self,
        target: &RepoTarget,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<GhIssue>, ClientError> {
        let url = format!(
            "{}/issues?state=all&sort=created&direction=asc&page={page}&per_page={per_page}",
            self.repo_url(&target.owner, &target.repo)
        );
        let request = ApiRequest::get(url).with_bearer(target.token.as_deref());
        Ok(self.http.get_json(&target.full_name(), &request).await?)
    }
}
