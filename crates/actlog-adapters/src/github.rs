//! GitHub webhook normalization and historical resource transforms.
//!
//! Webhook payloads and REST listings share the same resource shapes, so both
//! paths build events through the same transform functions and end up with
//! identical identity keys.

use actlog_core::{
    CanonicalEvent, CloseReason, EventPayload, IssueClosed, IssueCommented, IssueOpened, Provider,
    PullRequestClosed, PullRequestOpened, Push, RepositoryRef, ReviewSubmitted,
};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{InboundDelivery, NormalizeError, ProviderAdapter};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GhUser {
    pub login: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GhRepository {
    pub id: i64,
    pub full_name: String,
}

impl From<GhRepository> for RepositoryRef {
    fn from(repo: GhRepository) -> Self {
        RepositoryRef {
            id: repo.id,
            full_name: repo.full_name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GhBranch {
    #[serde(rename = "ref")]
    pub git_ref: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GhPullRequest {
    pub id: i64,
    pub number: i64,
    pub title: String,
    pub user: Option<GhUser>,
    pub state: String,
    #[serde(default)]
    pub html_url: String,
    #[serde(default)]
    pub draft: bool,
    pub merged: Option<bool>,
    pub merged_at: Option<DateTime<Utc>>,
    pub merged_by: Option<GhUser>,
    pub head: GhBranch,
    pub base: GhBranch,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl GhPullRequest {
    /// Listings omit `merged`; `merged_at` is set exactly when the PR was merged.
    pub fn is_merged(&self) -> bool {
        self.merged.unwrap_or(self.merged_at.is_some())
    }

    pub fn is_closed(&self) -> bool {
        self.state == "closed"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GhReview {
    pub id: i64,
    pub user: Option<GhUser>,
    pub state: String,
    pub body: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GhIssue {
    pub id: i64,
    pub number: i64,
    pub title: String,
    pub user: Option<GhUser>,
    pub state: String,
    #[serde(default)]
    pub html_url: String,
    pub state_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    /// Present only when the issue is a pull request in disguise.
    pub pull_request: Option<JsonValue>,
}

impl GhIssue {
    pub fn is_pull_request(&self) -> bool {
        self.pull_request.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.state == "closed"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GhComment {
    pub id: i64,
    pub user: Option<GhUser>,
    #[serde(default)]
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct ActionProbe {
    action: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PullRequestEnvelope {
    pull_request: GhPullRequest,
    repository: GhRepository,
}

#[derive(Debug, Deserialize)]
struct ReviewEnvelope {
    review: GhReview,
    pull_request: GhPullRequest,
    repository: GhRepository,
}

#[derive(Debug, Deserialize)]
struct IssueEnvelope {
    issue: GhIssue,
    repository: GhRepository,
}

#[derive(Debug, Deserialize)]
struct CommentEnvelope {
    comment: GhComment,
    issue: GhIssue,
    repository: GhRepository,
}

#[derive(Debug, Deserialize)]
struct GhPusher {
    name: String,
}

#[derive(Debug, Deserialize)]
struct GhCommit {
    id: String,
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct PushEnvelope {
    #[serde(rename = "ref")]
    git_ref: String,
    before: String,
    after: String,
    pusher: GhPusher,
    #[serde(default)]
    commits: Vec<JsonValue>,
    head_commit: Option<GhCommit>,
    repository: GhRepository,
}

/// (event, action) pairs that produce a canonical event. `push` has no action.
pub fn is_handled(event_name: &str, action: Option<&str>) -> bool {
    matches!(
        (event_name, action),
        ("pull_request", Some("opened" | "closed"))
            | ("pull_request_review", Some("submitted"))
            | ("issues", Some("opened" | "closed"))
            | ("issue_comment", Some("created"))
            | ("push", _)
    )
}

fn decode<T: DeserializeOwned>(event: &str, body: &[u8]) -> Result<T, NormalizeError> {
    serde_json::from_slice(body).map_err(|source| NormalizeError::Malformed {
        event: event.to_string(),
        source,
    })
}

fn login(
    user: Option<&GhUser>,
    event: &str,
    field: &'static str,
) -> Result<String, NormalizeError> {
    user.map(|u| u.login.clone())
        .ok_or_else(|| NormalizeError::MissingField {
            event: event.to_string(),
            field,
        })
}

pub fn pull_request_opened(
    pr: &GhPullRequest,
    repo: &RepositoryRef,
) -> Result<CanonicalEvent, NormalizeError> {
    let payload = EventPayload::PrOpened(PullRequestOpened {
        pr_id: pr.id,
        number: pr.number,
        title: pr.title.clone(),
        author: login(pr.user.as_ref(), "pull_request", "pull_request.user")?,
        head_ref: pr.head.git_ref.clone(),
        base_ref: pr.base.git_ref.clone(),
        html_url: pr.html_url.clone(),
        draft: pr.draft,
    });
    Ok(CanonicalEvent::new(
        Provider::Github,
        pr.created_at,
        repo.clone(),
        payload,
    ))
}

pub fn pull_request_closed(
    pr: &GhPullRequest,
    repo: &RepositoryRef,
) -> Result<CanonicalEvent, NormalizeError> {
    let merged = pr.is_merged();
    let occurred_at = pr
        .closed_at
        .or(pr.merged_at)
        .or(pr.updated_at)
        .unwrap_or(pr.created_at);
    let payload = EventPayload::PrClosed(PullRequestClosed {
        pr_id: pr.id,
        number: pr.number,
        title: pr.title.clone(),
        author: login(pr.user.as_ref(), "pull_request", "pull_request.user")?,
        merged,
        close_reason: CloseReason::from_merged(merged),
        merged_by: pr.merged_by.as_ref().map(|u| u.login.clone()),
    });
    Ok(CanonicalEvent::new(
        Provider::Github,
        occurred_at,
        repo.clone(),
        payload,
    ))
}

/// Always an opened event, plus a closed event when the PR is closed.
pub fn pull_request_events(
    pr: &GhPullRequest,
    repo: &RepositoryRef,
) -> Result<Vec<CanonicalEvent>, NormalizeError> {
    let mut events = vec![pull_request_opened(pr, repo)?];
    if pr.is_closed() {
        events.push(pull_request_closed(pr, repo)?);
    }
    Ok(events)
}

/// Returns `None` for pending reviews, which have not been submitted yet.
pub fn review_submitted(
    review: &GhReview,
    pr: &GhPullRequest,
    repo: &RepositoryRef,
) -> Result<Option<CanonicalEvent>, NormalizeError> {
    let Some(submitted_at) = review.submitted_at else {
        return Ok(None);
    };
    let payload = EventPayload::ReviewSubmitted(ReviewSubmitted {
        review_id: review.id,
        pr_id: pr.id,
        pr_number: pr.number,
        reviewer: login(review.user.as_ref(), "pull_request_review", "review.user")?,
        state: review.state.to_ascii_lowercase(),
        body: review.body.clone().filter(|b| !b.is_empty()),
    });
    Ok(Some(CanonicalEvent::new(
        Provider::Github,
        submitted_at,
        repo.clone(),
        payload,
    )))
}

pub fn issue_opened(issue: &GhIssue, repo: &RepositoryRef) -> Result<CanonicalEvent, NormalizeError> {
    let payload = EventPayload::IssueOpened(IssueOpened {
        issue_id: issue.id,
        number: issue.number,
        title: issue.title.clone(),
        author: login(issue.user.as_ref(), "issues", "issue.user")?,
        html_url: issue.html_url.clone(),
    });
    Ok(CanonicalEvent::new(
        Provider::Github,
        issue.created_at,
        repo.clone(),
        payload,
    ))
}

pub fn issue_closed(issue: &GhIssue, repo: &RepositoryRef) -> Result<CanonicalEvent, NormalizeError> {
    let occurred_at = issue
        .closed_at
        .or(issue.updated_at)
        .unwrap_or(issue.created_at);
    let payload = EventPayload::IssueClosed(IssueClosed {
        issue_id: issue.id,
        number: issue.number,
        title: issue.title.clone(),
        author: login(issue.user.as_ref(), "issues", "issue.user")?,
        state_reason: issue.state_reason.clone(),
    });
    Ok(CanonicalEvent::new(
        Provider::Github,
        occurred_at,
        repo.clone(),
        payload,
    ))
}

pub fn issue_events(
    issue: &GhIssue,
    repo: &RepositoryRef,
) -> Result<Vec<CanonicalEvent>, NormalizeError> {
    let mut events = vec![issue_opened(issue, repo)?];
    if issue.is_closed() {
        events.push(issue_closed(issue, repo)?);
    }
    Ok(events)
}

fn issue_commented(
    comment: &GhComment,
    issue: &GhIssue,
    repo: &RepositoryRef,
) -> Result<CanonicalEvent, NormalizeError> {
    let payload = EventPayload::IssueCommented(IssueCommented {
        comment_id: comment.id,
        issue_id: issue.id,
        issue_number: issue.number,
        author: login(comment.user.as_ref(), "issue_comment", "comment.user")?,
        body: comment.body.clone(),
        on_pull_request: issue.is_pull_request(),
    });
    Ok(CanonicalEvent::new(
        Provider::Github,
        comment.created_at,
        repo.clone(),
        payload,
    ))
}

fn push(envelope: PushEnvelope, received_at: DateTime<Utc>) -> CanonicalEvent {
    let occurred_at = envelope
        .head_commit
        .as_ref()
        .and_then(|c| c.timestamp)
        .unwrap_or(received_at);
    let payload = EventPayload::Push(Push {
        git_ref: envelope.git_ref,
        before: envelope.before,
        after: envelope.after,
        pusher: envelope.pusher.name,
        commit_count: u32::try_from(envelope.commits.len()).unwrap_or(u32::MAX),
        head_commit: envelope.head_commit.map(|c| c.id),
    });
    CanonicalEvent::new(
        Provider::Github,
        occurred_at,
        envelope.repository.into(),
        payload,
    )
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GithubAdapter;

impl ProviderAdapter for GithubAdapter {
    fn provider(&self) -> Provider {
        Provider::Github
    }

    fn is_handled(&self, event_name: &str, action: Option<&str>) -> bool {
        is_handled(event_name, action)
    }

    fn normalize(&self, delivery: &InboundDelivery) -> Result<CanonicalEvent, NormalizeError> {
        let event = delivery.event_name.as_str();
        let body = delivery.body.as_slice();
        let probe: ActionProbe = decode(event, body)?;

        match (event, probe.action.as_deref()) {
            ("pull_request", Some("opened")) => {
                let env: PullRequestEnvelope = decode(event, body)?;
                pull_request_opened(&env.pull_request, &env.repository.into())
            }
            ("pull_request", Some("closed")) => {
                let env: PullRequestEnvelope = decode(event, body)?;
                pull_request_closed(&env.pull_request, &env.repository.into())
            }
            ("pull_request_review", Some("submitted")) => {
                let env: ReviewEnvelope = decode(event, body)?;
                review_submitted(&env.review, &env.pull_request, &env.repository.into())?.ok_or(
                    NormalizeError::MissingField {
                        event: event.to_string(),
                        field: "review.submitted_at",
                    },
                )
            }
            ("issues", Some("opened")) => {
                let env: IssueEnvelope = decode(event, body)?;
                issue_opened(&env.issue, &env.repository.into())
            }
            ("issues", Some("closed")) => {
                let env: IssueEnvelope = decode(event, body)?;
                issue_closed(&env.issue, &env.repository.into())
            }
            ("issue_comment", Some("created")) => {
                let env: CommentEnvelope = decode(event, body)?;
                issue_commented(&env.comment, &env.issue, &env.repository.into())
            }
            ("push", _) => Ok(push(decode(event, body)?, delivery.received_at)),
            (_, action) => Err(NormalizeError::NotHandled {
                event: event.to_string(),
                action: action.map(ToString::to_string),
            }),
        }
    }
}
