//! Canonical event model and identity rules for actlog.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "actlog-core";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! string_enum {
    ($name:ident, $label:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($text => Ok($name::$variant),)+
                    other => Err(ParseEnumError {
                        kind: $label,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

/// Code-hosting provider an event originated from. Always part of the identity key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Github,
}

string_enum!(Provider, "provider", { Github => "github" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PrOpened,
    PrClosed,
    ReviewSubmitted,
    IssueOpened,
    IssueClosed,
    IssueCommented,
    Push,
}

string_enum!(EventKind, "event kind", {
    PrOpened => "pr_opened",
    PrClosed => "pr_closed",
    ReviewSubmitted => "review_submitted",
    IssueOpened => "issue_opened",
    IssueClosed => "issue_closed",
    IssueCommented => "issue_commented",
    Push => "push",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    PullRequest,
    PullRequestReview,
    Issue,
    IssueComment,
    Push,
    #[serde(other)]
    Unknown,
}

string_enum!(ResourceType, "resource type", {
    PullRequest => "pull_request",
    PullRequestReview => "pull_request_review",
    Issue => "issue",
    IssueComment => "issue_comment",
    Push => "push",
    Unknown => "unknown",
});

impl ResourceType {
    /// Parses stored values, mapping anything unrecognised to `Unknown`.
    pub fn parse_lenient(value: &str) -> Self {
        value.parse().unwrap_or(ResourceType::Unknown)
    }
}

/// Ingestion path that produced a stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Webhook,
    Historical,
}

string_enum!(EventSource, "event source", {
    Webhook => "webhook",
    Historical => "historical",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Merged,
    Closed,
}

impl CloseReason {
    pub fn from_merged(merged: bool) -> Self {
        if merged {
            CloseReason::Merged
        } else {
            CloseReason::Closed
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestOpened {
    pub pr_id: i64,
    pub number: i64,
    pub title: String,
    pub author: String,
    pub head_ref: String,
    pub base_ref: String,
    pub html_url: String,
    #[serde(default)]
    pub draft: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestClosed {
    pub pr_id: i64,
    pub number: i64,
    pub title: String,
    pub author: String,
    pub merged: bool,
    pub close_reason: CloseReason,
    pub merged_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewSubmitted {
    pub review_id: i64,
    pub pr_id: i64,
    pub pr_number: i64,
    pub reviewer: String,
    pub state: String,
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueOpened {
    pub issue_id: i64,
    pub number: i64,
    pub title: String,
    pub author: String,
    pub html_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueClosed {
    pub issue_id: i64,
    pub number: i64,
    pub title: String,
    pub author: String,
    pub state_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueCommented {
    pub comment_id: i64,
    pub issue_id: i64,
    pub issue_number: i64,
    pub author: String,
    pub body: String,
    pub on_pull_request: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Push {
    pub git_ref: String,
    pub before: String,
    pub after: String,
    pub pusher: String,
    pub commit_count: u32,
    pub head_commit: Option<String>,
}

/// Variant payload of a canonical event, tagged by its kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    PrOpened(PullRequestOpened),
    PrClosed(PullRequestClosed),
    ReviewSubmitted(ReviewSubmitted),
    IssueOpened(IssueOpened),
    IssueClosed(IssueClosed),
    IssueCommented(IssueCommented),
    Push(Push),
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::PrOpened(_) => EventKind::PrOpened,
            EventPayload::PrClosed(_) => EventKind::PrClosed,
            EventPayload::ReviewSubmitted(_) => EventKind::ReviewSubmitted,
            EventPayload::IssueOpened(_) => EventKind::IssueOpened,
            EventPayload::IssueClosed(_) => EventKind::IssueClosed,
            EventPayload::IssueCommented(_) => EventKind::IssueCommented,
            EventPayload::Push(_) => EventKind::Push,
        }
    }

    /// Resource this payload is about. Total over every variant.
    pub fn resource_info(&self) -> ResourceInfo {
        match self {
            EventPayload::PrOpened(p) => ResourceInfo::numeric(ResourceType::PullRequest, p.pr_id),
            EventPayload::PrClosed(p) => ResourceInfo::numeric(ResourceType::PullRequest, p.pr_id),
            EventPayload::ReviewSubmitted(r) => {
                ResourceInfo::numeric(ResourceType::PullRequestReview, r.review_id)
            }
            EventPayload::IssueOpened(i) => ResourceInfo::numeric(ResourceType::Issue, i.issue_id),
            EventPayload::IssueClosed(i) => ResourceInfo::numeric(ResourceType::Issue, i.issue_id),
            EventPayload::IssueCommented(c) => {
                ResourceInfo::numeric(ResourceType::IssueComment, c.comment_id)
            }
            EventPayload::Push(p) if p.after.is_empty() => ResourceInfo::unknown(),
            EventPayload::Push(p) => ResourceInfo::textual(ResourceType::Push, p.after.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub resource_type: ResourceType,
    /// Zero when the resource has no numeric identifier (pushes).
    pub numeric_id: i64,
    pub id: String,
}

impl ResourceInfo {
    pub fn numeric(resource_type: ResourceType, numeric_id: i64) -> Self {
        Self {
            resource_type,
            numeric_id,
            id: numeric_id.to_string(),
        }
    }

    pub fn textual(resource_type: ResourceType, id: impl Into<String>) -> Self {
        Self {
            resource_type,
            numeric_id: 0,
            id: id.into(),
        }
    }

    pub fn unknown() -> Self {
        Self::textual(ResourceType::Unknown, "unknown")
    }
}

/// Deduplication identity: `{provider}:{resource_type}:{resource_id}:{event_kind}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn new(
        provider: Provider,
        resource_type: ResourceType,
        resource_id: &str,
        kind: EventKind,
    ) -> Self {
        Self(format!("{provider}:{resource_type}:{resource_id}:{kind}"))
    }

    pub fn for_event(event: &CanonicalEvent) -> Self {
        let info = event.resource_info();
        Self::new(event.provider, info.resource_type, &info.id, event.kind)
    }

    /// Wraps a key read back from storage.
    pub fn from_raw(value: String) -> Self {
        Self(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryRef {
    pub id: i64,
    pub full_name: String,
}

/// Provider-agnostic representation of one activity occurrence.
///
/// Fields are private so the kind and id always agree with the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    id: Uuid,
    kind: EventKind,
    provider: Provider,
    occurred_at: DateTime<Utc>,
    repository: RepositoryRef,
    payload: EventPayload,
}

impl CanonicalEvent {
    pub fn new(
        provider: Provider,
        occurred_at: DateTime<Utc>,
        repository: RepositoryRef,
        payload: EventPayload,
    ) -> Self {
        let kind = payload.kind();
        let info = payload.resource_info();
        let key = IdempotencyKey::new(provider, info.resource_type, &info.id, kind);
        Self {
            id: Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_str().as_bytes()),
            kind,
            provider,
            occurred_at,
            repository,
            payload,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn repository_id(&self) -> i64 {
        self.repository.id
    }

    pub fn repository_name(&self) -> &str {
        &self.repository.full_name
    }

    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }

    pub fn resource_info(&self) -> ResourceInfo {
        self.payload.resource_info()
    }

    pub fn idempotency_key(&self) -> IdempotencyKey {
        IdempotencyKey::for_event(self)
    }
}

/// Insert-ready row, produced from a canonical event by one of the ingestion paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEventRecord {
    pub provider: Provider,
    pub source: EventSource,
    pub resource_type: ResourceType,
    pub resource_id: String,
    pub kind: EventKind,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
    pub delivery_id: Option<String>,
    pub event_key: IdempotencyKey,
}

impl NewEventRecord {
    pub fn webhook(
        event: &CanonicalEvent,
        delivery_id: Option<String>,
        received_at: DateTime<Utc>,
    ) -> Result<Self, serde_json::Error> {
        let info = event.resource_info();
        Ok(Self {
            provider: event.provider(),
            source: EventSource::Webhook,
            resource_type: info.resource_type,
            resource_id: info.id,
            kind: event.kind(),
            payload: serde_json::to_vec(event)?,
            received_at,
            delivery_id,
            event_key: event.idempotency_key(),
        })
    }

    /// Historical rows carry an explicit resource-scoped identity.
    pub fn historical(
        event: &CanonicalEvent,
        resource_type: ResourceType,
        resource_id: &str,
        received_at: DateTime<Utc>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            provider: event.provider(),
            source: EventSource::Historical,
            resource_type,
            resource_id: resource_id.to_string(),
            kind: event.kind(),
            payload: serde_json::to_vec(event)?,
            received_at,
            delivery_id: None,
            event_key: IdempotencyKey::new(
                event.provider(),
                resource_type,
                resource_id,
                event.kind(),
            ),
        })
    }
}

/// Persisted row. Append-only: created by the store and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEventRecord {
    pub seq: i64,
    pub provider: Provider,
    pub source: EventSource,
    pub resource_type: ResourceType,
    pub resource_id: String,
    pub kind: EventKind,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
    pub delivery_id: Option<String>,
    pub event_key: Option<IdempotencyKey>,
}

impl StoredEventRecord {
    pub fn from_new(seq: i64, record: NewEventRecord) -> Self {
        Self {
            seq,
            provider: record.provider,
            source: record.source,
            resource_type: record.resource_type,
            resource_id: record.resource_id,
            kind: record.kind,
            payload: record.payload,
            received_at: record.received_at,
            delivery_id: record.delivery_id,
            event_key: Some(record.event_key),
        }
    }

    pub fn decode_event(&self) -> Result<CanonicalEvent, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// One attempt recorded in the provider's delivery log. Read-only to this system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryDescriptor {
    pub id: i64,
    pub guid: String,
    pub delivered_at: DateTime<Utc>,
    #[serde(default)]
    pub redelivery: bool,
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub status_code: u16,
    pub event: String,
    #[serde(default)]
    pub action: Option<String>,
}
