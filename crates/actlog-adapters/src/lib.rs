//! Provider adapter contracts + the GitHub normalizer and REST client.

use std::fs;
use std::path::Path;

use actlog_core::{CanonicalEvent, Provider};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod client;
pub mod github;

pub use client::{
    ClientError, DeliveryLog, GithubClient, HistoricalSource, HookTarget, RepoTarget,
};
pub use github::{GithubAdapter, GhIssue, GhPullRequest, GhReview, GhUser};

pub const CRATE_NAME: &str = "actlog-adapters";

/// One validated inbound callback, as handed over by the HTTP receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundDelivery {
    pub event_name: String,
    pub delivery_id: String,
    pub received_at: DateTime<Utc>,
    #[serde(with = "raw_json")]
    pub body: Vec<u8>,
}

impl InboundDelivery {
    pub fn new(
        event_name: impl Into<String>,
        delivery_id: impl Into<String>,
        body: impl Into<Vec<u8>>,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_name: event_name.into(),
            delivery_id: delivery_id.into(),
            received_at,
            body: body.into(),
        }
    }
}

/// Fixture files embed the body as JSON rather than an escaped string.
mod raw_json {
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        let value: Value = serde_json::from_slice(body).map_err(serde::ser::Error::custom)?;
        serde::Serialize::serialize(&value, serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let value = Value::deserialize(deserializer)?;
        serde_json::to_vec(&value).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    /// The (event, action) pair is not one this adapter turns into an event.
    /// Callers acknowledge these and move on.
    #[error("event {event} with action {action:?} is not handled")]
    NotHandled {
        event: String,
        action: Option<String>,
    },
    #[error("malformed {event} payload: {source}")]
    Malformed {
        event: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{event} payload is missing {field}")]
    MissingField { event: String, field: &'static str },
}

impl NormalizeError {
    pub fn is_not_handled(&self) -> bool {
        matches!(self, NormalizeError::NotHandled { .. })
    }
}

/// Pure translation of provider wire payloads into canonical events.
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    /// Whether `normalize` would produce an event for this pair.
    fn is_handled(&self, event_name: &str, action: Option<&str>) -> bool;

    fn normalize(&self, delivery: &InboundDelivery) -> Result<CanonicalEvent, NormalizeError>;
}

pub fn load_delivery_fixture(path: impl AsRef<Path>) -> Result<InboundDelivery> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}
