//! Axum webhook receiver and event listing for actlog.

use std::future::Future;
use std::sync::Arc;

use actlog_adapters::{InboundDelivery, ProviderAdapter};
use actlog_core::{EventKind, Provider, StoredEventRecord};
use actlog_storage::{EventFilter, EventStore, StoreError};
use actlog_sync::{BatchError, BatchPipeline};
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::net::TcpListener;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

pub const CRATE_NAME: &str = "actlog-web";

pub const EVENT_HEADER: &str = "x-github-event";
pub const DELIVERY_HEADER: &str = "x-github-delivery";
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

const MAX_PER_PAGE: u32 = 200;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn EventStore>,
    pub adapter: Arc<dyn ProviderAdapter>,
    /// Set in batch mode: deliveries are enqueued instead of saved directly.
    pub pipeline: Option<Arc<BatchPipeline>>,
    pub webhook_secret: Option<String>,
    pub span: Span,
}

impl AppState {
    pub fn new(store: Arc<dyn EventStore>, adapter: Arc<dyn ProviderAdapter>) -> Self {
        Self {
            store,
            adapter,
            pipeline: None,
            webhook_secret: None,
            span: info_span!("receiver"),
        }
    }

    pub fn with_pipeline(mut self, pipeline: Arc<BatchPipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn with_secret(mut self, secret: Option<String>) -> Self {
        self.webhook_secret = secret.filter(|s| !s.is_empty());
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/webhooks/github", post(github_webhook_handler))
        .route("/events", get(events_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(
    state: AppState,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(parent: &state.span, port, "receiver listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// `sha256=<hex>` signature of `body` under `secret`.
pub fn sign_body(secret: &[u8], body: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret).ok()?;
    mac.update(body);
    Some(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// Constant-time check of an `X-Hub-Signature-256` value.
pub fn verify_signature(secret: &[u8], body: &[u8], header: Option<&str>) -> bool {
    let Some(expected) = header
        .and_then(|h| h.strip_prefix("sha256="))
        .and_then(|h| hex::decode(h).ok())
    else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReceiveResponse {
    pub status: ReceiveStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReceiveStatus {
    Stored,
    Duplicate,
    Ignored,
    Queued,
    Rejected,
    Unavailable,
}

fn reply(code: StatusCode, status: ReceiveStatus, event_key: Option<String>) -> Response {
    (
        code,
        Json(ReceiveResponse {
            status,
            event_key,
            error: None,
        }),
    )
        .into_response()
}

fn reject(code: StatusCode, status: ReceiveStatus, error: impl ToString) -> Response {
    (
        code,
        Json(ReceiveResponse {
            status,
            event_key: None,
            error: Some(error.to_string()),
        }),
    )
        .into_response()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

async fn healthz_handler() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn github_webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let (Some(event_name), Some(delivery_id)) = (
        header_str(&headers, EVENT_HEADER),
        header_str(&headers, DELIVERY_HEADER),
    ) else {
        return reject(
            StatusCode::BAD_REQUEST,
            ReceiveStatus::Rejected,
            "missing event or delivery header",
        );
    };
    let span = info_span!(parent: &state.span, "webhook", event = event_name, delivery = delivery_id);

    if let Some(secret) = &state.webhook_secret {
        if !verify_signature(
            secret.as_bytes(),
            &body,
            header_str(&headers, SIGNATURE_HEADER),
        ) {
            warn!(parent: &span, "signature mismatch");
            return reject(
                StatusCode::UNAUTHORIZED,
                ReceiveStatus::Rejected,
                "invalid signature",
            );
        }
    }

    let delivery = InboundDelivery::new(event_name, delivery_id, body.to_vec(), Utc::now());
    receive(&state, delivery).instrument(span).await
}

async fn receive(state: &AppState, delivery: InboundDelivery) -> Response {
    if delivery.event_name == "ping" {
        debug!("ping acknowledged");
        return reply(StatusCode::OK, ReceiveStatus::Ignored, None);
    }

    let event = match state.adapter.normalize(&delivery) {
        Ok(event) => event,
        Err(err) if err.is_not_handled() => {
            debug!(error = %err, "delivery not handled");
            return reply(StatusCode::OK, ReceiveStatus::Ignored, None);
        }
        Err(err) => {
            warn!(error = %err, "rejecting malformed delivery");
            return reject(StatusCode::BAD_REQUEST, ReceiveStatus::Rejected, err);
        }
    };
    let key = event.idempotency_key().into_string();

    if let Some(pipeline) = &state.pipeline {
        return match pipeline
            .enqueue(&event, Some(delivery.delivery_id.as_str()), delivery.received_at)
            .await
        {
            Ok(()) => reply(StatusCode::ACCEPTED, ReceiveStatus::Queued, Some(key)),
            Err(BatchError::Encode(err)) => {
                error!(error = %err, "encoding queued event");
                reject(StatusCode::INTERNAL_SERVER_ERROR, ReceiveStatus::Rejected, err)
            }
            Err(err) => {
                error!(error = %err, "queue unavailable");
                reject(StatusCode::SERVICE_UNAVAILABLE, ReceiveStatus::Unavailable, err)
            }
        };
    }

    match state.store.save(&event, Some(delivery.delivery_id.as_str())).await {
        Ok(stored) => {
            info!(seq = stored.seq, key = %key, "event stored");
            reply(StatusCode::OK, ReceiveStatus::Stored, Some(key))
        }
        Err(StoreError::Duplicate) => {
            debug!(key = %key, "duplicate delivery");
            reply(StatusCode::OK, ReceiveStatus::Duplicate, Some(key))
        }
        Err(err) if err.is_retryable() => {
            error!(error = %err, "store unavailable");
            reject(StatusCode::SERVICE_UNAVAILABLE, ReceiveStatus::Unavailable, err)
        }
        Err(err) => {
            error!(error = %err, "store rejected event");
            reject(StatusCode::INTERNAL_SERVER_ERROR, ReceiveStatus::Rejected, err)
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct EventsQuery {
    provider: Option<String>,
    kind: Option<String>,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    page: Option<u32>,
    per_page: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventView {
    pub seq: i64,
    pub provider: String,
    pub source: String,
    pub resource_type: String,
    pub resource_id: String,
    pub kind: String,
    pub received_at: DateTime<Utc>,
    pub delivery_id: Option<String>,
    pub event_key: Option<String>,
    pub payload: serde_json::Value,
}

impl From<StoredEventRecord> for EventView {
    fn from(record: StoredEventRecord) -> Self {
        let payload = serde_json::from_slice(&record.payload).unwrap_or(serde_json::Value::Null);
        Self {
            seq: record.seq,
            provider: record.provider.to_string(),
            source: record.source.to_string(),
            resource_type: record.resource_type.to_string(),
            resource_id: record.resource_id,
            kind: record.kind.to_string(),
            received_at: record.received_at,
            delivery_id: record.delivery_id,
            event_key: record.event_key.map(|k| k.into_string()),
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsPage {
    pub page: u32,
    pub per_page: u32,
    pub events: Vec<EventView>,
}

fn event_filter(query: &EventsQuery) -> Result<(EventFilter, u32, u32), String> {
    let provider = query
        .provider
        .as_deref()
        .map(str::parse::<Provider>)
        .transpose()
        .map_err(|e| e.to_string())?;
    let kind = query
        .kind
        .as_deref()
        .map(str::parse::<EventKind>)
        .transpose()
        .map_err(|e| e.to_string())?;
    let per_page = query.per_page.unwrap_or(50).clamp(1, MAX_PER_PAGE);
    let page = query.page.unwrap_or(1).max(1);
    let filter = EventFilter {
        provider,
        kind,
        since: query.since,
        until: query.until,
        limit: per_page,
        offset: (page - 1).saturating_mul(per_page),
    };
    Ok((filter, page, per_page))
}

async fn events_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Response {
    let (filter, page, per_page) = match event_filter(&query) {
        Ok(parts) => parts,
        Err(message) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": message })),
            )
                .into_response()
        }
    };
    match state.store.list(&filter).await {
        Ok(rows) => Json(EventsPage {
            page,
            per_page,
            events: rows.into_iter().map(EventView::from).collect(),
        })
        .into_response(),
        Err(err) => {
            error!(parent: &state.span, error = %err, "listing events failed");
            let code = if err.is_retryable() {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            (code, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
        }
    }
}
