//! Outbound HTTP with retry, backoff and concurrency limits.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 4,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if self.refill_every.as_millis() > 0 && elapsed >= self.refill_every {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            drop(state);
            tokio::time::sleep(self.refill_every).await;
        }
    }
}

/// A single provider API call. Credentials travel with the request, not the client.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub bearer: Option<String>,
    /// Safe to resend after the provider may have acted on it.
    pub idempotent: bool,
}

impl ApiRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            bearer: None,
            idempotent: true,
        }
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            bearer: None,
            idempotent: false,
        }
    }

    pub fn with_bearer(mut self, token: Option<&str>) -> Self {
        self.bearer = token.map(ToString::to_string);
        self
    }

    /// Non-idempotent requests are resent only when the provider never acted on them.
    fn may_retry_status(&self, status: StatusCode) -> bool {
        if self.idempotent {
            classify_status(status) == RetryDisposition::Retryable
        } else {
            status == StatusCode::TOO_MANY_REQUESTS
        }
    }

    fn may_retry_error(&self, err: &reqwest::Error) -> bool {
        if self.idempotent {
            classify_reqwest_error(err) == RetryDisposition::Retryable
        } else {
            err.is_connect()
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err) == RetryDisposition::Retryable,
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(|s| classify_status(s) == RetryDisposition::Retryable)
                .unwrap_or(false),
            FetchError::Decode { .. } => false,
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            token_bucket,
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    /// Sends `request`, retrying retryable statuses and transport errors with backoff.
    pub async fn send(
        &self,
        source_id: &str,
        request: &ApiRequest,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source_id, method = %request.method, url = %request.url);
        self.send_inner(source_id, request).instrument(span).await
    }

    async fn send_inner(
        &self,
        source_id: &str,
        request: &ApiRequest,
    ) -> Result<FetchedResponse, FetchError> {
        // Semaphores are never closed, so acquire only fails on a logic bug.
        let _global = self.global_limit.acquire().await.ok();
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.ok();

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let mut attempt = 0usize;
        loop {
            let mut builder = self
                .client
                .request(request.method.clone(), &request.url)
                .header(ACCEPT, "application/vnd.github+json");
            if let Some(token) = &request.bearer {
                builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
            }

            let retry = match builder.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }
                    if !request.may_retry_status(status) || attempt >= self.backoff.max_retries
                    {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    format!("status {status}")
                }
                Err(err) => {
                    if !request.may_retry_error(&err) || attempt >= self.backoff.max_retries
                    {
                        return Err(FetchError::Request(err));
                    }
                    err.to_string()
                }
            };

            let delay = self.backoff.delay_for_attempt(attempt);
            debug!(attempt, ?delay, reason = %retry, "retrying request");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        source_id: &str,
        request: &ApiRequest,
    ) -> Result<T, FetchError> {
        let response = self.send(source_id, request).await?;
        serde_json::from_slice(&response.body).map_err(|source| FetchError::Decode {
            url: response.final_url,
            source,
        })
    }
}
