//! Shared HTTP transport: global and per-provider concurrency limits, a
//! per-provider token bucket, and capped exponential backoff for 429/5xx.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{info_span, warn, Instrument};
use trove_core::Provider;

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
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    #[serde(with = "millis")]
    pub base_delay: Duration,
    #[serde(with = "millis")]
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
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

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RateLimit {
    pub capacity: u32,
    #[serde(with = "millis")]
    pub refill_every: Duration,
}

/// Token bucket shared by every request to one provider. The lock is never
/// held across the sleep.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<BucketState>,
}

#[derive(Debug, Clone, Copy)]
struct BucketState {
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(limit: RateLimit) -> Self {
        let capacity = limit.capacity.max(1);
        Self {
            capacity,
            refill_every: limit.refill_every,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                if self.refill_every.is_zero() {
                    return;
                }
                let elapsed = state.last_refill.elapsed();
                let refills = u32::try_from(elapsed.as_nanos() / self.refill_every.as_nanos()).unwrap_or(u32::MAX);
                if refills > 0 {
                    state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                    // A full bucket banks no credit past the current instant.
                    state.last_refill = if state.tokens == self.capacity {
                        Instant::now()
                    } else {
                        state.last_refill + self.refill_every * refills
                    };
                }
                if state.tokens > 0 {
                    state.tokens -= 1;
                    return;
                }
                self.refill_every.saturating_sub(state.last_refill.elapsed())
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ProviderPolicy {
    pub concurrency: usize,
    #[serde(default)]
    pub rate_limit: Option<RateLimit>,
    #[serde(default)]
    pub backoff: BackoffPolicy,
}

impl Default for ProviderPolicy {
    fn default() -> Self {
        Self {
            concurrency: 4,
            rate_limit: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub policies: HashMap<Provider, ProviderPolicy>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            policies: HashMap::new(),
        }
    }
}

#[derive(Debug)]
struct Lane {
    permits: Semaphore,
    bucket: Option<TokenBucket>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
        serde_json::from_slice(&self.body).map_err(|source| FetchError::Decode {
            url: self.final_url.clone(),
            source,
        })
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("building http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("request body cannot be replayed")]
    NotReplayable,
    #[error("transport is shutting down")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    lanes: Arc<HashMap<Provider, Lane>>,
}

impl HttpTransport {
    pub fn new(config: TransportConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().map_err(FetchError::Client)?;

        let lanes = Provider::ALL
            .into_iter()
            .map(|provider| {
                let policy = config.policies.get(&provider).copied().unwrap_or_default();
                let lane = Lane {
                    permits: Semaphore::new(policy.concurrency.max(1)),
                    bucket: policy.rate_limit.map(TokenBucket::new),
                    backoff: policy.backoff,
                };
                (provider, lane)
            })
            .collect();

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            lanes: Arc::new(lanes),
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Sends `request`, retrying retryable failures per the provider's backoff.
    /// Any other non-success status is returned with its body captured.
    pub async fn execute(
        &self,
        provider: Provider,
        request: reqwest::Request,
    ) -> Result<FetchedResponse, FetchError> {
        let lane = &self.lanes[&provider];
        let _global = self.global_limit.acquire().await.map_err(|_| FetchError::Closed)?;
        let _lane = lane.permits.acquire().await.map_err(|_| FetchError::Closed)?;

        let span = info_span!(
            "http_fetch",
            %provider,
            method = %request.method(),
            url = %request.url()
        );
        async move {
            let mut attempt = 0;
            loop {
                if let Some(bucket) = &lane.bucket {
                    bucket.take().await;
                }
                let current = request.try_clone().ok_or(FetchError::NotReplayable)?;
                let can_retry = attempt < lane.backoff.max_retries;

                match self.client.execute(current).await {
                    Ok(resp) => {
                        let status = resp.status();
                        let final_url = resp.url().to_string();
                        if status.is_success() {
                            let body = resp.bytes().await?.to_vec();
                            return Ok(FetchedResponse { status, final_url, body });
                        }
                        if can_retry && classify_status(status) == RetryDisposition::Retryable {
                            warn!(status = status.as_u16(), attempt, "retryable status");
                            tokio::time::sleep(lane.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }
                        let body = resp.text().await.unwrap_or_default();
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                            body,
                        });
                    }
                    Err(err) => {
                        if can_retry && classify_reqwest_error(&err) == RetryDisposition::Retryable {
                            warn!(error = %err, attempt, "retryable request error");
                            tokio::time::sleep(lane.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(FetchError::Request(err));
                    }
                }
            }
        }
        .instrument(span)
        .await
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
