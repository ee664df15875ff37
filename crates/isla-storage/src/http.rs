use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::{StatusCode, Url};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

/// HTTP settings for source collaborators. Requests are never retried; a
/// failed page fails the fetch step.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_concurrency: usize,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_concurrency: 4,
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

/// Pacing for polite fetching: `capacity` requests up front, then one more
/// every `refill_every`.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: u32,
    refilled_at: Instant,
}

impl BucketState {
    fn refill(&mut self, capacity: u32, refill_every: Duration, now: Instant) {
        if refill_every.is_zero() {
            self.tokens = capacity;
            return;
        }
        let earned = now.duration_since(self.refilled_at).as_millis() / refill_every.as_millis().max(1);
        if earned > 0 {
            let earned = u32::try_from(earned).unwrap_or(u32::MAX);
            self.tokens = self.tokens.saturating_add(earned).min(capacity);
            self.refilled_at = now;
        }
    }
}

impl TokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            capacity: config.capacity.max(1),
            refill_every: config.refill_every,
            state: Mutex::new(BucketState {
                tokens: config.capacity.max(1),
                refilled_at: Instant::now(),
            }),
        }
    }

    /// Wait until a token is available and spend it.
    pub async fn acquire(&self) {
        loop {
            {
                let mut state = self.state.lock().await;
                state.refill(self.capacity, self.refill_every, Instant::now());
                if state.tokens > 0 {
                    state.tokens -= 1;
                    return;
                }
            }
            tokio::time::sleep(self.refill_every).await;
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
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("fetcher concurrency limit closed")]
    Closed,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    pacing: Option<TokenBucket>,
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
        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            pacing: config.token_bucket.map(TokenBucket::new),
        })
    }

    /// GET `base` with URL-encoded query parameters appended.
    pub async fn fetch_with_query(
        &self,
        run_id: Uuid,
        dataset_id: &str,
        base: &str,
        params: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let url = Url::parse_with_params(base, params).map_err(|e| FetchError::InvalidUrl {
            url: base.to_string(),
            reason: e.to_string(),
        })?;
        self.fetch_bytes(run_id, dataset_id, url.as_str()).await
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        dataset_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let _permit = self.limit.acquire().await.map_err(|_| FetchError::Closed)?;

        if let Some(bucket) = &self.pacing {
            bucket.acquire().await;
        }

        let span = info_span!("http_fetch", %run_id, dataset_id, url);
        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let body = resp.bytes().await?.to_vec();
            debug!(bytes = body.len(), "fetched");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}
