use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

const ERROR_BODY_LIMIT: usize = 2048;

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
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    /// Minimum spacing between logical requests; retries are not paced.
    pub min_request_interval: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            min_request_interval: Duration::from_secs(3),
        }
    }
}

impl HttpClientConfig {
    /// Fixed spacing that keeps a client under `requests_per_minute`.
    pub fn interval_for_rate(requests_per_minute: u32) -> Duration {
        if requests_per_minute == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs(60) / requests_per_minute
    }
}

/// Coarse time-based self-throttle: each call waits until `interval` has
/// passed since the previous call to `wait` released its caller, so request
/// starts are at least `interval` apart.
#[derive(Debug)]
pub struct RequestPacer {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn wait(&self) {
        let mut last = self.last.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.interval {
                tokio::time::sleep(self.interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
    /// `X-RateLimit-Remaining` as sent by the server. Logged, never enforced.
    pub rate_limit_remaining: Option<String>,
    pub elapsed: Duration,
    pub attempts: usize,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed after {attempts} attempt(s): {source}")]
    Transport {
        url: String,
        attempts: usize,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::HttpStatus { status, .. } if (400..500).contains(status) && *status != 429)
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    pacer: RequestPacer,
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

        Ok(Self {
            client,
            pacer: RequestPacer::new(config.min_request_interval),
            backoff: config.backoff,
        })
    }

    /// GET `url` with `query`, retrying transport failures and retryable
    /// statuses with exponential backoff. Non-retryable statuses fail at once.
    pub async fn get(
        &self,
        run_id: Uuid,
        url: &str,
        query: &[(String, String)],
    ) -> Result<FetchedResponse, FetchError> {
        self.pacer.wait().await;
        let span = info_span!("http_fetch", %run_id, url);
        self.get_with_retries(url, query).instrument(span).await
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        run_id: Uuid,
        url: &str,
        query: &[(String, String)],
    ) -> Result<(T, FetchedResponse), FetchError> {
        let response = self.get(run_id, url, query).await?;
        let value = serde_json::from_slice(&response.body).map_err(|source| FetchError::Decode {
            url: response.final_url.clone(),
            source,
        })?;
        Ok((value, response))
    }

    async fn get_with_retries(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let started = Instant::now();
        let mut attempt = 0usize;

        loop {
            let attempts = attempt + 1;
            let can_retry = attempt < self.backoff.max_retries;

            match self.client.get(url).query(query).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let rate_limit_remaining = resp
                        .headers()
                        .get("X-RateLimit-Remaining")
                        .and_then(|v| v.to_str().ok())
                        .map(ToString::to_string);

                    if status.is_success() {
                        let body = resp
                            .bytes()
                            .await
                            .map_err(|source| FetchError::Transport {
                                url: final_url.clone(),
                                attempts,
                                source,
                            })?
                            .to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                            rate_limit_remaining,
                            elapsed: started.elapsed(),
                            attempts,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && can_retry {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(status = status.as_u16(), attempt = attempts, ?delay, "retryable http status");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    let mut body = resp.text().await.unwrap_or_default();
                    truncate_utf8(&mut body, ERROR_BODY_LIMIT);
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                        body,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && can_retry {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(error = %err, attempt = attempts, ?delay, "transient request failure");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Transport {
                        url: url.to_string(),
                        attempts,
                        source: err,
                    });
                }
            }
        }
    }
}

fn truncate_utf8(text: &mut String, limit: usize) {
    if text.len() <= limit {
        return;
    }
    let mut cut = limit;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
}
