//! Outbound HTTP plumbing for the portal and detail host, plus the raw
//! payload archive.

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::{RequestBuilder, StatusCode};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

pub mod archive;

pub use archive::{ArchivedPayload, PayloadArchive};

pub const CRATE_NAME: &str = "rupsync-storage";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Linear backoff: the wait after failed attempt `n` (1-based) is `n * base_delay`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn with_base_delay(base_delay: Duration) -> Self {
        Self {
            base_delay,
            ..Self::default()
        }
    }

    pub fn delay_after_attempt(&self, attempt: usize) -> Duration {
        let factor = u32::try_from(attempt.max(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Enforces a minimum spacing between consecutive requests.
#[derive(Debug)]
pub struct IntervalLimiter {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl IntervalLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    pub async fn wait_turn(&self) {
        let wait_until = {
            let mut next_slot = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = match *next_slot {
                Some(slot) if slot > now => slot,
                _ => now,
            };
            *next_slot = Some(slot + self.interval);
            slot
        };
        tokio::time::sleep_until(wait_until).await;
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_in_flight: usize,
    pub retry: RetryPolicy,
    /// Minimum spacing between requests made through this client.
    pub min_interval: Option<Duration>,
    pub cookie_store: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            max_in_flight: 4,
            retry: RetryPolicy::default(),
            min_interval: None,
            cookie_store: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub attempts: usize,
    /// Response body, already gunzipped when the server sent gzip bytes.
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed after {attempts} attempt(s): {source}")]
    Request {
        url: String,
        attempts: usize,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url} after {attempts} attempt(s)")]
    HttpStatus {
        status: u16,
        url: String,
        attempts: usize,
    },
    #[error("decoding gzip body from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: std::io::Error,
    },
    #[error("http client is shut down")]
    Closed,
}

impl FetchError {
    pub fn attempts(&self) -> usize {
        match self {
            FetchError::Request { attempts, .. } | FetchError::HttpStatus { attempts, .. } => {
                *attempts
            }
            FetchError::Decode { .. } | FetchError::Closed => 1,
        }
    }
}

/// Gunzips `raw` when it starts with the gzip magic bytes, otherwise returns it unchanged.
pub fn decode_body(raw: &[u8]) -> std::io::Result<Vec<u8>> {
    if raw.len() < 2 || raw[..2] != GZIP_MAGIC {
        return Ok(raw.to_vec());
    }
    let mut decoded = Vec::with_capacity(raw.len() * 4);
    flate2::read::GzDecoder::new(raw).read_to_end(&mut decoded)?;
    Ok(decoded)
}

/// One long-lived client. Cookies set by the portal persist across calls
/// when `cookie_store` is enabled.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Arc<Semaphore>,
    limiter: Option<IntervalLimiter>,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .cookie_store(config.cookie_store)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            limiter: config.min_interval.map(IntervalLimiter::new),
            retry: config.retry,
        })
    }

    pub async fn get(
        &self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", method = "GET", url);
        self.send_with_retry(url, || with_headers(self.client.get(url), headers))
            .instrument(span)
            .await
    }

    pub async fn post_form(
        &self,
        url: &str,
        form: &[(&str, &str)],
        headers: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", method = "POST", url);
        self.send_with_retry(url, || {
            with_headers(self.client.post(url), headers).form(form)
        })
        .instrument(span)
        .await
    }

    async fn send_with_retry<F>(&self, url: &str, build: F) -> Result<FetchedResponse, FetchError>
    where
        F: Fn() -> RequestBuilder,
    {
        let _permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;

        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            if let Some(limiter) = &self.limiter {
                limiter.wait_turn().await;
            }

            let (disposition, error) = match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        match resp.bytes().await {
                            Ok(raw) => {
                                let body = decode_body(&raw).map_err(|source| FetchError::Decode {
                                    url: final_url.clone(),
                                    source,
                                })?;
                                debug!(attempt, bytes = body.len(), "fetched");
                                return Ok(FetchedResponse {
                                    status,
                                    final_url,
                                    attempts: attempt,
                                    body,
                                });
                            }
                            Err(source) => (
                                classify_reqwest_error(&source),
                                FetchError::Request {
                                    url: final_url,
                                    attempts: attempt,
                                    source,
                                },
                            ),
                        }
                    } else {
                        (
                            classify_status(status),
                            FetchError::HttpStatus {
                                status: status.as_u16(),
                                url: final_url,
                                attempts: attempt,
                            },
                        )
                    }
                }
                Err(source) => (
                    classify_reqwest_error(&source),
                    FetchError::Request {
                        url: url.to_string(),
                        attempts: attempt,
                        source,
                    },
                ),
            };

            if disposition == RetryDisposition::NonRetryable || attempt >= max_attempts {
                warn!(attempt, error = %error, "giving up");
                return Err(error);
            }

            let delay = self.retry.delay_after_attempt(attempt);
            warn!(attempt, delay_ms = delay.as_millis() as u64, error = %error, "retrying");
            tokio::time::sleep(delay).await;
        }
    }
}

fn with_headers(mut req: RequestBuilder, headers: &[(&str, &str)]) -> RequestBuilder {
    for (name, value) in headers {
        req = req.header(*name, *value);
    }
    req
}
