// Rate-limited HTTP client
//
// Wraps reqwest with the per-source request policy: minimum spacing between
// requests, persisted 429 back-off, bounded fixed-delay retries for 5xx and
// network failures, and a daily retry budget shared across runs.

use crate::config::RetryConfig;
use crate::error::{IngestError, Result};
use crate::models::Source;
use crate::state::StateTracker;
use chrono::{DateTime, Utc};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Response, StatusCode};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub struct RateLimitedClient {
    http: Client,
    source: Source,
    tracker: Arc<StateTracker>,
    retry: RetryConfig,
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
    requests_sent: AtomicU32,
}

impl RateLimitedClient {
    pub fn new(
        source: Source,
        tracker: Arc<StateTracker>,
        retry: RetryConfig,
        min_interval: Duration,
        timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("medmirror/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            source,
            tracker,
            retry,
            min_interval,
            last_request: Mutex::new(None),
            requests_sent: AtomicU32::new(0),
        })
    }

    pub fn source(&self) -> Source {
        self.source
    }

    /// Requests issued so far, retries included
    pub fn requests_sent(&self) -> u32 {
        self.requests_sent.load(Ordering::Relaxed)
    }

    pub async fn get_json(&self, url: &str, query: &[(&str, String)]) -> Result<serde_json::Value> {
        let response = self.get(url, query).await?;
        response.json().await.map_err(|e| IngestError::Upstream {
            source_name: self.source,
            message: format!("Invalid JSON body from {}: {}", url, e),
        })
    }

    pub async fn get_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.get(url, &[]).await?;
        Ok(response.bytes().await?.to_vec())
    }

    /// Issue a GET and return the first successful response
    pub async fn get(&self, url: &str, query: &[(&str, String)]) -> Result<Response> {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            self.ensure_allowed().await?;
            self.throttle().await;

            self.requests_sent.fetch_add(1, Ordering::Relaxed);
            debug!(source = %self.source, url, attempt, "Upstream request");

            match self.http.get(url).query(query).send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) if response.status() == StatusCode::TOO_MANY_REQUESTS => {
                    let retry_after = retry_after_secs(&response, Utc::now())
                        .unwrap_or(self.retry.default_retry_after_secs);
                    let until = self.tracker.set_rate_limit(self.source, retry_after).await?;
                    self.tracker.increment_retry_count(self.source).await?;

                    if Duration::from_secs(retry_after) > self.retry.max_inline_wait()
                        || attempt >= self.retry.max_request_attempts
                    {
                        return Err(IngestError::RateLimited {
                            source_name: self.source,
                            until,
                        });
                    }
                }
                Ok(response) if response.status().is_server_error() => {
                    let status = response.status();
                    self.tracker.increment_retry_count(self.source).await?;
                    if attempt >= self.retry.max_request_attempts {
                        return Err(IngestError::TransientNetwork {
                            source_name: self.source,
                            message: format!("{} returned {} after {} attempts", url, status, attempt),
                        });
                    }
                    let delay = self.retry.server_error_delay();
                    warn!(
                        source = %self.source,
                        status = status.as_u16(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Upstream server error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Ok(response) => {
                    return Err(IngestError::Upstream {
                        source_name: self.source,
                        message: format!("{} returned {}", url, response.status()),
                    });
                }
                Err(e) => {
                    self.tracker.increment_retry_count(self.source).await?;
                    if attempt >= self.retry.max_request_attempts {
                        return Err(IngestError::TransientNetwork {
                            source_name: self.source,
                            message: e.to_string(),
                        });
                    }
                    let delay = self.retry.network_error_delay();
                    warn!(
                        source = %self.source,
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Network error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Refuse or delay the request according to persisted state
    async fn ensure_allowed(&self) -> Result<()> {
        if let Some(until) = self.tracker.rate_limited_until(self.source).await {
            let wait = (until - Utc::now()).to_std().unwrap_or_default();
            if wait > self.retry.max_inline_wait() {
                return Err(IngestError::RateLimited {
                    source_name: self.source,
                    until,
                });
            }
            info!(
                source = %self.source,
                delay_ms = wait.as_millis() as u64,
                "Waiting out rate limit"
            );
            tokio::time::sleep(wait).await;
        }

        let count = self.tracker.get_daily_retry_count(self.source).await;
        if count >= self.retry.daily_retry_budget {
            return Err(IngestError::RetryBudgetExhausted {
                source_name: self.source,
                count,
            });
        }

        Ok(())
    }

    async fn throttle(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Seconds to wait according to a `Retry-After` header
///
/// Accepts both delta-seconds and HTTP-date forms.
fn retry_after_secs(response: &Response, now: DateTime<Utc>) -> Option<u64> {
    let raw = response.headers().get(RETRY_AFTER)?.to_str().ok()?.trim();
    parse_retry_after(raw, now)
}

pub(crate) fn parse_retry_after(raw: &str, now: DateTime<Utc>) -> Option<u64> {
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(secs);
    }
    let at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    Some((at - now).num_seconds().max(0) as u64)
}
