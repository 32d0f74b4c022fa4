//! Rate-limited, retrying HTTP client for the remote API
//!
//! Every attempt first waits on the shared [`RateLimiter`]. Transport
//! failures, `429` and `5xx` responses are retried with exponential backoff;
//! other statuses are returned to the caller immediately.

pub mod rate_limit;

pub use rate_limit::RateLimiter;

use harvest_common::{HarvestError, Result};
use reqwest::header::{HeaderMap, AUTHORIZATION, RETRY_AFTER};
use reqwest::{Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ============================================================================
// Client Constants
// ============================================================================

/// Default API base URL
pub const DEFAULT_BASE_URL: &str = "https://api.manifold.markets/v0";

/// Default per-request timeout in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Upper bound for a single backoff sleep
pub const MAX_BACKOFF: Duration = Duration::from_secs(3600);

/// Query parameters for one call
pub type Params = [(&'static str, String)];

/// Attempt budget and backoff schedule.
///
/// The sleep before retrying attempt `n` (1-based) is
/// `backoff_unit * backoff_factor^(n-1)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_factor: f64,
    pub backoff_unit: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_factor: f64) -> Self {
        Self {
            max_retries,
            backoff_factor,
            backoff_unit: Duration::from_secs(1),
        }
    }

    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.backoff_unit.as_secs_f64() * self.backoff_factor.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(MAX_BACKOFF)
            .min(MAX_BACKOFF)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, 1.5)
    }
}

/// HTTP client shared by every stage and worker; cheap to clone
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

pub struct ApiClientBuilder {
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
    policy: RetryPolicy,
    limiter: Option<Arc<RateLimiter>>,
    cancel: CancellationToken,
}

impl ApiClientBuilder {
    pub fn api_key(mut self, key: Option<String>) -> Self {
        self.api_key = key.filter(|k| !k.is_empty());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn build(self) -> Result<ApiClient> {
        let mut headers = HeaderMap::new();
        if let Some(key) = self.api_key {
            let value = format!("Key {key}")
                .parse()
                .map_err(|_| HarvestError::config("API key contains invalid header characters"))?;
            headers.insert(AUTHORIZATION, value);
        }

        let http = reqwest::Client::builder()
            .timeout(self.timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| HarvestError::config(format!("Failed to build HTTP client: {e}")))?;

        Ok(ApiClient {
            http,
            base_url: self.base_url.trim_end_matches('/').to_string(),
            limiter: self.limiter.unwrap_or_default(),
            policy: self.policy,
            cancel: self.cancel,
        })
    }
}

impl ApiClient {
    pub fn builder(base_url: impl Into<String>) -> ApiClientBuilder {
        ApiClientBuilder {
            base_url: base_url.into(),
            api_key: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            policy: RetryPolicy::default(),
            limiter: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn cancellable<F: Future>(&self, fut: F) -> Result<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(HarvestError::Cancelled),
            out = fut => Ok(out),
        }
    }

    async fn pause(&self, delay: Duration) -> Result<()> {
        self.cancellable(tokio::time::sleep(delay)).await
    }

    /// Perform one logical call with up to `max_retries` attempts.
    ///
    /// Returns the response for any status that is not retried (2xx and
    /// 4xx other than 429). A transport failure on the last attempt is
    /// returned as [`HarvestError::Transport`]; exhausting the budget on
    /// 429/5xx yields [`HarvestError::RetriesExceeded`].
    pub async fn request(&self, method: Method, path: &str, params: &Params) -> Result<Response> {
        let url = self.url(path);
        let max = self.policy.max_retries;
        let mut last_error = None;

        for attempt in 1..=max {
            self.cancellable(self.limiter.acquire()).await?;

            debug!(%method, %url, attempt, "Sending request");
            let sent = self
                .cancellable(self.http.request(method.clone(), &url).query(params).send())
                .await?;

            let response = match sent {
                Ok(response) => response,
                Err(e) => {
                    let err = HarvestError::Transport(e.to_string());
                    warn!(%method, %url, attempt, error = %err, "Request exception");
                    if attempt == max {
                        return Err(err);
                    }
                    let delay = self.policy.backoff(attempt);
                    info!(delay_secs = delay.as_secs_f64(), "Sleeping before retry");
                    self.pause(delay).await?;
                    last_error = Some(err);
                    continue;
                },
            };

            let status = response.status();
            let (err, delay) = if status == StatusCode::TOO_MANY_REQUESTS {
                let retry_after = retry_after(response.headers());
                let err = HarvestError::RateLimited {
                    retry_after_secs: retry_after.map(|d| d.as_secs_f64()),
                };
                (err, retry_after.unwrap_or_else(|| self.policy.backoff(attempt)))
            } else if status.is_server_error() {
                let err = HarvestError::Server {
                    status: status.as_u16(),
                };
                (err, self.policy.backoff(attempt))
            } else {
                return Ok(response);
            };

            warn!(%method, %url, attempt, max_retries = max, error = %err, "Retryable response");
            if attempt < max {
                info!(delay_secs = delay.as_secs_f64(), "Sleeping before retry");
                self.pause(delay).await?;
            }
            last_error = Some(err);
        }

        Err(HarvestError::RetriesExceeded {
            attempts: max,
            last: Box::new(
                last_error.unwrap_or_else(|| HarvestError::config("max_retries must be at least 1")),
            ),
        })
    }

    /// GET `path` and decode a JSON body.
    ///
    /// `404` maps to [`HarvestError::NotFound`] and other non-success
    /// statuses to [`HarvestError::Client`], both carrying the server's
    /// `message` field when the body has one.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str, params: &Params) -> Result<T> {
        let response = self.request(Method::GET, path, params).await?;
        let status = response.status();

        if !status.is_success() {
            let message = response_message(response).await;
            return Err(if status == StatusCode::NOT_FOUND {
                HarvestError::NotFound { message }
            } else {
                HarvestError::Client {
                    status: status.as_u16(),
                    message,
                }
            });
        }

        let body = self
            .cancellable(response.bytes())
            .await?
            .map_err(|e| HarvestError::Transport(e.to_string()))?;
        serde_json::from_slice(&body).map_err(|e| HarvestError::Decode(e.to_string()))
    }
}

/// `Retry-After` in (possibly fractional) seconds
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .map(|d| d.min(MAX_BACKOFF))
}

/// Server-provided `message` field, or the raw body when it is not JSON
async fn response_message(response: Response) -> String {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();

    serde_json::from_str::<serde_json::Value>(&text)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| if text.is_empty() { status.to_string() } else { text })
}
