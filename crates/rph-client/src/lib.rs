//! OAuth-authenticated, retrying HTTP client for the upstream post API.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, AUTHORIZATION};
use reqwest::{Method, StatusCode};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

pub mod auth;
pub mod listing;
pub mod reddit;

pub use auth::{Credential, TokenManager};
pub use listing::{ListingPage, Paging, RecordStream};
pub use reddit::{RedditClient, SearchParams, SearchSort, SubredditListing, SubredditSort, TimeRange};

pub const CRATE_NAME: &str = "rph-client";

pub const DEFAULT_AUTH_URL: &str = "https://www.reddit.com/api/v1/access_token";
pub const DEFAULT_API_BASE: &str = "https://oauth.reddit.com";
pub const RATE_LIMIT_RESET_HEADER: &str = "x-ratelimit-reset";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("authentication failed (status {status:?}): {message}")]
    Auth { status: Option<u16>, message: String },
    #[error("transport failure after retries: {source}")]
    Transport {
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {method} {url}")]
    Protocol {
        status: u16,
        method: String,
        url: String,
    },
    #[error("invalid response body from {url}: {message}")]
    Decode { url: String, message: String },
    #[error("building http client: {0}")]
    Setup(String),
    #[error("invalid {name}: {value:?}")]
    InvalidParameter { name: &'static str, value: String },
}

impl ClientError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Auth { status, .. } => *status,
            Self::Protocol { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Statuses the transport retries on its own before handing the response back.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    match status.as_u16() {
        429 | 500 | 502 | 503 | 504 => RetryDisposition::Retryable,
        _ => RetryDisposition::NonRetryable,
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(800),
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

/// Wait demanded by a rate-limit reset header: `max(1, ceil(seconds))`.
pub fn rate_limit_wait(headers: &HeaderMap, header_name: &str) -> Option<Duration> {
    let raw = headers.get(header_name)?.to_str().ok()?;
    let seconds = raw.trim().parse::<f64>().ok()?;
    if !seconds.is_finite() {
        return None;
    }
    Some(Duration::from_secs(seconds.ceil().max(1.0) as u64))
}

#[derive(Clone)]
pub struct ClientConfig {
    pub client_id: String,
    pub client_secret: String,
    pub user_agent: String,
    pub auth_url: String,
    pub api_base: String,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
    /// Pause between consecutive listing pages.
    pub page_delay: Duration,
    pub rate_limit_reset_header: String,
}

impl ClientConfig {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        user_agent: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            user_agent: user_agent.into(),
            auth_url: DEFAULT_AUTH_URL.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            timeout: Duration::from_secs(20),
            backoff: BackoffPolicy::default(),
            page_delay: Duration::from_millis(600),
            rate_limit_reset_header: RATE_LIMIT_RESET_HEADER.to_string(),
        }
    }

    /// User agent in the `<prefix> by u/<username>` form the provider asks for.
    pub fn user_agent_for(prefix: &str, username: &str) -> String {
        format!("{prefix} by u/{username}")
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("user_agent", &self.user_agent)
            .field("auth_url", &self.auth_url)
            .field("api_base", &self.api_base)
            .field("timeout", &self.timeout)
            .field("backoff", &self.backoff)
            .field("page_delay", &self.page_delay)
            .finish()
    }
}

/// Shared reqwest client plus the per-attempt retry loop.
#[derive(Debug, Clone)]
pub(crate) struct Transport {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl Transport {
    pub(crate) fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| ClientError::Setup(e.to_string()))?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub(crate) fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Sends the request built by `make_request`, rebuilding it for each attempt.
    ///
    /// A retryable status that survives every attempt is returned as a response
    /// so callers can apply their own handling (e.g. rate-limit headers).
    pub(crate) async fn send_with_retry<F, Fut>(
        &self,
        mut make_request: F,
    ) -> Result<reqwest::Response, ClientError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<reqwest::RequestBuilder, ClientError>>,
    {
        let mut attempt = 0usize;
        loop {
            let request = make_request().await?;
            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(
                            status = status.as_u16(),
                            url = %resp.url(),
                            attempt = attempt + 1,
                            max_attempts = self.backoff.max_retries + 1,
                            ?delay,
                            "retryable status, backing off"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(
                            error = %err,
                            attempt = attempt + 1,
                            max_attempts = self.backoff.max_retries + 1,
                            ?delay,
                            "network error, backing off"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(ClientError::Transport { source: err });
                }
            }
        }
    }
}

/// Resilient request layer: bearer auth, transport retry, one manual rate-limit retry.
#[derive(Debug, Clone)]
pub struct ApiClient {
    transport: Transport,
    tokens: Arc<TokenManager>,
    api_base: String,
    page_delay: Duration,
    rate_limit_reset_header: String,
}

impl ApiClient {
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        let transport = Transport::new(config)?;
        let tokens = Arc::new(TokenManager::new(transport.clone(), config));
        Ok(Self {
            transport,
            tokens,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            page_delay: config.page_delay,
            rate_limit_reset_header: config.rate_limit_reset_header.clone(),
        })
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    pub fn page_delay(&self) -> Duration {
        self.page_delay
    }

    /// Absolute URLs pass through; anything else is joined onto the API base.
    pub fn resolve_url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}/{}", self.api_base, path.trim_start_matches('/'))
        }
    }

    pub async fn get_json(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> Result<JsonValue, ClientError> {
        self.request(Method::GET, path, query).await
    }

    pub async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
    ) -> Result<JsonValue, ClientError> {
        let url = self.resolve_url(path);
        let url_ref: &str = &url;
        debug!(%method, url = url_ref, params = query.len(), "api request");

        let first_method = method.clone();
        let mut response = self
            .transport
            .send_with_retry(move || self.authorized(first_method.clone(), url_ref, query))
            .await?;

        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            if let Some(wait) = rate_limit_wait(response.headers(), &self.rate_limit_reset_header) {
                warn!(url = url_ref, ?wait, "rate limited, waiting for reset before one more attempt");
                tokio::time::sleep(wait).await;
                response = self
                    .authorized(method.clone(), url_ref, query)
                    .await?
                    .send()
                    .await
                    .map_err(|source| ClientError::Transport { source })?;
            }
        }

        let status = response.status();
        if !status.is_success() {
            if status == StatusCode::UNAUTHORIZED {
                self.tokens.invalidate().await;
            }
            return Err(ClientError::Protocol {
                status: status.as_u16(),
                method: method.to_string(),
                url,
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|source| ClientError::Transport { source })?;
        serde_json::from_slice(&body).map_err(|e| ClientError::Decode {
            url,
            message: e.to_string(),
        })
    }

    async fn authorized(
        &self,
        method: Method,
        url: &str,
        query: &[(String, String)],
    ) -> Result<reqwest::RequestBuilder, ClientError> {
        let credential = self.tokens.ensure_valid_credential().await?;
        Ok(self
            .transport
            .client()
            .request(method, url)
            .query(query)
            .header(AUTHORIZATION, credential.authorization_value()))
    }
}
