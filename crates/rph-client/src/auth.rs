//! Client-credentials token lifecycle.

use std::fmt;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{ClientConfig, ClientError, Transport};

/// Lifetime assumed when the token response omits `expires_in`.
pub const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// Longest lifetime honoured; larger `expires_in` values are clamped to it.
pub const MAX_EXPIRES_IN_SECS: i64 = u32::MAX as i64;

/// Share of the declared lifetime after which the token is treated as expired.
pub const REFRESH_FRACTION: f64 = 0.9;

#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    bearer: String,
    expires_at: DateTime<Utc>,
}

impl Credential {
    /// Issues a credential that expires after 90% of `expires_in_secs`, counted from `now`.
    pub fn issue(bearer: impl Into<String>, expires_in_secs: i64, now: DateTime<Utc>) -> Self {
        let lifetime_secs = expires_in_secs.clamp(1, MAX_EXPIRES_IN_SECS);
        let lifetime_ms = (lifetime_secs as f64 * REFRESH_FRACTION * 1000.0) as i64;
        Self {
            bearer: bearer.into(),
            expires_at: now + ChronoDuration::milliseconds(lifetime_ms.max(1)),
        }
    }

    pub fn bearer(&self) -> &str {
        &self.bearer
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    pub(crate) fn authorization_value(&self) -> String {
        format!("bearer {}", self.bearer)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("bearer", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Holds the current bearer credential and re-authenticates when it lapses.
///
/// The check-and-refresh runs under one async lock, so concurrent callers
/// waiting on a refresh pick up the fresh credential instead of issuing
/// another exchange.
pub struct TokenManager {
    transport: Transport,
    auth_url: String,
    client_id: String,
    client_secret: String,
    current: Mutex<Option<Credential>>,
}

impl TokenManager {
    pub(crate) fn new(transport: Transport, config: &ClientConfig) -> Self {
        Self {
            transport,
            auth_url: config.auth_url.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            current: Mutex::new(None),
        }
    }

    /// Returns a credential that is valid at the instant of return.
    pub async fn ensure_valid_credential(&self) -> Result<Credential, ClientError> {
        let mut current = self.current.lock().await;
        if let Some(credential) = current.as_ref() {
            if credential.is_valid_at(Utc::now()) {
                return Ok(credential.clone());
            }
            debug!(expired_at = %credential.expires_at, "credential lapsed, re-authenticating");
        }

        let credential = self.authenticate().await?;
        *current = Some(credential.clone());
        Ok(credential)
    }

    /// Drops the cached credential so the next call re-authenticates.
    pub async fn invalidate(&self) {
        *self.current.lock().await = None;
    }

    async fn authenticate(&self) -> Result<Credential, ClientError> {
        let response = self
            .transport
            .send_with_retry(move || async move {
                Ok(self
                    .transport
                    .client()
                    .post(&self.auth_url)
                    .basic_auth(&self.client_id, Some(&self.client_secret))
                    .form(&[("grant_type", "client_credentials")]))
            })
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Auth {
                status: Some(status.as_u16()),
                message: snippet(&body),
            });
        }

        let payload: JsonValue = response.json().await.map_err(|e| ClientError::Auth {
            status: Some(status.as_u16()),
            message: format!("unreadable token response: {e}"),
        })?;
        let credential = credential_from_payload(&payload, Utc::now())?;
        info!(expires_at = %credential.expires_at, "obtained bearer credential");
        Ok(credential)
    }
}

impl fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenManager")
            .field("auth_url", &self.auth_url)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

fn credential_from_payload(payload: &JsonValue, now: DateTime<Utc>) -> Result<Credential, ClientError> {
    let Some(token) = payload
        .get("access_token")
        .and_then(JsonValue::as_str)
        .filter(|t| !t.is_empty())
    else {
        let reason = payload
            .get("error")
            .and_then(JsonValue::as_str)
            .unwrap_or("response has no access_token");
        return Err(ClientError::Auth {
            status: None,
            message: reason.to_string(),
        });
    };

    let expires_in = payload
        .get("expires_in")
        .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
        .unwrap_or(DEFAULT_EXPIRES_IN_SECS);
    Ok(Credential::issue(token, expires_in, now))
}

fn snippet(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() > 200 {
        format!("{}...", trimmed.chars().take(200).collect::<String>())
    } else {
        trimmed.to_string()
    }
}
