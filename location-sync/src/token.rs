//! Shared bearer-token cache for every outbound call.
//!
//! One `(token, expiry)` pair sits behind a single async mutex. The lock is
//! held across the refresh call, so callers queued behind a refresh observe
//! the new token instead of issuing their own request.

use crate::config::TokenConfig;
use crate::error::{LocationSyncError, LocationSyncResult};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_in: u64
}

#[derive(Debug, Deserialize)]
struct OAuthErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>
}

#[async_trait]
pub trait CredentialExchange: Send + Sync {
    async fn request_token(&self) -> LocationSyncResult<TokenResponse>;
}

/// Client-credentials grant against the identity endpoint.
pub struct ClientCredentialsExchange {
    http_client: Client,
    config: TokenConfig
}

impl ClientCredentialsExchange {
    pub fn new(http_client: Client, config: TokenConfig) -> Self {
        Self {
            http_client,
            config
        }
    }
}

#[async_trait]
impl CredentialExchange for ClientCredentialsExchange {
    async fn request_token(&self) -> LocationSyncResult<TokenResponse> {
        debug!(address = %self.config.token_url, "Requesting access token");

        let body = format!(
            "grant_type=client_credentials&client_id={}&client_secret={}&scope={}",
            urlencoding::encode(&self.config.client_id),
            urlencoding::encode(&self.config.client_secret),
            urlencoding::encode(&self.config.scopes.join(" "))
        );

        let response = self
            .http_client
            .post(&self.config.token_url)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .map_err(|e| {
                LocationSyncError::CredentialFailure(format!("Token request failed: {e}"))
            })?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if !status.is_success() {
            let detail = match serde_json::from_str::<OAuthErrorResponse>(&text) {
                Ok(err) => match err.error_description {
                    Some(description) => format!("{}: {}", err.error, description),
                    None => err.error
                },
                Err(_) => text
            };
            return Err(LocationSyncError::CredentialFailure(format!(
                "Token request failed: {} - {}",
                status.as_u16(),
                detail
            )));
        }

        serde_json::from_str::<TokenResponse>(&text).map_err(|e| {
            LocationSyncError::CredentialFailure(format!("Failed to parse token response: {e}"))
        })
    }
}

struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>
}

pub struct TokenCache {
    exchange: Arc<dyn CredentialExchange>,
    safety_margin: Duration,
    caching_disabled: bool,
    cached: Mutex<Option<CachedToken>>
}

impl TokenCache {
    pub fn new(
        exchange: Arc<dyn CredentialExchange>,
        safety_margin: std::time::Duration,
        caching_disabled: bool
    ) -> Self {
        Self {
            exchange,
            safety_margin: Duration::from_std(safety_margin).unwrap_or_else(|_| Duration::seconds(15)),
            caching_disabled,
            cached: Mutex::new(None)
        }
    }

    pub fn from_config(exchange: Arc<dyn CredentialExchange>, config: &TokenConfig) -> Self {
        Self::new(
            exchange,
            std::time::Duration::from_secs(config.safety_margin_seconds),
            config.caching_disabled
        )
    }

    /// Returns a token with more than the safety margin of lifetime left,
    /// refreshing it first when needed. A failed refresh caches nothing.
    pub async fn acquire(&self) -> LocationSyncResult<String> {
        let mut cached = self.cached.lock().await;
        let now = Utc::now();

        if !self.caching_disabled {
            if let Some(ref token) = *cached {
                if token.expires_at - now > self.safety_margin {
                    return Ok(token.token.clone());
                }
            }
        }

        let response = match self.exchange.request_token().await {
            Ok(response) => response,
            Err(e) => {
                *cached = None;
                warn!(error = %e, "Access token refresh failed");
                return Err(e);
            }
        };
        metrics::counter!("location_sync.token.refresh").increment(1);
        debug!(expires_in = response.expires_in, "Access token refreshed");

        let lifetime = response.expires_in.min(u64::from(u32::MAX)) as i64;
        let expires_at = now + Duration::seconds(lifetime);
        let token = response.access_token;
        *cached = Some(CachedToken {
            token: token.clone(),
            expires_at
        });

        Ok(token)
    }

    /// Drops the cached token, e.g. after the remote answered 401.
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }
}
