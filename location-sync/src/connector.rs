use crate::error::{LocationSyncError, LocationSyncResult};
use crate::model::{LocationType, Provider, RawLocation};
use crate::token::TokenCache;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const WATERMARK_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// One page of a provider feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub watermark: DateTime<Utc>,
    pub location_type: LocationType,
    pub skip: usize,
    pub take: usize
}

impl PageRequest {
    /// Relative feed path, also used to identify the page in errors.
    pub fn path(&self) -> String {
        format!(
            "locations/{}?locationType={}&skip={}&take={}",
            self.watermark.format(WATERMARK_FORMAT),
            self.location_type.code(),
            self.skip,
            self.take
        )
    }
}

#[async_trait]
pub trait ConnectorClient: Send + Sync {
    fn provider(&self) -> &Provider;

    async fn fetch_page(&self, request: &PageRequest) -> LocationSyncResult<Vec<RawLocation>>;
}

pub struct HttpConnectorClient {
    client: Client,
    provider: Provider,
    base_url: String,
    tokens: Arc<TokenCache>
}

impl HttpConnectorClient {
    pub fn new(
        provider: Provider,
        base_url: impl Into<String>,
        tokens: Arc<TokenCache>,
        timeout: Duration
    ) -> LocationSyncResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(LocationSyncError::Http)?;

        Ok(Self::with_client(client, provider, base_url, tokens))
    }

    pub fn with_client(
        client: Client,
        provider: Provider,
        base_url: impl Into<String>,
        tokens: Arc<TokenCache>
    ) -> Self {
        Self {
            client,
            provider,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens
        }
    }

    fn fetch_failure(&self, path: &str, status: u16, reason: impl Into<String>) -> LocationSyncError {
        LocationSyncError::FetchFailure {
            provider: self.provider.to_string(),
            path: path.to_string(),
            status,
            reason: reason.into()
        }
    }
}

#[async_trait]
impl ConnectorClient for HttpConnectorClient {
    fn provider(&self) -> &Provider {
        &self.provider
    }

    async fn fetch_page(&self, request: &PageRequest) -> LocationSyncResult<Vec<RawLocation>> {
        let path = request.path();
        let url = format!("{}/{}", self.base_url, path);
        debug!(provider = %self.provider, url = %url, "Fetching location page");

        let token = self.tokens.acquire().await?;
        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| self.fetch_failure(&path, 0, e.to_string()))?;

        match response.status() {
            status if status.is_success() => {
                let body = response
                    .text()
                    .await
                    .map_err(|e| self.fetch_failure(&path, status.as_u16(), e.to_string()))?;
                serde_json::from_str::<Vec<RawLocation>>(&body).map_err(|e| {
                    LocationSyncError::DecodeFailure {
                        provider: self.provider.to_string(),
                        path: path.clone(),
                        reason: e.to_string()
                    }
                })
            }
            StatusCode::UNAUTHORIZED => {
                self.tokens.invalidate().await;
                Err(self.fetch_failure(&path, 401, "Unauthorized"))
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                let reason = if body.is_empty() {
                    status.canonical_reason().unwrap_or("Unknown").to_string()
                } else {
                    body
                };
                Err(self.fetch_failure(&path, status.as_u16(), reason))
            }
        }
    }
}
