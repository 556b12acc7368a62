//! Pushes the canonical set downstream.
//!
//! The store is walked in identity order, one top-level batch per scan page,
//! with a fixed pause between top-level batches. Under the split policy a
//! rejected batch is halved until every half either uploads or is a single
//! record; single-record rejections are poison and end the run once the rest
//! of their batch has been delivered.

use crate::config::{RetryConfig, UploadPolicy};
use crate::error::{LocationSyncError, LocationSyncResult, PoisonRecord};
use crate::model::{CanonicalLocation, LocationId};
use crate::repository::LocationRepository;
use crate::token::TokenCache;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const LAST_MODIFIED_PATH: &str = "en/api/1.0/locations/last-modified-date";
const LOCATIONS_PATH: &str = "en/api/1.0/locations";

#[async_trait]
pub trait PublisherClient: Send + Sync {
    /// Last modification acknowledged downstream; the differential watermark.
    async fn last_modified(&self) -> LocationSyncResult<DateTime<Utc>>;

    async fn upload(&self, batch: &[CanonicalLocation]) -> LocationSyncResult<()>;
}

pub struct HttpPublisherClient {
    client: Client,
    base_url: String,
    tokens: Arc<TokenCache>
}

impl HttpPublisherClient {
    pub fn new(
        base_url: impl Into<String>,
        tokens: Arc<TokenCache>,
        timeout: Duration
    ) -> LocationSyncResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(LocationSyncError::Http)?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }
}

/// Accepts RFC 3339 timestamps and offset-less ones, which are read as UTC.
/// `null` means nothing was published yet.
fn parse_last_modified(body: &str) -> Result<DateTime<Utc>, String> {
    let value: Option<String> = serde_json::from_str(body).map_err(|e| e.to_string())?;
    let Some(raw) = value else {
        return Ok(DateTime::<Utc>::UNIX_EPOCH);
    };

    if let Ok(parsed) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| format!("invalid timestamp '{raw}': {e}"))
}

#[async_trait]
impl PublisherClient for HttpPublisherClient {
    async fn last_modified(&self) -> LocationSyncResult<DateTime<Utc>> {
        let token = self.tokens.acquire().await?;
        let response = self
            .client
            .get(self.url(LAST_MODIFIED_PATH))
            .bearer_auth(token)
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            self.tokens.invalidate().await;
        }
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(LocationSyncError::LastModifiedFailure {
                status: status.as_u16(),
                reason: if body.is_empty() {
                    status.canonical_reason().unwrap_or("Unknown").to_string()
                } else {
                    body
                }
            });
        }

        parse_last_modified(&body).map_err(|reason| LocationSyncError::LastModifiedFailure {
            status: status.as_u16(),
            reason
        })
    }

    async fn upload(&self, batch: &[CanonicalLocation]) -> LocationSyncResult<()> {
        let token = self.tokens.acquire().await?;
        let response = self
            .client
            .post(self.url(LOCATIONS_PATH))
            .bearer_auth(token)
            .json(batch)
            .send()
            .await
            .map_err(|e| LocationSyncError::UploadFailure {
                size: batch.len(),
                status: 0,
                reason: e.to_string()
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status == StatusCode::UNAUTHORIZED {
            self.tokens.invalidate().await;
        }

        let body = response.text().await.unwrap_or_default();
        Err(LocationSyncError::UploadFailure {
            size: batch.len(),
            status: status.as_u16(),
            reason: if body.is_empty() {
                status.canonical_reason().unwrap_or("Unknown").to_string()
            } else {
                body
            }
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReport {
    pub uploaded: usize,
    /// Top-level batches read from the store.
    pub batches: usize,
    /// Upload requests issued, sub-batches and retries included.
    pub requests: usize,
    pub splits: usize
}

pub struct Publisher {
    client: Arc<dyn PublisherClient>,
    repository: Arc<dyn LocationRepository>,
    batch_size: usize,
    delay: Duration,
    policy: UploadPolicy,
    retry: RetryConfig
}

impl Publisher {
    pub fn new(
        client: Arc<dyn PublisherClient>,
        repository: Arc<dyn LocationRepository>,
        batch_size: usize,
        delay: Duration,
        policy: UploadPolicy,
        retry: RetryConfig
    ) -> Self {
        Self {
            client,
            repository,
            batch_size: batch_size.max(1),
            delay,
            policy,
            retry
        }
    }

    pub async fn publish(&self) -> LocationSyncResult<PublishReport> {
        let mut report = PublishReport::default();
        let mut after: Option<LocationId> = None;

        info!(batch_size = self.batch_size, policy = ?self.policy, "Publishing locations");

        loop {
            let batch = self
                .repository
                .scan_ordered(after, self.batch_size)
                .await?;
            let Some(last) = batch.last() else {
                break;
            };
            let last_id = last.id;
            let full = batch.len() == self.batch_size;

            if report.batches > 0 && !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            report.batches += 1;

            match self.policy {
                UploadPolicy::SplitOnFailure => self.upload_splitting(batch, &mut report).await?,
                UploadPolicy::FixedRetry { attempts } => {
                    self.upload_retrying(&batch, attempts, &mut report).await?
                }
            }

            if !full {
                break;
            }
            after = Some(last_id);
        }

        info!(
            uploaded = report.uploaded,
            batches = report.batches,
            requests = report.requests,
            splits = report.splits,
            "Publishing completed"
        );
        Ok(report)
    }

    /// Halving worklist. Left halves are sent before right halves, so records
    /// reach the consumer in identity order.
    async fn upload_splitting(
        &self,
        batch: Vec<CanonicalLocation>,
        report: &mut PublishReport
    ) -> LocationSyncResult<()> {
        let mut pending = vec![batch];
        let mut poisoned = Vec::new();

        while let Some(mut chunk) = pending.pop() {
            report.requests += 1;
            match self.client.upload(&chunk).await {
                Ok(()) => {
                    report.uploaded += chunk.len();
                    metrics::counter!("location_sync.records.uploaded")
                        .increment(chunk.len() as u64);
                    debug!(count = chunk.len(), "Uploaded batch");
                }
                Err(e @ LocationSyncError::CredentialFailure(_)) => return Err(e),
                Err(e) if chunk.len() == 1 => {
                    let record = &chunk[0];
                    error!(
                        id = %record.id,
                        name = %record.display_name(),
                        error = %e,
                        "Location rejected downstream"
                    );
                    poisoned.push(PoisonRecord {
                        id: record.id.0,
                        name: record.display_name(),
                        reason: e.to_string()
                    });
                }
                Err(e) => {
                    let right = chunk.split_off(chunk.len() / 2);
                    warn!(
                        count = chunk.len() + right.len(),
                        error = %e,
                        "Batch upload failed, splitting"
                    );
                    report.splits += 1;
                    metrics::counter!("location_sync.upload.split").increment(1);
                    pending.push(right);
                    pending.push(chunk);
                }
            }
        }

        if poisoned.is_empty() {
            Ok(())
        } else {
            Err(LocationSyncError::UploadRejected { poisoned })
        }
    }

    async fn upload_retrying(
        &self,
        batch: &[CanonicalLocation],
        attempts: u32,
        report: &mut PublishReport
    ) -> LocationSyncResult<()> {
        let attempts = attempts.max(1);
        let mut backoff = Duration::from_millis(self.retry.initial_backoff_ms);
        let max_backoff = Duration::from_millis(self.retry.max_backoff_ms);
        let mut attempt = 1;

        loop {
            report.requests += 1;
            match self.client.upload(batch).await {
                Ok(()) => {
                    report.uploaded += batch.len();
                    metrics::counter!("location_sync.records.uploaded")
                        .increment(batch.len() as u64);
                    debug!(count = batch.len(), attempt, "Uploaded batch");
                    return Ok(());
                }
                Err(e) if attempt >= attempts || !e.is_retryable() => {
                    error!(count = batch.len(), attempt, error = %e, "Batch upload failed");
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        count = batch.len(),
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Batch upload failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(max_backoff);
                    attempt += 1;
                }
            }
        }
    }
}
