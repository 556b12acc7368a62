use crate::config::{LocationSyncConfig, UpdateMode};
use crate::connector::{ConnectorClient, HttpConnectorClient, PageRequest};
use crate::error::{LocationSyncError, LocationSyncResult};
use crate::model::{CanonicalLocation, LocationId, LocationType, Provider};
use crate::normalizer::Normalizer;
use crate::publisher::{HttpPublisherClient, Publisher, PublisherClient};
use crate::reconciler::{ChangeSet, Reconciler};
use crate::repository::{InMemoryLocationRepository, LocationRepository, PgLocationRepository};
use crate::token::{ClientCredentialsExchange, TokenCache};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderState {
    #[default]
    Init,
    Paging,
    Done,
    Failed
}

impl fmt::Display for ProviderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::Paging => "paging",
            Self::Done => "done",
            Self::Failed => "failed"
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderReport {
    pub provider: String,
    pub state: ProviderState,
    pub pages: u32,
    pub fetched: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize
}

impl ProviderReport {
    fn new(provider: &Provider) -> Self {
        Self {
            provider: provider.to_string(),
            ..Default::default()
        }
    }

    fn record_page(&mut self, fetched: usize, changes: &ChangeSet) {
        self.pages += 1;
        self.fetched += fetched;
        self.inserted += changes.to_insert.len();
        self.updated += changes.to_update.len();
        self.unchanged += changes.unchanged;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReport {
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub mode: UpdateMode,
    pub watermark: DateTime<Utc>,
    pub providers: Vec<ProviderReport>,
    pub uploaded: usize,
    pub batches: usize,
    pub splits: usize
}

impl SyncReport {
    pub fn new(mode: UpdateMode) -> Self {
        Self {
            started_at: Utc::now(),
            completed_at: None,
            mode,
            watermark: DateTime::<Utc>::UNIX_EPOCH,
            providers: Vec::new(),
            uploaded: 0,
            batches: 0,
            splits: 0
        }
    }

    pub fn complete(&mut self) {
        self.completed_at = Some(Utc::now());
    }

    pub fn inserted(&self) -> usize {
        self.providers.iter().map(|p| p.inserted).sum()
    }

    pub fn updated(&self) -> usize {
        self.providers.iter().map(|p| p.updated).sum()
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderReport> {
        self.providers.iter().find(|p| p.provider == name)
    }
}

/// Orchestrator knobs taken from the service configuration.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub mode: UpdateMode,
    pub location_types: Vec<LocationType>,
    pub page_size: usize,
    pub parallel: bool,
    pub normalizer: Normalizer
}

impl SyncSettings {
    pub fn from_config(config: &LocationSyncConfig) -> Self {
        Self {
            mode: config.update_mode,
            location_types: config.location_types.clone(),
            page_size: config.page_size,
            parallel: config.parallel_providers,
            normalizer: Normalizer::new(config.prediction_source)
        }
    }
}

/// Reconciles pages against the store and persists them. The only writer.
struct PageWriter {
    repository: Arc<dyn LocationRepository>
}

impl PageWriter {
    async fn write(
        &self,
        provider: &Provider,
        records: Vec<CanonicalLocation>
    ) -> LocationSyncResult<ChangeSet> {
        if records.is_empty() {
            return Ok(ChangeSet::default());
        }

        let ids: Vec<LocationId> = records.iter().map(|r| r.id).collect();
        let existing = self.repository.find_by_ids(&ids).await?;
        let changes = Reconciler::new(provider.clone()).reconcile(records, existing)?;
        self.repository.apply(&changes).await?;

        metrics::counter!("location_sync.records.inserted")
            .increment(changes.to_insert.len() as u64);
        metrics::counter!("location_sync.records.updated")
            .increment(changes.to_update.len() as u64);

        Ok(changes)
    }
}

enum FetchEvent {
    Page {
        index: usize,
        location_type: LocationType,
        skip: usize,
        fetched: usize,
        records: Vec<CanonicalLocation>
    },
    Done {
        index: usize
    },
    Failed {
        index: usize,
        error: LocationSyncError
    }
}

pub struct SyncOrchestrator {
    connectors: Vec<Arc<dyn ConnectorClient>>,
    publisher_client: Arc<dyn PublisherClient>,
    writer: PageWriter,
    settings: SyncSettings
}

impl SyncOrchestrator {
    pub fn new(
        connectors: Vec<Arc<dyn ConnectorClient>>,
        repository: Arc<dyn LocationRepository>,
        publisher_client: Arc<dyn PublisherClient>,
        settings: SyncSettings
    ) -> Self {
        Self {
            connectors,
            publisher_client,
            writer: PageWriter { repository },
            settings
        }
    }

    pub async fn sync(&self) -> LocationSyncResult<SyncReport> {
        let mut report = SyncReport::new(self.settings.mode);
        report.providers = self
            .connectors
            .iter()
            .map(|c| ProviderReport::new(c.provider()))
            .collect();

        report.watermark = match self.settings.mode {
            UpdateMode::Full => {
                self.writer.repository.truncate_all().await?;
                info!("Full update: location store truncated");
                DateTime::<Utc>::UNIX_EPOCH
            }
            UpdateMode::Differential => {
                let watermark = self.publisher_client.last_modified().await?;
                info!(watermark = %watermark, "Differential update watermark fetched");
                watermark
            }
        };

        if self.settings.parallel && self.connectors.len() > 1 {
            self.sync_parallel(&mut report).await?;
        } else {
            for (index, connector) in self.connectors.iter().enumerate() {
                let provider_report = &mut report.providers[index];
                if let Err(e) = self
                    .sync_provider(connector.as_ref(), report.watermark, provider_report)
                    .await
                {
                    provider_report.state = ProviderState::Failed;
                    error!(provider = %connector.provider(), error = %e, "Provider sync failed");
                    return Err(e);
                }
            }
        }

        Ok(report)
    }

    async fn sync_provider(
        &self,
        connector: &dyn ConnectorClient,
        watermark: DateTime<Utc>,
        report: &mut ProviderReport
    ) -> LocationSyncResult<()> {
        let provider = connector.provider();
        let take = self.settings.page_size;
        report.state = ProviderState::Paging;
        info!(provider = %provider, "Syncing provider");

        for &location_type in &self.settings.location_types {
            let mut skip = 0;
            loop {
                let request = PageRequest {
                    watermark,
                    location_type,
                    skip,
                    take
                };
                let raws = connector.fetch_page(&request).await?;
                let fetched = raws.len();
                let records = self
                    .settings
                    .normalizer
                    .normalize_page(raws, provider, &request.path())?;
                let changes = self.writer.write(provider, records).await?;
                report.record_page(fetched, &changes);

                debug!(
                    provider = %provider,
                    location_type = %location_type,
                    skip,
                    take,
                    count = fetched,
                    inserted = changes.to_insert.len(),
                    updated = changes.to_update.len(),
                    "Page persisted"
                );

                if fetched < take {
                    break;
                }
                skip += take;
            }
        }

        report.state = ProviderState::Done;
        info!(
            provider = %provider,
            pages = report.pages,
            fetched = report.fetched,
            inserted = report.inserted,
            updated = report.updated,
            "Provider sync completed"
        );
        Ok(())
    }

    /// One fetch task per provider feeding this task, which alone reconciles
    /// and persists. Pages of one provider arrive in fetch order.
    async fn sync_parallel(&self, report: &mut SyncReport) -> LocationSyncResult<()> {
        let (tx, mut rx) = mpsc::channel::<FetchEvent>(self.connectors.len() * 2);
        let mut handles = Vec::with_capacity(self.connectors.len());

        for (index, connector) in self.connectors.iter().enumerate() {
            report.providers[index].state = ProviderState::Paging;
            handles.push(tokio::spawn(fetch_provider(
                index,
                connector.clone(),
                self.settings.clone(),
                report.watermark,
                tx.clone()
            )));
        }
        drop(tx);

        let mut outcome = Ok(());
        while let Some(event) = rx.recv().await {
            match event {
                FetchEvent::Page {
                    index,
                    location_type,
                    skip,
                    fetched,
                    records
                } => {
                    let provider = self.connectors[index].provider();
                    match self.writer.write(provider, records).await {
                        Ok(changes) => {
                            report.providers[index].record_page(fetched, &changes);
                            debug!(
                                provider = %provider,
                                location_type = %location_type,
                                skip,
                                count = fetched,
                                "Page persisted"
                            );
                        }
                        Err(e) => {
                            report.providers[index].state = ProviderState::Failed;
                            outcome = Err(e);
                            break;
                        }
                    }
                }
                FetchEvent::Done { index } => {
                    report.providers[index].state = ProviderState::Done;
                    info!(provider = %self.connectors[index].provider(), "Provider sync completed");
                }
                FetchEvent::Failed { index, error } => {
                    report.providers[index].state = ProviderState::Failed;
                    outcome = Err(error);
                    break;
                }
            }
        }

        if let Err(e) = &outcome {
            error!(error = %e, "Parallel sync aborted");
            for handle in &handles {
                handle.abort();
            }
        }
        drop(rx);

        for handle in handles {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    return Err(LocationSyncError::Internal(format!(
                        "provider fetch task failed: {e}"
                    )));
                }
            }
        }

        outcome
    }
}

async fn fetch_provider(
    index: usize,
    connector: Arc<dyn ConnectorClient>,
    settings: SyncSettings,
    watermark: DateTime<Utc>,
    tx: mpsc::Sender<FetchEvent>
) {
    let provider = connector.provider().clone();
    let take = settings.page_size;

    for &location_type in &settings.location_types {
        let mut skip = 0;
        loop {
            let request = PageRequest {
                watermark,
                location_type,
                skip,
                take
            };
            let page = match connector.fetch_page(&request).await {
                Ok(raws) => {
                    let fetched = raws.len();
                    settings
                        .normalizer
                        .normalize_page(raws, &provider, &request.path())
                        .map(|records| (fetched, records))
                }
                Err(e) => Err(e)
            };

            let (fetched, records) = match page {
                Ok(page) => page,
                Err(error) => {
                    warn!(provider = %provider, error = %error, "Provider fetch failed");
                    let _ = tx.send(FetchEvent::Failed { index, error }).await;
                    return;
                }
            };

            let event = FetchEvent::Page {
                index,
                location_type,
                skip,
                fetched,
                records
            };
            if tx.send(event).await.is_err() {
                return;
            }

            if fetched < take {
                break;
            }
            skip += take;
        }
    }

    let _ = tx.send(FetchEvent::Done { index }).await;
}

/// One complete pass: sync every provider, then publish the whole store.
pub struct LocationSyncService {
    orchestrator: SyncOrchestrator,
    publisher: Publisher
}

impl LocationSyncService {
    pub fn new(orchestrator: SyncOrchestrator, publisher: Publisher) -> Self {
        Self {
            orchestrator,
            publisher
        }
    }

    pub async fn from_config(config: &LocationSyncConfig) -> LocationSyncResult<Self> {
        let http_client = Client::builder()
            .timeout(config.http_timeout())
            .build()
            .map_err(LocationSyncError::Http)?;

        let exchange = Arc::new(ClientCredentialsExchange::new(
            http_client.clone(),
            config.token.clone()
        ));
        let tokens = Arc::new(TokenCache::from_config(exchange, &config.token));

        let repository: Arc<dyn LocationRepository> = if config.database_url.is_empty() {
            warn!("No database configured, using in-memory location store");
            Arc::new(InMemoryLocationRepository::new())
        } else {
            let repository = PgLocationRepository::connect(&config.database_url).await?;
            repository.initialize_schema().await?;
            Arc::new(repository)
        };

        let connectors: Vec<Arc<dyn ConnectorClient>> = config
            .enabled_providers()
            .map(|p| {
                Arc::new(HttpConnectorClient::with_client(
                    http_client.clone(),
                    p.provider(),
                    p.base_url.clone(),
                    tokens.clone()
                )) as Arc<dyn ConnectorClient>
            })
            .collect();

        let publisher_client: Arc<dyn PublisherClient> = Arc::new(HttpPublisherClient::new(
            config.publisher_base_url.clone(),
            tokens,
            config.http_timeout()
        )?);

        let orchestrator = SyncOrchestrator::new(
            connectors,
            repository.clone(),
            publisher_client.clone(),
            SyncSettings::from_config(config)
        );
        let publisher = Publisher::new(
            publisher_client,
            repository,
            config.batch_size,
            config.upload_delay(),
            config.upload_policy,
            config.retry.clone()
        );

        Ok(Self::new(orchestrator, publisher))
    }

    pub async fn run_pass(&self) -> LocationSyncResult<SyncReport> {
        info!(mode = ?self.orchestrator.settings.mode, "Starting location sync pass");

        let mut report = self.orchestrator.sync().await?;
        let published = self.publisher.publish().await?;
        report.uploaded = published.uploaded;
        report.batches = published.batches;
        report.splits = published.splits;
        report.complete();

        info!(
            inserted = report.inserted(),
            updated = report.updated(),
            uploaded = report.uploaded,
            batches = report.batches,
            splits = report.splits,
            "Location sync pass completed"
        );

        Ok(report)
    }
}
