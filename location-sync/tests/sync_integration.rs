use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use location_sync::config::{RetryConfig, UpdateMode, UploadPolicy};
use location_sync::connector::{ConnectorClient, PageRequest};
use location_sync::error::{LocationSyncError, LocationSyncResult};
use location_sync::model::{
    CanonicalLocation, GeoPoint, LanguageMap, LocationType, Provider, RawLocation
};
use location_sync::normalizer::Normalizer;
use location_sync::publisher::{Publisher, PublisherClient};
use location_sync::repository::{InMemoryLocationRepository, LocationRepository};
use location_sync::sync::{LocationSyncService, ProviderState, SyncOrchestrator, SyncSettings};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn place(name: &[(&str, &str)], locality: &[(&str, &str)], location_type: LocationType) -> RawLocation {
    RawLocation {
        name: name.iter().copied().collect(),
        locality: locality.iter().copied().collect(),
        country: [("en", "France")].into_iter().collect(),
        coordinates: GeoPoint::new(48.8566, 2.3522),
        location_type
    }
}

fn hotel(n: usize) -> RawLocation {
    let mut raw = place(&[], &[("en", "Paris")], LocationType::Accommodation);
    raw.name = [("en", format!("Hotel {n}"))].into_iter().collect();
    raw.coordinates = GeoPoint::new(48.0 + n as f64 / 100.0, 2.0);
    raw
}

/// Serves canned pages keyed by location type and skip; unknown pages are empty.
struct FakeConnector {
    provider: Provider,
    pages: HashMap<(LocationType, usize), Vec<RawLocation>>,
    fail_at_skip: Option<usize>,
    repository: Arc<InMemoryLocationRepository>,
    requests: Mutex<Vec<PageRequest>>,
    truncations_seen: Mutex<Vec<usize>>
}

impl FakeConnector {
    fn new(name: &str, repository: Arc<InMemoryLocationRepository>) -> Self {
        Self {
            provider: Provider::new(name),
            pages: HashMap::new(),
            fail_at_skip: None,
            repository,
            requests: Mutex::new(Vec::new()),
            truncations_seen: Mutex::new(Vec::new())
        }
    }

    fn page(mut self, location_type: LocationType, skip: usize, records: Vec<RawLocation>) -> Self {
        self.pages.insert((location_type, skip), records);
        self
    }

    fn failing_at(mut self, skip: usize) -> Self {
        self.fail_at_skip = Some(skip);
        self
    }

    fn requests(&self) -> Vec<PageRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConnectorClient for FakeConnector {
    fn provider(&self) -> &Provider {
        &self.provider
    }

    async fn fetch_page(&self, request: &PageRequest) -> LocationSyncResult<Vec<RawLocation>> {
        self.requests.lock().unwrap().push(*request);
        self.truncations_seen
            .lock()
            .unwrap()
            .push(self.repository.truncations());

        if self.fail_at_skip == Some(request.skip) {
            return Err(LocationSyncError::FetchFailure {
                provider: self.provider.to_string(),
                path: request.path(),
                status: 503,
                reason: "Service Unavailable".to_string()
            });
        }
        Ok(self
            .pages
            .get(&(request.location_type, request.skip))
            .cloned()
            .unwrap_or_default())
    }
}

struct FakePublisher {
    watermark: DateTime<Utc>,
    watermark_calls: Mutex<usize>,
    uploads: Mutex<Vec<Vec<CanonicalLocation>>>
}

impl FakePublisher {
    fn new(watermark: DateTime<Utc>) -> Self {
        Self {
            watermark,
            watermark_calls: Mutex::new(0),
            uploads: Mutex::new(Vec::new())
        }
    }

    fn uploaded(&self) -> Vec<CanonicalLocation> {
        self.uploads.lock().unwrap().iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl PublisherClient for FakePublisher {
    async fn last_modified(&self) -> LocationSyncResult<DateTime<Utc>> {
        *self.watermark_calls.lock().unwrap() += 1;
        Ok(self.watermark)
    }

    async fn upload(&self, batch: &[CanonicalLocation]) -> LocationSyncResult<()> {
        self.uploads.lock().unwrap().push(batch.to_vec());
        Ok(())
    }
}

fn settings(mode: UpdateMode, page_size: usize, parallel: bool) -> SyncSettings {
    SyncSettings {
        mode,
        location_types: vec![LocationType::AdminArea, LocationType::Accommodation],
        page_size,
        parallel,
        normalizer: Normalizer::default()
    }
}

fn orchestrator(
    connectors: Vec<Arc<FakeConnector>>,
    repository: Arc<InMemoryLocationRepository>,
    publisher: Arc<FakePublisher>,
    settings: SyncSettings
) -> SyncOrchestrator {
    SyncOrchestrator::new(
        connectors
            .into_iter()
            .map(|c| c as Arc<dyn ConnectorClient>)
            .collect(),
        repository,
        publisher,
        settings
    )
}

fn watermark() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap()
}

#[tokio::test]
async fn test_full_mode_truncates_once_before_any_page() {
    let repository = Arc::new(InMemoryLocationRepository::new());
    let stale = Normalizer::default()
        .normalize(hotel(99), &Provider::new("legacy"))
        .unwrap();
    repository.insert_many(&[stale.clone()]).await.unwrap();

    let first = Arc::new(
        FakeConnector::new("netstorming", repository.clone())
            .page(LocationType::Accommodation, 0, vec![hotel(1)])
    );
    let second = Arc::new(
        FakeConnector::new("illusions", repository.clone())
            .page(LocationType::Accommodation, 0, vec![hotel(2)])
    );
    let publisher = Arc::new(FakePublisher::new(watermark()));

    let report = orchestrator(
        vec![first.clone(), second.clone()],
        repository.clone(),
        publisher.clone(),
        settings(UpdateMode::Full, 10, false)
    )
    .sync()
    .await
    .unwrap();

    assert_eq!(repository.truncations(), 1);
    assert!(repository.get(stale.id).await.is_none());
    assert_eq!(repository.len().await, 2);
    assert_eq!(report.watermark, DateTime::<Utc>::UNIX_EPOCH);
    assert_eq!(*publisher.watermark_calls.lock().unwrap(), 0);

    for connector in [&first, &second] {
        assert!(connector.truncations_seen.lock().unwrap().iter().all(|n| *n == 1));
        assert!(connector
            .requests()
            .iter()
            .all(|r| r.watermark == DateTime::<Utc>::UNIX_EPOCH));
    }
}

#[tokio::test]
async fn test_differential_mode_never_truncates_and_uses_downstream_watermark() {
    let repository = Arc::new(InMemoryLocationRepository::new());
    let existing = Normalizer::default()
        .normalize(hotel(1), &Provider::new("netstorming"))
        .unwrap();
    repository.insert_many(&[existing.clone()]).await.unwrap();

    let connector = Arc::new(
        FakeConnector::new("netstorming", repository.clone())
            .page(LocationType::Accommodation, 0, vec![hotel(2)])
    );
    let publisher = Arc::new(FakePublisher::new(watermark()));

    let report = orchestrator(
        vec![connector.clone()],
        repository.clone(),
        publisher.clone(),
        settings(UpdateMode::Differential, 10, false)
    )
    .sync()
    .await
    .unwrap();

    assert_eq!(repository.truncations(), 0);
    assert!(repository.get(existing.id).await.is_some());
    assert_eq!(repository.len().await, 2);
    assert_eq!(report.watermark, watermark());
    assert!(connector.requests().iter().all(|r| r.watermark == watermark()));
}

#[tokio::test]
async fn test_pages_advance_until_a_short_page() {
    let repository = Arc::new(InMemoryLocationRepository::new());
    let connector = Arc::new(
        FakeConnector::new("netstorming", repository.clone())
            .page(LocationType::Accommodation, 0, vec![hotel(1), hotel(2)])
            .page(LocationType::Accommodation, 2, vec![hotel(3), hotel(4)])
            .page(LocationType::Accommodation, 4, vec![hotel(5)])
    );
    let publisher = Arc::new(FakePublisher::new(watermark()));

    let report = orchestrator(
        vec![connector.clone()],
        repository.clone(),
        publisher,
        settings(UpdateMode::Differential, 2, false)
    )
    .sync()
    .await
    .unwrap();

    let accommodation_skips: Vec<usize> = connector
        .requests()
        .iter()
        .filter(|r| r.location_type == LocationType::Accommodation)
        .map(|r| r.skip)
        .collect();
    assert_eq!(accommodation_skips, vec![0, 2, 4]);
    assert!(connector.requests().iter().all(|r| r.take == 2));

    let provider = report.provider("netstorming").unwrap();
    assert_eq!(provider.state, ProviderState::Done);
    assert_eq!(provider.pages, 4);
    assert_eq!(provider.fetched, 5);
    assert_eq!(provider.inserted, 5);
    assert_eq!(repository.len().await, 5);
}

#[tokio::test]
async fn test_fetch_failure_aborts_the_run_and_keeps_committed_pages() {
    let repository = Arc::new(InMemoryLocationRepository::new());
    let healthy = Arc::new(
        FakeConnector::new("netstorming", repository.clone())
            .page(LocationType::Accommodation, 0, vec![hotel(1)])
    );
    let broken = Arc::new(
        FakeConnector::new("illusions", repository.clone())
            .page(LocationType::AdminArea, 0, vec![place(&[], &[("en", "Lyon")], LocationType::AdminArea)])
            .failing_at(1)
    );
    let never_reached = Arc::new(
        FakeConnector::new("juniper", repository.clone())
            .page(LocationType::Accommodation, 0, vec![hotel(3)])
    );
    let publisher = Arc::new(FakePublisher::new(watermark()));

    let mut settings = settings(UpdateMode::Differential, 1, false);
    settings.location_types = vec![LocationType::AdminArea, LocationType::Accommodation];
    let result = orchestrator(
        vec![healthy, broken, never_reached.clone()],
        repository.clone(),
        publisher,
        settings
    )
    .sync()
    .await;

    match result {
        Err(LocationSyncError::FetchFailure { provider, path, status, .. }) => {
            assert_eq!(provider, "illusions");
            assert_eq!(status, 503);
            assert!(path.contains("skip=1"));
        }
        other => panic!("unexpected result: {other:?}")
    }
    assert!(never_reached.requests().is_empty());
    assert_eq!(repository.len().await, 2);
}

#[tokio::test]
async fn test_invalid_location_type_fails_the_page() {
    let repository = Arc::new(InMemoryLocationRepository::new());
    let connector = Arc::new(
        FakeConnector::new("netstorming", repository.clone()).page(
            LocationType::AdminArea,
            0,
            vec![place(&[("en", "Nowhere")], &[], LocationType::Unknown)]
        )
    );
    let publisher = Arc::new(FakePublisher::new(watermark()));

    let result = orchestrator(
        vec![connector],
        repository.clone(),
        publisher,
        settings(UpdateMode::Differential, 10, false)
    )
    .sync()
    .await;

    match result {
        Err(LocationSyncError::InvalidLocationType {
            location_type,
            record,
            provider,
            path
        }) => {
            assert_eq!(location_type, "Unknown");
            assert_eq!(record, "Nowhere");
            assert_eq!(provider, "netstorming");
            assert!(path.contains("locationType=4&skip=0"));
        }
        other => panic!("unexpected result: {other:?}")
    }
    assert_eq!(repository.len().await, 0);
}

fn shared_place_connectors(repository: &Arc<InMemoryLocationRepository>) -> Vec<Arc<FakeConnector>> {
    let english = place(&[("en", "Le Marais")], &[("en", "Paris")], LocationType::AdminArea);
    let mut french = english.clone();
    french.name.insert("fr", "Le Marais");
    french.locality.insert("fr", "Paris");
    let mut german = english.clone();
    german.name.insert("de", "Marais-Viertel");

    vec![
        Arc::new(
            FakeConnector::new("netstorming", repository.clone())
                .page(LocationType::AdminArea, 0, vec![english, hotel(1)])
        ),
        Arc::new(
            FakeConnector::new("illusions", repository.clone())
                .page(LocationType::AdminArea, 0, vec![french])
                .page(LocationType::Accommodation, 0, vec![hotel(2)])
        ),
        Arc::new(
            FakeConnector::new("juniper", repository.clone())
                .page(LocationType::AdminArea, 0, vec![german])
        ),
    ]
}

async fn merged_state(parallel: bool) -> Vec<CanonicalLocation> {
    let repository = Arc::new(InMemoryLocationRepository::new());
    let publisher = Arc::new(FakePublisher::new(watermark()));
    orchestrator(
        shared_place_connectors(&repository),
        repository.clone(),
        publisher,
        settings(UpdateMode::Full, 10, parallel)
    )
    .sync()
    .await
    .unwrap();
    repository.all().await
}

#[tokio::test]
async fn test_providers_merge_into_one_canonical_record() {
    let state = merged_state(false).await;
    assert_eq!(state.len(), 3);

    let marais = state
        .iter()
        .find(|r| r.location_type == LocationType::AdminArea)
        .unwrap();
    let expected_name: LanguageMap = [("en", "Le Marais"), ("fr", "Le Marais"), ("de", "Marais-Viertel")]
        .into_iter()
        .collect();
    assert_eq!(marais.name, expected_name);
    assert_eq!(marais.locality.get("fr"), Some("Paris"));
    assert_eq!(marais.search_radius_meters, 2_000);
    let providers: Vec<&str> = marais.providers.iter().map(Provider::as_str).collect();
    assert_eq!(providers, vec!["illusions", "juniper", "netstorming"]);
}

#[tokio::test]
async fn test_parallel_providers_reach_the_same_state() {
    let sequential = merged_state(false).await;
    let parallel = merged_state(true).await;
    assert_eq!(sequential, parallel);
}

#[tokio::test]
async fn test_parallel_fetch_failure_aborts_the_run() {
    let repository = Arc::new(InMemoryLocationRepository::new());
    let connectors = vec![
        Arc::new(
            FakeConnector::new("netstorming", repository.clone())
                .page(LocationType::Accommodation, 0, vec![hotel(1)])
        ),
        Arc::new(FakeConnector::new("illusions", repository.clone()).failing_at(0)),
    ];
    let publisher = Arc::new(FakePublisher::new(watermark()));

    let result = orchestrator(
        connectors,
        repository,
        publisher,
        settings(UpdateMode::Differential, 10, true)
    )
    .sync()
    .await;

    assert!(matches!(result, Err(LocationSyncError::FetchFailure { .. })));
}

#[tokio::test]
async fn test_service_pass_syncs_then_publishes_everything() {
    let repository = Arc::new(InMemoryLocationRepository::new());
    let publisher_client = Arc::new(FakePublisher::new(watermark()));
    let orchestrator = orchestrator(
        shared_place_connectors(&repository),
        repository.clone(),
        publisher_client.clone(),
        settings(UpdateMode::Full, 10, false)
    );
    let publisher = Publisher::new(
        publisher_client.clone(),
        repository.clone() as Arc<dyn LocationRepository>,
        2,
        Duration::from_millis(1),
        UploadPolicy::SplitOnFailure,
        RetryConfig {
            max_retries: 1,
            initial_backoff_ms: 1,
            max_backoff_ms: 1
        }
    );
    let service = LocationSyncService::new(orchestrator, publisher);

    let report = service.run_pass().await.unwrap();

    assert!(report.completed_at.is_some());
    assert_eq!(report.mode, UpdateMode::Full);
    assert_eq!(report.inserted(), 3);
    assert_eq!(report.uploaded, 3);
    assert_eq!(report.batches, 2);

    let uploaded = publisher_client.uploaded();
    let ids: Vec<i32> = uploaded.iter().map(|r| r.id.0).collect();
    let mut sorted = ids.clone();
    sorted.sort_unstable();
    assert_eq!(ids, sorted);
    assert_eq!(uploaded.len(), repository.len().await);

    let second = service.run_pass().await.unwrap();
    assert_eq!(second.inserted(), 3);
    assert_eq!(repository.truncations(), 2);
}
