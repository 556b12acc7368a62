use crate::error::{LocationSyncError, LocationSyncResult};
use crate::model::{
    CanonicalLocation, GeoPoint, LanguageMap, LocationId, LocationType, PredictionSource,
    ProviderSet
};
use crate::reconciler::ChangeSet;
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Store of canonical locations keyed by identity.
#[async_trait]
pub trait LocationRepository: Send + Sync {
    async fn truncate_all(&self) -> LocationSyncResult<()>;

    async fn find_by_ids(
        &self,
        ids: &[LocationId]
    ) -> LocationSyncResult<HashMap<LocationId, CanonicalLocation>>;

    async fn insert_many(&self, records: &[CanonicalLocation]) -> LocationSyncResult<()>;

    async fn update_many(&self, records: &[CanonicalLocation]) -> LocationSyncResult<()>;

    /// Up to `limit` records with identity strictly greater than `after`, in
    /// ascending identity order. Walking the keys this way yields the whole
    /// store lazily.
    async fn scan_ordered(
        &self,
        after: Option<LocationId>,
        limit: usize
    ) -> LocationSyncResult<Vec<CanonicalLocation>>;

    /// Persists one reconciled page.
    async fn apply(&self, changes: &ChangeSet) -> LocationSyncResult<()> {
        if !changes.to_insert.is_empty() {
            self.insert_many(&changes.to_insert).await?;
        }
        if !changes.to_update.is_empty() {
            self.update_many(&changes.to_update).await?;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryLocationRepository {
    records: RwLock<BTreeMap<LocationId, CanonicalLocation>>,
    truncations: AtomicUsize
}

impl InMemoryLocationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn get(&self, id: LocationId) -> Option<CanonicalLocation> {
        self.records.read().await.get(&id).cloned()
    }

    pub async fn all(&self) -> Vec<CanonicalLocation> {
        self.records.read().await.values().cloned().collect()
    }

    /// Number of `truncate_all` calls seen so far.
    pub fn truncations(&self) -> usize {
        self.truncations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LocationRepository for InMemoryLocationRepository {
    async fn truncate_all(&self) -> LocationSyncResult<()> {
        self.records.write().await.clear();
        self.truncations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn find_by_ids(
        &self,
        ids: &[LocationId]
    ) -> LocationSyncResult<HashMap<LocationId, CanonicalLocation>> {
        let records = self.records.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| records.get(id).map(|r| (*id, r.clone())))
            .collect())
    }

    async fn insert_many(&self, records: &[CanonicalLocation]) -> LocationSyncResult<()> {
        let mut stored = self.records.write().await;
        if let Some(duplicate) = records.iter().find(|r| stored.contains_key(&r.id)) {
            return Err(LocationSyncError::Repository(format!(
                "location {} already exists",
                duplicate.id
            )));
        }
        for record in records {
            stored.insert(record.id, record.clone());
        }
        Ok(())
    }

    async fn update_many(&self, records: &[CanonicalLocation]) -> LocationSyncResult<()> {
        let mut stored = self.records.write().await;
        if let Some(missing) = records.iter().find(|r| !stored.contains_key(&r.id)) {
            return Err(LocationSyncError::Repository(format!(
                "location {} does not exist",
                missing.id
            )));
        }
        for record in records {
            stored.insert(record.id, record.clone());
        }
        Ok(())
    }

    async fn scan_ordered(
        &self,
        after: Option<LocationId>,
        limit: usize
    ) -> LocationSyncResult<Vec<CanonicalLocation>> {
        let records = self.records.read().await;
        let page = match after {
            Some(after) => records
                .range((std::ops::Bound::Excluded(after), std::ops::Bound::Unbounded))
                .take(limit)
                .map(|(_, r)| r.clone())
                .collect(),
            None => records.values().take(limit).cloned().collect()
        };
        Ok(page)
    }
}

pub struct PgLocationRepository {
    pool: PgPool
}

impl PgLocationRepository {
    pub async fn connect(database_url: &str) -> LocationSyncResult<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn initialize_schema(&self) -> LocationSyncResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS locations (
                id INTEGER PRIMARY KEY,
                longitude DOUBLE PRECISION NOT NULL,
                latitude DOUBLE PRECISION NOT NULL,
                name JSONB NOT NULL DEFAULT '{}',
                locality JSONB NOT NULL DEFAULT '{}',
                country JSONB NOT NULL DEFAULT '{}',
                type TEXT NOT NULL,
                distance INTEGER NOT NULL,
                source TEXT NOT NULL,
                providers JSONB NOT NULL DEFAULT '[]',
                modified_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )"
        )
        .execute(&self.pool)
        .await?;

        info!("Location schema ready");
        Ok(())
    }

    fn decode_row(row: &PgRow) -> LocationSyncResult<CanonicalLocation> {
        let location_type: String = row.try_get("type")?;
        let source: String = row.try_get("source")?;

        Ok(CanonicalLocation {
            id: LocationId(row.try_get("id")?),
            coordinates: GeoPoint {
                longitude: row.try_get("longitude")?,
                latitude: row.try_get("latitude")?
            },
            name: decode_json::<LanguageMap>(row, "name")?,
            locality: decode_json::<LanguageMap>(row, "locality")?,
            country: decode_json::<LanguageMap>(row, "country")?,
            location_type: LocationType::from_name(&location_type),
            search_radius_meters: row.try_get("distance")?,
            source: source.parse::<PredictionSource>()?,
            providers: decode_json::<ProviderSet>(row, "providers")?
        })
    }
}

fn decode_json<T: serde::de::DeserializeOwned>(row: &PgRow, column: &str) -> LocationSyncResult<T> {
    let value: serde_json::Value = row.try_get(column)?;
    Ok(serde_json::from_value(value)?)
}

fn source_name(source: PredictionSource) -> LocationSyncResult<String> {
    match serde_json::to_value(source)? {
        serde_json::Value::String(name) => Ok(name),
        other => Err(LocationSyncError::Internal(format!(
            "unexpected prediction source encoding: {other}"
        )))
    }
}

const FIND_BY_IDS: &str = "SELECT id, longitude, latitude, name, locality, country, type, \
     distance, source, providers FROM locations WHERE id = ANY($1)";

const SCAN_FIRST: &str = "SELECT id, longitude, latitude, name, locality, country, type, \
     distance, source, providers FROM locations ORDER BY id LIMIT $1";

const SCAN_AFTER: &str = "SELECT id, longitude, latitude, name, locality, country, type, \
     distance, source, providers FROM locations WHERE id > $1 ORDER BY id LIMIT $2";

const INSERT_LOCATION: &str = "INSERT INTO locations (id, longitude, latitude, name, locality, \
     country, type, distance, source, providers, modified_at) \
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW())";

const UPDATE_LOCATION: &str = "UPDATE locations SET name = $2, locality = $3, country = $4, \
     distance = $5, providers = $6, modified_at = NOW() WHERE id = $1";

#[async_trait]
impl LocationRepository for PgLocationRepository {
    async fn truncate_all(&self) -> LocationSyncResult<()> {
        sqlx::query("TRUNCATE TABLE locations")
            .execute(&self.pool)
            .await?;
        info!("Truncated locations table");
        Ok(())
    }

    async fn find_by_ids(
        &self,
        ids: &[LocationId]
    ) -> LocationSyncResult<HashMap<LocationId, CanonicalLocation>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let keys: Vec<i32> = ids.iter().map(|id| id.0).collect();
        let rows = sqlx::query(FIND_BY_IDS)
            .bind(keys)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| Self::decode_row(row).map(|r| (r.id, r)))
            .collect()
    }

    async fn insert_many(&self, records: &[CanonicalLocation]) -> LocationSyncResult<()> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(INSERT_LOCATION)
                .bind(record.id.0)
                .bind(record.coordinates.longitude)
                .bind(record.coordinates.latitude)
                .bind(serde_json::to_value(&record.name)?)
                .bind(serde_json::to_value(&record.locality)?)
                .bind(serde_json::to_value(&record.country)?)
                .bind(record.location_type.wire_name())
                .bind(record.search_radius_meters)
                .bind(source_name(record.source)?)
                .bind(serde_json::to_value(&record.providers)?)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        debug!(count = records.len(), "Inserted locations");
        Ok(())
    }

    async fn update_many(&self, records: &[CanonicalLocation]) -> LocationSyncResult<()> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(UPDATE_LOCATION)
                .bind(record.id.0)
                .bind(serde_json::to_value(&record.name)?)
                .bind(serde_json::to_value(&record.locality)?)
                .bind(serde_json::to_value(&record.country)?)
                .bind(record.search_radius_meters)
                .bind(serde_json::to_value(&record.providers)?)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        debug!(count = records.len(), "Updated locations");
        Ok(())
    }

    async fn scan_ordered(
        &self,
        after: Option<LocationId>,
        limit: usize
    ) -> LocationSyncResult<Vec<CanonicalLocation>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = match after {
            Some(after) => {
                sqlx::query(SCAN_AFTER)
                    .bind(after.0)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query(SCAN_FIRST)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.iter().map(Self::decode_row).collect()
    }

    /// Inserts and updates of one page commit together.
    async fn apply(&self, changes: &ChangeSet) -> LocationSyncResult<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for record in &changes.to_insert {
            sqlx::query(INSERT_LOCATION)
                .bind(record.id.0)
                .bind(record.coordinates.longitude)
                .bind(record.coordinates.latitude)
                .bind(serde_json::to_value(&record.name)?)
                .bind(serde_json::to_value(&record.locality)?)
                .bind(serde_json::to_value(&record.country)?)
                .bind(record.location_type.wire_name())
                .bind(record.search_radius_meters)
                .bind(source_name(record.source)?)
                .bind(serde_json::to_value(&record.providers)?)
                .execute(&mut *tx)
                .await?;
        }
        for record in &changes.to_update {
            sqlx::query(UPDATE_LOCATION)
                .bind(record.id.0)
                .bind(serde_json::to_value(&record.name)?)
                .bind(serde_json::to_value(&record.locality)?)
                .bind(serde_json::to_value(&record.country)?)
                .bind(record.search_radius_meters)
                .bind(serde_json::to_value(&record.providers)?)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        debug!(
            inserted = changes.to_insert.len(),
            updated = changes.to_update.len(),
            "Applied location changes"
        );
        Ok(())
    }
}
