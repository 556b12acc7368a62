//! Turns raw feed records into canonical locations: identity, search radius
//! and provider tagging. Pure, no I/O.

use crate::error::{LocationSyncError, LocationSyncResult};
use crate::model::{
    CanonicalLocation, GeoPoint, LanguageMap, LocationId, LocationType, PredictionSource,
    Provider, RawLocation
};

pub const DEFAULT_LANGUAGE: &str = "en";

const DESTINATION_RADIUS: i32 = 3_000;
const ACCOMMODATION_RADIUS: i32 = 100;
const LANDMARK_RADIUS: i32 = 1_000;
const COUNTRY_RADIUS: i32 = 200_000;
const CITY_RADIUS: i32 = 20_000;
const CITY_ZONE_RADIUS: i32 = 2_000;

const HASH_SEED: i32 = (5381 << 16) + 5381;
const HASH_MULTIPLIER: i32 = 1_566_083_941;

/// Default-language projection of a language map, empty when absent.
pub fn extract_default(map: &LanguageMap) -> &str {
    map.get(DEFAULT_LANGUAGE).unwrap_or_default()
}

/// Reproducible 32-bit string hash.
///
/// Two DJB2 accumulators consume the even and odd UTF-16 code units
/// respectively and are combined as `acc1 + acc2 * 1566083941`, all with
/// wrapping arithmetic. Identities persisted by earlier runs depend on this
/// exact output.
pub fn deterministic_hash(value: &str) -> i32 {
    let units: Vec<u16> = value.encode_utf16().collect();
    let mut hash1 = HASH_SEED;
    let mut hash2 = HASH_SEED;

    for pair in units.chunks(2) {
        hash1 = (hash1 << 5).wrapping_add(hash1) ^ i32::from(pair[0]);
        if let Some(&odd) = pair.get(1) {
            hash2 = (hash2 << 5).wrapping_add(hash2) ^ i32::from(odd);
        }
    }

    hash1.wrapping_add(hash2.wrapping_mul(HASH_MULTIPLIER))
}

pub fn compute_identity(
    default_name: &str,
    default_locality: &str,
    default_country: &str,
    location_type: LocationType,
    source: PredictionSource,
    coordinates: &GeoPoint
) -> LocationId {
    let key = format!(
        "{}{}{}{}{}{}",
        default_name.to_uppercase(),
        default_locality.to_uppercase(),
        default_country.to_uppercase(),
        source.hash_name(),
        location_type.wire_name(),
        coordinates.to_wkt()
    );
    LocationId(deterministic_hash(&key))
}

pub fn assign_search_radius(
    location_type: LocationType,
    has_locality: bool,
    has_name: bool
) -> LocationSyncResult<i32> {
    match location_type {
        LocationType::Destination => Ok(DESTINATION_RADIUS),
        LocationType::Accommodation => Ok(ACCOMMODATION_RADIUS),
        LocationType::Landmark => Ok(LANDMARK_RADIUS),
        LocationType::AdminArea => Ok(match (has_locality, has_name) {
            (false, _) => COUNTRY_RADIUS,
            (true, false) => CITY_RADIUS,
            (true, true) => CITY_ZONE_RADIUS
        }),
        LocationType::Unknown => Err(LocationSyncError::invalid_location_type(location_type))
    }
}

/// Radius for a record, derived from its type and its current language maps.
pub fn search_radius_for(location: &CanonicalLocation) -> LocationSyncResult<i32> {
    assign_search_radius(
        location.location_type,
        location.locality.has_content(),
        location.name.has_content()
    )
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Normalizer {
    source: PredictionSource
}

impl Normalizer {
    pub fn new(source: PredictionSource) -> Self {
        Self { source }
    }

    pub fn source(&self) -> PredictionSource {
        self.source
    }

    pub fn normalize(
        &self,
        raw: RawLocation,
        provider: &Provider
    ) -> LocationSyncResult<CanonicalLocation> {
        raw.coordinates.validate()?;
        let search_radius_meters = assign_search_radius(
            raw.location_type,
            raw.locality.has_content(),
            raw.name.has_content()
        )
        .map_err(|e| e.with_record(extract_default(&raw.name), provider.as_str()))?;

        let id = compute_identity(
            extract_default(&raw.name),
            extract_default(&raw.locality),
            extract_default(&raw.country),
            raw.location_type,
            self.source,
            &raw.coordinates
        );

        Ok(CanonicalLocation {
            id,
            coordinates: raw.coordinates,
            name: raw.name,
            locality: raw.locality,
            country: raw.country,
            location_type: raw.location_type,
            search_radius_meters,
            source: self.source,
            providers: std::iter::once(provider.clone()).collect()
        })
    }

    /// Normalizes a whole page fetched from `path`. The first invalid record
    /// fails the page.
    pub fn normalize_page(
        &self,
        raws: Vec<RawLocation>,
        provider: &Provider,
        path: &str
    ) -> LocationSyncResult<Vec<CanonicalLocation>> {
        raws.into_iter()
            .map(|raw| self.normalize(raw, provider).map_err(|e| e.at_path(path)))
            .collect()
    }
}
