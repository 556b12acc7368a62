//! Canonical and raw location shapes shared by every stage of a sync pass.

use crate::error::{LocationSyncError, LocationSyncResult};
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Deterministic primary key of a canonical location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocationId(pub i32);

impl fmt::Display for LocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    #[serde(alias = "long", alias = "lng")]
    pub longitude: f64,
    #[serde(alias = "lat")]
    pub latitude: f64
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            longitude,
            latitude
        }
    }

    pub fn validate(&self) -> LocationSyncResult<()> {
        let valid = (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude);
        if valid {
            Ok(())
        } else {
            Err(LocationSyncError::InvalidCoordinates {
                latitude: self.latitude,
                longitude: self.longitude
            })
        }
    }

    /// Well-known-text rendering used as the coordinate part of the identity.
    pub fn to_wkt(&self) -> String {
        format!("POINT ({} {})", self.longitude, self.latitude)
    }
}

/// Language code to display string.
///
/// Feeds deliver these either as JSON objects or as JSON documents embedded in
/// a string; both forms, `null` and the empty string decode to a map. An empty
/// map serializes as `{}`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LanguageMap(BTreeMap<String, String>);

impl LanguageMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, language: &str) -> Option<&str> {
        self.0.get(language).map(String::as_str)
    }

    pub fn insert(&mut self, language: impl Into<String>, value: impl Into<String>) {
        self.0.insert(language.into(), value.into());
    }

    pub fn contains_language(&self, language: &str) -> bool {
        self.0.contains_key(language)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when at least one language carries a non-blank value.
    pub fn has_content(&self) -> bool {
        self.0.values().any(|v| !v.trim().is_empty())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Adds every language of `other` missing from `self`. Existing values
    /// are never overwritten. Returns whether anything was added.
    pub fn union_missing(&mut self, other: &LanguageMap) -> bool {
        let mut added = false;
        for (language, value) in &other.0 {
            if !self.0.contains_key(language) {
                self.0.insert(language.clone(), value.clone());
                added = true;
            }
        }
        added
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for LanguageMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect()
        )
    }
}

impl Serialize for LanguageMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LanguageMapRepr {
    Map(BTreeMap<String, String>),
    Encoded(String),
    Missing(())
}

impl<'de> Deserialize<'de> for LanguageMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match LanguageMapRepr::deserialize(deserializer)? {
            LanguageMapRepr::Map(map) => Ok(Self(map)),
            LanguageMapRepr::Missing(()) => Ok(Self::default()),
            LanguageMapRepr::Encoded(text) if text.trim().is_empty() => Ok(Self::default()),
            LanguageMapRepr::Encoded(text) => serde_json::from_str::<BTreeMap<String, String>>(&text)
                .map(Self)
                .map_err(|e| de::Error::custom(format!("invalid language map '{text}': {e}")))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LocationType {
    Unknown,
    Destination,
    Accommodation,
    Landmark,
    AdminArea
}

impl LocationType {
    /// Numeric code used by connector feeds.
    pub fn code(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Destination => 1,
            Self::Accommodation => 2,
            Self::Landmark => 3,
            Self::AdminArea => 4
        }
    }

    pub fn from_code(code: u64) -> Self {
        match code {
            1 => Self::Destination,
            2 => Self::Accommodation,
            3 => Self::Landmark,
            4 => Self::AdminArea,
            _ => Self::Unknown
        }
    }

    /// Name on the wire. Admin areas travel as `Location`.
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::Destination => "Destination",
            Self::Accommodation => "Accommodation",
            Self::Landmark => "Landmark",
            Self::AdminArea => "Location"
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "destination" => Self::Destination,
            "accommodation" => Self::Accommodation,
            "landmark" => Self::Landmark,
            "location" | "adminarea" | "admin_area" => Self::AdminArea,
            _ => Self::Unknown
        }
    }
}

impl fmt::Display for LocationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

impl Serialize for LocationType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.wire_name())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LocationTypeRepr {
    Code(u64),
    Name(String)
}

impl<'de> Deserialize<'de> for LocationType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match LocationTypeRepr::deserialize(deserializer)? {
            LocationTypeRepr::Code(code) => Self::from_code(code),
            LocationTypeRepr::Name(name) => Self::from_name(&name)
        })
    }
}

/// Origin of a canonical record as reported downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PredictionSource {
    #[serde(rename = "geocoder")]
    Google,
    #[serde(rename = "netstorming-connector")]
    NetstormingConnector,
    #[default]
    #[serde(rename = "interior")]
    Interior
}

impl PredictionSource {
    /// Member name folded into the identity hash.
    pub fn hash_name(self) -> &'static str {
        match self {
            Self::Google => "Google",
            Self::NetstormingConnector => "NetstormingConnector",
            Self::Interior => "Interior"
        }
    }
}

impl std::str::FromStr for PredictionSource {
    type Err = LocationSyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "geocoder" | "google" => Ok(Self::Google),
            "netstorming-connector" | "netstormingconnector" => Ok(Self::NetstormingConnector),
            "interior" => Ok(Self::Interior),
            other => Err(LocationSyncError::Configuration(format!(
                "unknown prediction source '{other}'"
            )))
        }
    }
}

/// Tag of an upstream provider contributing to a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Provider(String);

impl Provider {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub type ProviderSet = BTreeSet<Provider>;

/// A location exactly as a connector feed reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawLocation {
    #[serde(default)]
    pub name: LanguageMap,
    #[serde(default)]
    pub locality: LanguageMap,
    #[serde(default)]
    pub country: LanguageMap,
    pub coordinates: GeoPoint,
    #[serde(rename = "type", default = "unknown_type")]
    pub location_type: LocationType
}

fn unknown_type() -> LocationType {
    LocationType::Unknown
}

/// The merged, stored representation of a place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalLocation {
    pub id: LocationId,
    pub coordinates: GeoPoint,
    pub name: LanguageMap,
    pub locality: LanguageMap,
    pub country: LanguageMap,
    #[serde(rename = "type")]
    pub location_type: LocationType,
    #[serde(rename = "distance")]
    pub search_radius_meters: i32,
    pub source: PredictionSource,
    pub providers: ProviderSet
}

impl CanonicalLocation {
    /// Short label for logs and error reports.
    pub fn display_name(&self) -> String {
        let pick = |map: &LanguageMap| {
            map.get(crate::normalizer::DEFAULT_LANGUAGE)
                .map(str::to_string)
                .or_else(|| map.iter().next().map(|(_, v)| v.to_string()))
        };
        pick(&self.name)
            .or_else(|| pick(&self.locality))
            .or_else(|| pick(&self.country))
            .unwrap_or_default()
    }
}
