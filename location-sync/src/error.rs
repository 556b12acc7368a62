use std::fmt;
use thiserror::Error;

pub type LocationSyncResult<T> = Result<T, LocationSyncError>;

#[derive(Debug, Error)]
pub enum LocationSyncError {
    #[error("Invalid location type: {location_type}{}", FeedOrigin(.record, .provider, .path))]
    InvalidLocationType {
        location_type: String,
        /// Default-language name of the offending record.
        record: String,
        provider: String,
        path: String
    },

    #[error("Invalid coordinates: latitude {latitude}, longitude {longitude}")]
    InvalidCoordinates { latitude: f64, longitude: f64 },

    #[error("Failed to get locations from {provider} at {path}: {status} - {reason}")]
    FetchFailure {
        provider: String,
        path: String,
        status: u16,
        reason: String
    },

    #[error("Failed to decode locations from {provider} at {path}: {reason}")]
    DecodeFailure {
        provider: String,
        path: String,
        reason: String
    },

    #[error("Failed to upload {size} locations: {status} - {reason}")]
    UploadFailure {
        size: usize,
        status: u16,
        reason: String
    },

    #[error("Downstream rejected {} location(s): {}", .poisoned.len(), PoisonList(.poisoned))]
    UploadRejected { poisoned: Vec<PoisonRecord> },

    #[error("Failed to get locations last modified date: {status} - {reason}")]
    LastModifiedFailure { status: u16, reason: String },

    #[error("Credential exchange failed: {0}")]
    CredentialFailure(String),

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Internal error: {0}")]
    Internal(String)
}

/// A single record the downstream consumer refused even when sent alone.
#[derive(Debug, Clone, PartialEq)]
pub struct PoisonRecord {
    pub id: i32,
    pub name: String,
    pub reason: String
}

struct PoisonList<'a>(&'a [PoisonRecord]);

impl fmt::Display for PoisonList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, record) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(
                f,
                "id={} name='{}' ({})",
                record.id, record.name, record.reason
            )?;
        }
        Ok(())
    }
}

/// Where a rejected feed record came from. Unknown parts are left out.
struct FeedOrigin<'a>(&'a str, &'a str, &'a str);

impl fmt::Display for FeedOrigin<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let FeedOrigin(record, provider, path) = *self;
        if !record.is_empty() {
            write!(f, " for '{record}'")?;
        }
        if !provider.is_empty() {
            write!(f, " from {provider}")?;
        }
        if !path.is_empty() {
            write!(f, " at {path}")?;
        }
        Ok(())
    }
}

impl LocationSyncError {
    pub fn invalid_location_type(location_type: impl fmt::Display) -> Self {
        Self::InvalidLocationType {
            location_type: location_type.to_string(),
            record: String::new(),
            provider: String::new(),
            path: String::new()
        }
    }

    /// Names the feed record and provider on an invalid-type error. Other
    /// errors pass through unchanged.
    pub fn with_record(self, name: &str, from: &str) -> Self {
        match self {
            Self::InvalidLocationType {
                location_type,
                path,
                ..
            } => Self::InvalidLocationType {
                location_type,
                record: name.to_string(),
                provider: from.to_string(),
                path
            },
            other => other
        }
    }

    /// Adds the request path of the page an invalid-type record arrived on.
    pub fn at_path(self, request_path: &str) -> Self {
        match self {
            Self::InvalidLocationType {
                location_type,
                record,
                provider,
                ..
            } => Self::InvalidLocationType {
                location_type,
                record,
                provider,
                path: request_path.to_string()
            },
            other => other
        }
    }

    /// Decode failures abort a provider pass exactly like fetch failures do.
    pub fn is_fetch_failure(&self) -> bool {
        matches!(self, Self::FetchFailure { .. } | Self::DecodeFailure { .. })
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_) => true,
            Self::UploadFailure { status, .. } => *status == 0 || *status >= 500 || *status == 408,
            _ => false
        }
    }
}
