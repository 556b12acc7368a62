use crate::error::{LocationSyncError, LocationSyncResult};
use crate::model::{LocationType, PredictionSource, Provider};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::fmt;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationSyncConfig {
    #[serde(default)]
    pub update_mode: UpdateMode,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default = "default_location_types")]
    pub location_types: Vec<LocationType>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_upload_delay_ms")]
    pub upload_delay_ms: u64,
    #[serde(default)]
    pub upload_policy: UploadPolicy,
    #[serde(default = "default_retry_config")]
    pub retry: RetryConfig,
    #[serde(default)]
    pub parallel_providers: bool,
    #[serde(default)]
    pub prediction_source: PredictionSource,
    #[serde(default)]
    pub publisher_base_url: String,
    #[serde(default)]
    pub database_url: String,
    #[serde(default)]
    pub sync_interval_seconds: u64,
    #[serde(default)]
    pub token: TokenConfig,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateMode {
    /// Truncate the store once, then re-ingest everything.
    Full,
    /// Fetch only what changed since the downstream watermark.
    #[default]
    Differential
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub base_url: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool
}

impl ProviderConfig {
    pub fn provider(&self) -> Provider {
        Provider::new(self.name.clone())
    }
}

/// How a failed batch upload is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UploadPolicy {
    /// Halve failing batches until single poison records are isolated.
    SplitOnFailure,
    /// Resend the whole batch up to `attempts` times with backoff; never
    /// split. A rejection that cannot succeed on resend (a 4xx other than
    /// 408, or a credential failure) ends the attempts early.
    FixedRetry { attempts: u32 }
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self::SplitOnFailure
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64
}

#[derive(Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    #[serde(default)]
    pub token_url: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default = "default_safety_margin_seconds")]
    pub safety_margin_seconds: u64,
    #[serde(default)]
    pub caching_disabled: bool
}

impl fmt::Debug for TokenConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenConfig")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("scopes", &self.scopes)
            .field("safety_margin_seconds", &self.safety_margin_seconds)
            .field("caching_disabled", &self.caching_disabled)
            .finish()
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            token_url: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            scopes: Vec::new(),
            safety_margin_seconds: default_safety_margin_seconds(),
            caching_disabled: false
        }
    }
}

fn default_location_types() -> Vec<LocationType> {
    vec![LocationType::AdminArea, LocationType::Accommodation]
}

fn default_page_size() -> usize {
    3000
}

fn default_batch_size() -> usize {
    1000
}

fn default_upload_delay_ms() -> u64 {
    1000
}

fn default_enabled() -> bool {
    true
}

fn default_safety_margin_seconds() -> u64 {
    15
}

fn default_http_timeout_seconds() -> u64 {
    30
}

fn default_retry_config() -> RetryConfig {
    RetryConfig {
        max_retries: 10,
        initial_backoff_ms: 1000,
        max_backoff_ms: 30000
    }
}

impl Default for LocationSyncConfig {
    fn default() -> Self {
        Self {
            update_mode: UpdateMode::default(),
            providers: Vec::new(),
            location_types: default_location_types(),
            page_size: default_page_size(),
            batch_size: default_batch_size(),
            upload_delay_ms: default_upload_delay_ms(),
            upload_policy: UploadPolicy::default(),
            retry: default_retry_config(),
            parallel_providers: false,
            prediction_source: PredictionSource::default(),
            publisher_base_url: String::new(),
            database_url: String::new(),
            sync_interval_seconds: 0,
            token: TokenConfig::default(),
            http_timeout_seconds: default_http_timeout_seconds()
        }
    }
}

impl LocationSyncConfig {
    /// Reads the optional TOML file named by `LOCATION_SYNC_CONFIG`, applies
    /// environment overrides and validates the result.
    pub fn load() -> LocationSyncResult<Self> {
        let mut config = match env::var("LOCATION_SYNC_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default()
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> LocationSyncResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            LocationSyncError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> LocationSyncResult<Self> {
        toml::from_str(contents)
            .map_err(|e| LocationSyncError::Configuration(format!("invalid TOML: {e}")))
    }

    pub fn from_env() -> LocationSyncResult<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> LocationSyncResult<()> {
        if let Ok(mode) = env::var("LOCATION_SYNC_UPDATE_MODE") {
            self.update_mode = match mode.trim().to_ascii_lowercase().as_str() {
                "full" => UpdateMode::Full,
                "differential" => UpdateMode::Differential,
                other => {
                    return Err(LocationSyncError::Configuration(format!(
                        "unknown update mode '{other}'"
                    )));
                }
            };
        }
        if let Ok(providers) = env::var("LOCATION_SYNC_PROVIDERS") {
            self.providers = parse_providers(&providers)?;
        }
        if let Ok(types) = env::var("LOCATION_SYNC_LOCATION_TYPES") {
            self.location_types = parse_location_types(&types)?;
        }
        if let Some(v) = parse_env("LOCATION_SYNC_PAGE_SIZE")? {
            self.page_size = v;
        }
        if let Some(v) = parse_env("LOCATION_SYNC_BATCH_SIZE")? {
            self.batch_size = v;
        }
        if let Some(v) = parse_env("LOCATION_SYNC_UPLOAD_DELAY_MS")? {
            self.upload_delay_ms = v;
        }
        if let Ok(policy) = env::var("LOCATION_SYNC_UPLOAD_POLICY") {
            self.upload_policy = match policy.trim().to_ascii_lowercase().as_str() {
                "split" | "split_on_failure" => UploadPolicy::SplitOnFailure,
                "fixed" | "fixed_retry" => UploadPolicy::FixedRetry {
                    attempts: parse_env("LOCATION_SYNC_UPLOAD_ATTEMPTS")?
                        .unwrap_or(self.retry.max_retries)
                },
                other => {
                    return Err(LocationSyncError::Configuration(format!(
                        "unknown upload policy '{other}'"
                    )));
                }
            };
        }
        if let Some(v) = parse_env("LOCATION_SYNC_PARALLEL_PROVIDERS")? {
            self.parallel_providers = v;
        }
        if let Ok(source) = env::var("LOCATION_SYNC_PREDICTION_SOURCE") {
            self.prediction_source = source.parse()?;
        }
        if let Ok(url) = env::var("LOCATION_SYNC_PUBLISHER_URL") {
            self.publisher_base_url = url;
        }
        if let Ok(url) = env::var("DATABASE_URL") {
            self.database_url = url;
        }
        if let Some(v) = parse_env("LOCATION_SYNC_INTERVAL_SECONDS")? {
            self.sync_interval_seconds = v;
        }
        if let Some(v) = parse_env("LOCATION_SYNC_HTTP_TIMEOUT_SECONDS")? {
            self.http_timeout_seconds = v;
        }
        if let Ok(url) = env::var("LOCATION_SYNC_TOKEN_URL") {
            self.token.token_url = url;
        }
        if let Ok(id) = env::var("LOCATION_SYNC_CLIENT_ID") {
            self.token.client_id = id;
        }
        if let Ok(secret) = env::var("LOCATION_SYNC_CLIENT_SECRET") {
            self.token.client_secret = secret;
        }
        if let Ok(scopes) = env::var("LOCATION_SYNC_SCOPES") {
            self.token.scopes = scopes.split_whitespace().map(str::to_string).collect();
        }
        if let Some(v) = parse_env("LOCATION_SYNC_TOKEN_MARGIN_SECONDS")? {
            self.token.safety_margin_seconds = v;
        }
        if let Some(v) = parse_env("LOCATION_SYNC_TOKEN_CACHE_DISABLED")? {
            self.token.caching_disabled = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> LocationSyncResult<()> {
        let mut seen = HashSet::new();
        for provider in &self.providers {
            if provider.name.trim().is_empty() {
                return Err(LocationSyncError::Configuration(
                    "provider name must not be empty".to_string()
                ));
            }
            if !seen.insert(provider.name.as_str()) {
                return Err(LocationSyncError::Configuration(format!(
                    "duplicate provider '{}'",
                    provider.name
                )));
            }
        }
        if self.location_types.contains(&LocationType::Unknown) {
            return Err(LocationSyncError::Configuration(
                "location_types must not contain Unknown".to_string()
            ));
        }
        if self.page_size == 0 {
            return Err(LocationSyncError::Configuration(
                "page_size must be positive".to_string()
            ));
        }
        if self.batch_size == 0 {
            return Err(LocationSyncError::Configuration(
                "batch_size must be positive".to_string()
            ));
        }
        if let UploadPolicy::FixedRetry { attempts: 0 } = self.upload_policy {
            return Err(LocationSyncError::Configuration(
                "fixed retry needs at least one attempt".to_string()
            ));
        }
        if self.publisher_base_url.trim().is_empty() {
            return Err(LocationSyncError::Configuration(
                "publisher_base_url is required".to_string()
            ));
        }
        Ok(())
    }

    pub fn enabled_providers(&self) -> impl Iterator<Item = &ProviderConfig> {
        self.providers.iter().filter(|p| p.enabled)
    }

    pub fn upload_delay(&self) -> Duration {
        Duration::from_millis(self.upload_delay_ms)
    }

    pub fn sync_interval(&self) -> Option<Duration> {
        (self.sync_interval_seconds > 0).then(|| Duration::from_secs(self.sync_interval_seconds))
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_seconds)
    }
}

fn parse_env<T>(key: &str) -> LocationSyncResult<Option<T>>
where
    T: std::str::FromStr,
    T::Err: fmt::Display
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| LocationSyncError::Configuration(format!("{key}: {e}"))),
        Err(_) => Ok(None)
    }
}

/// `name=url` pairs separated by commas.
fn parse_providers(value: &str) -> LocationSyncResult<Vec<ProviderConfig>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (name, url) = entry.split_once('=').ok_or_else(|| {
                LocationSyncError::Configuration(format!(
                    "provider entry '{entry}' must look like name=url"
                ))
            })?;
            Ok(ProviderConfig {
                name: name.trim().to_string(),
                base_url: url.trim().to_string(),
                enabled: true
            })
        })
        .collect()
}

fn parse_location_types(value: &str) -> LocationSyncResult<Vec<LocationType>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match LocationType::from_name(entry) {
            LocationType::Unknown => Err(LocationSyncError::Configuration(format!(
                "unknown location type '{entry}'"
            ))),
            location_type => Ok(location_type)
        })
        .collect()
}
