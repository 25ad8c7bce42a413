//! Configuration loading for netharvest.
//! Reads netharvest.toml (or the path in NETHARVEST_CONFIG), then applies
//! environment overrides. Every value has a default, so a missing default
//! config file is not an error.

mod error;

pub use error::ConfigError;

use secrecy::SecretString;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const ENV_CONFIG_PATH: &str = "NETHARVEST_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "netharvest.toml";
/// Largest `resultsPerPage` the NVD CVE API accepts.
pub const NVD_MAX_PAGE_SIZE: u32 = 2000;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub connector: ConnectorConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
}

// ── Database ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    /// Postgres schema holding one table per collection.
    #[serde(default = "default_database_schema")]
    pub schema: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_database_url()    -> String { "postgres://localhost:5432/netharvest".to_string() }
fn default_database_schema() -> String { "etl_data".to_string() }
fn default_max_connections() -> u32    { 5 }
fn default_connect_timeout() -> u64    { 5 }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            schema: default_database_schema(),
            max_connections: default_max_connections(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl DatabaseConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

// ── HTTP / retry ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
    #[serde(default)]
    pub backoff: BackoffKind,
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,
    /// Multiplier applied to the retry delay after a 429.
    #[serde(default = "default_rate_limit_multiplier")]
    pub rate_limit_multiplier: u32,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_timeout()               -> u64    { 10 }
fn default_retry_attempts()        -> u32    { 3 }
fn default_retry_delay()           -> u64    { 2 }
fn default_max_delay()             -> u64    { 60 }
fn default_rate_limit_multiplier() -> u32    { 2 }
fn default_user_agent()            -> String { format!("netharvest/{}", env!("CARGO_PKG_VERSION")) }

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
            retry_attempts: default_retry_attempts(),
            retry_delay_secs: default_retry_delay(),
            backoff: BackoffKind::default(),
            max_delay_secs: default_max_delay(),
            rate_limit_multiplier: default_rate_limit_multiplier(),
            user_agent: default_user_agent(),
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }
}

// ── Connector metadata ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectorConfig {
    /// Version tag stamped on every document as `etl_version`.
    #[serde(default = "default_etl_version")]
    pub etl_version: String,
}

fn default_etl_version() -> String { "2.0".to_string() }

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self { etl_version: default_etl_version() }
    }
}

// ── Sources ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SourcesConfig {
    #[serde(default)]
    pub trace: TraceSourceConfig,
    #[serde(default)]
    pub doh: DohSourceConfig,
    #[serde(default)]
    pub speed: SpeedSourceConfig,
    #[serde(default)]
    pub nvd: NvdSourceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TraceSourceConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_trace_url")]
    pub url: String,
    #[serde(default = "default_trace_collection")]
    pub collection: String,
    #[serde(default = "default_timestamp_index")]
    pub index_field: String,
}

fn bool_true()                -> bool   { true }
fn default_trace_url()        -> String { "https://1.1.1.1/cdn-cgi/trace".to_string() }
fn default_trace_collection() -> String { "cloudflare_trace_raw".to_string() }
fn default_timestamp_index()  -> String { "ingestion_timestamp".to_string() }

impl Default for TraceSourceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: default_trace_url(),
            collection: default_trace_collection(),
            index_field: default_timestamp_index(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DohSourceConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_doh_url")]
    pub url: String,
    #[serde(default = "default_doh_collection")]
    pub collection: String,
    #[serde(default = "default_doh_index")]
    pub index_field: String,
    #[serde(default = "default_domains")]
    pub domains: Vec<String>,
    #[serde(default = "default_record_type")]
    pub record_type: String,
    #[serde(default = "default_doh_delay")]
    pub item_delay_ms: u64,
}

fn default_doh_url()        -> String { "https://cloudflare-dns.com/dns-query".to_string() }
fn default_doh_collection() -> String { "cloudflare_doh_raw".to_string() }
fn default_doh_index()      -> String { "query_name".to_string() }
fn default_record_type()    -> String { "A".to_string() }
fn default_doh_delay()      -> u64    { 500 }

fn default_domains() -> Vec<String> {
    ["google.com", "github.com", "cloudflare.com", "amazon.com", "microsoft.com"]
        .iter()
        .map(|d| d.to_string())
        .collect()
}

impl Default for DohSourceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: default_doh_url(),
            collection: default_doh_collection(),
            index_field: default_doh_index(),
            domains: default_domains(),
            record_type: default_record_type(),
            item_delay_ms: default_doh_delay(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpeedSourceConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_speed_url")]
    pub url: String,
    #[serde(default = "default_speed_collection")]
    pub collection: String,
    #[serde(default = "default_timestamp_index")]
    pub index_field: String,
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    /// Payload size requested per download; the endpoint default when unset.
    #[serde(default)]
    pub bytes: Option<u64>,
    #[serde(default = "default_speed_delay")]
    pub item_delay_ms: u64,
}

fn default_speed_url()        -> String { "https://speed.cloudflare.com/__down".to_string() }
fn default_speed_collection() -> String { "cloudflare_speed_raw".to_string() }
fn default_iterations()       -> u32    { 3 }
fn default_speed_delay()      -> u64    { 1000 }

impl Default for SpeedSourceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: default_speed_url(),
            collection: default_speed_collection(),
            index_field: default_timestamp_index(),
            iterations: default_iterations(),
            bytes: None,
            item_delay_ms: default_speed_delay(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NvdSourceConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_nvd_url")]
    pub url: String,
    #[serde(default)]
    pub api_key: Option<SecretString>,
    #[serde(default = "default_nvd_collection")]
    pub collection: String,
    #[serde(default = "default_nvd_index")]
    pub index_field: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Trailing window on `lastModified`, ending at run start.
    #[serde(default = "default_window_hours")]
    pub window_hours: u32,
    #[serde(default = "default_page_delay")]
    pub page_delay_ms: u64,
    #[serde(default = "default_keyed_page_delay")]
    pub keyed_page_delay_ms: u64,
}

fn default_nvd_url()          -> String { "https://services.nvd.nist.gov/rest/json/cves/2.0".to_string() }
fn default_nvd_collection()   -> String { "nvd_cve_raw".to_string() }
fn default_nvd_index()        -> String { "last_modified".to_string() }
fn default_page_size()        -> u32    { NVD_MAX_PAGE_SIZE }
fn default_window_hours()     -> u32    { 24 }
fn default_page_delay()       -> u64    { 6000 }
fn default_keyed_page_delay() -> u64    { 600 }

impl Default for NvdSourceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: default_nvd_url(),
            api_key: None,
            collection: default_nvd_collection(),
            index_field: default_nvd_index(),
            page_size: default_page_size(),
            window_hours: default_window_hours(),
            page_delay_ms: default_page_delay(),
            keyed_page_delay_ms: default_keyed_page_delay(),
        }
    }
}

impl NvdSourceConfig {
    /// NVD asks unkeyed clients to pace requests much further apart.
    pub fn effective_page_delay(&self) -> Duration {
        if self.api_key.is_some() {
            Duration::from_millis(self.keyed_page_delay_ms)
        } else {
            Duration::from_millis(self.page_delay_ms)
        }
    }
}


// ── Loading ──────────────────────────────────────────────────────────────────

impl Config {
    /// Load configuration from `path`, else the file named by NETHARVEST_CONFIG,
    /// else netharvest.toml in the current directory, then apply environment
    /// overrides. Not validated: callers layer their own overrides first and
    /// then call [`Config::validate`].
    pub fn load_from(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match (path, std::env::var(ENV_CONFIG_PATH)) {
            (Some(path), _) => Self::from_path(path)?,
            (None, Ok(path)) => Self::from_path(&path)?,
            (None, Err(_)) if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_path(DEFAULT_CONFIG_PATH)?
            }
            (None, Err(_)) => {
                tracing::debug!("no {DEFAULT_CONFIG_PATH} found, using defaults");
                Self::default()
            }
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parse a config file; the format follows the extension (toml, yaml/yml, json).
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();

        let config = match ext.as_str() {
            "yaml" | "yml" => serde_yaml::from_str(&content)
                .map_err(|e| ConfigError::Parse(format!("{}: {e}", path.display())))?,
            "json" => serde_json::from_str(&content)
                .map_err(|e| ConfigError::Parse(format!("{}: {e}", path.display())))?,
            _ => Self::from_toml_str(&content)?,
        };
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply environment-style overrides. `lookup` is `std::env::var` in
    /// production and a map in tests. Unparseable numbers are ignored with a warning.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("DATABASE_URL") {
            self.database.url = v;
        }
        if let Some(v) = lookup("NETHARVEST_DB_SCHEMA") {
            self.database.schema = v;
        }
        if let Some(v) = lookup("CLOUDFLARE_TRACE_URL") {
            self.sources.trace.url = v;
        }
        if let Some(v) = lookup("CLOUDFLARE_DOH_URL") {
            self.sources.doh.url = v;
        }
        if let Some(v) = lookup("CLOUDFLARE_SPEED_URL") {
            self.sources.speed.url = v;
        }
        if let Some(v) = lookup("NVD_API_URL") {
            self.sources.nvd.url = v;
        }
        if let Some(v) = lookup("NVD_API_KEY") {
            if !v.trim().is_empty() {
                self.sources.nvd.api_key = Some(SecretString::from(v));
            }
        }
        override_number(&lookup, "REQUEST_TIMEOUT", &mut self.http.timeout_secs);
        override_number(&lookup, "RETRY_ATTEMPTS", &mut self.http.retry_attempts);
        override_number(&lookup, "RETRY_DELAY", &mut self.http.retry_delay_secs);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.http.retry_attempts == 0 {
            return Err(ConfigError::Invalid("http.retry_attempts must be at least 1".into()));
        }
        if !(1..=NVD_MAX_PAGE_SIZE).contains(&self.sources.nvd.page_size) {
            return Err(ConfigError::Invalid(format!(
                "sources.nvd.page_size must be within 1..={NVD_MAX_PAGE_SIZE}"
            )));
        }
        // NVD rejects lastMod windows longer than 120 days.
        if !(1..=2880).contains(&self.sources.nvd.window_hours) {
            return Err(ConfigError::Invalid("sources.nvd.window_hours must be within 1..=2880".into()));
        }
        if !is_identifier(&self.database.schema) {
            return Err(ConfigError::Invalid(format!(
                "database.schema `{}` is not a valid identifier",
                self.database.schema
            )));
        }
        let names = [
            ("trace", &self.sources.trace.collection, &self.sources.trace.index_field),
            ("doh", &self.sources.doh.collection, &self.sources.doh.index_field),
            ("speed", &self.sources.speed.collection, &self.sources.speed.index_field),
            ("nvd", &self.sources.nvd.collection, &self.sources.nvd.index_field),
        ];
        for (source, collection, index_field) in names {
            if !is_identifier(collection) {
                return Err(ConfigError::Invalid(format!(
                    "sources.{source}.collection `{collection}` is not a valid identifier"
                )));
            }
            if !is_identifier(index_field) {
                return Err(ConfigError::Invalid(format!(
                    "sources.{source}.index_field `{index_field}` is not a valid identifier"
                )));
            }
        }
        Ok(())
    }
}

fn override_number<F, T>(lookup: &F, key: &str, slot: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(raw) = lookup(key) {
        match raw.trim().parse::<T>() {
            Ok(v) => *slot = v,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring non-numeric override"),
        }
    }
}

/// Lowercase ASCII letters, digits and underscores, not starting with a digit.
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    s.len() <= 63 && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}
