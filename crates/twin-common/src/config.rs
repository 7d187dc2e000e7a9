//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the telemetry runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_store_url() -> String {
    "http://localhost:8086".to_owned()
}

fn default_store_org() -> String {
    "digital-twin".to_owned()
}

fn default_store_bucket() -> String {
    "building_telemetry".to_owned()
}

fn default_store_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_max_range_days() -> u32 {
    90
}

fn default_resolution_minutes() -> u32 {
    15
}

fn default_latest_lookback_days() -> u32 {
    30
}

fn default_zones() -> Vec<String> {
    vec![
        "zone-core".to_owned(),
        "zone-east".to_owned(),
        "zone-west".to_owned(),
    ]
}

fn default_write_concurrency() -> usize {
    8
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_log_file() -> bool {
    true
}

fn default_metrics_enabled() -> bool {
    true
}

/// Primary configuration object for the telemetry engine.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub zones: ZoneConfig,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default)]
    pub write: WriteConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "TWIN_CONFIG";
    pub const ENV_STORE_URL: &str = "INFLUXDB_URL";
    pub const ENV_STORE_ORG: &str = "INFLUXDB_ORG";
    pub const ENV_STORE_BUCKET: &str = "INFLUXDB_BUCKET";
    pub const ENV_STORE_TOKEN: &str = "INFLUXDB_TOKEN";

    /// Load configuration from disk, respecting the `TWIN_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: PathBuf) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let mut config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Overlay the `INFLUXDB_*` connection variables on top of the file values.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Overlay connection settings using an arbitrary variable lookup.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        if let Some(url) = non_empty(Self::ENV_STORE_URL) {
            self.store.url = url;
        }
        if let Some(org) = non_empty(Self::ENV_STORE_ORG) {
            self.store.org = org;
        }
        if let Some(bucket) = non_empty(Self::ENV_STORE_BUCKET) {
            self.store.bucket = bucket;
        }
        if let Some(token) = non_empty(Self::ENV_STORE_TOKEN) {
            self.store.token = Some(token);
        }
    }

    /// Zones known for a building, falling back to the default zone list.
    pub fn zones_for(&self, building_id: &str) -> &[String] {
        self.zones
            .buildings
            .get(building_id)
            .map(Vec::as_slice)
            .unwrap_or(self.zones.default.as_slice())
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.store.validate()?;
        self.query.validate()?;
        self.zones.validate()?;
        self.fallback.validate()?;
        if self.write.concurrency == 0 {
            return Err(anyhow!("write.concurrency must be at least 1"));
        }
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Connection settings for the telemetry store.
#[serde_as]
#[derive(Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_url")]
    pub url: String,
    #[serde(default = "default_store_org")]
    pub org: String,
    #[serde(default = "default_store_bucket")]
    pub bucket: String,
    #[serde(default)]
    pub token: Option<String>,
    /// Upper bound applied to every read and write issued against the store.
    #[serde(default = "default_store_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub timeout: Duration,
}

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        let url = self.url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(anyhow!("store.url must be an http(s) url, got '{}'", self.url));
        }
        if self.bucket.trim().is_empty() {
            return Err(anyhow!("store.bucket must not be empty"));
        }
        if self.org.trim().is_empty() {
            return Err(anyhow!("store.org must not be empty"));
        }
        if self.timeout.is_zero() {
            return Err(anyhow!("store.timeout must be greater than zero"));
        }
        Ok(())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            org: default_store_org(),
            bucket: default_store_bucket(),
            token: None,
            timeout: default_store_timeout(),
        }
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("url", &self.url)
            .field("org", &self.org)
            .field("bucket", &self.bucket)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Limits and defaults applied when composing store queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    #[serde(default = "default_max_range_days")]
    pub max_range_days: u32,
    #[serde(default = "default_resolution_minutes")]
    pub default_resolution_minutes: u32,
    /// How far back the latest-value query searches for a last sample.
    #[serde(default = "default_latest_lookback_days")]
    pub latest_lookback_days: u32,
}

impl QueryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_range_days == 0 {
            return Err(anyhow!("query.max_range_days must be at least 1"));
        }
        if self.default_resolution_minutes == 0 {
            return Err(anyhow!("query.default_resolution_minutes must be at least 1"));
        }
        if self.latest_lookback_days == 0 {
            return Err(anyhow!("query.latest_lookback_days must be at least 1"));
        }
        if self.latest_lookback_days > self.max_range_days {
            return Err(anyhow!(
                "query.latest_lookback_days ({}) exceeds query.max_range_days ({})",
                self.latest_lookback_days,
                self.max_range_days
            ));
        }
        Ok(())
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_range_days: default_max_range_days(),
            default_resolution_minutes: default_resolution_minutes(),
            latest_lookback_days: default_latest_lookback_days(),
        }
    }
}

/// Known zones, used whenever a request does not name a zone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneConfig {
    #[serde(default = "default_zones")]
    pub default: Vec<String>,
    #[serde(default)]
    pub buildings: IndexMap<String, Vec<String>>,
}

impl ZoneConfig {
    pub fn validate(&self) -> Result<()> {
        if self.default.is_empty() {
            return Err(anyhow!("zones.default must list at least one zone"));
        }
        check_zone_list("zones.default", &self.default)?;
        for (building_id, zones) in &self.buildings {
            if zones.is_empty() {
                return Err(anyhow!(
                    "building '{}' must list at least one zone",
                    building_id
                ));
            }
            check_zone_list(&format!("zones.buildings.{building_id}"), zones)?;
        }
        Ok(())
    }
}

fn check_zone_list(section: &str, zones: &[String]) -> Result<()> {
    for (index, zone) in zones.iter().enumerate() {
        if zone.trim().is_empty() {
            return Err(anyhow!("{section} contains a blank zone"));
        }
        if zones[..index].iter().any(|seen| seen.trim() == zone.trim()) {
            return Err(anyhow!("{section} lists zone '{}' more than once", zone.trim()));
        }
    }
    Ok(())
}

impl Default for ZoneConfig {
    fn default() -> Self {
        Self {
            default: default_zones(),
            buildings: IndexMap::new(),
        }
    }
}

/// Inclusive value range used for synthetic data.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BoundsConfig {
    pub min: f64,
    pub max: f64,
}

/// Synthetic fallback tuning.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FallbackConfig {
    /// Fixed seed for reproducible synthetic series. Entropy-seeded when unset.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Per-metric overrides of the built-in synthetic bounds, keyed by metric name.
    #[serde(default)]
    pub bounds: IndexMap<String, BoundsConfig>,
}

impl FallbackConfig {
    pub fn validate(&self) -> Result<()> {
        for (metric, bounds) in &self.bounds {
            if !bounds.min.is_finite() || !bounds.max.is_finite() || bounds.min >= bounds.max {
                return Err(anyhow!(
                    "fallback bounds for '{}' must be finite with min < max",
                    metric
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteConfig {
    /// Maximum number of points in flight for one write batch.
    #[serde(default = "default_write_concurrency")]
    pub concurrency: usize,
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            concurrency: default_write_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
    /// Keep the rolling JSON file next to stdout.
    #[serde(default = "default_log_file")]
    pub file: bool,
}

impl LoggingConfig {
    /// Base name of the rolling log file; the appender adds the date suffix.
    pub fn file_name(&self, service_name: &str) -> String {
        let prefix = self
            .file_prefix
            .as_deref()
            .map(str::trim)
            .filter(|prefix| !prefix.is_empty())
            .unwrap_or(service_name);
        format!("{prefix}.log")
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
            file: default_log_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
        }
    }
}
