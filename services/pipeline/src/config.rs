//! Run configuration, built explicitly and passed into the orchestrator.

use crate::error::ConfigError;
use crate::model::{enumerate_tasks, Metric, Task};
use crate::normalize::MissingValues;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_QUICKSTATS_URL: &str = "https://quickstats.nass.usda.gov/api/api_GET/";
pub const DEFAULT_TABLE: &str = "usda_observations";

/// Largest chunk one insert statement can carry: Postgres accepts at most
/// 65535 bind parameters and each row binds 7.
pub const MAX_CHUNK_SIZE: usize = u16::MAX as usize / 7;

const DEFAULT_COMMODITIES: &[&str] = &["SOYBEANS", "CORN", "WHEAT"];
const DEFAULT_REGIONS: &[&str] = &["IA", "IL", "MN", "NE", "SD"];
const DEFAULT_YEAR_FROM: i32 = 2020;
const DEFAULT_YEAR_TO: i32 = 2024;

/// Opaque QuickStats credential.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(***)")
    }
}

#[derive(Debug, Clone)]
pub struct ExtractConfig {
    pub base_url: String,
    pub api_key: Option<ApiKey>,
    pub request_timeout: Duration,
    /// Minimum spacing between two remote calls, across all workers.
    pub min_request_interval: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub concurrency: usize,
    pub missing_values: MissingValues,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_QUICKSTATS_URL.to_string(),
            api_key: None,
            request_timeout: Duration::from_secs(20),
            min_request_interval: Duration::from_millis(1000),
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
            concurrency: 1,
            missing_values: MissingValues::default(),
        }
    }
}

/// Exclusive bounds a PRICE raw value must fall within.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceBounds {
    pub min: f64,
    pub max: f64,
}

impl PriceBounds {
    pub fn contains(&self, value: f64) -> bool {
        value > self.min && value < self.max
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransformConfig {
    pub price_bounds: Option<PriceBounds>,
}

#[derive(Debug, Clone)]
pub struct LoadConfig {
    pub db_url: Option<String>,
    pub table: String,
    pub chunk_size: usize,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            db_url: None,
            table: DEFAULT_TABLE.to_string(),
            chunk_size: 1000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub commodities: Vec<String>,
    pub metrics: Vec<Metric>,
    pub regions: Vec<String>,
    pub year_from: i32,
    pub year_to: i32,
    pub staging_dir: PathBuf,
    pub processed_path: PathBuf,
    pub extract: ExtractConfig,
    pub transform: TransformConfig,
    pub load: LoadConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            commodities: DEFAULT_COMMODITIES.iter().map(|s| s.to_string()).collect(),
            metrics: Metric::ALL.to_vec(),
            regions: DEFAULT_REGIONS.iter().map(|s| s.to_string()).collect(),
            year_from: DEFAULT_YEAR_FROM,
            year_to: DEFAULT_YEAR_TO,
            staging_dir: PathBuf::from("./data/raw"),
            processed_path: PathBuf::from("./data/processed/usda_processed.csv"),
            extract: ExtractConfig::default(),
            transform: TransformConfig::default(),
            load: LoadConfig::default(),
        }
    }
}

/// Task list overrides read from a JSON file.
#[derive(Debug, Default, Deserialize)]
pub struct TaskFile {
    #[serde(default)]
    pub commodities: Option<Vec<String>>,
    #[serde(default)]
    pub metrics: Option<Vec<String>>,
    #[serde(default)]
    pub regions: Option<Vec<String>>,
    #[serde(default)]
    pub year_from: Option<i32>,
    #[serde(default)]
    pub year_to: Option<i32>,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = PipelineConfig::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(list) = get("COMMODITIES") {
            config.commodities = split_list(&list);
        }
        if let Some(list) = get("REGIONS") {
            config.regions = split_list(&list);
        }
        if let Some(list) = get("METRICS") {
            config.metrics = parse_metrics("METRICS", &split_list(&list))?;
        }
        config.year_from = parse_or("YEAR_FROM", get("YEAR_FROM"), config.year_from)?;
        config.year_to = parse_or("YEAR_TO", get("YEAR_TO"), config.year_to)?;

        if let Some(dir) = get("STAGING_DIR") {
            config.staging_dir = PathBuf::from(dir);
        }
        if let Some(path) = get("PROCESSED_PATH") {
            config.processed_path = PathBuf::from(path);
        }

        let extract = &mut config.extract;
        if let Some(url) = get("QUICKSTATS_URL") {
            extract.base_url = url;
        }
        extract.api_key = get("USDA_API_KEY").map(ApiKey::new);
        extract.request_timeout = Duration::from_secs(parse_or(
            "REQUEST_TIMEOUT_SECS",
            get("REQUEST_TIMEOUT_SECS"),
            extract.request_timeout.as_secs(),
        )?);
        extract.min_request_interval = Duration::from_millis(parse_or(
            "RATE_LIMIT_MS",
            get("RATE_LIMIT_MS"),
            extract.min_request_interval.as_millis() as u64,
        )?);
        extract.max_retries = parse_or("MAX_RETRIES", get("MAX_RETRIES"), extract.max_retries)?;
        extract.retry_backoff = Duration::from_millis(parse_or(
            "RETRY_BACKOFF_MS",
            get("RETRY_BACKOFF_MS"),
            extract.retry_backoff.as_millis() as u64,
        )?);
        extract.concurrency = parse_or("FETCH_CONCURRENCY", get("FETCH_CONCURRENCY"), extract.concurrency)?;
        if let Some(tokens) = lookup("MISSING_VALUE_TOKENS") {
            extract.missing_values = MissingValues::new(tokens.split(',').map(|t| t.to_string()));
        }

        let price_min: Option<f64> = parse_opt("PRICE_MIN", get("PRICE_MIN"))?;
        let price_max: Option<f64> = parse_opt("PRICE_MAX", get("PRICE_MAX"))?;
        config.transform.price_bounds = match (price_min, price_max) {
            (None, None) => None,
            (min, max) => Some(PriceBounds {
                min: min.unwrap_or(f64::NEG_INFINITY),
                max: max.unwrap_or(f64::INFINITY),
            }),
        };

        config.load.db_url = get("DB_URL");
        if let Some(table) = get("TARGET_TABLE") {
            config.load.table = table;
        }
        config.load.chunk_size = parse_or("CHUNK_SIZE", get("CHUNK_SIZE"), config.load.chunk_size)?;

        config.validate()?;
        Ok(config)
    }

    /// Apply task list overrides from a JSON file.
    pub fn apply_task_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: TaskFile = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        if let Some(commodities) = file.commodities {
            self.commodities = normalize_list(commodities);
        }
        if let Some(regions) = file.regions {
            self.regions = normalize_list(regions);
        }
        if let Some(metrics) = file.metrics {
            self.metrics = parse_metrics("metrics", &metrics)?;
        }
        if let Some(year_from) = file.year_from {
            self.year_from = year_from;
        }
        if let Some(year_to) = file.year_to {
            self.year_to = year_to;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.year_from > self.year_to {
            return Err(ConfigError::Invalid {
                key: "YEAR_FROM",
                reason: format!("{} is after YEAR_TO {}", self.year_from, self.year_to),
            });
        }
        if self.load.chunk_size == 0 || self.load.chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::Invalid {
                key: "CHUNK_SIZE",
                reason: format!(
                    "{} is outside 1..={}",
                    self.load.chunk_size, MAX_CHUNK_SIZE
                ),
            });
        }
        if self.extract.concurrency == 0 {
            return Err(ConfigError::Invalid {
                key: "FETCH_CONCURRENCY",
                reason: "must be at least 1".to_string(),
            });
        }
        validate_table_name(&self.load.table)?;
        Ok(())
    }

    pub fn tasks(&self) -> Vec<Task> {
        enumerate_tasks(
            &self.commodities,
            &self.metrics,
            &self.regions,
            self.year_from,
            self.year_to,
        )
    }

    pub fn require_api_key(&self) -> Result<&ApiKey, ConfigError> {
        self.extract
            .api_key
            .as_ref()
            .ok_or(ConfigError::Missing("USDA_API_KEY"))
    }

    pub fn require_db_url(&self) -> Result<&str, ConfigError> {
        self.load
            .db_url
            .as_deref()
            .ok_or(ConfigError::Missing("DB_URL"))
    }
}

/// Table names are interpolated into SQL, so only plain identifiers pass.
pub fn validate_table_name(table: &str) -> Result<(), ConfigError> {
    let valid = !table.is_empty()
        && table.len() <= 63
        && table
            .chars()
            .next()
            .map(|c| c.is_ascii_alphabetic() || c == '_')
            .unwrap_or(false)
        && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            key: "TARGET_TABLE",
            reason: format!("'{}' is not a plain SQL identifier", table),
        })
    }
}

fn split_list(raw: &str) -> Vec<String> {
    normalize_list(raw.split(','))
}

/// Trimmed, upper-cased, blanks and repeats removed, first occurrence wins.
fn normalize_list<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for item in items {
        let value = item.as_ref().trim().to_uppercase();
        if !value.is_empty() && !out.contains(&value) {
            out.push(value);
        }
    }
    out
}

fn parse_metrics(key: &'static str, raw: &[String]) -> Result<Vec<Metric>, ConfigError> {
    let mut metrics = Vec::new();
    for m in raw {
        let metric = m
            .parse::<Metric>()
            .map_err(|reason| ConfigError::Invalid { key, reason })?;
        // "PRICE" and "PRICE RECEIVED" name the same metric.
        if !metrics.contains(&metric) {
            metrics.push(metric);
        }
    }
    Ok(metrics)
}

fn parse_or<T: FromStr>(key: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T::Err: fmt::Display,
{
    Ok(parse_opt(key, raw)?.unwrap_or(default))
}

fn parse_opt<T: FromStr>(key: &'static str, raw: Option<String>) -> Result<Option<T>, ConfigError>
where
    T::Err: fmt::Display,
{
    raw.map(|value| {
        value.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
            key,
            reason: format!("'{}': {}", value, e),
        })
    })
    .transpose()
}
