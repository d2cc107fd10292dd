//! Extraction stage: one remote query per Task, cleaned and staged.

mod client;
mod rate_limit;

pub use client::QuickStatsClient;
pub use rate_limit::RateLimiter;

use crate::config::ExtractConfig;
use crate::error::{FetchError, StagingError};
use crate::model::{RawBatch, RawRecord, Task};
use crate::normalize::MissingValues;
use crate::staging::StagingArea;
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Facets fixed for every query: state-level field crop surveys, JSON output.
const FIXED_FACETS: &[(&str, &str)] = &[
    ("source_desc", "SURVEY"),
    ("sector_desc", "CROPS"),
    ("group_desc", "FIELD CROPS"),
    ("agg_level_desc", "STATE"),
    ("format", "JSON"),
];

/// Facet filters for one remote query. The credential is added by the
/// transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsQuery {
    pub commodity: String,
    pub statistic_category: String,
    pub region: String,
    pub year_from: i32,
    pub year_to: i32,
}

impl StatsQuery {
    pub fn from_task(task: &Task) -> Self {
        Self {
            commodity: task.commodity.clone(),
            statistic_category: task.metric.category().to_string(),
            region: task.region.clone(),
            year_from: task.year_from,
            year_to: task.year_to,
        }
    }

    pub fn params(&self) -> Vec<(&'static str, String)> {
        let mut params: Vec<(&'static str, String)> = FIXED_FACETS
            .iter()
            .map(|(k, v)| (*k, v.to_string()))
            .collect();
        params.push(("commodity_desc", self.commodity.clone()));
        params.push(("statisticcat_desc", self.statistic_category.clone()));
        params.push(("state_alpha", self.region.clone()));
        params.push(("year__GE", self.year_from.to_string()));
        params.push(("year__LE", self.year_to.to_string()));
        params
    }
}

/// Remote statistics source.
#[async_trait]
pub trait StatsSource: Send + Sync {
    /// Rows matching `query`. An empty vector means the query succeeded with
    /// no data.
    async fn query(&self, query: &StatsQuery) -> Result<Vec<RawRecord>, FetchError>;
}

/// `sha256:<hex>` over every field of `records`. Each field is tagged so
/// that a missing value, an empty string and shifted boundaries all hash
/// differently.
pub fn content_hash(records: &[RawRecord]) -> String {
    let mut hasher = Sha256::new();
    for record in records {
        for field in record.fields() {
            match field {
                None => hasher.update([0u8]),
                Some(text) => {
                    hasher.update([1u8]);
                    hasher.update((text.len() as u64).to_be_bytes());
                    hasher.update(text.as_bytes());
                }
            }
        }
    }
    format!("sha256:{:x}", hasher.finalize())
}

pub struct Extractor {
    source: Arc<dyn StatsSource>,
    staging: Arc<dyn StagingArea>,
    limiter: RateLimiter,
    missing: MissingValues,
    max_retries: u32,
    retry_backoff: Duration,
    concurrency: usize,
}

impl Extractor {
    pub fn new(
        source: Arc<dyn StatsSource>,
        staging: Arc<dyn StagingArea>,
        config: &ExtractConfig,
    ) -> Self {
        Self {
            source,
            staging,
            limiter: RateLimiter::new(config.min_request_interval),
            missing: config.missing_values.clone(),
            max_retries: config.max_retries,
            retry_backoff: config.retry_backoff,
            concurrency: config.concurrency.max(1),
        }
    }

    /// One attempt: query, clean sentinels, stage.
    pub async fn fetch(&self, task: &Task) -> Result<RawBatch, FetchError> {
        self.limiter.acquire().await;

        let mut records = self.source.query(&StatsQuery::from_task(task)).await?;
        for record in &mut records {
            record.map_fields(|field| self.missing.clean(field));
        }

        let batch = RawBatch {
            task: task.clone(),
            fetched_at: Utc::now(),
            content_hash: content_hash(&records),
            records,
        };

        let key = self
            .staging
            .put(&batch)
            .await
            .map_err(|e| FetchError::permanent(format!("staging write failed: {}", e)))?;

        if batch.is_empty() {
            info!(task = %task, "no data found, staged empty batch");
        } else {
            debug!(key = %key, rows = batch.records.len(), hash = %batch.content_hash, "staged batch");
        }
        Ok(batch)
    }

    /// `fetch`, retrying transient failures with linear backoff.
    pub async fn fetch_with_retry(&self, task: &Task) -> Result<RawBatch, FetchError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.fetch(task).await {
                Ok(batch) => return Ok(batch),
                Err(e) if e.is_transient() && attempt <= self.max_retries => {
                    let backoff = self.retry_backoff * attempt;
                    warn!(
                        task = %task,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "transient fetch failure, retrying"
                    );
                    sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Fetch every task. Results are in task order; one failure never stops
    /// or cancels another task.
    pub async fn fetch_all(&self, tasks: &[Task]) -> Vec<Result<RawBatch, FetchError>> {
        let total = tasks.len();
        info!(total, concurrency = self.concurrency, "starting extraction");

        let results: Vec<Result<RawBatch, FetchError>> = stream::iter(tasks.iter().enumerate())
            .map(|(i, task)| async move {
                debug!("[{}/{}] fetching {}", i + 1, total, task);
                let result = self.fetch_with_retry(task).await;
                match &result {
                    Ok(batch) => info!("[{}/{}] {} -> {} rows", i + 1, total, task, batch.records.len()),
                    Err(e) => warn!("[{}/{}] {} failed: {}", i + 1, total, task, e),
                }
                result
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        let fetched = results.iter().filter(|r| r.is_ok()).count();
        info!(fetched, failed = total - fetched, "completed extraction");
        results
    }

    /// Clear the staging area, then fetch every task, so staging holds
    /// exactly this task set afterwards.
    pub async fn extract_fresh(
        &self,
        tasks: &[Task],
    ) -> Result<Vec<Result<RawBatch, FetchError>>, StagingError> {
        self.staging.clear().await?;
        Ok(self.fetch_all(tasks).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchErrorKind;
    use crate::model::Metric;
    use crate::testing::{raw, test_extract_config, MemoryStaging, ScriptedSource};

    fn task(commodity: &str) -> Task {
        Task {
            commodity: commodity.to_string(),
            metric: Metric::Price,
            region: "IA".to_string(),
            year_from: 2020,
            year_to: 2024,
        }
    }

    fn extractor(source: Arc<ScriptedSource>, staging: Arc<MemoryStaging>) -> Extractor {
        Extractor::new(source, staging, &test_extract_config())
    }

    // -------------------------------------------------------------------------
    // QUERY CONSTRUCTION
    // -------------------------------------------------------------------------

    #[test]
    fn test_query_params_include_fixed_facets() {
        let params = StatsQuery::from_task(&task("SOYBEANS")).params();
        let get = |k: &str| params.iter().find(|(key, _)| *key == k).map(|(_, v)| v.as_str());
        assert_eq!(get("source_desc"), Some("SURVEY"));
        assert_eq!(get("agg_level_desc"), Some("STATE"));
        assert_eq!(get("commodity_desc"), Some("SOYBEANS"));
        assert_eq!(get("statisticcat_desc"), Some("PRICE RECEIVED"));
        assert_eq!(get("state_alpha"), Some("IA"));
        assert_eq!(get("year__GE"), Some("2020"));
        assert_eq!(get("year__LE"), Some("2024"));
        assert_eq!(get("key"), None);
    }

    #[test]
    fn test_content_hash_is_stable() {
        let records = vec![raw("2023", "IOWA", "CORN", "PRICE RECEIVED", "$ / BU", "4.50")];
        assert_eq!(content_hash(&records), content_hash(&records.clone()));
        assert!(content_hash(&records).starts_with("sha256:"));
        assert_ne!(content_hash(&records), content_hash(&[]));
    }

    #[test]
    fn test_content_hash_separates_fields() {
        let a = RawRecord {
            year: Some("2023".to_string()),
            state_name: Some("IOWA".to_string()),
            ..RawRecord::default()
        };
        let b = RawRecord {
            year: Some("2023IOWA".to_string()),
            ..RawRecord::default()
        };
        assert_ne!(content_hash(&[a.clone()]), content_hash(&[b]));

        let empty = RawRecord {
            value: Some(String::new()),
            ..a.clone()
        };
        assert_ne!(content_hash(&[a]), content_hash(&[empty]));
    }

    // -------------------------------------------------------------------------
    // FETCH
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_fetch_cleans_sentinels_and_stages() {
        let source = Arc::new(ScriptedSource::new());
        source.respond(
            "CORN",
            Ok(vec![
                raw("2023", "IOWA", "CORN", "PRICE RECEIVED", "$ / BU", "(D)"),
                raw("2022", "IOWA", "CORN", "PRICE RECEIVED", "$ / BU", "(NA)"),
                raw("2021", "", "CORN", "PRICE RECEIVED", "$ / BU", "5.10"),
            ]),
        );
        let staging = Arc::new(MemoryStaging::default());
        let extractor = extractor(source, staging.clone());

        let batch = extractor.fetch(&task("CORN")).await.unwrap();
        assert_eq!(batch.records[0].value, None);
        assert_eq!(batch.records[1].value, None);
        assert_eq!(batch.records[2].state_name, None);
        assert_eq!(batch.records[2].value.as_deref(), Some("5.10"));

        let staged = staging.get(&task("CORN").staging_key()).await.unwrap();
        assert_eq!(staged, batch);
    }

    #[tokio::test]
    async fn test_zero_rows_is_empty_batch_not_error() {
        let source = Arc::new(ScriptedSource::new());
        source.respond("CORN", Ok(vec![]));
        let staging = Arc::new(MemoryStaging::default());
        let extractor = extractor(source, staging.clone());

        let batch = extractor.fetch(&task("CORN")).await.unwrap();
        assert!(batch.is_empty());
        assert_eq!(staging.len(), 1);
    }

    #[tokio::test]
    async fn test_refetch_overwrites_staged_batch() {
        let source = Arc::new(ScriptedSource::new());
        let row = raw("2023", "IOWA", "CORN", "PRICE RECEIVED", "$ / BU", "4.50");
        source.respond("CORN", Ok(vec![row.clone(), row.clone()]));
        source.respond("CORN", Ok(vec![row]));
        let staging = Arc::new(MemoryStaging::default());
        let extractor = extractor(source, staging.clone());

        extractor.fetch(&task("CORN")).await.unwrap();
        extractor.fetch(&task("CORN")).await.unwrap();

        assert_eq!(staging.len(), 1);
        let staged = staging.get(&task("CORN").staging_key()).await.unwrap();
        assert_eq!(staged.records.len(), 1);
    }

    // -------------------------------------------------------------------------
    // RETRY
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let source = Arc::new(ScriptedSource::new());
        source.respond("CORN", Err(FetchError::transient("connection reset")));
        source.respond("CORN", Err(FetchError::transient("502")));
        source.respond("CORN", Ok(vec![raw("2023", "IOWA", "CORN", "PRICE RECEIVED", "$ / BU", "4.50")]));
        let staging = Arc::new(MemoryStaging::default());
        let extractor = extractor(source.clone(), staging);

        let batch = extractor.fetch_with_retry(&task("CORN")).await.unwrap();
        assert_eq!(batch.records.len(), 1);
        assert_eq!(source.calls("CORN"), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let source = Arc::new(ScriptedSource::new());
        for _ in 0..10 {
            source.respond("CORN", Err(FetchError::transient("timeout")));
        }
        let staging = Arc::new(MemoryStaging::default());
        let extractor = extractor(source.clone(), staging.clone());

        let err = extractor.fetch_with_retry(&task("CORN")).await.unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::Transient);
        // first attempt + max_retries (2 in the test config)
        assert_eq!(source.calls("CORN"), 3);
        assert_eq!(staging.len(), 0);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let source = Arc::new(ScriptedSource::new());
        source.respond("CORN", Err(FetchError::permanent("API error 400")));
        let staging = Arc::new(MemoryStaging::default());
        let extractor = extractor(source.clone(), staging);

        let err = extractor.fetch_with_retry(&task("CORN")).await.unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::Permanent);
        assert_eq!(source.calls("CORN"), 1);
    }

    // -------------------------------------------------------------------------
    // FETCH ALL
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_fetch_all_isolates_failures() {
        let source = Arc::new(ScriptedSource::new());
        source.respond("CORN", Ok(vec![raw("2023", "IOWA", "CORN", "PRICE RECEIVED", "$ / BU", "4.50")]));
        source.respond("WHEAT", Err(FetchError::permanent("API error 401")));
        source.respond("SOYBEANS", Ok(vec![]));
        let staging = Arc::new(MemoryStaging::default());
        let extractor = extractor(source, staging.clone());

        let tasks = vec![task("CORN"), task("WHEAT"), task("SOYBEANS")];
        let results = extractor.fetch_all(&tasks).await;

        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert!(results[2].as_ref().unwrap().is_empty());
        assert_eq!(staging.len(), 2);
    }

    #[tokio::test]
    async fn test_extract_fresh_drops_batches_from_other_task_sets() {
        let source = Arc::new(ScriptedSource::new());
        source.respond("OATS", Ok(vec![raw("2010", "IOWA", "OATS", "PRICE RECEIVED", "$ / BU", "2")]));
        source.respond("CORN", Ok(vec![raw("2023", "IOWA", "CORN", "PRICE RECEIVED", "$ / BU", "4.50")]));
        let staging = Arc::new(MemoryStaging::default());
        let extractor = extractor(source, staging.clone());

        extractor.fetch_all(&[task("OATS")]).await;
        let results = extractor.extract_fresh(&[task("CORN")]).await.unwrap();

        assert!(results[0].is_ok());
        assert_eq!(staging.keys().await.unwrap(), vec![task("CORN").staging_key()]);
    }

    #[tokio::test]
    async fn test_fetch_all_concurrent_keeps_task_order() {
        let source = Arc::new(ScriptedSource::new());
        let commodities = ["CORN", "WHEAT", "SOYBEANS", "OATS", "BARLEY"];
        for c in commodities {
            source.respond(c, Ok(vec![raw("2023", "IOWA", c, "PRICE RECEIVED", "$ / BU", "1")]));
        }
        let staging = Arc::new(MemoryStaging::default());
        let mut config = test_extract_config();
        config.concurrency = 3;
        let extractor = Extractor::new(source, staging.clone(), &config);

        let tasks: Vec<Task> = commodities.iter().map(|c| task(c)).collect();
        let results = extractor.fetch_all(&tasks).await;

        for (task, result) in tasks.iter().zip(&results) {
            assert_eq!(&result.as_ref().unwrap().task, task);
        }
        assert_eq!(staging.len(), 5);
    }
}
