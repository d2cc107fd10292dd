//! In-memory stand-ins for the remote source, staging area and store.

use crate::config::ExtractConfig;
use crate::error::{FetchError, StagingError, StoreError};
use crate::extract::{StatsQuery, StatsSource};
use crate::load::DestinationStore;
use crate::model::{Metric, NormalizedRecord, RawBatch, RawRecord, ReplaceScope};
use crate::staging::StagingArea;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub fn test_extract_config() -> ExtractConfig {
    ExtractConfig {
        min_request_interval: Duration::ZERO,
        retry_backoff: Duration::from_millis(1),
        max_retries: 2,
        ..ExtractConfig::default()
    }
}

pub fn raw(year: &str, state: &str, commodity: &str, category: &str, unit: &str, value: &str) -> RawRecord {
    RawRecord {
        year: Some(year.to_string()),
        state_name: Some(state.to_string()),
        state_alpha: None,
        commodity_desc: Some(commodity.to_string()),
        statisticcat_desc: Some(category.to_string()),
        unit_desc: Some(unit.to_string()),
        reference_period_desc: Some("MARKETING YEAR".to_string()),
        value: Some(value.to_string()),
    }
}

pub fn record(year: i32, region: &str, commodity: &str, metric: Metric, value: Option<f64>) -> NormalizedRecord {
    NormalizedRecord {
        year,
        region_name: region.to_string(),
        commodity: commodity.to_string(),
        metric,
        unit: "$ / BU".to_string(),
        raw_value: value,
        derived_value_per_ton: None,
    }
}

// =============================================================================
// Source
// =============================================================================

/// Replays queued responses per commodity; an exhausted queue answers with
/// an empty result.
#[derive(Default)]
pub struct ScriptedSource {
    responses: Mutex<HashMap<String, VecDeque<Result<Vec<RawRecord>, FetchError>>>>,
    calls: Mutex<HashMap<String, usize>>,
    /// Answer every query with this error when set.
    fail_all: Option<fn() -> FetchError>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(error: fn() -> FetchError) -> Self {
        Self {
            fail_all: Some(error),
            ..Self::default()
        }
    }

    pub fn respond(&self, commodity: &str, response: Result<Vec<RawRecord>, FetchError>) {
        self.responses
            .lock()
            .unwrap()
            .entry(commodity.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn calls(&self, commodity: &str) -> usize {
        self.calls.lock().unwrap().get(commodity).copied().unwrap_or(0)
    }
}

#[async_trait]
impl StatsSource for ScriptedSource {
    async fn query(&self, query: &StatsQuery) -> Result<Vec<RawRecord>, FetchError> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(query.commodity.clone())
            .or_default() += 1;
        if let Some(error) = self.fail_all {
            return Err(error());
        }
        self.responses
            .lock()
            .unwrap()
            .get_mut(&query.commodity)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

// =============================================================================
// Staging
// =============================================================================

#[derive(Default)]
pub struct MemoryStaging {
    batches: Mutex<BTreeMap<String, Result<RawBatch, String>>>,
}

impl MemoryStaging {
    pub fn len(&self) -> usize {
        self.batches.lock().unwrap().len()
    }

    /// Stage an entry that fails to parse on read.
    pub fn put_corrupt(&self, key: &str) {
        self.batches
            .lock()
            .unwrap()
            .insert(key.to_string(), Err("{not json".to_string()));
    }
}

#[async_trait]
impl StagingArea for MemoryStaging {
    async fn put(&self, batch: &RawBatch) -> Result<String, StagingError> {
        let key = batch.task.staging_key();
        self.batches
            .lock()
            .unwrap()
            .insert(key.clone(), Ok(batch.clone()));
        Ok(key)
    }

    async fn get(&self, key: &str) -> Result<RawBatch, StagingError> {
        match self.batches.lock().unwrap().get(key) {
            Some(Ok(batch)) => Ok(batch.clone()),
            Some(Err(body)) => Err(StagingError::Parse {
                key: key.to_string(),
                source: serde_json::from_str::<RawBatch>(body)
                    .err()
                    .unwrap_or_else(|| serde::de::Error::custom("corrupt")),
            }),
            None => Err(StagingError::NotFound(key.to_string())),
        }
    }

    async fn keys(&self) -> Result<Vec<String>, StagingError> {
        Ok(self.batches.lock().unwrap().keys().cloned().collect())
    }

    async fn clear(&self) -> Result<(), StagingError> {
        self.batches.lock().unwrap().clear();
        Ok(())
    }
}

// =============================================================================
// Store
// =============================================================================

#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<Vec<NormalizedRecord>>,
    append_sizes: Mutex<Vec<usize>>,
    append_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    /// 1-based append call that fails.
    fail_on_append: Option<usize>,
    fail_delete: bool,
}

impl MemoryStore {
    pub fn with_rows(rows: Vec<NormalizedRecord>) -> Self {
        Self {
            rows: Mutex::new(rows),
            ..Self::default()
        }
    }

    pub fn failing_append(call: usize) -> Self {
        Self {
            fail_on_append: Some(call),
            ..Self::default()
        }
    }

    pub fn failing_delete() -> Self {
        Self {
            fail_delete: true,
            ..Self::default()
        }
    }

    pub fn rows(&self) -> Vec<NormalizedRecord> {
        self.rows.lock().unwrap().clone()
    }

    /// Sizes of the appends that succeeded.
    pub fn append_sizes(&self) -> Vec<usize> {
        self.append_sizes.lock().unwrap().clone()
    }

    pub fn touched(&self) -> bool {
        self.append_calls.load(Ordering::SeqCst) > 0 || self.delete_calls.load(Ordering::SeqCst) > 0
    }
}

#[async_trait]
impl DestinationStore for MemoryStore {
    async fn delete(&self, scope: &ReplaceScope) -> Result<u64, StoreError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_delete {
            return Err(StoreError::Other("lock wait timeout".to_string()));
        }
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|r| !scope.covers(r));
        Ok((before - rows.len()) as u64)
    }

    async fn append(&self, rows: &[NormalizedRecord]) -> Result<(), StoreError> {
        let call = self.append_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_append == Some(call) {
            return Err(StoreError::Other("connection lost".to_string()));
        }
        self.rows.lock().unwrap().extend_from_slice(rows);
        self.append_sizes.lock().unwrap().push(rows.len());
        Ok(())
    }
}
