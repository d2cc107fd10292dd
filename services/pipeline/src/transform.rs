//! Transform stage: staged raw batches in, canonical dataset out.
//!
//! Row problems never fail the stage. A row that cannot be normalized is
//! dropped and counted; a batch that cannot be read is skipped and counted.

use crate::artifact::CanonicalArtifact;
use crate::config::{PriceBounds, TransformConfig};
use crate::error::{PipelineError, StagingError};
use crate::model::{CanonicalDataset, Metric, NormalizedRecord, RawBatch, RawRecord, Task};
use crate::normalize::{convert_to_ton, normalize_unit, parse_number, parse_year};
use crate::staging::StagingArea;
use tracing::{debug, info, warn};

/// Why a row was left out of the dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    MissingYear,
    MissingRegion,
    MissingValue,
    OutOfRange,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransformStats {
    pub batches_read: usize,
    /// Staged batches that could not be read or parsed.
    pub batches_failed: usize,
    pub rows_in: usize,
    pub rows_out: usize,
    pub dropped_missing: usize,
    pub dropped_out_of_range: usize,
}

impl TransformStats {
    pub fn rows_dropped(&self) -> usize {
        self.dropped_missing + self.dropped_out_of_range
    }

    fn record_drop(&mut self, reason: DropReason) {
        match reason {
            DropReason::OutOfRange => self.dropped_out_of_range += 1,
            _ => self.dropped_missing += 1,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransformOutput {
    pub dataset: CanonicalDataset,
    pub stats: TransformStats,
}

#[derive(Debug, Clone, Default)]
pub struct Transformer {
    price_bounds: Option<PriceBounds>,
}

impl Transformer {
    pub fn new(config: &TransformConfig) -> Self {
        Self {
            price_bounds: config.price_bounds,
        }
    }

    /// Normalize one raw row in the context of its batch's task.
    pub fn normalize_row(&self, raw: &RawRecord, task: &Task) -> Result<NormalizedRecord, DropReason> {
        let year = raw
            .year
            .as_deref()
            .and_then(parse_year)
            .ok_or(DropReason::MissingYear)?;

        let region_name = raw
            .state_name
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(DropReason::MissingRegion)?
            .to_string();

        let raw_value = raw
            .value
            .as_deref()
            .and_then(parse_number)
            .ok_or(DropReason::MissingValue)?;

        // The batch's declared statistic category decides the metric.
        let metric = task.metric;
        if metric == Metric::Price {
            if let Some(bounds) = self.price_bounds {
                if !bounds.contains(raw_value) {
                    return Err(DropReason::OutOfRange);
                }
            }
        }

        let commodity = raw
            .commodity_desc
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(task.commodity.as_str())
            .to_uppercase();

        let unit = normalize_unit(raw.unit_desc.as_deref().unwrap_or_default());
        let derived_value_per_ton = convert_to_ton(Some(raw_value), &unit, &commodity);

        Ok(NormalizedRecord {
            year,
            region_name,
            commodity,
            metric,
            unit,
            raw_value: Some(raw_value),
            derived_value_per_ton,
        })
    }

    /// Normalize one batch. Returns the kept rows; drops are added to `stats`.
    pub fn process_batch(&self, batch: &RawBatch, stats: &mut TransformStats) -> Vec<NormalizedRecord> {
        let mut rows = Vec::with_capacity(batch.records.len());
        let mut dropped = 0usize;
        for raw in &batch.records {
            match self.normalize_row(raw, &batch.task) {
                Ok(row) => rows.push(row),
                Err(reason) => {
                    stats.record_drop(reason);
                    dropped += 1;
                }
            }
        }
        stats.rows_in += batch.records.len();
        stats.rows_out += rows.len();
        stats.batches_read += 1;

        if dropped > 0 {
            debug!(task = %batch.task, dropped, "removed rows with missing or invalid values");
        }
        debug!(task = %batch.task, rows = rows.len(), "processed batch");
        rows
    }

    /// Merge every batch by concatenation.
    pub fn transform(&self, batches: &[RawBatch]) -> TransformOutput {
        let mut stats = TransformStats::default();
        let mut dataset = CanonicalDataset::new();
        for batch in batches {
            dataset.extend(self.process_batch(batch, &mut stats));
        }
        TransformOutput { dataset, stats }
    }

    /// Transform everything currently staged. A batch that fails to load is
    /// skipped; only failing to list the staging area is an error.
    pub async fn transform_staged(&self, staging: &dyn StagingArea) -> Result<TransformOutput, StagingError> {
        let keys = staging.keys().await?;
        let mut stats = TransformStats::default();
        let mut dataset = CanonicalDataset::new();

        for key in &keys {
            match staging.get(key).await {
                Ok(batch) => dataset.extend(self.process_batch(&batch, &mut stats)),
                Err(e) => {
                    warn!(key = %key, error = %e, "skipping unreadable staged batch");
                    stats.batches_failed += 1;
                }
            }
        }

        info!(
            batches = stats.batches_read,
            failed = stats.batches_failed,
            rows_in = stats.rows_in,
            rows_out = stats.rows_out,
            dropped = stats.rows_dropped(),
            "combined staged batches"
        );
        Ok(TransformOutput { dataset, stats })
    }

    /// Transform everything staged and replace the canonical artifact with
    /// the result. An empty result removes the artifact, so a later load
    /// never picks up an earlier dataset.
    pub async fn transform_to_artifact(
        &self,
        staging: &dyn StagingArea,
        artifact: &CanonicalArtifact,
    ) -> Result<TransformOutput, PipelineError> {
        let output = self.transform_staged(staging).await?;
        if output.dataset.is_empty() {
            artifact.clear().await?;
        } else {
            artifact.write(&output.dataset).await?;
            info!(path = %artifact.path().display(), rows = output.dataset.len(), "saved canonical dataset");
        }
        Ok(output)
    }
}
