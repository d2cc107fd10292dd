//! QuickStats ETL pipeline.
//!
//! Extract → Transform → Load, driven by the [`orchestrator::Orchestrator`]:
//! - `extract`: one remote query per (commodity, metric, region, years) task,
//!   sentinel cleaning, per-task staging with overwrite
//! - `transform`: numeric/unit normalization and row validation into one
//!   canonical dataset, persisted as CSV
//! - `load`: scoped delete plus chunked appends into the destination table

pub mod artifact;
pub mod config;
pub mod error;
pub mod extract;
pub mod load;
pub mod logging;
pub mod model;
pub mod normalize;
pub mod orchestrator;
pub mod staging;
pub mod transform;

#[cfg(test)]
pub(crate) mod testing;
