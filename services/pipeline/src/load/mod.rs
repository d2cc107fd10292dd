//! Load stage: scoped delete, then chunked appends.
//!
//! `Loader::load` is the only code path in the pipeline that writes to the
//! destination store.

mod postgres;

pub use postgres::PgStore;

use crate::error::{LoadError, StoreError};
use crate::model::{NormalizedRecord, ReplaceScope};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// Destination table operations the loader relies on. Each call is one
/// atomic statement or transaction in the store.
#[async_trait]
pub trait DestinationStore: Send + Sync {
    /// Delete the rows covered by `scope`; returns rows removed.
    async fn delete(&self, scope: &ReplaceScope) -> Result<u64, StoreError>;

    /// Append `rows` as a single unit.
    async fn append(&self, rows: &[NormalizedRecord]) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LoadResult {
    pub deleted: u64,
    pub chunks: usize,
    pub rows_loaded: usize,
    /// Dataset rows outside a `Subset` scope, not written.
    pub rows_skipped: usize,
}

pub struct Loader {
    store: Arc<dyn DestinationStore>,
    chunk_size: usize,
}

impl Loader {
    pub fn new(store: Arc<dyn DestinationStore>, chunk_size: usize) -> Self {
        Self {
            store,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Replace the rows covered by `scope` with the matching rows of
    /// `dataset`.
    ///
    /// On a chunk failure the store keeps the chunks committed so far; the
    /// error carries that row count and the run must be repeated in full.
    pub async fn load(
        &self,
        dataset: &[NormalizedRecord],
        scope: &ReplaceScope,
    ) -> Result<LoadResult, LoadError> {
        let rows: Vec<&NormalizedRecord> = dataset.iter().filter(|r| scope.covers(r)).collect();
        let rows_skipped = dataset.len() - rows.len();
        if rows_skipped > 0 {
            warn!(rows_skipped, %scope, "rows outside the replace scope were not loaded");
        }

        let deleted = self
            .store
            .delete(scope)
            .await
            .map_err(|source| LoadError::DeleteFailed {
                scope: scope.to_string(),
                source,
            })?;
        info!(deleted, %scope, "deleted previous rows");

        let mut committed = 0usize;
        let mut chunks = 0usize;
        for (index, chunk) in rows.chunks(self.chunk_size).enumerate() {
            let owned: Vec<NormalizedRecord> = chunk.iter().map(|r| (*r).clone()).collect();
            self.store
                .append(&owned)
                .await
                .map_err(|source| LoadError::ChunkInsertFailed {
                    chunk: index + 1,
                    committed,
                    source,
                })?;
            info!("Inserted rows {} to {}", committed, committed + owned.len());
            committed += owned.len();
            chunks += 1;
        }

        info!(rows_loaded = committed, chunks, "upload completed");
        Ok(LoadResult {
            deleted,
            chunks,
            rows_loaded: committed,
            rows_skipped,
        })
    }
}
