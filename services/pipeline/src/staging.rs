//! Key-value staging area for raw batches.
//!
//! One entry per Task, keyed by `Task::staging_key`. Writing the same key
//! twice replaces the earlier batch.

use crate::error::StagingError;
use crate::model::RawBatch;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;

#[async_trait]
pub trait StagingArea: Send + Sync {
    /// Store `batch`, replacing any batch with the same key. Returns the key.
    async fn put(&self, batch: &RawBatch) -> Result<String, StagingError>;

    async fn get(&self, key: &str) -> Result<RawBatch, StagingError>;

    /// All staged keys, sorted.
    async fn keys(&self) -> Result<Vec<String>, StagingError>;

    /// Remove every staged batch.
    async fn clear(&self) -> Result<(), StagingError>;
}

/// Filesystem staging: `<dir>/<key>.json`.
#[derive(Debug, Clone)]
pub struct FsStaging {
    dir: PathBuf,
}

impl FsStaging {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    fn io_error(path: &Path, source: std::io::Error) -> StagingError {
        StagingError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[async_trait]
impl StagingArea for FsStaging {
    async fn put(&self, batch: &RawBatch) -> Result<String, StagingError> {
        let key = batch.task.staging_key();
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Self::io_error(&self.dir, e))?;

        let json = serde_json::to_vec_pretty(batch).map_err(|source| StagingError::Parse {
            key: key.clone(),
            source,
        })?;

        // Write then rename so a reader never sees a half-written batch.
        let path = self.path_for(&key);
        let tmp = self.dir.join(format!(".{}.json.tmp", key));
        fs::write(&tmp, &json)
            .await
            .map_err(|e| Self::io_error(&tmp, e))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| Self::io_error(&path, e))?;

        Ok(key)
    }

    async fn get(&self, key: &str) -> Result<RawBatch, StagingError> {
        let path = self.path_for(key);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StagingError::NotFound(key.to_string()))
            }
            Err(e) => return Err(Self::io_error(&path, e)),
        };
        serde_json::from_slice(&bytes).map_err(|source| StagingError::Parse {
            key: key.to_string(),
            source,
        })
    }

    async fn keys(&self) -> Result<Vec<String>, StagingError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Self::io_error(&self.dir, e)),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Self::io_error(&self.dir, e))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            if let Some(key) = name.strip_suffix(".json") {
                keys.push(key.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn clear(&self) -> Result<(), StagingError> {
        for key in self.keys().await? {
            let path = self.path_for(&key);
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Self::io_error(&path, e)),
            }
        }
        Ok(())
    }
}
