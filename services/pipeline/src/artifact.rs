//! Durable CSV copy of the canonical dataset, so Load can be retried
//! without re-running Transform.

use crate::error::ArtifactError;
use crate::model::{CanonicalDataset, NormalizedRecord};
use std::path::{Path, PathBuf};
use tokio::fs;

/// Column order of the artifact.
pub const COLUMNS: &[&str] = &[
    "year",
    "region_name",
    "commodity",
    "metric",
    "unit",
    "raw_value",
    "derived_value_per_ton",
];

#[derive(Debug, Clone)]
pub struct CanonicalArtifact {
    path: PathBuf,
}

impl CanonicalArtifact {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> ArtifactError {
        ArtifactError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Replace the artifact with `dataset`.
    pub async fn write(&self, dataset: &[NormalizedRecord]) -> Result<(), ArtifactError> {
        let bytes = encode(dataset)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(|e| self.io_error(e))?;
        }
        fs::write(&self.path, bytes).await.map_err(|e| self.io_error(e))
    }

    pub async fn read(&self) -> Result<CanonicalDataset, ArtifactError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ArtifactError::NotFound(self.path.clone()))
            }
            Err(e) => return Err(self.io_error(e)),
        };
        decode(&bytes)
    }

    /// Remove the artifact; a missing file is not an error.
    pub async fn clear(&self) -> Result<(), ArtifactError> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_error(e)),
        }
    }
}

fn encode(dataset: &[NormalizedRecord]) -> Result<Vec<u8>, ArtifactError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer.write_record(COLUMNS)?;
    for row in dataset {
        writer.serialize(row)?;
    }
    writer
        .into_inner()
        .map_err(|e| ArtifactError::Csv(csv::Error::from(e.into_error())))
}

fn decode(bytes: &[u8]) -> Result<CanonicalDataset, ArtifactError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(bytes);
    let mut dataset = CanonicalDataset::new();
    for row in reader.deserialize() {
        dataset.push(row?);
    }
    Ok(dataset)
}
