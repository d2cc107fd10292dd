use std::path::PathBuf;
use thiserror::Error;

/// Whether retrying the same request can succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    /// Timeout, connection failure, 5xx, 429.
    Transient,
    /// 4xx or a payload that will not parse.
    Permanent,
}

#[derive(Error, Debug)]
#[error("{kind:?} fetch error: {cause}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub cause: String,
}

impl FetchError {
    pub fn transient(cause: impl Into<String>) -> Self {
        Self {
            kind: FetchErrorKind::Transient,
            cause: cause.into(),
        }
    }

    pub fn permanent(cause: impl Into<String>) -> Self {
        Self {
            kind: FetchErrorKind::Permanent,
            cause: cause.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == FetchErrorKind::Transient
    }
}

#[derive(Error, Debug)]
pub enum StagingError {
    #[error("staging I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed staged batch '{key}': {source}")]
    Parse {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("staged batch '{0}' not found")]
    NotFound(String),
}

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("artifact I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("artifact CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("artifact not found at {0}")]
    NotFound(PathBuf),
}

/// Error raised by a destination store statement.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{0}")]
    Other(String),
}

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("delete for scope {scope} failed, no rows inserted: {source}")]
    DeleteFailed {
        scope: String,
        #[source]
        source: StoreError,
    },

    #[error("chunk {chunk} insert failed after {committed} committed rows: {source}")]
    ChunkInsertFailed {
        chunk: usize,
        committed: usize,
        #[source]
        source: StoreError,
    },
}

impl LoadError {
    /// Rows durably appended before the failure.
    pub fn committed(&self) -> usize {
        match self {
            LoadError::DeleteFailed { .. } => 0,
            LoadError::ChunkInsertFailed { committed, .. } => *committed,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} env var missing")]
    Missing(&'static str),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Infrastructure failure that stops a run before it reaches a terminal state.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}
