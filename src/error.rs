use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Source access error at {path:?}: {source}")]
    SourceAccess {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Schema conflict on column '{column}': stored type {existing}, incoming type {incoming}")]
    SchemaConflict {
        column: String,
        existing: String,
        incoming: String,
    },

    #[error("Value '{value}' in {file:?} does not fit column '{column}' of type {data_type}")]
    InvalidValue {
        file: PathBuf,
        column: String,
        data_type: String,
        value: String,
    },

    #[error("Schema location {path:?} is corrupt: {reason}")]
    SchemaStoreCorrupt { path: PathBuf, reason: String },

    #[error("Table log at {path:?} is corrupt: {reason}")]
    TableCorrupt { path: PathBuf, reason: String },

    #[error("Checkpoint at {path:?} does not match this job: {reason}")]
    CheckpointMismatch { path: PathBuf, reason: String },

    #[error("Checkpoint at {path:?} is corrupt: {reason}")]
    CheckpointCorrupt { path: PathBuf, reason: String },

    #[error("Table not found at {0:?}")]
    TableNotFound(PathBuf),

    #[error("Table version {version} not found at {path:?}")]
    VersionNotFound { path: PathBuf, version: u64 },

    #[error("Columns {sources:?} all map to '{column}' after renaming")]
    DuplicateColumn { column: String, sources: Vec<String> },

    #[error("Another writer already committed version {version} at {path:?}")]
    CommitConflict { path: PathBuf, version: u64 },

    #[error("Dataset {dataset} failed: {source}")]
    Dataset {
        dataset: String,
        #[source]
        source: Box<IngestError>,
    },

    #[error("{} dataset(s) failed: {}", .0.len(), .0.join(", "))]
    DatasetsFailed(Vec<String>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Polars error: {0}")]
    Polars(String),
}

impl From<polars::error::PolarsError> for IngestError {
    fn from(err: polars::error::PolarsError) -> Self {
        IngestError::Polars(err.to_string())
    }
}

impl IngestError {
    /// Attach the dataset name so the operator can tell which job failed.
    pub fn for_dataset(self, dataset: impl Into<String>) -> Self {
        IngestError::Dataset {
            dataset: dataset.into(),
            source: Box::new(self),
        }
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;
