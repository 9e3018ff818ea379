pub mod config;
pub mod dataset;
pub mod driver;
pub mod error;
pub mod ingestion;
pub mod normalize;
pub mod paths;

pub use config::{FailurePolicy, IngestConfig, IngestFileConfig, StorageConfig, StorageCredential};
pub use dataset::{DatasetId, OCDE_DATASETS};
pub use driver::{BronzeDriver, DatasetFailure, DatasetOutcome, RunReport};
pub use error::{IngestError, Result};
pub use ingestion::{IngestionEngine, LocalEngine};
pub use normalize::{normalize_column, normalize_columns};
pub use paths::{BasePath, DatasetPaths, PathPlan};
