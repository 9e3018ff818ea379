//! Bronze Driver - runs every configured dataset through the engine
//!
//! Per dataset: derive paths, start the incremental read, normalize column
//! names, write once with checkpoint, then read the table back.

use crate::config::{FailurePolicy, IngestConfig};
use crate::dataset::DatasetId;
use crate::error::{IngestError, Result};
use crate::ingestion::{CommitResult, IngestionEngine, SourceFormat, TableCommit};
use crate::normalize::normalize_column;
use crate::paths::{BasePath, DatasetPaths, PathPlan};
use polars::prelude::*;
use tracing::{error, info, warn};

/// Result of ingesting one dataset
#[derive(Clone, Debug)]
pub struct DatasetOutcome {
    pub dataset: DatasetId,
    pub paths: DatasetPaths,
    pub commit: CommitResult,
    /// Columns of the table as read back
    pub columns: Vec<String>,
    pub table_rows: usize,
    /// First `display_rows` rows of the table
    pub preview: DataFrame,
}

#[derive(Debug)]
pub struct DatasetFailure {
    pub dataset: DatasetId,
    pub paths: DatasetPaths,
    pub error: IngestError,
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub succeeded: Vec<DatasetOutcome>,
    pub failed: Vec<DatasetFailure>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Outcomes when every dataset succeeded, otherwise `DatasetsFailed`
    pub fn into_result(self) -> Result<Vec<DatasetOutcome>> {
        if self.failed.is_empty() {
            return Ok(self.succeeded);
        }
        Err(IngestError::DatasetsFailed(
            self.failed
                .into_iter()
                .map(|f| f.dataset.to_string())
                .collect(),
        ))
    }
}

pub struct BronzeDriver<E: IngestionEngine> {
    engine: E,
    config: IngestConfig,
    plan: PathPlan,
}

impl<E: IngestionEngine> BronzeDriver<E> {
    pub fn new(engine: E, config: IngestConfig) -> Self {
        let plan = PathPlan::new(&config.storage.base_path, &config.datasets);
        Self {
            engine,
            config,
            plan,
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn plan(&self) -> &PathPlan {
        &self.plan
    }

    fn paths(&self, dataset: &DatasetId) -> Result<&DatasetPaths> {
        self.plan.get(dataset).ok_or_else(|| {
            IngestError::Config(format!("dataset '{}' is not configured", dataset))
        })
    }

    /// Ingest all configured datasets in order, honoring the failure policy.
    pub fn run(&self) -> Result<RunReport> {
        self.run_with(|_| {})
    }

    /// Like `run`, calling `on_outcome` as each dataset succeeds, before a
    /// later failure can stop the loop.
    pub fn run_with<F>(&self, mut on_outcome: F) -> Result<RunReport>
    where
        F: FnMut(&DatasetOutcome),
    {
        let mut report = RunReport::default();
        for (dataset, paths) in self.plan.iter() {
            info!("Ingesting {} from {}", dataset, paths.landing);
            match self.ingest_dataset(dataset, paths) {
                Ok(outcome) => {
                    on_outcome(&outcome);
                    report.succeeded.push(outcome);
                }
                Err(err) => {
                    error!(
                        "{} failed (landing: {}, bronze: {}): {}",
                        dataset, paths.landing, paths.bronze, err
                    );
                    let err = err.for_dataset(dataset.as_str());
                    match self.config.failure_policy {
                        FailurePolicy::FailFast => return Err(err),
                        FailurePolicy::ContinueOnError => report.failed.push(DatasetFailure {
                            dataset: dataset.clone(),
                            paths: paths.clone(),
                            error: err,
                        }),
                    }
                }
            }
        }

        if !report.is_success() {
            warn!(
                "{} of {} datasets failed",
                report.failed.len(),
                self.plan.len()
            );
        }
        Ok(report)
    }

    pub fn ingest_dataset(&self, dataset: &DatasetId, paths: &DatasetPaths) -> Result<DatasetOutcome> {
        let job = self
            .engine
            .start_incremental_read(&paths.landing, &SourceFormat::default(), &paths.schema)?
            .rename_columns(normalize_column);

        let commit = self
            .engine
            .write_once_and_checkpoint(job, &paths.bronze, &paths.checkpoint)?;
        if commit.is_noop() {
            info!("{}: nothing new to ingest", dataset);
        } else {
            info!(
                "{}: batch {:?} wrote {} rows from {} files",
                dataset,
                commit.batch_id,
                commit.rows_written,
                commit.files.len()
            );
        }

        let table = match self.engine.read_table(&paths.bronze) {
            Ok(frame) => frame.collect()?,
            Err(err @ IngestError::TableNotFound(_)) => {
                warn!(
                    "{}: no bronze table yet at {}; {} has not delivered any file",
                    dataset, paths.bronze, paths.landing
                );
                return Err(err);
            }
            Err(err) => return Err(err),
        };
        let preview = table.head(Some(self.config.display_rows));

        Ok(DatasetOutcome {
            dataset: dataset.clone(),
            paths: paths.clone(),
            commit,
            columns: table
                .get_column_names()
                .into_iter()
                .map(str::to_string)
                .collect(),
            table_rows: table.height(),
            preview,
        })
    }

    /// Table contents for `dataset`, latest or as of `version`
    pub fn read_back(&self, dataset: &DatasetId, version: Option<u64>) -> Result<LazyFrame> {
        let paths = self.paths(dataset)?;
        self.engine.read_table_version(&paths.bronze, version)
    }

    /// First `display_rows` rows of `frame`
    pub fn preview(&self, frame: LazyFrame) -> Result<DataFrame> {
        Ok(frame.limit(self.config.display_rows as IdxSize).collect()?)
    }

    /// Normalized schema the next write would use, as a tree
    pub fn describe_schema(&self, dataset: &DatasetId) -> Result<String> {
        let paths = self.paths(dataset)?;
        let job = self
            .engine
            .start_incremental_read(&paths.landing, &SourceFormat::default(), &paths.schema)?
            .rename_columns(normalize_column);
        Ok(job.print_schema())
    }

    pub fn history(&self, dataset: &DatasetId) -> Result<Vec<TableCommit>> {
        let paths = self.paths(dataset)?;
        self.engine.table_history(&paths.bronze)
    }

    /// Delete everything under the base path. `confirmation` must name the
    /// base path itself.
    pub fn purge(&self, confirmation: &str) -> Result<()> {
        let base = &self.config.storage.base_path;
        let confirmed = BasePath::parse(confirmation)
            .map(|c| &c == base)
            .unwrap_or(false);
        if !confirmed {
            return Err(IngestError::Config(format!(
                "purge refused: confirmation '{}' does not match base path '{}'",
                confirmation, base
            )));
        }
        warn!("Purging {}", base);
        self.engine.remove_recursive(base.as_str())
    }
}
