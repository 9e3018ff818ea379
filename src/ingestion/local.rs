//! Local Engine - incremental CSV ingestion into bronze tables on a local
//! filesystem (bare paths or `file://` locations under the base path)

use crate::config::StorageConfig;
use crate::error::{IngestError, Result};
use crate::ingestion::checkpoint::{BatchCommit, CheckpointStore, NextBatch};
use crate::ingestion::csv_source::{discover_files, read_raw, RawTable, SourceFile};
use crate::ingestion::engine::{CommitResult, IngestionEngine, JobHandle, SourceFormat};
use crate::ingestion::schema_inference::{
    ColumnType, InferredSchema, SchemaEvolution, SchemaInference, SchemaStore,
};
use crate::ingestion::table::{BronzeTable, TableColumn, TableCommit, TxnMarker};
use crate::paths::BasePath;
use chrono::Utc;
use itertools::Itertools;
use polars::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub struct LocalEngine {
    base: BasePath,
}

impl LocalEngine {
    /// Validate the credential and bind the engine to the base path. Must
    /// succeed before any storage access.
    pub fn connect(config: &StorageConfig) -> Result<Self> {
        let credential = config.validate()?;
        match config.base_path.scheme() {
            None | Some("file") => {}
            Some(other) => {
                return Err(IngestError::Config(format!(
                    "the local engine cannot reach '{}://' locations",
                    other
                )))
            }
        }
        info!(
            "Connected to {} (account: {})",
            config.base_path,
            credential.account.as_deref().unwrap_or("default")
        );
        Ok(Self {
            base: config.base_path.clone(),
        })
    }

    fn resolve(&self, location: &str) -> Result<PathBuf> {
        if !location.starts_with(self.base.as_str()) {
            return Err(IngestError::Config(format!(
                "location '{}' is outside the base path '{}'",
                location, self.base
            )));
        }
        let local = location.strip_prefix("file://").unwrap_or(location);
        Ok(PathBuf::from(local))
    }

    fn read_files(
        &self,
        root: &Path,
        files: &[SourceFile],
        format: &SourceFormat,
    ) -> Result<Vec<(PathBuf, RawTable)>> {
        files
            .iter()
            .map(|file| {
                let path = file.absolute(root);
                read_raw(&path, format).map(|table| (path, table))
            })
            .collect()
    }
}

impl IngestionEngine for LocalEngine {
    fn start_incremental_read(
        &self,
        source: &str,
        format: &SourceFormat,
        schema_location: &str,
    ) -> Result<JobHandle> {
        let root = self.resolve(source)?;
        let files = discover_files(&root)?;
        let store = SchemaStore::new(self.resolve(schema_location)?);

        let (schema, persisted) = match store.latest()? {
            Some(schema) => {
                debug!("Reusing schema version {} from {}", schema.version, schema_location);
                (schema, true)
            }
            None if files.is_empty() => {
                info!("No files under {} yet, starting with an empty schema", source);
                (InferredSchema::empty(), false)
            }
            None => {
                // Kept on the handle only; the first write persists it
                let tables = self.read_files(&root, &files, format)?;
                let inference = SchemaInference::new(format.infer_column_types);
                let tables: Vec<RawTable> = tables.into_iter().map(|(_, t)| t).collect();
                let schema = inference.infer_schema(&tables);
                info!(
                    "Inferred {} columns from {} files under {}",
                    schema.columns.len(),
                    files.len(),
                    source
                );
                (schema, false)
            }
        };

        Ok(JobHandle::new(
            source,
            format.clone(),
            schema_location,
            schema,
            persisted,
        ))
    }

    fn write_once_and_checkpoint(
        &self,
        job: JobHandle,
        destination: &str,
        checkpoint: &str,
    ) -> Result<CommitResult> {
        let source_root = self.resolve(job.source())?;
        let table = BronzeTable::at(self.resolve(destination)?);
        let checkpoint_path = self.resolve(checkpoint)?;
        let checkpoint = CheckpointStore::open_or_create(&checkpoint_path, job.source(), destination)?;
        let query_id = checkpoint.query_id();

        let foreign = table.foreign_queries(query_id)?;
        if !foreign.is_empty() {
            return Err(IngestError::CheckpointMismatch {
                path: checkpoint_path,
                reason: format!(
                    "table {} already holds batches from query {}; its checkpoint was replaced",
                    destination,
                    foreign.iter().join(", ")
                ),
            });
        }
        let latest_planned = checkpoint.latest_batch()?;
        if let Some(committed) = table.max_txn_batch(query_id)? {
            if Some(committed) > latest_planned {
                return Err(IngestError::CheckpointMismatch {
                    path: checkpoint_path,
                    reason: format!(
                        "table holds batch {} but the checkpoint stops at {:?}",
                        committed, latest_planned
                    ),
                });
            }
        }

        let (batch, recovered) = match checkpoint.next_batch()? {
            NextBatch::Resume(batch) => {
                warn!(
                    "Batch {} for {} was planned but never committed, running it again",
                    batch.batch_id, destination
                );
                (batch, true)
            }
            NextBatch::Fresh { batch_id, seen } => {
                let new_files: Vec<SourceFile> = discover_files(&source_root)?
                    .into_iter()
                    .filter(|f| !seen.contains(&f.relative))
                    .collect();
                if new_files.is_empty() {
                    info!("No new files under {}", job.source());
                    return Ok(CommitResult {
                        table_version: table.latest_version()?,
                        schema_version: job.schema_persisted().then(|| job.schema().version),
                        ..CommitResult::default()
                    });
                }
                (checkpoint.plan_batch(batch_id, new_files)?, false)
            }
        };
        let batch_id = batch.batch_id;
        let file_names: Vec<String> = batch.files.iter().map(|f| f.relative.clone()).collect();

        // The table commit landed but the checkpoint commit did not
        if let Some(commit) = table.find_txn(query_id, batch_id)? {
            info!(
                "Batch {} already in {} as version {}, completing checkpoint",
                batch_id, destination, commit.version
            );
            checkpoint.commit_batch(&BatchCommit {
                batch_id,
                rows_written: commit.num_rows(),
                table_version: commit.version,
                committed_at: Utc::now(),
            })?;
            return Ok(CommitResult {
                batch_id: Some(batch_id),
                files: file_names,
                rows_written: commit.num_rows(),
                table_version: Some(commit.version),
                schema_version: job.schema_persisted().then(|| job.schema().version),
                recovered: true,
            });
        }

        let tables = self.read_files(&source_root, &batch.files, job.format())?;

        let inference = SchemaInference::new(job.format().infer_column_types);
        let mut observed = Vec::new();
        for (_, raw) in &tables {
            inference.observe(&mut observed, raw);
        }
        // An unpersisted schema is provisional: the first batch defines version 0
        let base = if job.schema_persisted() {
            job.schema().clone()
        } else {
            InferredSchema::empty()
        };
        let evolution = inference.compare_schema(&base, job.schema_persisted(), &observed)?;
        let schema = inference.apply(&base, &evolution);
        if let SchemaEvolution::AddColumns { columns, new_version } = &evolution {
            SchemaStore::new(self.resolve(job.schema_location())?).save(&schema)?;
            info!(
                "Schema for {} saved as version {} (added {})",
                job.source(),
                new_version,
                columns.iter().map(|c| c.name.as_str()).join(", ")
            );
        }

        let output: Vec<TableColumn> = schema
            .columns
            .iter()
            .map(|c| TableColumn {
                name: job.output_name(&c.name),
                data_type: c.data_type,
            })
            .collect();
        if let Some(duplicate) = output.iter().map(|c| &c.name).duplicates().next() {
            let sources = schema
                .columns
                .iter()
                .filter(|c| &job.output_name(&c.name) == duplicate)
                .map(|c| c.name.clone())
                .collect();
            return Err(IngestError::DuplicateColumn {
                column: duplicate.clone(),
                sources,
            });
        }

        let mut df = build_frame(&schema, &output, &tables)?;
        let commit = table.append(
            &mut df,
            &output,
            TxnMarker { query_id, batch_id },
            file_names.clone(),
        )?;
        checkpoint.commit_batch(&BatchCommit {
            batch_id,
            rows_written: commit.num_rows(),
            table_version: commit.version,
            committed_at: Utc::now(),
        })?;

        info!(
            "Batch {} wrote {} rows from {} files to {} (version {})",
            batch_id,
            commit.num_rows(),
            file_names.len(),
            destination,
            commit.version
        );

        Ok(CommitResult {
            batch_id: Some(batch_id),
            files: file_names,
            rows_written: commit.num_rows(),
            table_version: Some(commit.version),
            schema_version: (job.schema_persisted() || evolution != SchemaEvolution::NoChange)
                .then(|| schema.version),
            recovered,
        })
    }

    fn read_table_version(&self, path: &str, version: Option<u64>) -> Result<LazyFrame> {
        BronzeTable::at(self.resolve(path)?).scan(version)
    }

    fn table_history(&self, path: &str) -> Result<Vec<TableCommit>> {
        let root = self.resolve(path)?;
        let history = BronzeTable::at(&root).history()?;
        if history.is_empty() {
            return Err(IngestError::TableNotFound(root));
        }
        Ok(history)
    }

    fn remove_recursive(&self, path: &str) -> Result<()> {
        let root = self.resolve(path)?;
        match fs::symlink_metadata(&root) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&root)?,
            Ok(_) => fs::remove_file(&root)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Nothing to remove at {:?}", root);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
        warn!("Removed {:?} and everything below it", root);
        Ok(())
    }
}

enum ColumnBuffer {
    Boolean(Vec<Option<bool>>),
    Int64(Vec<Option<i64>>),
    Float64(Vec<Option<f64>>),
    Utf8(Vec<Option<String>>),
}

impl ColumnBuffer {
    fn new(data_type: ColumnType) -> Self {
        match data_type {
            ColumnType::Boolean => ColumnBuffer::Boolean(Vec::new()),
            ColumnType::Int64 => ColumnBuffer::Int64(Vec::new()),
            ColumnType::Float64 => ColumnBuffer::Float64(Vec::new()),
            ColumnType::Utf8 => ColumnBuffer::Utf8(Vec::new()),
        }
    }

    /// Returns `false` when the cell does not parse as the column type.
    /// Strings are kept as read; only typed values are trimmed.
    fn push(&mut self, raw: Option<&str>) -> bool {
        let raw = raw.filter(|c| !c.is_empty());
        let cell = raw.map(str::trim).filter(|c| !c.is_empty());
        match self {
            ColumnBuffer::Boolean(values) => match cell {
                None => values.push(None),
                Some(c) if c.eq_ignore_ascii_case("true") => values.push(Some(true)),
                Some(c) if c.eq_ignore_ascii_case("false") => values.push(Some(false)),
                Some(_) => return false,
            },
            ColumnBuffer::Int64(values) => match cell.map(str::parse::<i64>) {
                None => values.push(None),
                Some(Ok(v)) => values.push(Some(v)),
                Some(Err(_)) => return false,
            },
            ColumnBuffer::Float64(values) => match cell.map(str::parse::<f64>) {
                None => values.push(None),
                Some(Ok(v)) => values.push(Some(v)),
                Some(Err(_)) => return false,
            },
            ColumnBuffer::Utf8(values) => values.push(raw.map(str::to_string)),
        }
        true
    }

    fn into_series(self, name: &str) -> Series {
        match self {
            ColumnBuffer::Boolean(values) => Series::new(name, values),
            ColumnBuffer::Int64(values) => Series::new(name, values),
            ColumnBuffer::Float64(values) => Series::new(name, values),
            ColumnBuffer::Utf8(values) => Series::new(name, values),
        }
    }
}

/// Typed frame for one batch. Columns a file lacks are null for its rows.
fn build_frame(
    schema: &InferredSchema,
    output: &[TableColumn],
    tables: &[(PathBuf, RawTable)],
) -> Result<DataFrame> {
    let mut buffers: Vec<ColumnBuffer> = schema
        .columns
        .iter()
        .map(|c| ColumnBuffer::new(c.data_type))
        .collect();

    for (path, raw) in tables {
        let positions: Vec<Option<usize>> = schema
            .columns
            .iter()
            .map(|c| raw.headers.iter().position(|h| h == &c.name))
            .collect();

        for row in &raw.rows {
            for ((buffer, position), column) in buffers.iter_mut().zip(&positions).zip(&schema.columns) {
                let cell = position.and_then(|idx| row.get(idx)).map(String::as_str);
                if !buffer.push(cell) {
                    return Err(IngestError::InvalidValue {
                        file: path.clone(),
                        column: column.name.clone(),
                        data_type: column.data_type.to_string(),
                        value: cell.unwrap_or_default().to_string(),
                    });
                }
            }
        }
    }

    let series: Vec<Series> = buffers
        .into_iter()
        .zip(output)
        .map(|(buffer, column)| buffer.into_series(&column.name))
        .collect();
    Ok(DataFrame::new(series)?)
}
