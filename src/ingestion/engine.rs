//! Ingestion Engine Trait - the streaming runtime the driver talks to
//!
//! Implementations:
//! - LocalEngine: filesystem-backed incremental ingestion into bronze tables
//! - test fakes that record calls

use crate::error::Result;
use crate::ingestion::schema_inference::{ColumnType, InferredSchema};
use crate::ingestion::table::TableCommit;
use polars::prelude::LazyFrame;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// How files under a landing path are parsed
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFormat {
    pub delimiter: u8,
    pub header: bool,
    pub infer_column_types: bool,
}

impl Default for SourceFormat {
    fn default() -> Self {
        Self {
            delimiter: b',',
            header: true,
            infer_column_types: true,
        }
    }
}

pub type ColumnRenamer = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// A started, not yet materialized, incremental read
#[derive(Clone)]
pub struct JobHandle {
    source: String,
    format: SourceFormat,
    schema_location: String,
    schema: InferredSchema,
    schema_persisted: bool,
    renamer: Option<ColumnRenamer>,
}

impl JobHandle {
    pub fn new(
        source: impl Into<String>,
        format: SourceFormat,
        schema_location: impl Into<String>,
        schema: InferredSchema,
        schema_persisted: bool,
    ) -> Self {
        Self {
            source: source.into(),
            format,
            schema_location: schema_location.into(),
            schema,
            schema_persisted,
            renamer: None,
        }
    }

    /// Rename output columns with `f`. Applies to columns added later by
    /// schema evolution too.
    pub fn rename_columns<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.renamer = Some(Arc::new(f));
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn format(&self) -> &SourceFormat {
        &self.format
    }

    pub fn schema_location(&self) -> &str {
        &self.schema_location
    }

    /// Schema keyed by source column names
    pub fn schema(&self) -> &InferredSchema {
        &self.schema
    }

    /// Whether `schema` was read from or written to the schema location
    pub fn schema_persisted(&self) -> bool {
        self.schema_persisted
    }

    pub fn output_name(&self, source_name: &str) -> String {
        match &self.renamer {
            Some(rename) => rename(source_name),
            None => source_name.to_string(),
        }
    }

    pub fn output_columns(&self) -> Vec<(String, ColumnType)> {
        self.schema
            .columns
            .iter()
            .map(|c| (self.output_name(&c.name), c.data_type))
            .collect()
    }

    /// Tree rendering of the output schema
    pub fn print_schema(&self) -> String {
        let mut out = String::from("root\n");
        for (name, data_type) in self.output_columns() {
            out.push_str(&format!(" |-- {}: {} (nullable = true)\n", name, data_type));
        }
        out
    }
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("source", &self.source)
            .field("format", &self.format)
            .field("schema_location", &self.schema_location)
            .field("schema", &self.schema)
            .field("renamed", &self.renamer.is_some())
            .finish()
    }
}

/// Outcome of one trigger-once write
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CommitResult {
    /// Batch processed, `None` when nothing new was found
    pub batch_id: Option<u64>,
    /// Landing files in the batch, relative to the landing path
    pub files: Vec<String>,
    pub rows_written: u64,
    /// Table version after the write, `None` when the table does not exist
    pub table_version: Option<u64>,
    pub schema_version: Option<u64>,
    /// The batch had been planned by an interrupted run and was finished here
    pub recovered: bool,
}

impl CommitResult {
    pub fn is_noop(&self) -> bool {
        self.batch_id.is_none()
    }
}

/// Ingestion Engine Trait
pub trait IngestionEngine: Send + Sync {
    /// Start an incremental read over `source`, keeping the inferred schema
    /// at `schema_location`.
    fn start_incremental_read(
        &self,
        source: &str,
        format: &SourceFormat,
        schema_location: &str,
    ) -> Result<JobHandle>;

    /// Process everything new under the job's source once, append it to the
    /// table at `destination`, and record progress at `checkpoint`.
    fn write_once_and_checkpoint(
        &self,
        job: JobHandle,
        destination: &str,
        checkpoint: &str,
    ) -> Result<CommitResult>;

    /// Latest table contents, or the contents as of `version`
    fn read_table_version(&self, path: &str, version: Option<u64>) -> Result<LazyFrame>;

    fn read_table(&self, path: &str) -> Result<LazyFrame> {
        self.read_table_version(path, None)
    }

    fn table_history(&self, path: &str) -> Result<Vec<TableCommit>>;

    /// Delete `path` and everything below it
    fn remove_recursive(&self, path: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::schema_inference::InferredColumn;
    use crate::normalize::normalize_column;

    fn handle() -> JobHandle {
        let schema = InferredSchema {
            version: 0,
            columns: vec![
                InferredColumn {
                    name: "Country".to_string(),
                    data_type: ColumnType::Utf8,
                },
                InferredColumn {
                    name: "GDP Value".to_string(),
                    data_type: ColumnType::Float64,
                },
            ],
        };
        JobHandle::new("/lake/landing/ocde/x", SourceFormat::default(), "/lake/schema/", schema, true)
    }

    #[test]
    fn test_rename_applies_to_output_only() {
        let job = handle().rename_columns(normalize_column);
        assert_eq!(job.schema().columns[1].name, "GDP Value");
        assert_eq!(
            job.output_columns(),
            vec![
                ("Country".to_string(), ColumnType::Utf8),
                ("GDP_Value".to_string(), ColumnType::Float64)
            ]
        );
    }

    #[test]
    fn test_print_schema() {
        let rendered = handle().rename_columns(normalize_column).print_schema();
        assert_eq!(
            rendered,
            "root\n |-- Country: string (nullable = true)\n |-- GDP_Value: double (nullable = true)\n"
        );
    }
}
