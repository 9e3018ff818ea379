//! Bronze Table - append-only parquet parts tracked by a versioned JSON log
//!
//! Layout under the table path:
//! - `_bronze_log/{version:020}.json`: one commit per version, created exclusively
//! - `part-{version:05}-{uuid}.parquet`: rows added by that version
//!
//! Reading any version replays the log up to it, so older versions stay
//! readable (time travel) for as long as their part files exist.

use crate::error::{IngestError, Result};
use crate::ingestion::durable::{list_numbered, read_json, write_json_new};
use crate::ingestion::schema_inference::ColumnType;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

const LOG_DIR: &str = "_bronze_log";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableColumn {
    pub name: String,
    pub data_type: ColumnType,
}

/// Identifies the streaming batch that produced a commit
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnMarker {
    pub query_id: Uuid,
    pub batch_id: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddedFile {
    /// Relative to the table root
    pub path: String,
    pub columns: Vec<String>,
    pub num_rows: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableCommit {
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    pub txn: Option<TxnMarker>,
    /// Full table schema as of this version
    pub schema: Vec<TableColumn>,
    pub added_files: Vec<AddedFile>,
    /// Landing files the rows came from
    pub source_files: Vec<String>,
}

impl TableCommit {
    pub fn num_rows(&self) -> u64 {
        self.added_files.iter().map(|f| f.num_rows).sum()
    }
}

pub struct BronzeTable {
    root: PathBuf,
}

impl BronzeTable {
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn log_dir(&self) -> PathBuf {
        self.root.join(LOG_DIR)
    }

    fn corrupt(&self, path: &Path, reason: String) -> IngestError {
        IngestError::TableCorrupt {
            path: path.to_path_buf(),
            reason,
        }
    }

    /// All commits in version order. Empty when the table does not exist.
    pub fn history(&self) -> Result<Vec<TableCommit>> {
        let mut commits = Vec::new();
        for (expected, (version, path)) in list_numbered(&self.log_dir())?.into_iter().enumerate() {
            if version != expected as u64 {
                return Err(self.corrupt(&path, format!("version {} is missing from the log", expected)));
            }
            let commit: TableCommit = read_json(&path).map_err(|reason| self.corrupt(&path, reason))?;
            if commit.version != version {
                return Err(self.corrupt(
                    &path,
                    format!("file holds version {} instead of {}", commit.version, version),
                ));
            }
            commits.push(commit);
        }
        Ok(commits)
    }

    pub fn latest_version(&self) -> Result<Option<u64>> {
        Ok(list_numbered(&self.log_dir())?.last().map(|(v, _)| *v))
    }

    pub fn exists(&self) -> Result<bool> {
        Ok(self.latest_version()?.is_some())
    }

    /// Commit written by batch `batch_id` of query `query_id`, if any
    pub fn find_txn(&self, query_id: Uuid, batch_id: u64) -> Result<Option<TableCommit>> {
        Ok(self
            .history()?
            .into_iter()
            .find(|c| c.txn == Some(TxnMarker { query_id, batch_id })))
    }

    /// Queries other than `query_id` that have streamed into this table
    pub fn foreign_queries(&self, query_id: Uuid) -> Result<Vec<Uuid>> {
        Ok(self
            .history()?
            .iter()
            .filter_map(|c| c.txn.map(|t| t.query_id))
            .filter(|q| *q != query_id)
            .unique()
            .collect())
    }

    /// Highest batch id `query_id` has committed to this table
    pub fn max_txn_batch(&self, query_id: Uuid) -> Result<Option<u64>> {
        Ok(self
            .history()?
            .iter()
            .filter_map(|c| c.txn)
            .filter(|t| t.query_id == query_id)
            .map(|t| t.batch_id)
            .max())
    }

    /// Append `df` as a new version. Columns must already carry their
    /// final names and types.
    pub fn append(
        &self,
        df: &mut DataFrame,
        columns: &[TableColumn],
        txn: TxnMarker,
        source_files: Vec<String>,
    ) -> Result<TableCommit> {
        let history = self.history()?;
        let version = history.len() as u64;
        let schema = merge_table_schema(history.last().map(|c| c.schema.as_slice()), columns)?;

        fs::create_dir_all(&self.root)?;
        let mut added_files = Vec::new();
        let mut part_path = None;
        if df.height() > 0 {
            let name = format!("part-{:05}-{}.parquet", version, Uuid::new_v4());
            let path = self.root.join(&name);
            let mut file = File::create(&path)?;
            ParquetWriter::new(&mut file).finish(df)?;
            added_files.push(AddedFile {
                path: name,
                columns: columns.iter().map(|c| c.name.clone()).collect(),
                num_rows: df.height() as u64,
            });
            part_path = Some(path);
        }

        let commit = TableCommit {
            version,
            timestamp: Utc::now(),
            operation: "STREAMING UPDATE".to_string(),
            txn: Some(txn),
            schema,
            added_files,
            source_files,
        };

        let log_path = self.log_dir().join(format!("{:020}.json", version));
        if !write_json_new(&log_path, &commit)? {
            if let Some(path) = part_path {
                let _ = fs::remove_file(path);
            }
            return Err(IngestError::CommitConflict {
                path: self.root.clone(),
                version,
            });
        }
        debug!(
            "Committed version {} to {:?} ({} rows)",
            version,
            self.root,
            commit.num_rows()
        );
        Ok(commit)
    }

    /// Lazily load the table as of `version`, or the latest version.
    pub fn scan(&self, version: Option<u64>) -> Result<LazyFrame> {
        let history = self.history()?;
        let Some(latest) = history.last() else {
            return Err(IngestError::TableNotFound(self.root.clone()));
        };
        let target = version.unwrap_or(latest.version);
        if target > latest.version {
            return Err(IngestError::VersionNotFound {
                path: self.root.clone(),
                version: target,
            });
        }

        let schema = &history[target as usize].schema;
        let parts: Vec<&AddedFile> = history[..=target as usize]
            .iter()
            .flat_map(|c| c.added_files.iter())
            .collect();

        if parts.is_empty() {
            let empty: Vec<Series> = schema
                .iter()
                .map(|c| Series::new_empty(&c.name, &c.data_type.polars_dtype()))
                .collect();
            return Ok(DataFrame::new(empty)?.lazy());
        }

        let mut frames = Vec::with_capacity(parts.len());
        for part in parts {
            // Parts written before a column existed get it back as nulls
            let projection: Vec<Expr> = schema
                .iter()
                .map(|c| {
                    let dtype = c.data_type.polars_dtype();
                    if part.columns.contains(&c.name) {
                        col(&c.name).cast(dtype)
                    } else {
                        Expr::Literal(LiteralValue::Null).cast(dtype).alias(&c.name)
                    }
                })
                .collect();
            let frame = LazyFrame::scan_parquet(self.root.join(&part.path), ScanArgsParquet::default())?
                .select(projection);
            frames.push(frame);
        }

        Ok(concat(frames, UnionArgs::default())?)
    }
}

/// Previous table schema extended with any new columns. A column cannot
/// change type once stored.
fn merge_table_schema(
    previous: Option<&[TableColumn]>,
    incoming: &[TableColumn],
) -> Result<Vec<TableColumn>> {
    let mut schema = previous.map(|p| p.to_vec()).unwrap_or_default();
    for column in incoming {
        match schema.iter().find(|c| c.name == column.name) {
            Some(stored) if stored.data_type != column.data_type => {
                return Err(IngestError::SchemaConflict {
                    column: column.name.clone(),
                    existing: stored.data_type.to_string(),
                    incoming: column.data_type.to_string(),
                });
            }
            Some(_) => {}
            None => schema.push(column.clone()),
        }
    }
    Ok(schema)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn txn(batch_id: u64) -> TxnMarker {
        TxnMarker {
            query_id: Uuid::nil(),
            batch_id,
        }
    }

    fn column(name: &str, data_type: ColumnType) -> TableColumn {
        TableColumn {
            name: name.to_string(),
            data_type,
        }
    }

    #[test]
    fn test_missing_table() {
        let dir = TempDir::new().unwrap();
        let table = BronzeTable::at(dir.path().join("gdp"));
        assert!(!table.exists().unwrap());
        assert!(matches!(table.scan(None), Err(IngestError::TableNotFound(_))));
    }

    #[test]
    fn test_append_and_time_travel() {
        let dir = TempDir::new().unwrap();
        let table = BronzeTable::at(dir.path().join("gdp"));

        let mut first = df! ["Country" => ["ES"], "Value" => [1.2]].unwrap();
        let columns = vec![column("Country", ColumnType::Utf8), column("Value", ColumnType::Float64)];
        table.append(&mut first, &columns, txn(0), vec!["a.csv".to_string()]).unwrap();

        let mut second = df! [
            "Country" => ["FR", "DE"],
            "Value" => [2.0, 3.5],
            "Unit" => ["USD", "USD"]
        ]
        .unwrap();
        let mut wider = columns.clone();
        wider.push(column("Unit", ColumnType::Utf8));
        let commit = table.append(&mut second, &wider, txn(1), vec!["b.csv".to_string()]).unwrap();
        assert_eq!(commit.version, 1);
        assert_eq!(commit.num_rows(), 2);

        let latest = table.scan(None).unwrap().collect().unwrap();
        assert_eq!(latest.height(), 3);
        assert_eq!(latest.get_column_names(), vec!["Country", "Value", "Unit"]);
        assert_eq!(latest.column("Unit").unwrap().null_count(), 1);

        let v0 = table.scan(Some(0)).unwrap().collect().unwrap();
        assert_eq!(v0.height(), 1);
        assert_eq!(v0.width(), 2);

        assert!(matches!(
            table.scan(Some(7)),
            Err(IngestError::VersionNotFound { version: 7, .. })
        ));
        assert_eq!(table.max_txn_batch(Uuid::nil()).unwrap(), Some(1));
        assert!(table.find_txn(Uuid::nil(), 0).unwrap().is_some());
    }

    #[test]
    fn test_empty_commit_reads_as_empty_frame() {
        let dir = TempDir::new().unwrap();
        let table = BronzeTable::at(dir.path().join("gdp"));
        let mut empty = DataFrame::new(vec![Series::new_empty("Country", &DataType::String)]).unwrap();
        table
            .append(&mut empty, &[column("Country", ColumnType::Utf8)], txn(0), vec![])
            .unwrap();

        let read = table.scan(None).unwrap().collect().unwrap();
        assert_eq!(read.height(), 0);
        assert_eq!(read.get_column_names(), vec!["Country"]);
    }

    #[test]
    fn test_type_change_is_refused() {
        let dir = TempDir::new().unwrap();
        let table = BronzeTable::at(dir.path().join("gdp"));
        let mut first = df! ["Year" => [2019i64]].unwrap();
        table
            .append(&mut first, &[column("Year", ColumnType::Int64)], txn(0), vec![])
            .unwrap();

        let mut second = df! ["Year" => ["2019-Q1"]].unwrap();
        let err = table
            .append(&mut second, &[column("Year", ColumnType::Utf8)], txn(1), vec![])
            .unwrap_err();
        assert!(matches!(err, IngestError::SchemaConflict { .. }));
        assert_eq!(table.latest_version().unwrap(), Some(0));
    }
}
