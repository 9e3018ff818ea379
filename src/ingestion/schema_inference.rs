//! Schema Inference - Deterministic column type detection from CSV cells,
//! plus the versioned schema location that later runs reuse

use crate::error::{IngestError, Result};
use crate::ingestion::csv_source::RawTable;
use crate::ingestion::durable::{list_numbered, read_json, write_json_new};
use polars::prelude::DataType;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

const SCHEMAS_DIR: &str = "_schemas";

/// Column types the bronze layer stores
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Boolean,
    Int64,
    Float64,
    Utf8,
}

impl ColumnType {
    /// Narrowest type a single non-empty cell fits. `None` for an empty cell.
    pub fn of_cell(cell: &str) -> Option<ColumnType> {
        let trimmed = cell.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed.eq_ignore_ascii_case("true") || trimmed.eq_ignore_ascii_case("false") {
            return Some(ColumnType::Boolean);
        }
        // Rejects "NaN", "inf" and friends, which f64 parsing would accept
        if !trimmed.bytes().any(|b| b.is_ascii_digit()) {
            return Some(ColumnType::Utf8);
        }
        if trimmed.parse::<i64>().is_ok() {
            return Some(ColumnType::Int64);
        }
        if trimmed.parse::<f64>().is_ok() {
            return Some(ColumnType::Float64);
        }
        Some(ColumnType::Utf8)
    }

    /// Smallest type holding values of both
    pub fn merge(self, other: ColumnType) -> ColumnType {
        use ColumnType::*;
        match (self, other) {
            (a, b) if a == b => a,
            (Int64, Float64) | (Float64, Int64) => Float64,
            _ => Utf8,
        }
    }

    /// Whether a stored column of this type can take incoming values of
    /// `incoming` without losing anything.
    pub fn accepts(self, incoming: ColumnType) -> bool {
        self == incoming
            || self == ColumnType::Utf8
            || (self == ColumnType::Float64 && incoming == ColumnType::Int64)
    }

    pub fn polars_dtype(self) -> DataType {
        match self {
            ColumnType::Boolean => DataType::Boolean,
            ColumnType::Int64 => DataType::Int64,
            ColumnType::Float64 => DataType::Float64,
            ColumnType::Utf8 => DataType::String,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::Boolean => "boolean",
            ColumnType::Int64 => "long",
            ColumnType::Float64 => "double",
            ColumnType::Utf8 => "string",
        };
        f.write_str(name)
    }
}

/// Inferred column information
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferredColumn {
    pub name: String,
    pub data_type: ColumnType,
}

/// Inferred schema, versioned at the schema location
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferredSchema {
    pub version: u64,
    pub columns: Vec<InferredColumn>,
}

impl InferredSchema {
    pub fn empty() -> Self {
        Self {
            version: 0,
            columns: Vec::new(),
        }
    }

    pub fn column(&self, name: &str) -> Option<&InferredColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Column seen in a batch of files. `data_type` stays `None` while every
/// cell so far was empty.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObservedColumn {
    pub name: String,
    pub data_type: Option<ColumnType>,
}

/// Schema evolution plan
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SchemaEvolution {
    NoChange,
    AddColumns {
        columns: Vec<InferredColumn>,
        new_version: u64,
    },
}

/// Schema Inference Engine
pub struct SchemaInference {
    infer_types: bool,
}

impl SchemaInference {
    pub fn new(infer_types: bool) -> Self {
        Self { infer_types }
    }

    /// Observe every cell of `table`, folding into `observed` in header order.
    pub fn observe(&self, observed: &mut Vec<ObservedColumn>, table: &RawTable) {
        for (idx, header) in table.headers.iter().enumerate() {
            let mut data_type = None;
            for row in &table.rows {
                let cell = row.get(idx).map(String::as_str).unwrap_or("");
                let cell_type = if self.infer_types {
                    ColumnType::of_cell(cell)
                } else if cell.trim().is_empty() {
                    None
                } else {
                    Some(ColumnType::Utf8)
                };
                data_type = merge_optional(data_type, cell_type);
            }

            match observed.iter_mut().find(|c| &c.name == header) {
                Some(existing) => {
                    existing.data_type = merge_optional(existing.data_type, data_type);
                }
                None => observed.push(ObservedColumn {
                    name: header.clone(),
                    data_type,
                }),
            }
        }
    }

    pub fn infer_schema(&self, tables: &[RawTable]) -> InferredSchema {
        let mut observed = Vec::new();
        for table in tables {
            self.observe(&mut observed, table);
        }
        InferredSchema {
            version: 0,
            columns: observed.into_iter().map(finalize).collect(),
        }
    }

    /// Compare what a batch contains against the stored schema. New columns
    /// evolve the schema; a type the stored column cannot hold is a conflict.
    pub fn compare_schema(
        &self,
        existing: &InferredSchema,
        persisted: bool,
        observed: &[ObservedColumn],
    ) -> Result<SchemaEvolution> {
        let mut added = Vec::new();
        for column in observed {
            match existing.column(&column.name) {
                Some(stored) => {
                    if let Some(incoming) = column.data_type {
                        if !stored.data_type.accepts(incoming) {
                            return Err(IngestError::SchemaConflict {
                                column: column.name.clone(),
                                existing: stored.data_type.to_string(),
                                incoming: incoming.to_string(),
                            });
                        }
                    }
                }
                None => added.push(finalize(column.clone())),
            }
        }

        if added.is_empty() {
            return Ok(SchemaEvolution::NoChange);
        }
        Ok(SchemaEvolution::AddColumns {
            columns: added,
            new_version: if persisted { existing.version + 1 } else { 0 },
        })
    }

    pub fn apply(&self, existing: &InferredSchema, evolution: &SchemaEvolution) -> InferredSchema {
        match evolution {
            SchemaEvolution::NoChange => existing.clone(),
            SchemaEvolution::AddColumns {
                columns,
                new_version,
            } => {
                let mut evolved = existing.clone();
                evolved.version = *new_version;
                evolved.columns.extend(columns.iter().cloned());
                evolved
            }
        }
    }
}

impl Default for SchemaInference {
    fn default() -> Self {
        Self::new(true)
    }
}

fn merge_optional(a: Option<ColumnType>, b: Option<ColumnType>) -> Option<ColumnType> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.merge(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

fn finalize(column: ObservedColumn) -> InferredColumn {
    InferredColumn {
        name: column.name,
        data_type: column.data_type.unwrap_or(ColumnType::Utf8),
    }
}

/// Schema location: `{schema}/_schemas/{version}.json`, one file per version
pub struct SchemaStore {
    root: PathBuf,
}

impl SchemaStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn dir(&self) -> PathBuf {
        self.root.join(SCHEMAS_DIR)
    }

    pub fn latest(&self) -> Result<Option<InferredSchema>> {
        let versions = list_numbered(&self.dir())?;
        let Some((version, path)) = versions.last() else {
            return Ok(None);
        };
        let schema: InferredSchema = read_json(path).map_err(|reason| self.corrupt(path, reason))?;
        if schema.version != *version {
            return Err(self.corrupt(
                path,
                format!("file holds version {} instead of {}", schema.version, version),
            ));
        }
        Ok(Some(schema))
    }

    pub fn save(&self, schema: &InferredSchema) -> Result<()> {
        let path = self.dir().join(format!("{}.json", schema.version));
        if write_json_new(&path, schema)? {
            return Ok(());
        }
        // Same content from an earlier interrupted run is fine
        let stored: InferredSchema = read_json(&path).map_err(|reason| self.corrupt(&path, reason))?;
        if &stored == schema {
            Ok(())
        } else {
            Err(self.corrupt(
                &path,
                format!("version {} already exists with different columns", schema.version),
            ))
        }
    }

    fn corrupt(&self, path: &Path, reason: String) -> IngestError {
        IngestError::SchemaStoreCorrupt {
            path: path.to_path_buf(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn table(headers: &[&str], rows: &[&[&str]]) -> RawTable {
        RawTable {
            headers: headers.iter().map(|h| h.to_string()).collect(),
            rows: rows
                .iter()
                .map(|r| r.iter().map(|c| c.to_string()).collect())
                .collect(),
        }
    }

    #[test]
    fn test_cell_types() {
        assert_eq!(ColumnType::of_cell(""), None);
        assert_eq!(ColumnType::of_cell("  "), None);
        assert_eq!(ColumnType::of_cell("TRUE"), Some(ColumnType::Boolean));
        assert_eq!(ColumnType::of_cell("2019"), Some(ColumnType::Int64));
        assert_eq!(ColumnType::of_cell(" 1.2"), Some(ColumnType::Float64));
        assert_eq!(ColumnType::of_cell("1e3"), Some(ColumnType::Float64));
        assert_eq!(ColumnType::of_cell("NaN"), Some(ColumnType::Utf8));
        assert_eq!(ColumnType::of_cell("ES"), Some(ColumnType::Utf8));
    }

    #[test]
    fn test_merge_types() {
        use ColumnType::*;
        assert_eq!(Int64.merge(Float64), Float64);
        assert_eq!(Boolean.merge(Int64), Utf8);
        assert_eq!(Utf8.merge(Int64), Utf8);
        assert_eq!(Boolean.merge(Boolean), Boolean);
    }

    #[test]
    fn test_infer_across_files() {
        let inference = SchemaInference::default();
        let schema = inference.infer_schema(&[
            table(&["Country", "Year", "Value"], &[&["ES", "2019", "1"], &["FR", "", ""]]),
            table(&["Country", "Value", "Flag"], &[&["DE", "2.5", ""]]),
        ]);

        let types: Vec<(&str, ColumnType)> = schema
            .columns
            .iter()
            .map(|c| (c.name.as_str(), c.data_type))
            .collect();
        assert_eq!(
            types,
            vec![
                ("Country", ColumnType::Utf8),
                ("Year", ColumnType::Int64),
                ("Value", ColumnType::Float64),
                ("Flag", ColumnType::Utf8),
            ]
        );
    }

    #[test]
    fn test_without_type_inference_everything_is_string() {
        let inference = SchemaInference::new(false);
        let schema = inference.infer_schema(&[table(&["Year"], &[&["2019"]])]);
        assert_eq!(schema.columns[0].data_type, ColumnType::Utf8);
    }

    #[test]
    fn test_compare_adds_columns() {
        let inference = SchemaInference::default();
        let existing = inference.infer_schema(&[table(&["Country", "Value"], &[&["ES", "1.2"]])]);

        let mut observed = Vec::new();
        inference.observe(&mut observed, &table(&["Country", "Value", "Unit"], &[&["ES", "3", "USD"]]));
        let evolution = inference.compare_schema(&existing, true, &observed).unwrap();

        match &evolution {
            SchemaEvolution::AddColumns { columns, new_version } => {
                assert_eq!(*new_version, 1);
                assert_eq!(columns.len(), 1);
                assert_eq!(columns[0].name, "Unit");
            }
            other => panic!("unexpected evolution {:?}", other),
        }
        let evolved = inference.apply(&existing, &evolution);
        assert_eq!(evolved.columns.len(), 3);
        assert_eq!(evolved.version, 1);
    }

    #[test]
    fn test_compare_rejects_narrowing() {
        let inference = SchemaInference::default();
        let existing = inference.infer_schema(&[table(&["Year"], &[&["2019"]])]);

        let mut observed = Vec::new();
        inference.observe(&mut observed, &table(&["Year"], &[&["2019-Q1"]]));
        let err = inference.compare_schema(&existing, true, &observed).unwrap_err();
        assert!(matches!(err, IngestError::SchemaConflict { ref column, .. } if column == "Year"));
    }

    #[test]
    fn test_compare_accepts_widening_into_stored_type() {
        let inference = SchemaInference::default();
        let existing = inference.infer_schema(&[table(&["Value"], &[&["1.5"]])]);

        let mut observed = Vec::new();
        inference.observe(&mut observed, &table(&["Value"], &[&["7"], &[""]]));
        assert_eq!(
            inference.compare_schema(&existing, true, &observed).unwrap(),
            SchemaEvolution::NoChange
        );
    }

    #[test]
    fn test_schema_store_versions() {
        let dir = TempDir::new().unwrap();
        let store = SchemaStore::new(dir.path());
        assert!(store.latest().unwrap().is_none());

        let inference = SchemaInference::default();
        let v0 = inference.infer_schema(&[table(&["Country"], &[&["ES"]])]);
        store.save(&v0).unwrap();
        store.save(&v0).unwrap();

        let mut v1 = v0.clone();
        v1.version = 1;
        v1.columns.push(InferredColumn {
            name: "Value".to_string(),
            data_type: ColumnType::Float64,
        });
        store.save(&v1).unwrap();
        assert_eq!(store.latest().unwrap(), Some(v1));

        let mut clash = v0.clone();
        clash.columns[0].data_type = ColumnType::Int64;
        assert!(store.save(&clash).is_err());
    }
}
