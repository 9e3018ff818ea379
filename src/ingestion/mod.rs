//! Ingestion Module - landing CSV files into bronze tables
//!
//! Handles incremental ingestion with:
//! - File discovery and CSV parsing
//! - Schema inference and evolution
//! - Checkpointed, exactly-once batches
//! - Versioned tables with time travel

pub mod checkpoint;
pub mod csv_source;
pub(crate) mod durable;
pub mod engine;
pub mod local;
pub mod schema_inference;
pub mod table;

pub use checkpoint::{BatchCommit, BatchOffsets, CheckpointStore, NextBatch};
pub use csv_source::{discover_files, read_raw, RawTable, SourceFile};
pub use engine::{ColumnRenamer, CommitResult, IngestionEngine, JobHandle, SourceFormat};
pub use local::LocalEngine;
pub use schema_inference::{
    ColumnType, InferredColumn, InferredSchema, SchemaEvolution, SchemaInference, SchemaStore,
};
pub use table::{BronzeTable, TableColumn, TableCommit, TxnMarker};
