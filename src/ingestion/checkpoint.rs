//! Checkpoint - durable progress of one dataset's incremental ingestion
//!
//! Layout under the checkpoint path:
//! - `metadata.json`: query id plus the source and table it belongs to
//! - `offsets/{batch}.json`: files planned for a batch, written before the batch runs
//! - `commits/{batch}.json`: written once the batch is in the table
//!
//! Only the latest planned batch may lack a commit; it is re-run with the same
//! files on the next start.

use crate::error::{IngestError, Result};
use crate::ingestion::csv_source::SourceFile;
use crate::ingestion::durable::{list_numbered, read_json, write_json_atomic, write_json_new};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

const METADATA_FILE: &str = "metadata.json";
const OFFSETS_DIR: &str = "offsets";
const COMMITS_DIR: &str = "commits";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub query_id: Uuid,
    pub source: String,
    pub table: String,
    pub created_at: DateTime<Utc>,
}

/// Files planned for one batch
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOffsets {
    pub batch_id: u64,
    pub files: Vec<SourceFile>,
    pub planned_at: DateTime<Utc>,
}

/// Marker that a batch reached the table
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCommit {
    pub batch_id: u64,
    pub rows_written: u64,
    pub table_version: u64,
    pub committed_at: DateTime<Utc>,
}

/// What the next trigger-once run has to do
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NextBatch {
    /// A planned batch was never committed
    Resume(BatchOffsets),
    /// Batch id for new files, with every file already planned in earlier batches
    Fresh {
        batch_id: u64,
        seen: HashSet<String>,
    },
}

pub struct CheckpointStore {
    root: PathBuf,
    metadata: CheckpointMetadata,
    created: bool,
}

impl CheckpointStore {
    /// Open the checkpoint at `root`, creating it for `source` -> `table` when
    /// absent. An existing checkpoint for a different source or table is refused.
    pub fn open_or_create(root: impl Into<PathBuf>, source: &str, table: &str) -> Result<Self> {
        let root = root.into();
        let metadata_path = root.join(METADATA_FILE);

        if metadata_path.exists() {
            let metadata: CheckpointMetadata =
                read_json(&metadata_path).map_err(|reason| corrupt(&metadata_path, reason))?;
            if metadata.source != source {
                return Err(IngestError::CheckpointMismatch {
                    path: root,
                    reason: format!(
                        "checkpoint reads from '{}', job reads from '{}'",
                        metadata.source, source
                    ),
                });
            }
            if metadata.table != table {
                return Err(IngestError::CheckpointMismatch {
                    path: root,
                    reason: format!(
                        "checkpoint writes to '{}', job writes to '{}'",
                        metadata.table, table
                    ),
                });
            }
            return Ok(Self {
                root,
                metadata,
                created: false,
            });
        }

        // Offsets without metadata means the metadata file was lost
        if !list_numbered(&root.join(OFFSETS_DIR))?.is_empty() {
            return Err(corrupt(&metadata_path, "metadata missing but offsets exist".to_string()));
        }

        let metadata = CheckpointMetadata {
            query_id: Uuid::new_v4(),
            source: source.to_string(),
            table: table.to_string(),
            created_at: Utc::now(),
        };
        write_json_atomic(&metadata_path, &metadata)?;
        debug!("Created checkpoint {:?} with query id {}", root, metadata.query_id);

        Ok(Self {
            root,
            metadata,
            created: true,
        })
    }

    pub fn query_id(&self) -> Uuid {
        self.metadata.query_id
    }

    pub fn metadata(&self) -> &CheckpointMetadata {
        &self.metadata
    }

    /// True when this open created the checkpoint
    pub fn is_new(&self) -> bool {
        self.created
    }

    pub fn offsets(&self) -> Result<Vec<BatchOffsets>> {
        list_numbered(&self.root.join(OFFSETS_DIR))?
            .into_iter()
            .map(|(batch_id, path)| {
                let offsets: BatchOffsets =
                    read_json(&path).map_err(|reason| corrupt(&path, reason))?;
                if offsets.batch_id != batch_id {
                    return Err(corrupt(
                        &path,
                        format!("file holds batch {} instead of {}", offsets.batch_id, batch_id),
                    ));
                }
                Ok(offsets)
            })
            .collect()
    }

    pub fn commits(&self) -> Result<Vec<BatchCommit>> {
        list_numbered(&self.root.join(COMMITS_DIR))?
            .into_iter()
            .map(|(batch_id, path)| {
                let commit: BatchCommit =
                    read_json(&path).map_err(|reason| corrupt(&path, reason))?;
                if commit.batch_id != batch_id {
                    return Err(corrupt(
                        &path,
                        format!("file holds batch {} instead of {}", commit.batch_id, batch_id),
                    ));
                }
                Ok(commit)
            })
            .collect()
    }

    /// Latest planned batch id, if any batch was ever planned
    pub fn latest_batch(&self) -> Result<Option<u64>> {
        Ok(list_numbered(&self.root.join(OFFSETS_DIR))?
            .last()
            .map(|(batch_id, _)| *batch_id))
    }

    pub fn next_batch(&self) -> Result<NextBatch> {
        let offsets = self.offsets()?;
        let committed: BTreeSet<u64> = self.commits()?.iter().map(|c| c.batch_id).collect();
        let planned: BTreeSet<u64> = offsets.iter().map(|o| o.batch_id).collect();

        if let Some(orphan) = committed.difference(&planned).next() {
            return Err(corrupt(
                &self.root.join(COMMITS_DIR),
                format!("batch {} is committed but was never planned", orphan),
            ));
        }

        let mut seen = HashSet::new();
        let mut uncommitted: Option<BatchOffsets> = None;
        for batch in offsets {
            if !committed.contains(&batch.batch_id) {
                if let Some(previous) = &uncommitted {
                    return Err(corrupt(
                        &self.root.join(OFFSETS_DIR),
                        format!(
                            "batches {} and {} are both uncommitted",
                            previous.batch_id, batch.batch_id
                        ),
                    ));
                }
                uncommitted = Some(batch);
                continue;
            }
            seen.extend(batch.files.into_iter().map(|f| f.relative));
        }

        let latest = planned.iter().next_back().copied();
        if let Some(batch) = uncommitted {
            if Some(batch.batch_id) != latest {
                return Err(corrupt(
                    &self.root.join(OFFSETS_DIR),
                    format!("batch {} is uncommitted but later batches exist", batch.batch_id),
                ));
            }
            return Ok(NextBatch::Resume(batch));
        }
        let batch_id = latest.map(|b| b + 1).unwrap_or(0);
        Ok(NextBatch::Fresh { batch_id, seen })
    }

    pub fn plan_batch(&self, batch_id: u64, files: Vec<SourceFile>) -> Result<BatchOffsets> {
        let offsets = BatchOffsets {
            batch_id,
            files,
            planned_at: Utc::now(),
        };
        let path = self.root.join(OFFSETS_DIR).join(format!("{}.json", batch_id));
        if !write_json_new(&path, &offsets)? {
            return Err(IngestError::CheckpointMismatch {
                path: self.root.clone(),
                reason: format!("batch {} was planned concurrently by another run", batch_id),
            });
        }
        Ok(offsets)
    }

    pub fn commit_batch(&self, commit: &BatchCommit) -> Result<()> {
        let path = self
            .root
            .join(COMMITS_DIR)
            .join(format!("{}.json", commit.batch_id));
        write_json_atomic(&path, commit)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn corrupt(path: &Path, reason: String) -> IngestError {
    IngestError::CheckpointCorrupt {
        path: path.to_path_buf(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn file(name: &str) -> SourceFile {
        SourceFile {
            relative: name.to_string(),
            size: 10,
            modified: None,
        }
    }

    fn commit(batch_id: u64) -> BatchCommit {
        BatchCommit {
            batch_id,
            rows_written: 1,
            table_version: batch_id,
            committed_at: Utc::now(),
        }
    }

    #[test]
    fn test_create_then_reopen_keeps_query_id() {
        let dir = TempDir::new().unwrap();
        let first = CheckpointStore::open_or_create(dir.path(), "/landing/a", "/bronze/a").unwrap();
        assert!(first.is_new());
        let second = CheckpointStore::open_or_create(dir.path(), "/landing/a", "/bronze/a").unwrap();
        assert!(!second.is_new());
        assert_eq!(first.query_id(), second.query_id());
    }

    #[test]
    fn test_mismatched_paths_are_refused() {
        let dir = TempDir::new().unwrap();
        CheckpointStore::open_or_create(dir.path(), "/landing/a", "/bronze/a").unwrap();

        let other_source = CheckpointStore::open_or_create(dir.path(), "/landing/b", "/bronze/a");
        assert!(matches!(other_source, Err(IngestError::CheckpointMismatch { .. })));
        let other_table = CheckpointStore::open_or_create(dir.path(), "/landing/a", "/bronze/b");
        assert!(matches!(other_table, Err(IngestError::CheckpointMismatch { .. })));
    }

    #[test]
    fn test_batches_progress() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open_or_create(dir.path(), "/l", "/b").unwrap();

        match store.next_batch().unwrap() {
            NextBatch::Fresh { batch_id, seen } => {
                assert_eq!(batch_id, 0);
                assert!(seen.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }

        store.plan_batch(0, vec![file("a.csv")]).unwrap();
        match store.next_batch().unwrap() {
            NextBatch::Resume(batch) => assert_eq!(batch.files, vec![file("a.csv")]),
            other => panic!("unexpected {:?}", other),
        }

        store.commit_batch(&commit(0)).unwrap();
        match store.next_batch().unwrap() {
            NextBatch::Fresh { batch_id, seen } => {
                assert_eq!(batch_id, 1);
                assert!(seen.contains("a.csv"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(store.latest_batch().unwrap(), Some(0));
    }

    #[test]
    fn test_corrupt_offsets_fail_loudly() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open_or_create(dir.path(), "/l", "/b").unwrap();
        fs::create_dir_all(dir.path().join(OFFSETS_DIR)).unwrap();
        fs::write(dir.path().join(OFFSETS_DIR).join("0.json"), "garbage").unwrap();

        assert!(matches!(
            store.next_batch(),
            Err(IngestError::CheckpointCorrupt { .. })
        ));
    }

    #[test]
    fn test_commit_without_plan_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open_or_create(dir.path(), "/l", "/b").unwrap();
        store.commit_batch(&commit(3)).unwrap();
        assert!(matches!(
            store.next_batch(),
            Err(IngestError::CheckpointCorrupt { .. })
        ));
    }

    #[test]
    fn test_lost_metadata_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open_or_create(dir.path(), "/l", "/b").unwrap();
        store.plan_batch(0, vec![file("a.csv")]).unwrap();
        fs::remove_file(dir.path().join(METADATA_FILE)).unwrap();

        assert!(matches!(
            CheckpointStore::open_or_create(dir.path(), "/l", "/b"),
            Err(IngestError::CheckpointCorrupt { .. })
        ));
    }
}
