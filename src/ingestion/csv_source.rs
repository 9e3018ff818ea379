//! CSV Source - landing directory discovery and raw CSV parsing

use crate::error::{IngestError, Result};
use crate::ingestion::engine::SourceFormat;
use chrono::{DateTime, Utc};
use csv::ReaderBuilder;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

/// One file found under a landing path
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    /// Path relative to the landing root, `/`-separated. This is the file's
    /// identity for incremental processing.
    pub relative: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

impl SourceFile {
    pub fn absolute(&self, root: &Path) -> PathBuf {
        self.relative
            .split('/')
            .fold(root.to_path_buf(), |path, part| path.join(part))
    }
}

/// Header and rows of one CSV file, cells as written
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

fn source_access(path: &Path, source: io::Error) -> IngestError {
    IngestError::SourceAccess {
        path: path.to_path_buf(),
        source,
    }
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('_') || name.starts_with('.')
}

/// All data files under `root`, recursively, sorted by relative path.
/// Names starting with `_` or `.` are skipped, files and directories alike.
pub fn discover_files(root: &Path) -> Result<Vec<SourceFile>> {
    let metadata = fs::metadata(root).map_err(|e| source_access(root, e))?;
    if !metadata.is_dir() {
        return Err(source_access(
            root,
            io::Error::new(io::ErrorKind::Other, "landing path is not a directory"),
        ));
    }

    let mut found = Vec::new();
    let mut pending: Vec<(PathBuf, String)> = vec![(root.to_path_buf(), String::new())];

    while let Some((dir, prefix)) = pending.pop() {
        let entries = fs::read_dir(&dir).map_err(|e| source_access(&dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| source_access(&dir, e))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if is_hidden(&name) {
                continue;
            }
            let relative = if prefix.is_empty() {
                name
            } else {
                format!("{}/{}", prefix, name)
            };
            let path = entry.path();
            let metadata = entry.metadata().map_err(|e| source_access(&path, e))?;

            if metadata.is_dir() {
                pending.push((path, relative));
            } else if metadata.is_file() {
                found.push(SourceFile {
                    relative,
                    size: metadata.len(),
                    modified: metadata.modified().ok().map(DateTime::<Utc>::from),
                });
            }
        }
    }

    found.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok(found)
}

/// Parse one CSV file. Header names are trimmed; a blank header becomes
/// `_c{index}`, as do all names when the format has no header row.
pub fn read_raw(path: &Path, format: &SourceFormat) -> Result<RawTable> {
    let file = File::open(path).map_err(|e| source_access(path, e))?;
    let mut rdr = ReaderBuilder::new()
        .delimiter(format.delimiter)
        .has_headers(format.header)
        .flexible(true)
        .from_reader(file);

    let mut headers: Vec<String> = if format.header {
        rdr.headers()?
            .iter()
            .enumerate()
            .map(|(idx, h)| {
                let name = h.trim_start_matches('\u{feff}').trim();
                if name.is_empty() {
                    format!("_c{}", idx)
                } else {
                    name.to_string()
                }
            })
            .collect()
    } else {
        Vec::new()
    };

    let mut rows = Vec::new();
    for result in rdr.records() {
        let record = result?;
        rows.push(record.iter().map(|cell| cell.to_string()).collect::<Vec<_>>());
    }

    if !format.header {
        let width = rows.iter().map(Vec::len).max().unwrap_or(0);
        headers = (0..width).map(|idx| format!("_c{}", idx)).collect();
    }

    if let Some(duplicate) = headers.iter().duplicates().next() {
        return Err(IngestError::DuplicateColumn {
            column: duplicate.clone(),
            sources: vec![format!("{}", path.display())],
        });
    }

    Ok(RawTable { headers, rows })
}
