//! Durable JSON files - atomic writes and numbered logs shared by the
//! checkpoint, the schema location and the table log

use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Read and parse a JSON file. The error is a human readable reason that the
/// caller wraps into the corruption variant for its own store.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> std::result::Result<T, String> {
    let content = fs::read_to_string(path).map_err(|e| format!("cannot read {:?}: {}", path, e))?;
    serde_json::from_str(&content).map_err(|e| format!("cannot parse {:?}: {}", path, e))
}

fn write_temp<T: Serialize>(path: &Path, value: &T) -> Result<PathBuf> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let temp = dir.join(format!(".{}.tmp", Uuid::new_v4()));
    fs::write(&temp, serde_json::to_vec_pretty(value)?)?;
    Ok(temp)
}

/// Replace `path` with `value` in one rename.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let temp = write_temp(path, value)?;
    if let Err(e) = fs::rename(&temp, path) {
        let _ = fs::remove_file(&temp);
        return Err(e.into());
    }
    Ok(())
}

/// Create `path` only if it does not exist yet. Returns `false` when another
/// file already holds the name.
pub(crate) fn write_json_new<T: Serialize>(path: &Path, value: &T) -> Result<bool> {
    let temp = write_temp(path, value)?;
    let linked = fs::hard_link(&temp, path);
    let _ = fs::remove_file(&temp);
    match linked {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// `N.json` files in `dir`, sorted by `N`. A missing directory is an empty log.
pub(crate) fn list_numbered(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut numbered = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let number = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok());
        if let Some(number) = number {
            numbered.push((number, path));
        }
    }
    numbered.sort_by_key(|(number, _)| *number);
    Ok(numbered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Marker {
        id: u64,
    }

    #[test]
    fn test_write_new_refuses_existing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log").join("0.json");

        assert!(write_json_new(&path, &Marker { id: 1 }).unwrap());
        assert!(!write_json_new(&path, &Marker { id: 2 }).unwrap());
        assert_eq!(read_json::<Marker>(&path).unwrap(), Marker { id: 1 });
    }

    #[test]
    fn test_atomic_overwrite_and_listing() {
        let dir = TempDir::new().unwrap();
        write_json_atomic(&dir.path().join("10.json"), &Marker { id: 10 }).unwrap();
        write_json_atomic(&dir.path().join("2.json"), &Marker { id: 2 }).unwrap();
        write_json_atomic(&dir.path().join("2.json"), &Marker { id: 3 }).unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let listed = list_numbered(dir.path()).unwrap();
        let numbers: Vec<u64> = listed.iter().map(|(n, _)| *n).collect();
        assert_eq!(numbers, vec![2, 10]);
        assert_eq!(read_json::<Marker>(&listed[0].1).unwrap(), Marker { id: 3 });
        assert!(list_numbered(&dir.path().join("missing")).unwrap().is_empty());
    }

    #[test]
    fn test_read_json_reports_reason() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0.json");
        fs::write(&path, "{not json").unwrap();
        let reason = read_json::<Marker>(&path).unwrap_err();
        assert!(reason.contains("cannot parse"));
    }
}
