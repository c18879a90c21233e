//! Atomic JSON snapshot files
//!
//! Snapshots are written to a temp file in the target directory, fsynced,
//! then renamed over the destination, so readers never observe a torn write.
//! Serialization is canonical (struct field order, compact form), which keeps
//! serialize → deserialize → serialize byte-stable.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Write `value` as JSON to `path` atomically (tmp file + rename)
pub fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp = path.with_extension("json.tmp");
    {
        let mut file = File::create(&tmp)?;
        let bytes = serde_json::to_vec(value)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Read a JSON snapshot, returning `None` when the file does not exist
pub fn read<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let file = File::open(path)?;
    let value = serde_json::from_reader(std::io::BufReader::new(file))?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Row {
        id: String,
        importance: f32,
    }

    #[test]
    fn roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snap.json");

        let rows = vec![
            Row {
                id: "a".into(),
                importance: 0.5,
            },
            Row {
                id: "b".into(),
                importance: 0.9,
            },
        ];

        write_atomic(&path, &rows).unwrap();
        let loaded: Vec<Row> = read(&path).unwrap().unwrap();
        assert_eq!(loaded, rows);
    }

    #[test]
    fn serialization_is_byte_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snap.json");

        let rows = vec![Row {
            id: "a".into(),
            importance: 0.25,
        }];

        write_atomic(&path, &rows).unwrap();
        let first = std::fs::read(&path).unwrap();

        let loaded: Vec<Row> = read(&path).unwrap().unwrap();
        write_atomic(&path, &loaded).unwrap();
        let second = std::fs::read(&path).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn missing_file_reads_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        let loaded: Option<Vec<Row>> = read(&path).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn no_tmp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snap.json");
        write_atomic(&path, &vec![1, 2, 3]).unwrap();
        assert!(!path.with_extension("json.tmp").exists());
    }
}
