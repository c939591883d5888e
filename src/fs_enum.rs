//! Folder enumeration: snapshots for compare and file records for sending

use crate::error::{Error, Result};
use crate::protocol::TEMP_SUFFIX;
use crate::protocol_core::{join_rel, rel_name, FileTimes};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use walkdir::WalkDir;

/// A file captured at scan time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Posix-style path relative to the scanned root.
    pub name: String,
    pub size: u64,
    pub times: FileTimes,
}

/// Directory and file state of one folder tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FolderSnapshot {
    /// Relative directory -> (access time, modify time)
    pub dirs: HashMap<String, (f64, f64)>,
    /// Relative file -> size
    pub files: HashMap<String, u64>,
    /// Relative file -> modify time
    pub mtimes: HashMap<String, f64>,
}

impl FolderSnapshot {
    pub fn total_bytes(&self) -> u64 {
        self.files.values().sum()
    }
}

/// In-progress downloads are not part of a folder's content.
fn is_partial(name: &str) -> bool {
    name.ends_with(TEMP_SUFFIX)
}

/// Walk `root` and record every directory and regular file below it.
/// Unreadable entries are skipped.
pub fn snapshot(root: &Path) -> Result<FolderSnapshot> {
    if !root.is_dir() {
        return Err(Error::fs(
            root,
            std::io::Error::new(std::io::ErrorKind::NotFound, "not a directory"),
        ));
    }
    let mut snap = FolderSnapshot::default();
    for entry in WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let Some(name) = rel_name(root, entry.path()) else {
            continue;
        };
        let Ok(md) = entry.metadata() else {
            continue;
        };
        let times = FileTimes::from_metadata(&md);
        if entry.file_type().is_dir() {
            snap.dirs.insert(name, (times.accessed, times.modified));
        } else if entry.file_type().is_file() && !is_partial(&name) {
            snap.files.insert(name.clone(), md.len());
            snap.mtimes.insert(name, times.modified);
        }
    }
    Ok(snap)
}

/// Stat the named files under `root`. Names that cannot be read are
/// returned separately so callers can count them as failed.
pub fn records_for(root: &Path, names: &[String]) -> (Vec<FileRecord>, Vec<String>) {
    let mut records = Vec::with_capacity(names.len());
    let mut missing = Vec::new();
    for name in names {
        match std::fs::metadata(join_rel(root, name)) {
            Ok(md) if md.is_file() => records.push(FileRecord {
                name: name.clone(),
                size: md.len(),
                times: FileTimes::from_metadata(&md),
            }),
            Ok(_) => missing.push(name.clone()),
            Err(e) => {
                tracing::warn!("skipping {}: {}", name, e);
                missing.push(name.clone());
            }
        }
    }
    (records, missing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn snapshot_records_files_and_dirs() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("a/b")).unwrap();
        fs::create_dir_all(root.join("empty")).unwrap();
        fs::write(root.join("top.txt"), vec![0u8; 10]).unwrap();
        fs::write(root.join("a/b/deep.bin"), vec![1u8; 300]).unwrap();
        fs::write(root.join("a/b/half.bin.tandem-part"), vec![1u8; 30]).unwrap();

        let snap = snapshot(root).unwrap();
        assert_eq!(snap.files.len(), 2);
        assert_eq!(snap.files["top.txt"], 10);
        assert_eq!(snap.files["a/b/deep.bin"], 300);
        assert!(snap.mtimes["top.txt"] > 0.0);
        for d in ["a", "a/b", "empty"] {
            assert!(snap.dirs.contains_key(d), "missing dir {}", d);
        }
        assert_eq!(snap.total_bytes(), 310);
    }

    #[test]
    fn snapshot_of_missing_root_fails() {
        let tmp = TempDir::new().unwrap();
        assert!(snapshot(&tmp.path().join("nope")).is_err());
    }

    #[test]
    fn records_split_missing() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("x.txt"), b"hello").unwrap();
        let (recs, missing) = records_for(tmp.path(), &["x.txt".into(), "gone.txt".into()]);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].size, 5);
        assert_eq!(missing, vec!["gone.txt".to_string()]);
    }
}
