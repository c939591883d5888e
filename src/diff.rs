//! Folder comparison and force-sync planning

use crate::error::{Error, Result};
use crate::fs_enum::FolderSnapshot;
use crate::protocol_core::{ensure_parent_exists, normalize_under_root, FileTimes};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Size-level comparison of two file maps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompareResult {
    pub equal: BTreeSet<String>,
    pub source_only: BTreeSet<String>,
    pub target_only: BTreeSet<String>,
    /// Present on both sides, smaller on the source.
    pub source_smaller: BTreeSet<String>,
    /// Present on both sides, smaller on the target.
    pub target_smaller: BTreeSet<String>,
}

impl CompareResult {
    /// No file is missing or differently sized on either side.
    pub fn is_in_sync(&self) -> bool {
        self.source_only.is_empty()
            && self.target_only.is_empty()
            && self.source_smaller.is_empty()
            && self.target_smaller.is_empty()
    }
}

/// Single pass over `source`; matched names are removed from `target`, and
/// whatever is left over is target-only.
pub fn compare(source: &HashMap<String, u64>, mut target: HashMap<String, u64>) -> CompareResult {
    let mut r = CompareResult::default();
    for (name, &size) in source {
        match target.remove(name) {
            None => {
                r.source_only.insert(name.clone());
            }
            Some(t) if t == size => {
                r.equal.insert(name.clone());
            }
            Some(t) if size < t => {
                r.source_smaller.insert(name.clone());
            }
            Some(_) => {
                r.target_smaller.insert(name.clone());
            }
        }
    }
    r.target_only = target.into_keys().collect();
    r
}

/// Size comparison plus the outcome of content hashing on the equal bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompareReport {
    pub result: CompareResult,
    pub content_equal: BTreeSet<String>,
    pub content_mismatch: BTreeSet<String>,
}

/// Split digest candidates into names whose digests agree and names that
/// differ. A missing digest on either side counts as a mismatch.
pub fn match_digests<'a, I>(
    names: I,
    local: &HashMap<String, Option<String>>,
    remote: &HashMap<String, Option<String>>,
) -> (BTreeSet<String>, BTreeSet<String>)
where
    I: IntoIterator<Item = &'a String>,
{
    let mut same = BTreeSet::new();
    let mut differ = BTreeSet::new();
    for n in names {
        match (local.get(n), remote.get(n)) {
            (Some(Some(a)), Some(Some(b))) if a == b => same.insert(n.clone()),
            _ => differ.insert(n.clone()),
        };
    }
    (same, differ)
}

/// What a force-sync removes from the target and then sends from the source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPlan {
    pub remove: BTreeSet<String>,
    pub send: BTreeSet<String>,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.remove.is_empty() && self.send.is_empty()
    }
}

/// Size-equal files whose modify times differ in whole seconds.
pub fn mtime_mismatches(
    equal: &BTreeSet<String>,
    source: &HashMap<String, f64>,
    target: &HashMap<String, f64>,
) -> BTreeSet<String> {
    equal
        .iter()
        .filter(|n| match (source.get(*n), target.get(*n)) {
            (Some(a), Some(b)) => *a as i64 != *b as i64,
            _ => true,
        })
        .cloned()
        .collect()
}

/// Plan a force-sync of `target` to match `source`.
pub fn plan_force_sync(
    source: &FolderSnapshot,
    target: &FolderSnapshot,
) -> (CompareResult, SyncPlan) {
    let result = compare(&source.files, target.files.clone());
    let mut remove: BTreeSet<String> = result.target_only.clone();
    remove.extend(result.source_smaller.iter().cloned());
    remove.extend(result.target_smaller.iter().cloned());
    remove.extend(mtime_mismatches(&result.equal, &source.mtimes, &target.mtimes));

    let mut send = result.source_only.clone();
    send.extend(remove.iter().filter(|n| source.files.contains_key(*n)).cloned());
    (result, SyncPlan { remove, send })
}

/// A fresh timestamped directory under `trash_root`.
pub fn trash_batch_dir(trash_root: &Path) -> PathBuf {
    trash_root.join(chrono::Local::now().format("%Y%m%d-%H%M%S%.3f").to_string())
}

/// Move each named file under `root` into `trash_dir`, keeping its relative
/// path. Falls back to deleting a file it cannot move. Returns the names that
/// are still in place.
pub fn move_to_trash(root: &Path, names: &BTreeSet<String>, trash_dir: &Path) -> Vec<String> {
    let mut failed = Vec::new();
    for name in names {
        if let Err(e) = trash_one(root, name, trash_dir) {
            warn!("could not remove {}: {}", name, e);
            failed.push(name.clone());
        }
    }
    if !names.is_empty() {
        info!("moved {} files to {}", names.len() - failed.len(), trash_dir.display());
    }
    failed
}

fn trash_one(root: &Path, name: &str, trash_dir: &Path) -> Result<()> {
    let src = normalize_under_root(root, Path::new(name))?;
    let dst = normalize_under_root(trash_dir, Path::new(name))?;
    let moved = ensure_parent_exists(&dst).and_then(|_| move_file(&src, &dst));
    if let Err(e) = moved {
        warn!("trash failed for {} ({}), deleting", src.display(), e);
        std::fs::remove_file(&src).map_err(|e| Error::fs(&src, e))?;
    }
    Ok(())
}

/// Rename, or copy and remove when the trash sits on another volume.
fn move_file(src: &Path, dst: &Path) -> Result<()> {
    let Err(rename_err) = std::fs::rename(src, dst) else {
        return Ok(());
    };
    debug!("rename {} failed ({}), copying", src.display(), rename_err);
    let copied = std::fs::copy(src, dst).and_then(|_| {
        if let Ok(md) = std::fs::metadata(src) {
            let _ = crate::transfer::apply_times(dst, &FileTimes::from_metadata(&md));
        }
        std::fs::remove_file(src)
    });
    if let Err(e) = copied {
        let _ = std::fs::remove_file(dst);
        return Err(Error::fs(dst, e));
    }
    Ok(())
}
