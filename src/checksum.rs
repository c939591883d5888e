//! Tiered MD5 digests for folder comparison
//!
//! The fast digest samples a fixed number of windows spread across a large
//! file plus its tail, so differences that fall between windows go unseen.
//! The full digest reads everything and is only worth running on files whose
//! fast digests already agree.

use crate::error::{Error, Result};
use crate::protocol::defaults;
use crate::protocol_core::normalize_under_root;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

const READ_CHUNK: usize = 1024 * 1024;

/// Fast-digest sampling knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestParams {
    /// Files at or above this size are sampled instead of read whole.
    pub threshold: u64,
    pub windows: u64,
    pub window_len: u64,
}

impl Default for DigestParams {
    fn default() -> Self {
        Self {
            threshold: defaults::FAST_DIGEST_THRESHOLD,
            windows: defaults::FAST_DIGEST_WINDOWS,
            window_len: defaults::FAST_DIGEST_WINDOW_LEN,
        }
    }
}

impl DigestParams {
    pub fn with_threshold(threshold: u64) -> Self {
        Self {
            threshold,
            ..Self::default()
        }
    }

    /// Window start offsets for a file of `size` bytes, tail last.
    pub fn window_offsets(&self, size: u64) -> Vec<u64> {
        if size <= self.window_len || self.windows == 0 {
            return vec![0];
        }
        let tail = size - self.window_len;
        let step = tail / self.windows;
        let mut offsets: Vec<u64> = (0..self.windows).map(|i| i * step).collect();
        offsets.push(tail);
        offsets.dedup();
        offsets
    }
}

/// Compare-time requests on the primary connection. The sampling knobs
/// travel with the request so both sides hash the same windows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DigestRequest {
    Digest {
        full: bool,
        names: Vec<String>,
        params: DigestParams,
    },
    Done,
}

/// Reply to `DigestRequest::Digest`.
pub type DigestMap = HashMap<String, Option<String>>;

fn hex(digest: md5::Digest) -> String {
    format!("{:x}", digest)
}

fn hash_reader<R: Read>(mut r: R, ctx: &mut md5::Context, mut limit: u64) -> std::io::Result<()> {
    let mut buf = vec![0u8; READ_CHUNK];
    while limit > 0 {
        let want = (limit as usize).min(buf.len());
        let n = r.read(&mut buf[..want])?;
        if n == 0 {
            break;
        }
        ctx.consume(&buf[..n]);
        limit -= n as u64;
    }
    Ok(())
}

/// MD5 of the whole file.
pub fn full_digest(path: &Path) -> std::io::Result<String> {
    let f = File::open(path)?;
    let mut ctx = md5::Context::new();
    hash_reader(f, &mut ctx, u64::MAX)?;
    Ok(hex(ctx.compute()))
}

/// Sampled MD5 for files at or above the threshold, whole-file MD5 otherwise.
pub fn fast_digest(path: &Path, params: &DigestParams) -> std::io::Result<String> {
    let mut f = File::open(path)?;
    let size = f.metadata()?.len();
    if size < params.threshold {
        return full_digest(path);
    }
    let mut ctx = md5::Context::new();
    ctx.consume(size.to_be_bytes());
    for off in params.window_offsets(size) {
        f.seek(SeekFrom::Start(off))?;
        hash_reader(&mut f, &mut ctx, params.window_len)?;
    }
    Ok(hex(ctx.compute()))
}

/// Digest every named file under `root` on a pool of physical cores.
/// Unreadable files map to `None`.
pub fn digest_many(
    root: &Path,
    names: &[String],
    full: bool,
    params: &DigestParams,
) -> Result<DigestMap> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(num_cpus::get_physical().max(1))
        .build()
        .map_err(|e| Error::Io(std::io::Error::other(e)))?;

    // Spread large and small files across the pool
    let mut order: Vec<&String> = names.iter().collect();
    order.shuffle(&mut rand::thread_rng());

    let out = pool.install(|| {
        order
            .par_iter()
            .map(|name| {
                let path = match normalize_under_root(root, Path::new(name.as_str())) {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!("refusing digest of {}: {}", name, e);
                        return ((*name).clone(), None);
                    }
                };
                let d = if full {
                    full_digest(&path)
                } else {
                    fast_digest(&path, params)
                };
                let d = match d {
                    Ok(d) => Some(d),
                    Err(e) => {
                        tracing::warn!("cannot digest {}: {}", path.display(), e);
                        None
                    }
                };
                ((*name).clone(), d)
            })
            .collect()
    });
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn params() -> DigestParams {
        DigestParams {
            threshold: 1024 * 1024,
            windows: 48,
            window_len: 32 * 1024,
        }
    }

    #[test]
    fn offsets_cover_head_and_tail() {
        let p = params();
        let offs = p.window_offsets(10_000_000);
        assert_eq!(offs.len(), 49);
        assert_eq!(offs[0], 0);
        assert_eq!(*offs.last().unwrap(), 10_000_000 - 32 * 1024);
        assert!(offs.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn unsampled_change_fools_fast_but_not_full() {
        let tmp = TempDir::new().unwrap();
        let p = params();
        let size = 4 * 1024 * 1024u64;
        let data: Vec<u8> = (0..size).map(|i| (i % 253) as u8).collect();
        let mut altered = data.clone();

        // Pick a byte between the first two windows
        let offs = p.window_offsets(size);
        let gap = (offs[0] + p.window_len + offs[1]) / 2;
        assert!(gap > offs[0] + p.window_len && gap < offs[1]);
        altered[gap as usize] ^= 0xff;

        let a = tmp.path().join("a.bin");
        let b = tmp.path().join("b.bin");
        fs::write(&a, &data).unwrap();
        fs::write(&b, &altered).unwrap();

        assert_eq!(fast_digest(&a, &p).unwrap(), fast_digest(&b, &p).unwrap());
        assert_ne!(full_digest(&a).unwrap(), full_digest(&b).unwrap());
    }

    #[test]
    fn small_files_hash_whole() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("s.txt");
        fs::write(&a, b"hello").unwrap();
        assert_eq!(fast_digest(&a, &params()).unwrap(), "5d41402abc4b2a76b9719d911017c592");
        assert_eq!(full_digest(&a).unwrap(), "5d41402abc4b2a76b9719d911017c592");
    }

    #[test]
    fn digest_many_marks_missing() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("d")).unwrap();
        fs::write(tmp.path().join("d/x"), b"x").unwrap();
        let names = vec!["d/x".to_string(), "nope".to_string()];
        let m = digest_many(tmp.path(), &names, true, &params()).unwrap();
        assert_eq!(m.len(), 2);
        assert!(m["d/x"].is_some());
        assert!(m["nope"].is_none());
    }

    #[test]
    fn digest_many_stays_inside_root() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        fs::create_dir(&root).unwrap();
        fs::write(tmp.path().join("secret.txt"), b"hello").unwrap();
        fs::write(root.join("inside.txt"), b"hello").unwrap();

        let names = vec![
            "../secret.txt".to_string(),
            "inside.txt".to_string(),
            "/etc/hostname".to_string(),
        ];
        let m = digest_many(&root, &names, true, &params()).unwrap();
        assert_eq!(m["../secret.txt"], None);
        assert_eq!(m["/etc/hostname"], None);
        assert_eq!(m["inside.txt"].as_deref(), Some("5d41402abc4b2a76b9719d911017c592"));
    }

    #[cfg(unix)]
    #[test]
    fn digest_many_ignores_symlinks_out_of_root() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        fs::create_dir(&root).unwrap();
        fs::write(tmp.path().join("secret.txt"), b"hello").unwrap();
        std::os::unix::fs::symlink(tmp.path().join("secret.txt"), root.join("link.txt")).unwrap();

        let m = digest_many(&root, &["link.txt".to_string()], false, &params()).unwrap();
        assert_eq!(m["link.txt"], None);
    }
}
