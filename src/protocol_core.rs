//! Wire codec shared by every connection
//!
//! Pure encode/decode helpers: fixed headers, control frames, the timestamp
//! record and compressed values. Nothing in here touches a socket.

use crate::error::{Error, Result};
use crate::protocol::{Command, HEADER_FIXED_LEN, SIGNAL_LEN, TIMES_RECORD_LEN};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

/// One command header: `[command u8][size u64 BE][name_len u16 BE][name]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub command: Command,
    pub size: u64,
    pub name: String,
}

impl Header {
    pub fn new(command: Command, size: u64, name: impl Into<String>) -> Self {
        Self {
            command,
            size,
            name: name.into(),
        }
    }

    pub fn bare(command: Command) -> Self {
        Self::new(command, 0, String::new())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let name = self.name.as_bytes();
        if name.len() > u16::MAX as usize {
            return Err(Error::protocol(format!(
                "header name too long: {} bytes",
                name.len()
            )));
        }
        let mut buf = Vec::with_capacity(HEADER_FIXED_LEN + name.len());
        buf.push(self.command as u8);
        buf.extend_from_slice(&self.size.to_be_bytes());
        buf.extend_from_slice(&(name.len() as u16).to_be_bytes());
        buf.extend_from_slice(name);
        Ok(buf)
    }
}

/// Parse the fixed part of a header. Returns (command, size, name_len).
pub fn parse_header_fixed(buf: &[u8; HEADER_FIXED_LEN]) -> Result<(Command, u64, usize)> {
    let command = Command::from_u8(buf[0])
        .ok_or_else(|| Error::protocol(format!("unknown command byte {}", buf[0])))?;
    let mut size = [0u8; 8];
    size.copy_from_slice(&buf[1..9]);
    let name_len = u16::from_be_bytes([buf[9], buf[10]]) as usize;
    Ok((command, u64::from_be_bytes(size), name_len))
}

pub fn encode_signal(value: i64) -> [u8; SIGNAL_LEN] {
    value.to_be_bytes()
}

pub fn decode_signal(buf: [u8; SIGNAL_LEN]) -> i64 {
    i64::from_be_bytes(buf)
}

/// Creation, modification and access time as floating epoch seconds.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FileTimes {
    pub created: f64,
    pub modified: f64,
    pub accessed: f64,
}

impl FileTimes {
    pub fn from_metadata(md: &std::fs::Metadata) -> Self {
        fn secs(t: std::io::Result<std::time::SystemTime>) -> f64 {
            t.ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0)
        }
        let modified = secs(md.modified());
        let created = match md.created() {
            Ok(t) => secs(Ok(t)),
            Err(_) => modified,
        };
        Self {
            created,
            modified,
            accessed: secs(md.accessed()),
        }
    }

    pub fn encode(&self) -> [u8; TIMES_RECORD_LEN] {
        let mut out = [0u8; TIMES_RECORD_LEN];
        out[0..8].copy_from_slice(&self.created.to_be_bytes());
        out[8..16].copy_from_slice(&self.modified.to_be_bytes());
        out[16..24].copy_from_slice(&self.accessed.to_be_bytes());
        out
    }

    pub fn decode(buf: &[u8; TIMES_RECORD_LEN]) -> Self {
        let f = |i: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[i..i + 8]);
            f64::from_be_bytes(b)
        };
        Self {
            created: f(0),
            modified: f(8),
            accessed: f(16),
        }
    }
}

/// Serialize with bincode, then zlib-compress.
pub fn encode_value<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let raw = bincode::serialize(value)?;
    let mut enc = ZlibEncoder::new(Vec::with_capacity(raw.len() / 2 + 16), Compression::fast());
    enc.write_all(&raw)?;
    Ok(enc.finish()?)
}

pub fn decode_value<T: DeserializeOwned>(blob: &[u8]) -> Result<T> {
    let mut raw = Vec::with_capacity(blob.len() * 2);
    ZlibDecoder::new(blob)
        .read_to_end(&mut raw)
        .map_err(|e| Error::protocol(format!("corrupt compressed value: {}", e)))?;
    Ok(bincode::deserialize(&raw)?)
}

/// Normalize a peer-supplied relative path so it stays under `root`.
/// Rejects absolute paths, parent components and NUL bytes, and resolves
/// symlinks on whatever part of the path already exists.
pub fn normalize_under_root(root: &Path, p: &Path) -> Result<PathBuf> {
    use Component::{CurDir, Normal, ParentDir, Prefix, RootDir};

    if p.to_string_lossy().contains('\0') {
        return Err(Error::protocol("path contains NUL byte"));
    }

    let mut safe = PathBuf::new();
    for component in p.components() {
        match component {
            CurDir => {}
            Normal(s) => {
                #[cfg(windows)]
                if s.to_string_lossy().contains(':') {
                    return Err(Error::protocol("path component contains colon"));
                }
                safe.push(s);
            }
            ParentDir | RootDir | Prefix(_) => {
                return Err(Error::protocol(format!(
                    "path contains disallowed component: {:?}",
                    component
                )));
            }
        }
    }

    let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let joined = root.join(&safe);

    let final_path = if joined.exists() {
        joined.canonicalize().map_err(|e| Error::fs(&joined, e))?
    } else if let Some(parent) = joined.parent().filter(|p| p.exists()) {
        let canonical_parent = parent.canonicalize().map_err(|e| Error::fs(parent, e))?;
        match joined.file_name() {
            Some(name) => canonical_parent.join(name),
            None => canonical_parent,
        }
    } else {
        joined
    };

    if !final_path.starts_with(&root) {
        return Err(Error::protocol(format!(
            "path {:?} escapes root {:?}",
            p, root
        )));
    }
    Ok(final_path)
}

/// Posix-style relative name for `path` under `root`.
pub fn rel_name(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Turn a posix relative name back into a path under `root`.
pub fn join_rel(root: &Path, name: &str) -> PathBuf {
    let mut p = root.to_path_buf();
    for part in name.split('/').filter(|s| !s.is_empty()) {
        p.push(part);
    }
    p
}

pub fn ensure_dir_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path).map_err(|e| Error::fs(path, e))?;
    }
    Ok(())
}

pub fn ensure_parent_exists(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir_exists(parent)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn header_layout_is_big_endian() {
        let h = Header::new(Command::SendLargeFile, 0x0102, "ab");
        let bytes = h.encode().unwrap();
        assert_eq!(bytes.len(), HEADER_FIXED_LEN + 2);
        assert_eq!(bytes[0], Command::SendLargeFile as u8);
        assert_eq!(&bytes[1..9], &[0, 0, 0, 0, 0, 0, 1, 2]);
        assert_eq!(&bytes[9..11], &[0, 2]);
        assert_eq!(&bytes[11..], b"ab");

        let mut fixed = [0u8; HEADER_FIXED_LEN];
        fixed.copy_from_slice(&bytes[..HEADER_FIXED_LEN]);
        let (cmd, size, nlen) = parse_header_fixed(&fixed).unwrap();
        assert_eq!(cmd, Command::SendLargeFile);
        assert_eq!(size, 0x0102);
        assert_eq!(nlen, 2);
    }

    #[test]
    fn header_rejects_unknown_command_and_long_names() {
        let mut fixed = [0u8; HEADER_FIXED_LEN];
        fixed[0] = 200;
        assert!(parse_header_fixed(&fixed).is_err());

        let long = "x".repeat(u16::MAX as usize + 1);
        assert!(Header::new(Command::ChatMessage, 0, long).encode().is_err());
    }

    #[test]
    fn control_codes_decode() {
        assert_eq!(decode_signal(encode_signal(-2)), -2);
        assert_eq!(encode_signal(-1), [0xff; 8]);
        assert_eq!(decode_signal(encode_signal(4_000_000)), 4_000_000);
    }

    #[test]
    fn times_record_is_24_bytes() {
        let t = FileTimes {
            created: 1.5,
            modified: 1_700_000_000.25,
            accessed: 42.0,
        };
        let rec = t.encode();
        assert_eq!(rec.len(), TIMES_RECORD_LEN);
        assert_eq!(&rec[0..8], &1.5f64.to_be_bytes());
        assert_eq!(FileTimes::decode(&rec), t);
    }

    #[test]
    fn compressed_value_shrinks_repetitive_maps() {
        let mut files = HashMap::new();
        for i in 0..500 {
            files.insert(format!("dir/sub/file_{:04}.txt", i), i as u64);
        }
        let blob = encode_value(&files).unwrap();
        assert!(blob.len() < bincode::serialize(&files).unwrap().len());
        let back: HashMap<String, u64> = decode_value(&blob).unwrap();
        assert_eq!(back, files);
        assert!(decode_value::<u64>(b"not zlib").is_err());
    }

    #[test]
    fn normalize_rejects_escapes() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        assert!(normalize_under_root(root, Path::new("../etc/passwd")).is_err());
        assert!(normalize_under_root(root, Path::new("a/../../x")).is_err());
        assert!(normalize_under_root(root, Path::new("/etc/passwd")).is_err());
        assert!(normalize_under_root(root, Path::new("file\0.txt")).is_err());

        let ok = normalize_under_root(root, Path::new("./sub/./file.txt")).unwrap();
        assert!(ok.ends_with("sub/file.txt"));
    }

    #[test]
    fn normalize_resolves_existing_files() {
        let tmp = TempDir::new().unwrap();
        let sub = tmp.path().join("sub");
        fs::create_dir(&sub).unwrap();
        fs::write(sub.join("f.txt"), "x").unwrap();
        let p = normalize_under_root(tmp.path(), Path::new("sub/f.txt")).unwrap();
        assert_eq!(p, sub.join("f.txt").canonicalize().unwrap());
    }

    #[test]
    fn rel_names_are_posix() {
        let root = Path::new("/data/root");
        assert_eq!(
            rel_name(root, &root.join("a").join("b.txt")).as_deref(),
            Some("a/b.txt")
        );
        assert_eq!(rel_name(root, root), None);
        assert_eq!(join_rel(root, "a/b.txt"), root.join("a").join("b.txt"));
    }

    #[test]
    fn ensure_parent_creates_nested_dirs() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("x").join("y").join("z.bin");
        ensure_parent_exists(&file).unwrap();
        assert!(file.parent().unwrap().is_dir());
        ensure_dir_exists(file.parent().unwrap()).unwrap();
    }
}
