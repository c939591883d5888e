//! Per-file send/receive with partial-download resume
//!
//! Large files travel one per header and resume from whatever the receiver
//! already holds in its temp file. Small files travel in batches: one
//! header, one compressed file list, then the concatenated bodies.
//!
//! Send/receive functions return `Err` only when the connection itself is
//! unusable; per-file problems come back as `Ok(false)` or in a failure list.

use crate::conn::Connection;
use crate::error::{Error, Result};
use crate::fs_enum::FileRecord;
use crate::progress::Progress;
use crate::protocol::{signal, Command, IO_CHUNK, TEMP_SUFFIX, TIMES_RECORD_LEN};
use crate::protocol_core::{ensure_parent_exists, join_rel, normalize_under_root, FileTimes, Header};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};
use tracing::{debug, warn};

/// `<dest>.tandem-part`
pub fn temp_path_for(dest: &Path) -> PathBuf {
    let mut s = dest.as_os_str().to_os_string();
    s.push(TEMP_SUFFIX);
    PathBuf::from(s)
}

/// First free name among `dest`, `stem (1).ext`, `stem (2).ext`, ...
pub fn unique_destination(dest: &Path) -> PathBuf {
    if !dest.exists() {
        return dest.to_path_buf();
    }
    let stem = dest
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = dest
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let parent = dest.parent().unwrap_or(Path::new(""));
    (1u32..)
        .map(|i| parent.join(format!("{} ({}){}", stem, i, ext)))
        .find(|p| !p.exists())
        .unwrap_or_else(|| dest.to_path_buf())
}

pub(crate) fn file_time(secs: f64) -> filetime::FileTime {
    let d = Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or_default();
    filetime::FileTime::from_system_time(UNIX_EPOCH + d)
}

/// Apply received timestamps. Creation time only where the platform lets us.
pub fn apply_times(path: &Path, times: &FileTimes) -> std::io::Result<()> {
    filetime::set_file_times(path, file_time(times.accessed), file_time(times.modified))?;
    #[cfg(windows)]
    set_creation_time(path, times.created)?;
    Ok(())
}

#[cfg(windows)]
fn set_creation_time(path: &Path, created: f64) -> std::io::Result<()> {
    use std::os::windows::fs::OpenOptionsExt;
    use std::os::windows::io::AsRawHandle;
    use windows::Win32::Foundation::{FILETIME, HANDLE};
    use windows::Win32::Storage::FileSystem::{
        SetFileTime, FILE_FLAG_BACKUP_SEMANTICS, FILE_WRITE_ATTRIBUTES,
    };

    let f = OpenOptions::new()
        .access_mode(FILE_WRITE_ATTRIBUTES.0)
        .custom_flags(FILE_FLAG_BACKUP_SEMANTICS.0)
        .open(path)?;
    // 100ns ticks since 1601-01-01
    let ticks = ((created.max(0.0) + 11_644_473_600.0) * 10_000_000.0) as u64;
    let ft = FILETIME {
        dwLowDateTime: ticks as u32,
        dwHighDateTime: (ticks >> 32) as u32,
    };
    unsafe { SetFileTime(HANDLE(f.as_raw_handle() as isize), Some(&ft as *const _), None, None) }
        .map_err(std::io::Error::other)
}

/// Send one large file, resuming at the receiver's offset.
pub fn send_large_file(
    conn: &mut Connection,
    root: &Path,
    rec: &FileRecord,
    progress: &Progress,
) -> Result<bool> {
    let path = join_rel(root, &rec.name);
    let mut file = match File::open(&path) {
        Ok(f) => f,
        Err(e) => {
            warn!("cannot open {}: {}", path.display(), e);
            progress.discount_skipped(rec.size);
            return Ok(false);
        }
    };

    conn.send_command(Command::SendLargeFile, rec.size, &rec.name)?;
    let offset = match conn.recv_signal()? {
        signal::FAIL_TO_OPEN => {
            warn!("peer cannot open destination for {}", rec.name);
            progress.discount_skipped(rec.size);
            return Ok(false);
        }
        s if s < 0 => {
            warn!("peer refused {} (code {})", rec.name, s);
            progress.discount_skipped(rec.size);
            return Ok(false);
        }
        s if s as u64 > rec.size => {
            return Err(Error::protocol(format!(
                "resume offset {} beyond size {} for {}",
                s, rec.size, rec.name
            )));
        }
        s => s as u64,
    };
    if offset > 0 {
        debug!("resuming {} at {} of {}", rec.name, offset, rec.size);
        progress.discount_resumed(offset);
    }

    if let Err(e) = file.seek(SeekFrom::Start(offset)) {
        // The peer is waiting for bytes we cannot produce
        conn.close();
        return Err(Error::fs(&path, e));
    }
    let mut remaining = rec.size - offset;
    let mut buf = vec![0u8; IO_CHUNK.min(remaining.max(1) as usize)];
    while remaining > 0 {
        let want = (remaining as usize).min(buf.len());
        let n = match file.read(&mut buf[..want]) {
            Ok(0) => {
                conn.close();
                let shrank = std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "file shrank during transfer",
                );
                return Err(Error::fs(&path, shrank));
            }
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                conn.close();
                return Err(Error::fs(&path, e));
            }
        };
        conn.send_bytes(&buf[..n])?;
        remaining -= n as u64;
        progress.add_done(n as u64);
    }
    conn.send_bytes(&rec.times.encode())?;
    conn.flush()?;
    Ok(conn.recv_signal()? == signal::CONTINUE)
}

/// Receive one large file announced by `header` into `dest_root`.
pub fn receive_large_file(
    conn: &mut Connection,
    dest_root: &Path,
    header: &Header,
    progress: &Progress,
) -> Result<bool> {
    let opened = normalize_under_root(dest_root, Path::new(&header.name)).and_then(|dest| {
        let tmp = temp_path_for(&dest);
        ensure_parent_exists(&tmp)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&tmp)
            .map_err(|e| Error::fs(&tmp, e))?;
        Ok((dest, tmp, file))
    });
    let (dest, tmp, mut file) = match opened {
        Ok(x) => x,
        Err(e) => {
            warn!("cannot open destination for {}: {}", header.name, e);
            conn.send_signal(signal::FAIL_TO_OPEN)?;
            return Ok(false);
        }
    };

    let mut held = file.metadata().map(|m| m.len()).unwrap_or(0);
    if held > header.size {
        // Stale partial from a different version of the file
        held = 0;
        if file.set_len(0).is_err() {
            conn.send_signal(signal::FAIL_TO_OPEN)?;
            return Ok(false);
        }
    }
    if file.seek(SeekFrom::Start(held)).is_err() {
        conn.send_signal(signal::FAIL_TO_OPEN)?;
        return Ok(false);
    }
    conn.send_signal(held as i64)?;
    if held > 0 {
        progress.discount_resumed(held);
    }

    // Unbuffered so an interrupted body keeps every byte that arrived
    let written =
        conn.recv_to_writer(header.size - held, &mut file, &mut |n| progress.add_done(n))?;
    let mut rec = [0u8; TIMES_RECORD_LEN];
    conn.recv_into(&mut rec)?;
    let times = FileTimes::decode(&rec);

    let flushed = written.and_then(|_| file.sync_all());
    drop(file);
    if let Err(e) = flushed {
        warn!("write failed for {}: {}", tmp.display(), e);
        conn.send_signal(signal::CANCEL)?;
        return Ok(false);
    }

    match finalize(&tmp, &dest, &times) {
        Ok(final_path) => {
            debug!("received {}", final_path.display());
            conn.send_signal(signal::CONTINUE)?;
            Ok(true)
        }
        Err(e) => {
            warn!("could not finalize {}: {}", header.name, e);
            conn.send_signal(signal::CANCEL)?;
            Ok(false)
        }
    }
}

/// Rename the finished temp file into place and stamp it.
fn finalize(tmp: &Path, dest: &Path, times: &FileTimes) -> Result<PathBuf> {
    let target = unique_destination(dest);
    fs::rename(tmp, &target).map_err(|e| Error::fs(&target, e))?;
    if let Err(e) = apply_times(&target, times) {
        warn!("could not set times on {}: {}", target.display(), e);
    }
    Ok(target)
}

/// Send a batch of small files. Returns the names the receiver stored.
pub fn send_small_batch(
    conn: &mut Connection,
    root: &Path,
    files: &[FileRecord],
    progress: &Progress,
) -> Result<Vec<String>> {
    let mut entries = Vec::with_capacity(files.len());
    let mut bodies = Vec::with_capacity(files.len());
    for rec in files {
        let path = join_rel(root, &rec.name);
        match fs::read(&path) {
            Ok(data) => {
                if data.len() as u64 != rec.size {
                    // Changed since the scan; account for what we will actually send
                    progress.discount_skipped(rec.size);
                    progress.grow_total(data.len() as u64);
                }
                entries.push(FileRecord {
                    name: rec.name.clone(),
                    size: data.len() as u64,
                    times: rec.times,
                });
                bodies.push(data);
            }
            Err(e) => {
                warn!("cannot read {}: {}", path.display(), e);
                progress.discount_skipped(rec.size);
            }
        }
    }
    if entries.is_empty() {
        return Ok(Vec::new());
    }

    let total: u64 = entries.iter().map(|e| e.size).sum();
    conn.send_command(Command::SendSmallBatch, total, "")?;
    conn.send_value(&entries)?;
    for body in &bodies {
        conn.send_bytes(body)?;
        progress.add_done(body.len() as u64);
    }
    conn.flush()?;

    let failed: Vec<String> = conn.recv_value()?;
    Ok(entries
        .into_iter()
        .map(|e| e.name)
        .filter(|n| !failed.contains(n))
        .collect())
}

/// Receive a small-file batch. Returns the names that could not be stored.
pub fn receive_small_batch(
    conn: &mut Connection,
    dest_root: &Path,
    header: &Header,
    progress: &Progress,
) -> Result<Vec<String>> {
    let entries: Vec<FileRecord> = conn.recv_value()?;
    let declared: u64 = entries.iter().map(|e| e.size).sum();
    if declared != header.size {
        return Err(Error::protocol(format!(
            "batch list totals {} bytes, header says {}",
            declared, header.size
        )));
    }

    let mut failed = Vec::new();
    for rec in &entries {
        let opened = normalize_under_root(dest_root, Path::new(&rec.name)).and_then(|dest| {
            ensure_parent_exists(&dest)?;
            let f = File::create(&dest).map_err(|e| Error::fs(&dest, e))?;
            Ok((dest, f))
        });
        match opened {
            Ok((dest, f)) => {
                let mut w = BufWriter::new(f);
                let written = conn.recv_to_writer(rec.size, &mut w, &mut |n| progress.add_done(n))?;
                match written.and_then(|_| w.flush()) {
                    Ok(()) => {
                        drop(w);
                        if let Err(e) = apply_times(&dest, &rec.times) {
                            warn!("could not set times on {}: {}", dest.display(), e);
                        }
                    }
                    Err(e) => {
                        warn!("write failed for {}: {}", dest.display(), e);
                        failed.push(rec.name.clone());
                    }
                }
            }
            Err(e) => {
                warn!("cannot create {}: {}", rec.name, e);
                conn.recv_to_writer(rec.size, &mut std::io::sink(), &mut |n| progress.add_done(n))?
                    .ok();
                failed.push(rec.name.clone());
            }
        }
    }
    conn.send_value(&failed)?;
    Ok(failed)
}
