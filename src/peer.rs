//! Responder side of a session: the dispatch loop on the primary connection

use crate::checksum::{self, DigestRequest};
use crate::config::Config;
use crate::conn::Connection;
use crate::diff;
use crate::error::{Error, Result};
use crate::fs_enum::{self, FolderSnapshot};
use crate::progress::Progress;
use crate::protocol::{signal, Command};
use crate::protocol_core::{ensure_dir_exists, normalize_under_root, Header};
use crate::scheduler;
use crate::session::{local_username, Session};
use crate::transfer;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command as ShellCommand, Stdio};
use tracing::{debug, error, info, warn};

/// Directory -> (access time, modify time), sent ahead of a folder transfer.
pub type FolderManifest = HashMap<String, (f64, f64)>;

/// Reply to `GetSysinfo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SysInfo {
    pub hostname: String,
    pub username: String,
    pub platform: String,
    pub cpus: usize,
    pub physical_cores: usize,
}

impl SysInfo {
    pub fn local() -> Self {
        Self {
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_default(),
            username: local_username(),
            platform: std::env::consts::OS.to_string(),
            cpus: num_cpus::get(),
            physical_cores: num_cpus::get_physical(),
        }
    }
}

/// Exit status reported when the command could not be started.
pub const SPAWN_FAILED: u64 = u64::MAX;

/// Serve commands from the initiator until it closes the session or the
/// primary connection fails. Returns `Ok` on an orderly close.
pub fn serve(session: &Session, cfg: &Config) -> Result<()> {
    let mut primary = session.primary();
    loop {
        let header = match primary.recv_header() {
            Ok(h) => h,
            Err(Error::PeerGone) => {
                info!("{} went away", session.peer());
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        debug!("{:?} {:?} ({} bytes)", header.command, header.name, header.size);

        let r = match header.command {
            Command::SendFolder => receive_folder(session, &mut primary, cfg, &header),
            Command::CompareFolder => serve_compare(&mut primary, cfg, &header),
            Command::ForceSyncFolder => serve_force_sync(&mut primary, cfg, &header),
            Command::ExecuteShell => run_shell(&mut primary, &header.name),
            Command::GetSysinfo => primary.send_value(&SysInfo::local()),
            Command::ChatMessage => {
                info!("[{}] {}", session.peer(), header.name);
                Ok(())
            }
            Command::SpeedTest | Command::PushClipboard | Command::PullClipboard => {
                debug!("{:?} is not supported here", header.command);
                primary.send_header(&Header::bare(Command::Null))
            }
            Command::SessionClose => {
                info!("{} closed the session", session.peer());
                return Ok(());
            }
            other => Err(Error::protocol(format!("unexpected {:?} on primary connection", other))),
        };
        let r = r.and_then(|_| primary.flush());

        match r {
            Ok(()) => {}
            Err(e) if e.is_session_fatal() => {
                error!("session with {} failed: {}", session.peer(), e);
                return Err(e);
            }
            Err(e) => warn!("{:?} failed: {}", header.command, e),
        }
    }
}

/// Resolve a peer-named folder under the save path.
fn folder_under_save_path(cfg: &Config, name: &str) -> Result<PathBuf> {
    ensure_dir_exists(&cfg.save_path)?;
    normalize_under_root(&cfg.save_path, Path::new(name))
}

fn receive_folder(
    session: &Session,
    primary: &mut Connection,
    cfg: &Config,
    header: &Header,
) -> Result<()> {
    let manifest: FolderManifest = primary.recv_value()?;

    let mut workers = match session.try_workers() {
        Ok(w) => w,
        Err(e) => {
            primary.send_signal(signal::CANCEL)?;
            return Err(e);
        }
    };
    let dest = match folder_under_save_path(cfg, &header.name).and_then(|d| {
        ensure_dir_exists(&d)?;
        Ok(d)
    }) {
        Ok(d) => d,
        Err(e) => {
            primary.send_signal(signal::CANCEL)?;
            return Err(Error::Refused(format!("{}: {}", header.name, e)));
        }
    };
    for dir in manifest.keys() {
        let made = normalize_under_root(&dest, Path::new(dir)).and_then(|p| ensure_dir_exists(&p));
        if let Err(e) = made {
            warn!("cannot create directory {}: {}", dir, e);
        }
    }
    primary.send_signal(signal::CONTINUE)?;
    primary.flush()?;
    info!("receiving {} ({} bytes) into {}", header.name, header.size, dest.display());

    let progress = Progress::new(header.size);
    let failures = scheduler::run_receivers(&mut workers, &dest, &progress);
    progress.finish(failures > 0);
    restore_dir_times(&dest, &manifest);

    if failures > 0 {
        warn!("{} files failed to arrive in {}", failures, dest.display());
    }
    primary.send_command(Command::Finished, failures, &header.name)
}

/// Deepest first, so stamping a child does not disturb its parent's mtime.
fn restore_dir_times(dest: &Path, manifest: &FolderManifest) {
    let mut dirs: Vec<(&String, &(f64, f64))> = manifest.iter().collect();
    dirs.sort_by_key(|(name, _)| std::cmp::Reverse(name.matches('/').count()));
    for (name, &(atime, mtime)) in dirs {
        let Ok(path) = normalize_under_root(dest, Path::new(name)) else {
            continue;
        };
        let stamped = filetime::set_file_times(
            &path,
            transfer::file_time(atime),
            transfer::file_time(mtime),
        );
        if let Err(e) = stamped {
            debug!("could not set times on {}: {}", path.display(), e);
        }
    }
}

/// Snapshot the named folder and send it, or the reason it cannot be read.
fn send_snapshot(primary: &mut Connection, cfg: &Config, name: &str) -> Result<Option<PathBuf>> {
    let snap = folder_under_save_path(cfg, name)
        .and_then(|root| Ok((fs_enum::snapshot(&root)?, root)));
    match snap {
        Ok((snap, root)) => {
            primary.send_value(&std::result::Result::<FolderSnapshot, String>::Ok(snap))?;
            Ok(Some(root))
        }
        Err(e) => {
            warn!("cannot snapshot {}: {}", name, e);
            primary.send_value(&std::result::Result::<FolderSnapshot, String>::Err(e.to_string()))?;
            Ok(None)
        }
    }
}

fn serve_compare(primary: &mut Connection, cfg: &Config, header: &Header) -> Result<()> {
    let Some(root) = send_snapshot(primary, cfg, &header.name)? else {
        return Ok(());
    };
    primary.flush()?;
    loop {
        match primary.recv_value::<DigestRequest>()? {
            DigestRequest::Digest { full, names, params } => {
                debug!("{} {} digests requested", names.len(), if full { "full" } else { "fast" });
                let map = checksum::digest_many(&root, &names, full, &params)?;
                primary.send_value(&map)?;
                primary.flush()?;
            }
            DigestRequest::Done => return Ok(()),
        }
    }
}

fn serve_force_sync(primary: &mut Connection, cfg: &Config, header: &Header) -> Result<()> {
    let Some(root) = send_snapshot(primary, cfg, &header.name)? else {
        return Ok(());
    };
    primary.flush()?;
    let Some(remove) = primary.recv_value::<Option<Vec<String>>>()? else {
        info!("force-sync of {} declined", header.name);
        return Ok(());
    };
    let names = remove.into_iter().collect();
    let trash = diff::trash_batch_dir(&cfg.trash_dir());
    let failed = diff::move_to_trash(&root, &names, &trash);
    primary.send_value(&failed)
}

fn shell_for(cmd: &str) -> ShellCommand {
    let line = format!("{} 2>&1", cmd);
    if cfg!(windows) {
        let mut c = ShellCommand::new("cmd");
        c.arg("/C").arg(line);
        c
    } else {
        let mut c = ShellCommand::new("sh");
        c.arg("-c").arg(line);
        c
    }
}

/// Cut at a char boundary so the line fits a header name.
fn fit_header_name(line: &str) -> &str {
    let max = u16::MAX as usize;
    if line.len() <= max {
        return line;
    }
    let mut end = max;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    &line[..end]
}

fn run_shell(primary: &mut Connection, cmd: &str) -> Result<()> {
    info!("running {:?}", cmd);
    let mut child = match shell_for(cmd).stdin(Stdio::null()).stdout(Stdio::piped()).spawn() {
        Ok(c) => c,
        Err(e) => {
            warn!("cannot start {:?}: {}", cmd, e);
            return primary.send_command(Command::Finished, SPAWN_FAILED, "");
        }
    };
    if let Some(out) = child.stdout.take() {
        for line in BufReader::new(out).lines() {
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    debug!("output read stopped: {}", e);
                    break;
                }
            };
            primary.send_command(Command::CommandOutputLine, 0, fit_header_name(&line))?;
        }
    }
    let code = match child.wait() {
        Ok(status) => status.code().map(|c| c as u32 as u64).unwrap_or(SPAWN_FAILED),
        Err(_) => SPAWN_FAILED,
    };
    primary.send_command(Command::Finished, code, "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_lines_are_cut_on_char_boundary() {
        let s = "é".repeat(40_000);
        let cut = fit_header_name(&s);
        assert!(cut.len() <= u16::MAX as usize);
        assert!(cut.chars().all(|c| c == 'é'));
        assert_eq!(fit_header_name("short"), "short");
    }

    #[test]
    fn sysinfo_reports_cores() {
        let s = SysInfo::local();
        assert!(s.cpus >= 1);
        assert!(s.physical_cores >= 1);
        assert_eq!(s.platform, std::env::consts::OS);
    }
}
