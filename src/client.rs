//! Initiator side of a session: folder send, compare, force-sync and the
//! small request/reply commands

use crate::checksum::{self, DigestMap, DigestParams, DigestRequest};
use crate::config::Config;
use crate::conn::Connection;
use crate::diff::{self, CompareReport, CompareResult, SyncPlan};
use crate::error::{Error, Result};
use crate::fs_enum::{self, FolderSnapshot};
use crate::peer::{FolderManifest, SysInfo, SPAWN_FAILED};
use crate::progress::{Progress, ProgressDisplay};
use crate::protocol::{signal, Command};
use crate::scheduler::{self, TransferOutcome, WorkQueues};
use crate::session::Session;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a force-sync did.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub result: CompareResult,
    pub plan: SyncPlan,
    /// The operator said no; nothing was removed or sent.
    pub declined: bool,
    pub removal_failures: Vec<String>,
    pub outcome: Option<TransferOutcome>,
}

pub struct Client<'a> {
    session: &'a Session,
    cfg: &'a Config,
    show_progress: bool,
}

impl<'a> Client<'a> {
    pub fn new(session: &'a Session, cfg: &'a Config) -> Self {
        Self {
            session,
            cfg,
            show_progress: false,
        }
    }

    pub fn with_progress(mut self, on: bool) -> Self {
        self.show_progress = on;
        self
    }

    fn digest_params(&self) -> DigestParams {
        DigestParams::with_threshold(self.cfg.fast_digest_threshold)
    }

    /// Send every file under `src` into `<peer save path>/<dest_name>`.
    pub fn send_folder(&self, src: &Path, dest_name: &str) -> Result<TransferOutcome> {
        let snap = fs_enum::snapshot(src)?;
        let names: Vec<String> = snap.files.keys().cloned().collect();
        self.send_files(src, dest_name, names, snap.dirs)
    }

    /// Send the named files under `src`, creating the manifest directories first.
    pub fn send_files(
        &self,
        src: &Path,
        dest_name: &str,
        names: Vec<String>,
        manifest: FolderManifest,
    ) -> Result<TransferOutcome> {
        let mut workers = self.session.try_workers()?;
        self.send_over(&mut workers, src, dest_name, names, manifest)
    }

    fn send_over(
        &self,
        workers: &mut [Connection],
        src: &Path,
        dest_name: &str,
        names: Vec<String>,
        manifest: FolderManifest,
    ) -> Result<TransferOutcome> {
        let (records, missing) = fs_enum::records_for(src, &names);
        let total: u64 = records.iter().map(|r| r.size).sum();

        let mut primary = self.session.primary();
        primary.send_command(Command::SendFolder, total, dest_name)?;
        primary.send_value(&manifest)?;
        primary.flush()?;
        if primary.recv_signal()? != signal::CONTINUE {
            return Err(Error::Refused(format!("peer declined folder {}", dest_name)));
        }
        info!("sending {} files ({} bytes) to {}", records.len(), total, dest_name);

        let progress = Progress::new(total);
        let display = self.show_progress.then(|| {
            let p = Arc::clone(&progress);
            let label = dest_name.to_string();
            std::thread::spawn(move || ProgressDisplay::new(&label).follow(p))
        });

        let queues = WorkQueues::plan(
            records,
            self.cfg.large_file_threshold,
            self.cfg.chunk_threshold,
        );
        let (completed, mut failed_names) =
            scheduler::run_senders(workers, src, &queues, &progress);
        failed_names.extend(missing);
        let finished = primary.expect_header(Command::Finished);

        progress.finish(!failed_names.is_empty() || finished.is_err());
        if let Some(h) = display {
            let _ = h.join();
        }
        let finished = finished?;
        if finished.size > 0 {
            warn!("peer reports {} files not stored", finished.size);
        }
        failed_names.sort();
        for name in &failed_names {
            warn!("not transferred: {}", name);
        }
        Ok(TransferOutcome {
            requested: names.len(),
            completed,
            failed_names,
        })
    }

    fn recv_snapshot(primary: &mut Connection, remote: &str) -> Result<FolderSnapshot> {
        primary
            .recv_value::<std::result::Result<FolderSnapshot, String>>()?
            .map_err(|e| Error::Refused(format!("{}: {}", remote, e)))
    }

    /// One digest stage: hash `names` here and on the peer at the same time.
    fn digest_round(
        &self,
        primary: &mut Connection,
        src: &Path,
        names: Vec<String>,
        full: bool,
    ) -> Result<(BTreeSet<String>, BTreeSet<String>)> {
        if names.is_empty() {
            return Ok(Default::default());
        }
        let params = self.digest_params();
        let (local, remote) = std::thread::scope(|s| {
            let local = s.spawn(|| checksum::digest_many(src, &names, full, &params));
            let remote = primary
                .send_value(&DigestRequest::Digest {
                    full,
                    names: names.clone(),
                    params,
                })
                .and_then(|_| primary.flush())
                .and_then(|_| primary.recv_value::<DigestMap>());
            let local = local.join().unwrap_or_else(|_| {
                Err(Error::Io(std::io::Error::other("digest worker panicked")))
            });
            (local, remote)
        });
        Ok(diff::match_digests(&names, &local?, &remote?))
    }

    /// Read-only compare of `src` against the peer's `remote` folder, with
    /// tiered hashing on the size-equal files.
    pub fn compare_folder(&self, src: &Path, remote: &str) -> Result<CompareReport> {
        let local = fs_enum::snapshot(src)?;
        debug!(
            "comparing {} files ({} bytes) with {}",
            local.files.len(),
            local.total_bytes(),
            remote
        );
        let mut primary = self.session.primary();
        primary.send_command(Command::CompareFolder, 0, remote)?;
        primary.flush()?;
        let target = Self::recv_snapshot(&mut primary, remote)?;

        let result = diff::compare(&local.files, target.files);
        let threshold = self.digest_params().threshold;

        let candidates: Vec<String> = result.equal.iter().cloned().collect();
        let (fast_same, mut content_mismatch) =
            self.digest_round(&mut primary, src, candidates, false)?;

        // Only sampled files need the second, full pass
        let sampled: Vec<String> = fast_same
            .iter()
            .filter(|n| local.files.get(*n).copied().unwrap_or(0) >= threshold)
            .cloned()
            .collect();
        let (_, full_differ) = self.digest_round(&mut primary, src, sampled, true)?;

        primary.send_value(&DigestRequest::Done)?;
        primary.flush()?;

        let content_equal = fast_same.difference(&full_differ).cloned().collect();
        content_mismatch.extend(full_differ);
        Ok(CompareReport {
            result,
            content_equal,
            content_mismatch,
        })
    }

    /// Make the peer's `remote` folder match `src`. `confirm` sees exactly the
    /// paths that will be removed and decides whether to go ahead.
    pub fn force_sync<F>(&self, src: &Path, remote: &str, confirm: F) -> Result<SyncReport>
    where
        F: FnOnce(&BTreeSet<String>) -> bool,
    {
        let local = fs_enum::snapshot(src)?;
        // Hold the pool from the start so nothing is removed without a resend
        let mut workers = self.session.try_workers()?;
        let mut primary = self.session.primary();
        primary.send_command(Command::ForceSyncFolder, 0, remote)?;
        primary.flush()?;
        let target = Self::recv_snapshot(&mut primary, remote)?;

        let (result, plan) = diff::plan_force_sync(&local, &target);
        if !plan.remove.is_empty() && !confirm(&plan.remove) {
            primary.send_value(&None::<Vec<String>>)?;
            primary.flush()?;
            return Ok(SyncReport {
                result,
                plan,
                declined: true,
                ..Default::default()
            });
        }
        primary.send_value(&Some(plan.remove.iter().cloned().collect::<Vec<_>>()))?;
        primary.flush()?;
        let removal_failures: Vec<String> = primary.recv_value()?;
        drop(primary);
        for name in &removal_failures {
            warn!("could not remove {} on peer", name);
        }

        let outcome = if plan.send.is_empty() {
            None
        } else {
            let names = plan.send.iter().cloned().collect();
            Some(self.send_over(&mut workers, src, remote, names, local.dirs.clone())?)
        };
        Ok(SyncReport {
            result,
            plan,
            declined: false,
            removal_failures,
            outcome,
        })
    }

    /// Run `cmd` on the peer, feeding each output line to `on_line`. Returns
    /// the exit code, or `None` when the peer could not start the command.
    pub fn exec<F: FnMut(&str)>(&self, cmd: &str, mut on_line: F) -> Result<Option<u64>> {
        let mut primary = self.session.primary();
        primary.send_command(Command::ExecuteShell, 0, cmd)?;
        primary.flush()?;
        loop {
            let h = primary.recv_header()?;
            match h.command {
                Command::CommandOutputLine => on_line(&h.name),
                Command::Finished => return Ok((h.size != SPAWN_FAILED).then_some(h.size)),
                other => {
                    return Err(Error::protocol(format!(
                        "unexpected {:?} during shell output",
                        other
                    )))
                }
            }
        }
    }

    pub fn sysinfo(&self) -> Result<SysInfo> {
        let mut primary = self.session.primary();
        primary.send_command(Command::GetSysinfo, 0, "")?;
        primary.flush()?;
        primary.recv_value()
    }

    pub fn chat(&self, msg: &str) -> Result<()> {
        let mut primary = self.session.primary();
        primary.send_command(Command::ChatMessage, 0, msg)?;
        primary.flush()
    }

    /// Tell the peer we are done and drop every connection.
    pub fn close(self) -> Result<()> {
        {
            let mut primary = self.session.primary();
            primary.send_command(Command::SessionClose, 0, "")?;
            primary.flush()?;
        }
        self.session.shutdown();
        Ok(())
    }
}
