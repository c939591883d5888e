//! Work partitioning and the per-connection worker loops
//!
//! Large files go one per item in an interleaved small/large order; small
//! files are shuffled and packed into batches up to the chunk threshold.
//! Every worker connection gets its own thread and pops one item at a time
//! from the shared queues until both are empty.

use crate::conn::Connection;
use crate::error::Error;
use crate::fs_enum::FileRecord;
use crate::progress::Progress;
use crate::protocol::{defaults, Command};
use crate::transfer;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::path::Path;
use tracing::{debug, warn};

/// One unit of work for a sender worker.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferBatch {
    Large(FileRecord),
    Small { total: u64, files: Vec<FileRecord> },
}

/// Result of a folder send: failures are reported, never retried.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferOutcome {
    pub requested: usize,
    pub completed: usize,
    /// Names that did not arrive, where known.
    pub failed_names: Vec<String>,
}

impl TransferOutcome {
    pub fn failed(&self) -> usize {
        self.requested.saturating_sub(self.completed)
    }
}

/// smallest, largest, second smallest, second largest, ...
pub fn interleave_by_size(mut files: Vec<FileRecord>) -> Vec<FileRecord> {
    files.sort_by_key(|f| f.size);
    let mut out = Vec::with_capacity(files.len());
    let mut lo = 0usize;
    let mut hi = files.len();
    let mut take_low = true;
    let mut slots: Vec<Option<FileRecord>> = files.into_iter().map(Some).collect();
    while lo < hi {
        let idx = if take_low {
            lo += 1;
            lo - 1
        } else {
            hi -= 1;
            hi
        };
        if let Some(f) = slots[idx].take() {
            out.push(f);
        }
        take_low = !take_low;
    }
    out
}

/// Greedy packing in the given order. A batch closes as soon as the next file
/// would push it past `chunk`; a file larger than `chunk` sits alone.
pub fn pack_batches(files: Vec<FileRecord>, chunk: u64) -> Vec<TransferBatch> {
    let mut batches = Vec::new();
    let mut cur: Vec<FileRecord> = Vec::new();
    let mut total = 0u64;
    for f in files {
        if !cur.is_empty() && total + f.size > chunk {
            batches.push(TransferBatch::Small {
                total,
                files: std::mem::take(&mut cur),
            });
            total = 0;
        }
        total += f.size;
        cur.push(f);
    }
    if !cur.is_empty() {
        batches.push(TransferBatch::Small { total, files: cur });
    }
    batches
}

/// Shared stacks popped by the worker threads.
#[derive(Debug, Default)]
pub struct WorkQueues {
    large: Mutex<Vec<TransferBatch>>,
    small: Mutex<Vec<TransferBatch>>,
}

impl WorkQueues {
    /// Partition `records` by `large_threshold` and build both queues.
    pub fn plan(records: Vec<FileRecord>, large_threshold: u64, chunk: u64) -> Self {
        let (large, mut small): (Vec<_>, Vec<_>) = records
            .into_iter()
            .partition(|r| r.size >= large_threshold);
        small.shuffle(&mut rand::thread_rng());

        // Vec::pop takes from the end, so store in reverse pop order
        let mut large: Vec<TransferBatch> = interleave_by_size(large)
            .into_iter()
            .map(TransferBatch::Large)
            .collect();
        large.reverse();
        let small = pack_batches(small, chunk);

        debug!("planned {} large files, {} small batches", large.len(), small.len());
        Self {
            large: Mutex::new(large),
            small: Mutex::new(small),
        }
    }

    /// Next item for worker `index`. The first few workers start on large files.
    pub fn next(&self, index: usize) -> Option<TransferBatch> {
        let (first, second) = if index < defaults::LARGE_FIRST_WORKERS {
            (&self.large, &self.small)
        } else {
            (&self.small, &self.large)
        };
        let item = first.lock().pop();
        item.or_else(|| second.lock().pop())
    }

    pub fn is_empty(&self) -> bool {
        self.large.lock().is_empty() && self.small.lock().is_empty()
    }
}

fn batch_names(batch: &TransferBatch) -> Vec<String> {
    match batch {
        TransferBatch::Large(r) => vec![r.name.clone()],
        TransferBatch::Small { files, .. } => files.iter().map(|f| f.name.clone()).collect(),
    }
}

/// Drain `queues` over every worker connection, one thread each. Each worker
/// ends with a `Finished` header so its receiver can stop.
pub fn run_senders(
    workers: &mut [Connection],
    root: &Path,
    queues: &WorkQueues,
    progress: &Progress,
) -> (usize, Vec<String>) {
    let results: Vec<(usize, Vec<String>)> = std::thread::scope(|s| {
        let handles: Vec<_> = workers
            .iter_mut()
            .enumerate()
            .map(|(i, conn)| s.spawn(move || sender_worker(i, conn, root, queues, progress)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|_| (0, Vec::new())))
            .collect()
    });

    let mut done = 0;
    let mut failed = Vec::new();
    for (d, f) in results {
        done += d;
        failed.extend(f);
    }
    if !queues.is_empty() {
        warn!("no live worker left for the remaining files");
        while let Some(b) = queues.next(0) {
            failed.extend(batch_names(&b));
        }
    }
    (done, failed)
}

fn sender_worker(
    index: usize,
    conn: &mut Connection,
    root: &Path,
    queues: &WorkQueues,
    progress: &Progress,
) -> (usize, Vec<String>) {
    let mut done = 0;
    let mut failed = Vec::new();
    while let Some(batch) = queues.next(index) {
        let r = match &batch {
            TransferBatch::Large(rec) => {
                transfer::send_large_file(conn, root, rec, progress).map(|ok| {
                    if ok {
                        vec![rec.name.clone()]
                    } else {
                        warn!("failed to send {}", rec.name);
                        vec![]
                    }
                })
            }
            TransferBatch::Small { files, .. } => {
                transfer::send_small_batch(conn, root, files, progress)
            }
        };
        match r {
            Ok(names) => {
                done += names.len();
                failed.extend(batch_names(&batch).into_iter().filter(|n| !names.contains(n)));
            }
            Err(e) => {
                warn!("worker {} stopped: {}", index, e);
                failed.extend(batch_names(&batch));
                conn.close();
                return (done, failed);
            }
        }
    }
    if let Err(e) = conn.send_command(Command::Finished, 0, "").and_then(|_| conn.flush()) {
        warn!("worker {} could not finish: {}", index, e);
        conn.close();
    }
    (done, failed)
}

/// Serve incoming file items on every worker connection until each one sees
/// `Finished` or dies. Returns the number of files that failed to land.
pub fn run_receivers(workers: &mut [Connection], dest_root: &Path, progress: &Progress) -> u64 {
    std::thread::scope(|s| {
        let handles: Vec<_> = workers
            .iter_mut()
            .enumerate()
            .map(|(i, conn)| s.spawn(move || receiver_worker(i, conn, dest_root, progress)))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap_or(0)).sum()
    })
}

fn receiver_worker(
    index: usize,
    conn: &mut Connection,
    dest_root: &Path,
    progress: &Progress,
) -> u64 {
    let mut failures = 0u64;
    loop {
        let header = match conn.recv_header() {
            Ok(h) => h,
            Err(e) => {
                warn!("worker {} lost: {}", index, e);
                conn.close();
                return failures;
            }
        };
        let r = match header.command {
            Command::Finished => return failures,
            Command::SendLargeFile => {
                transfer::receive_large_file(conn, dest_root, &header, progress)
                    .map(|ok| u64::from(!ok))
            }
            Command::SendSmallBatch => {
                transfer::receive_small_batch(conn, dest_root, &header, progress)
                    .map(|f| f.len() as u64)
            }
            other => Err(Error::protocol(format!("unexpected {:?} on worker connection", other))),
        };
        match r {
            Ok(n) => failures += n,
            Err(e) => {
                warn!("worker {} stopped: {}", index, e);
                failures += 1;
                conn.close();
                return failures;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol_core::FileTimes;

    fn rec(name: &str, size: u64) -> FileRecord {
        FileRecord {
            name: name.to_string(),
            size,
            times: FileTimes::default(),
        }
    }

    fn sizes(files: &[FileRecord]) -> Vec<u64> {
        files.iter().map(|f| f.size).collect()
    }

    #[test]
    fn interleave_alternates_ends() {
        let files = [5, 1, 4, 2, 3, 6].iter().map(|&s| rec(&s.to_string(), s)).collect();
        assert_eq!(sizes(&interleave_by_size(files)), vec![1, 6, 2, 5, 3, 4]);
        let odd = [3, 1, 2].iter().map(|&s| rec(&s.to_string(), s)).collect();
        assert_eq!(sizes(&interleave_by_size(odd)), vec![1, 3, 2]);
        assert!(interleave_by_size(Vec::new()).is_empty());
    }

    #[test]
    fn batches_never_exceed_chunk_unless_alone() {
        let files = vec![
            rec("a", 40),
            rec("b", 60),
            rec("c", 1),
            rec("d", 250),
            rec("e", 99),
            rec("f", 1),
        ];
        let batches = pack_batches(files, 100);
        let mut seen = 0;
        for b in &batches {
            let TransferBatch::Small { total, files } = b else {
                panic!("large item in small batches");
            };
            assert_eq!(*total, files.iter().map(|f| f.size).sum::<u64>());
            assert!(*total <= 100 || files.len() == 1);
            seen += files.len();
        }
        assert_eq!(seen, 6);
        // Exactly at the boundary stays in one batch
        assert!(matches!(
            &batches[0],
            TransferBatch::Small { total: 100, files } if files.len() == 2
        ));
        assert!(matches!(
            &batches[2],
            TransferBatch::Small { total: 250, files } if files.len() == 1
        ));
    }

    #[test]
    fn plan_partitions_at_threshold() {
        let records = vec![
            rec("tiny", 10),
            rec("edge", 1000),
            rec("big", 5000),
            rec("just_under", 999),
        ];
        let q = WorkQueues::plan(records, 1000, 4096);
        let mut large = vec![];
        let mut small = vec![];
        while let Some(b) = q.next(0) {
            match b {
                TransferBatch::Large(r) => large.push(r.name),
                TransferBatch::Small { files, .. } => {
                    small.extend(files.into_iter().map(|f| f.name))
                }
            }
        }
        assert_eq!(large, vec!["edge", "big"]);
        small.sort();
        assert_eq!(small, vec!["just_under", "tiny"]);
        assert!(q.is_empty());
    }

    #[test]
    fn later_workers_start_on_small_files() {
        let q = WorkQueues::plan(vec![rec("big", 10_000), rec("s", 1)], 1000, 4096);
        assert!(matches!(q.next(defaults::LARGE_FIRST_WORKERS), Some(TransferBatch::Small { .. })));
        assert!(matches!(q.next(defaults::LARGE_FIRST_WORKERS), Some(TransferBatch::Large(_))));
        assert!(q.next(0).is_none());
    }

    #[test]
    fn outcome_counts_failures() {
        let o = TransferOutcome {
            requested: 5,
            completed: 3,
            failed_names: vec![],
        };
        assert_eq!(o.failed(), 2);
    }
}
