//! Shared transfer progress
//!
//! Workers bump one counter under a mutex. Resumed bytes shrink the total
//! instead of counting as progress. A display thread can poll `snapshot()`.

use crossterm::style::{Color, Stylize};
use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

const BAR_TEMPLATE: &str =
    "{spinner:.green} {prefix} [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Running,
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressState {
    pub current: u64,
    pub total: u64,
    pub status: Status,
}

#[derive(Debug)]
pub struct Progress {
    state: Mutex<ProgressState>,
}

impl Progress {
    pub fn new(total: u64) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ProgressState {
                current: 0,
                total,
                status: Status::Running,
            }),
        })
    }

    pub fn add_done(&self, bytes: u64) {
        self.state.lock().current += bytes;
    }

    /// The receiver already held `bytes`; they will never be sent.
    pub fn discount_resumed(&self, bytes: u64) {
        let mut s = self.state.lock();
        s.total = s.total.saturating_sub(bytes);
    }

    /// A file dropped out before any of its bytes were streamed.
    pub fn discount_skipped(&self, bytes: u64) {
        self.discount_resumed(bytes);
    }

    pub fn grow_total(&self, bytes: u64) {
        self.state.lock().total += bytes;
    }

    /// Set the final status; only the first call wins.
    pub fn finish(&self, failed: bool) {
        let mut s = self.state.lock();
        if s.status == Status::Running {
            s.status = if failed { Status::Failure } else { Status::Success };
        }
    }

    pub fn snapshot(&self) -> ProgressState {
        *self.state.lock()
    }
}

/// Terminal rendering of a `Progress`, polled from its own thread.
pub struct ProgressDisplay {
    bar: ProgressBar,
    started: Instant,
}

impl ProgressDisplay {
    pub fn new(label: &str) -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::default_bar()
                .template(BAR_TEMPLATE)
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        bar.set_prefix(label.to_string());
        Self {
            bar,
            started: Instant::now(),
        }
    }

    /// Refresh until the progress leaves `Running`, then print the final line.
    pub fn follow(self, progress: Arc<Progress>) {
        loop {
            let s = progress.snapshot();
            self.bar.set_length(s.total);
            self.bar.set_position(s.current.min(s.total));
            if s.status != Status::Running {
                self.finish(s);
                return;
            }
            std::thread::sleep(Duration::from_millis(150));
        }
    }

    fn finish(&self, s: ProgressState) {
        let secs = self.started.elapsed().as_secs_f64();
        let mb = s.current as f64 / 1_048_576.0;
        let line = format!("{:.1} MB in {:.1}s", mb, secs);
        let msg = match s.status {
            Status::Failure => format!(
                "{} {}",
                "Finished with failures".with(Color::Red).bold(),
                line
            ),
            _ => format!("{} {}", "Completed".with(Color::Green).bold(), line),
        };
        self.bar.finish_and_clear();
        eprintln!("{}", msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resumed_bytes_shrink_total() {
        let p = Progress::new(10_000_000);
        p.discount_resumed(4_000_000);
        p.add_done(6_000_000);
        let s = p.snapshot();
        assert_eq!(s.total, 6_000_000);
        assert_eq!(s.current, 6_000_000);
        assert_eq!(s.status, Status::Running);
    }

    #[test]
    fn final_status_is_set_once() {
        let p = Progress::new(1);
        p.finish(true);
        p.finish(false);
        assert_eq!(p.snapshot().status, Status::Failure);
    }

    #[test]
    fn concurrent_updates_are_counted() {
        let p = Progress::new(8 * 1000);
        std::thread::scope(|s| {
            for _ in 0..8 {
                let p = &p;
                s.spawn(move || {
                    for _ in 0..1000 {
                        p.add_done(1);
                    }
                });
            }
        });
        assert_eq!(p.snapshot().current, 8000);
    }
}
