//! tracing setup: stderr always, plus an append-only file under the log dir

use anyhow::{Context, Result};
use chrono::Local;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// One file per day; archiving old files is left to the host.
pub fn log_file_path(dir: &Path) -> PathBuf {
    dir.join(format!("tandem-{}.log", Local::now().format("%Y-%m-%d")))
}

/// Install the global subscriber. `RUST_LOG` overrides the verbosity flag.
pub fn init(verbose: bool, log_dir: Option<&Path>) -> Result<()> {
    let default = if verbose { "tandem=debug" } else { "tandem=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let file_layer = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
            let path = log_file_path(dir);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("open {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(file_layer)
        .try_init()
        .context("install log subscriber")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_name_is_dated() {
        let p = log_file_path(Path::new("/var/log/tandem"));
        let name = p.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("tandem-") && name.ends_with(".log"));
        assert_eq!(name.len(), "tandem-2024-01-01.log".len());
    }
}
