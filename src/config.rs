//! Persisted settings, loaded once at process entry and passed by reference

use crate::protocol::defaults;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Where received folders land.
    pub save_path: PathBuf,
    pub log_dir: PathBuf,
    // Archive thresholds; consumed by external log rotation
    pub log_max_files: usize,
    pub log_max_bytes: u64,

    pub port: u16,
    pub broadcast_port: u16,
    pub password: String,
    /// Requested worker connections; the session uses min(ours, theirs).
    pub threads: usize,

    pub large_file_threshold: u64,
    pub chunk_threshold: u64,
    pub fast_digest_threshold: u64,
    pub auth_timeout_secs: u64,

    pub tls: bool,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    /// Where force-sync moves removed files; defaults under the config dir.
    pub trash_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        let base = crate::tls::config_dir();
        Self {
            save_path: PathBuf::from("."),
            log_dir: base.join("logs"),
            log_max_files: 10,
            log_max_bytes: 64 * 1024 * 1024,
            port: defaults::PORT,
            broadcast_port: defaults::BROADCAST_PORT,
            password: String::new(),
            threads: defaults::THREADS,
            large_file_threshold: defaults::LARGE_FILE_THRESHOLD,
            chunk_threshold: defaults::CHUNK_THRESHOLD,
            fast_digest_threshold: defaults::FAST_DIGEST_THRESHOLD,
            auth_timeout_secs: defaults::AUTH_TIMEOUT_SECS,
            tls: true,
            cert_path: None,
            key_path: None,
            trash_path: None,
        }
    }
}

impl Config {
    pub fn default_path() -> PathBuf {
        crate::tls::config_dir().join("tandem.toml")
    }

    /// Read `path`, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(data) => {
                let cfg: Config = toml::from_str(&data)
                    .with_context(|| format!("parse {}", path.display()))?;
                cfg.validate()?;
                Ok(cfg)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
        }
    }

    /// Atomic write with owner-only permissions (the file holds the password).
    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&dir).ok();
        let data = toml::to_string(self)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(data.as_bytes())?;
        tmp.flush()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o600));
        }
        tmp.persist(path)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            anyhow::bail!("threads must be at least 1");
        }
        if self.chunk_threshold == 0 || self.large_file_threshold == 0 {
            anyhow::bail!("size thresholds must be non-zero");
        }
        if self.password.len() > u16::MAX as usize {
            anyhow::bail!("password too long");
        }
        Ok(())
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs.max(1))
    }

    pub fn cert_paths(&self) -> (PathBuf, PathBuf) {
        let (c, k) = crate::tls::default_cert_paths();
        (
            self.cert_path.clone().unwrap_or(c),
            self.key_path.clone().unwrap_or(k),
        )
    }

    pub fn known_hosts_path(&self) -> PathBuf {
        crate::tls::config_dir().join("known_hosts")
    }

    pub fn trash_dir(&self) -> PathBuf {
        self.trash_path
            .clone()
            .unwrap_or_else(|| crate::tls::config_dir().join("trash"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = Config::load(&tmp.path().join("nope.toml")).unwrap();
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn save_then_load() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cfg/tandem.toml");
        let mut cfg = Config::default();
        cfg.port = 10_001;
        cfg.password = "hunter2".into();
        cfg.threads = 3;
        cfg.save(&path).unwrap();
        assert_eq!(Config::load(&path).unwrap(), cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("t.toml");
        std::fs::write(&path, "port = 7000\nthreads = 2\n").unwrap();
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.port, 7000);
        assert_eq!(cfg.threads, 2);
        assert_eq!(cfg.chunk_threshold, defaults::CHUNK_THRESHOLD);
    }

    #[test]
    fn rejects_zero_threads() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("t.toml");
        std::fs::write(&path, "threads = 0\n").unwrap();
        assert!(Config::load(&path).is_err());
    }
}
