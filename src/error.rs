//! Error taxonomy for sessions and transfers

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Wrong password, bad voucher or malformed pre-session frame.
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// The underlying stream returned a zero-length read.
    #[error("peer disappeared")]
    PeerGone,

    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("value codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("{path}: {source}")]
    FileSystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A folder operation is already running on this session.
    #[error("session busy with another folder operation")]
    Busy,

    /// The peer answered but declined the operation.
    #[error("peer refused: {0}")]
    Refused(String),

    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::FileSystem {
            path: path.into(),
            source,
        }
    }

    /// Whether the primary channel can no longer be trusted after this error.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Error::Auth(_)
                | Error::Protocol(_)
                | Error::PeerGone
                | Error::Io(_)
                | Error::Tls(_)
                | Error::Codec(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filesystem_errors_are_not_fatal() {
        let e = Error::fs("a/b.txt", std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert!(!e.is_session_fatal());
        assert!(e.to_string().starts_with("a/b.txt"));
        assert!(!Error::Busy.is_session_fatal());
        assert!(!Error::Refused("no such folder".into()).is_session_fatal());
    }

    #[test]
    fn protocol_errors_are_fatal() {
        assert!(Error::protocol("bad header").is_session_fatal());
        assert!(Error::PeerGone.is_session_fatal());
    }
}
