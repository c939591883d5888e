//! Tandem library
//!
//! Point-to-point folder transfer between two hosts over one authenticated
//! primary connection and a pool of worker connections, with resumable large
//! files, batched small files and a compare/force-sync engine.

pub mod checksum;
pub mod cli;
pub mod client;
pub mod config;
pub mod conn;
pub mod diff;
pub mod discovery;
pub mod error;
pub mod fs_enum;
pub mod logging;
pub mod peer;
pub mod progress;
pub mod protocol;
pub mod protocol_core;
pub mod scheduler;
pub mod session;
pub mod tls;
pub mod transfer;
pub mod transport;

pub use error::{Error, Result};
