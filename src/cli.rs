//! Command-line surface

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Tandem - point-to-point folder transfer over a pool of TLS connections"
)]
pub struct Args {
    /// Settings file (default: <config dir>/tandem.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Disable TLS for this run (both peers must agree)
    #[arg(long, global = true)]
    pub plain: bool,

    #[command(subcommand)]
    pub command: Cmd,
}

/// Peer selection shared by every initiator command.
#[derive(Clone, Debug, clap::Args)]
pub struct Target {
    /// Peer as host or host:port; discovered on the LAN when omitted
    #[arg(long)]
    pub host: Option<String>,

    /// Override the configured worker count
    #[arg(short = 't', long)]
    pub threads: Option<usize>,
}

#[derive(Debug, Subcommand)]
pub enum Cmd {
    /// Wait for peers and serve their requests
    Serve {
        /// Where received folders land
        #[arg(long)]
        save_path: Option<PathBuf>,

        #[arg(long)]
        port: Option<u16>,

        /// Do not answer LAN announcements
        #[arg(long)]
        no_discovery: bool,
    },
    /// Send a folder to the peer
    Send {
        folder: PathBuf,

        /// Folder name on the peer (default: the local folder's name)
        #[arg(long = "as")]
        dest_name: Option<String>,

        #[command(flatten)]
        target: Target,
    },
    /// Compare a local folder with one on the peer
    Compare {
        local: PathBuf,
        remote: String,

        #[command(flatten)]
        target: Target,
    },
    /// Make the peer's folder identical to a local one
    Sync {
        local: PathBuf,
        remote: String,

        /// Skip the removal confirmation
        #[arg(short, long)]
        yes: bool,

        #[command(flatten)]
        target: Target,
    },
    /// Run a shell command on the peer
    Exec {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,

        #[command(flatten)]
        target: Target,
    },
    /// Show the peer's host details
    Sysinfo {
        #[command(flatten)]
        target: Target,
    },
    /// Send a one-line message to the peer's log
    Chat {
        message: String,

        #[command(flatten)]
        target: Target,
    },
    /// List peers answering on the LAN
    Discover {
        /// Seconds to wait for replies
        #[arg(long, default_value_t = 2)]
        wait: u64,
    },
    /// Create the server certificate and settings file if missing, then print
    /// the certificate fingerprint
    InitCert,
}
