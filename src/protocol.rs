//! Shared protocol constants for the tandem framed transport

// Fixed part of a header: command (1) | size (8) | name length (2)
pub const HEADER_FIXED_LEN: usize = 1 + 8 + 2;

// Control frames are a single big-endian i64
pub const SIGNAL_LEN: usize = 8;

// Timestamp record sent after a large file body: created | modified | accessed
pub const TIMES_RECORD_LEN: usize = 24;

// Voucher bytes issued by the initiator for worker connections
pub const VOUCHER_LEN: usize = 64;

// Upper bound for a compressed value frame (256MB)
pub const MAX_VALUE_SIZE: u64 = 256 * 1024 * 1024;

// In-progress large downloads live under this suffix until renamed
pub const TEMP_SUFFIX: &str = ".tandem-part";

// Streaming buffer for file bodies
pub const IO_CHUNK: usize = 1024 * 1024;

/// Logical command set carried in the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    Null = 0,
    SendFolder = 1,
    SendSmallBatch = 2,
    SendLargeFile = 3,
    CompareFolder = 4,
    ForceSyncFolder = 5,
    ExecuteShell = 6,
    CommandOutputLine = 7,
    GetSysinfo = 8,
    SpeedTest = 9,
    PreSessionAuth = 10,
    SessionClose = 11,
    Finished = 12,
    ChatMessage = 13,
    PushClipboard = 14,
    PullClipboard = 15,
}

impl Command {
    pub fn from_u8(b: u8) -> Option<Self> {
        use Command::*;
        Some(match b {
            0 => Null,
            1 => SendFolder,
            2 => SendSmallBatch,
            3 => SendLargeFile,
            4 => CompareFolder,
            5 => ForceSyncFolder,
            6 => ExecuteShell,
            7 => CommandOutputLine,
            8 => GetSysinfo,
            9 => SpeedTest,
            10 => PreSessionAuth,
            11 => SessionClose,
            12 => Finished,
            13 => ChatMessage,
            14 => PushClipboard,
            15 => PullClipboard,
            _ => return None,
        })
    }
}

/// Reserved control-frame values. Anything non-negative doubles as a byte count.
pub mod signal {
    pub const CONTINUE: i64 = 0;
    pub const CANCEL: i64 = -1;
    pub const FAIL_TO_OPEN: i64 = -2;
}

// Discovery packet tags (UDP, plaintext)
pub mod discovery_tag {
    pub const ANNOUNCE: &str = "TANDEM_ANNOUNCE";
    pub const HERE: &str = "TANDEM_HERE";
    pub const CONNECT: &str = "TANDEM_CONNECT";
}

// Scheduler and digest defaults
pub mod defaults {
    pub const PORT: u16 = 9421;
    pub const BROADCAST_PORT: u16 = 9422;
    pub const THREADS: usize = 6;
    // Files at or above this size go through the resumable single-file path
    pub const LARGE_FILE_THRESHOLD: u64 = 1024 * 1024;
    // Small files are grouped into batches up to this many bytes
    pub const CHUNK_THRESHOLD: u64 = 8 * 1024 * 1024;
    // Files at or above this size get a sampled fast digest
    pub const FAST_DIGEST_THRESHOLD: u64 = 8 * 1024 * 1024;
    pub const FAST_DIGEST_WINDOWS: u64 = 48;
    pub const FAST_DIGEST_WINDOW_LEN: u64 = 32 * 1024;
    pub const AUTH_TIMEOUT_SECS: u64 = 5;
    // The first few workers drain large files first
    pub const LARGE_FIRST_WORKERS: usize = 3;
}
