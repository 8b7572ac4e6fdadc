//! Storage seam for a stream: the `StreamStore` trait every backend
//! implements, plus shared state/record types and the file-store tuning
//! helper used at create time.

use crate::config::core::StreamConfig;
use crate::subject::subject_is_literal;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Current wall-clock time as unix nanoseconds, the timestamp unit used
/// throughout the store and replication layers.
pub fn now_unix_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos().min(i64::MAX as u128) as i64)
        .unwrap_or(0)
}

/// Errors surfaced from a storage backend.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum StoreError {
    #[error("maximum messages exceeded")]
    MaxMsgs,
    #[error("maximum bytes exceeded")]
    MaxBytes,
    #[error("maximum messages per subject exceeded")]
    MaxMsgsPerSubject,
    #[error("message to store was too large")]
    MsgTooLarge,
    #[error("no message found")]
    NotFound,
    #[error("stream store EOF")]
    Eof,
    #[error("stream store is closed")]
    Closed,
    #[error("no space left on device")]
    NoSpace,
    #[error("sequence {0} already used")]
    SequenceInUse(u64),
}

/// Raw message record held by a store.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StoredMsg {
    pub subject: String,
    pub hdr: Vec<u8>,
    pub msg: Vec<u8>,
    pub seq: u64,
    pub ts: i64,
}

/// Cheap summary of a store's contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamState {
    pub msgs: u64,
    pub bytes: u64,
    pub first_seq: u64,
    pub first_ts: i64,
    pub last_seq: u64,
    pub last_ts: i64,
}

/// Purge request: `keep` retains the newest N matching messages, otherwise
/// `sequence` removes everything below it; both zero removes all matching.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PurgeRequest {
    pub subject: String,
    pub sequence: u64,
    pub keep: u64,
}

impl PurgeRequest {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn keep_last(subject: impl Into<String>, keep: u64) -> Self {
        Self {
            subject: subject.into(),
            keep,
            ..Default::default()
        }
    }
}

/// Backend contract for a stream's message log. The stream owns the store;
/// all writes funnel through the stream's ingress task.
pub trait StreamStore: Send + Sync {
    /// Appends a message, assigning the next sequence and a timestamp.
    fn store_msg(&self, subject: &str, hdr: &[u8], msg: &[u8]) -> Result<(u64, i64), StoreError>;

    /// Appends a message at a pre-assigned `(seq, ts)`, used when replaying
    /// committed entries so every replica lands identical sequences.
    fn store_raw_msg(
        &self,
        subject: &str,
        hdr: &[u8],
        msg: &[u8],
        seq: u64,
        ts: i64,
    ) -> Result<(), StoreError>;

    /// Consumes the next sequence without storing a payload.
    fn skip_msg(&self) -> u64;

    fn load_msg(&self, seq: u64) -> Result<StoredMsg, StoreError>;

    /// Newest message on `subject` (literal match).
    fn load_last_msg(&self, subject: &str) -> Result<StoredMsg, StoreError>;

    /// Removes a single message; `Ok(false)` when the sequence was already
    /// gone, `Err(Eof)` when it was never written.
    fn remove_msg(&self, seq: u64) -> Result<bool, StoreError>;

    fn purge(&self, req: &PurgeRequest) -> Result<u64, StoreError>;

    /// Drops everything below `first_seq` and realigns the floor, used to
    /// adopt an upstream starting position.
    fn compact(&self, first_seq: u64) -> Result<u64, StoreError>;

    /// First sequence with a timestamp at or after `ts`, or 0.
    fn seq_from_time(&self, ts: i64) -> u64;

    fn state(&self) -> StreamState;

    fn update_config(&self, cfg: &StreamConfig) -> Result<(), StoreError>;

    /// Flushes and closes the store, keeping data in place.
    fn stop(&self) -> Result<(), StoreError>;

    /// Closes the store and removes its data.
    fn delete(&self) -> Result<(), StoreError>;
}

/// Options handed to the file backend when a stream is file-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStoreConfig {
    pub store_dir: PathBuf,
    /// Zero lets the backend pick its own block size.
    pub block_size: u64,
    pub sync_interval: Duration,
    pub async_flush: bool,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::new(),
            block_size: 0,
            sync_interval: Duration::from_secs(120),
            async_flush: false,
        }
    }
}

pub const FILE_STORE_MIN_BLOCK_SIZE: u64 = 256 * 1024;
pub const FILE_STORE_MAX_BLOCK_SIZE: u64 = 16 * 1024 * 1024;
const KV_DEFAULT_BLOCK_SIZE: u64 = 8 * 1024 * 1024;
const DEFAULT_SUBJECT_ESTIMATE: usize = 256;
const RECORD_OVERHEAD: u64 = 34;

/// Picks a file-store block size targeting ~25% overhead over the stream's
/// configured limits, rounded up to 100 bytes and clamped to the supported
/// range. Returns `None` when nothing in the config bounds total size.
pub fn auto_tune_block_size(cfg: &StreamConfig, max_payload: i32) -> Option<u64> {
    let total_estimate = if cfg.max_bytes > 0 {
        cfg.max_bytes as u64
    } else if cfg.max_msgs > 0 {
        estimated_msg_size(cfg, max_payload) * cfg.max_msgs as u64
    } else if cfg.max_msgs_per > 0 {
        return Some(KV_DEFAULT_BLOCK_SIZE);
    } else {
        return None;
    };

    let mut blk = (total_estimate / 4) + 1;
    if blk % 100 != 0 {
        blk += 100 - (blk % 100);
    }
    Some(blk.clamp(FILE_STORE_MIN_BLOCK_SIZE, FILE_STORE_MAX_BLOCK_SIZE))
}

fn estimated_msg_size(cfg: &StreamConfig, max_payload: i32) -> u64 {
    let msg_size = if cfg.max_msg_size > 0 {
        cfg.max_msg_size
    } else {
        max_payload.max(1)
    } as u64;
    let subject = cfg
        .subjects
        .iter()
        .filter(|s| subject_is_literal(s.as_str()))
        .map(|s| s.len())
        .max()
        .unwrap_or(DEFAULT_SUBJECT_ESTIMATE);
    msg_size + subject as u64 + RECORD_OVERHEAD
}
