//! Engine-wide limits and per-account resource accounting.

use crate::config::core::{StorageType, StreamConfig};
use std::time::Duration;
use thiserror::Error;

/// Longest allowed stream/consumer name.
pub const MAX_NAME_LEN: usize = 255;
/// Longest allowed stream description.
pub const MAX_DESCRIPTION_LEN: usize = 4 * 1024;
/// Replica count ceiling for a single consensus group.
pub const MAX_REPLICAS: usize = 5;

/// Operator-configured caps applied during config validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineLimits {
    pub max_name_len: usize,
    pub max_description_len: usize,
    /// Hard cap for the duplicate-suppression window, when set.
    pub duplicates: Option<Duration>,
    /// Fallback payload ceiling when a stream sets no `max_msg_size`.
    pub max_payload: i32,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            max_name_len: MAX_NAME_LEN,
            max_description_len: MAX_DESCRIPTION_LEN,
            duplicates: None,
            max_payload: 1024 * 1024,
        }
    }
}

/// Error raised when an account would exceed its reservations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResourceError {
    #[error("insufficient memory resources available")]
    Memory,
    #[error("insufficient storage resources available")]
    Storage,
    #[error("maximum number of streams reached")]
    Streams,
}

/// Per-account reservation ledger for stream resources. `MaxBytes` style
/// reservations are charged up front; `-1` caps mean unlimited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountResources {
    pub max_memory: i64,
    pub max_storage: i64,
    pub max_streams: i64,
    reserved_memory: i64,
    reserved_storage: i64,
    streams: i64,
}

impl Default for AccountResources {
    fn default() -> Self {
        Self {
            max_memory: -1,
            max_storage: -1,
            max_streams: -1,
            reserved_memory: 0,
            reserved_storage: 0,
            streams: 0,
        }
    }
}

impl AccountResources {
    pub fn with_limits(max_memory: i64, max_storage: i64, max_streams: i64) -> Self {
        Self {
            max_memory,
            max_storage,
            max_streams,
            ..Default::default()
        }
    }

    /// Reserves the stream's `max_bytes` (scaled by replicas) and a stream
    /// slot. Call once at create; the update path reserves deltas.
    pub fn reserve_stream(&mut self, cfg: &StreamConfig) -> Result<(), ResourceError> {
        if self.max_streams >= 0 && self.streams >= self.max_streams {
            return Err(ResourceError::Streams);
        }
        self.reserve_bytes(cfg.storage, stream_reservation(cfg))?;
        self.streams += 1;
        Ok(())
    }

    /// Releases everything `reserve_stream` charged.
    pub fn release_stream(&mut self, cfg: &StreamConfig) {
        self.release_bytes(cfg.storage, stream_reservation(cfg));
        self.streams = (self.streams - 1).max(0);
    }

    /// Reserves additional bytes against the account cap.
    pub fn reserve_bytes(&mut self, storage: StorageType, bytes: i64) -> Result<(), ResourceError> {
        if bytes <= 0 {
            return Ok(());
        }
        let (reserved, cap, err) = match storage {
            StorageType::Memory => (&mut self.reserved_memory, self.max_memory, ResourceError::Memory),
            StorageType::File => (&mut self.reserved_storage, self.max_storage, ResourceError::Storage),
        };
        if cap >= 0 && *reserved + bytes > cap {
            return Err(err);
        }
        *reserved += bytes;
        Ok(())
    }

    pub fn release_bytes(&mut self, storage: StorageType, bytes: i64) {
        if bytes <= 0 {
            return;
        }
        let reserved = match storage {
            StorageType::Memory => &mut self.reserved_memory,
            StorageType::File => &mut self.reserved_storage,
        };
        *reserved = (*reserved - bytes).max(0);
    }

    /// True once reservations exhaust the cap for the given backend.
    pub fn limits_exceeded(&self, storage: StorageType) -> bool {
        match storage {
            StorageType::Memory => self.max_memory >= 0 && self.reserved_memory >= self.max_memory,
            StorageType::File => self.max_storage >= 0 && self.reserved_storage >= self.max_storage,
        }
    }

    pub fn reserved(&self, storage: StorageType) -> i64 {
        match storage {
            StorageType::Memory => self.reserved_memory,
            StorageType::File => self.reserved_storage,
        }
    }
}

fn stream_reservation(cfg: &StreamConfig) -> i64 {
    cfg.max_bytes.max(0)
}
