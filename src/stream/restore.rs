//! Snapshot restore: expand a gzip-framed tar archive into a staging
//! directory, validate its metadata, adopt it as the stream's store
//! directory and re-create consumers from their persisted metadata.

use crate::account::Account;
use crate::config::check::check_stream_config;
use crate::config::core::StreamConfig;
use crate::stream::core::{Stream, StreamError};
use crate::stream::registry::Consumer;
use crate::wire::{ConsumerApiConfig, SequencePair};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::warn;
use uuid::Uuid;

/// Stream metadata file at the root of a snapshot and a store directory.
pub const META_FILE: &str = "meta.inf";
/// Checksum companion for consumer metadata.
pub const META_SUM_FILE: &str = "meta.sum";
/// Per-stream consumer metadata directory.
pub const CONSUMERS_DIR: &str = "consumers";
/// Account-level directory holding one subdirectory per stream.
pub const STREAMS_DIR: &str = "streams";

const SNAPSHOTS_DIR: &str = "__snapshots__";

/// Failures while restoring a stream from a snapshot.
#[derive(Debug, Error)]
pub enum RestoreError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("archive entry escapes the staging directory: {0:?}")]
    PathTraversal(PathBuf),
    #[error("archive contains an unsupported entry type: {0:?}")]
    UnsupportedEntry(PathBuf),
    #[error("snapshot has no stream metadata")]
    MissingMetadata,
    #[error("snapshot metadata is invalid: {0}")]
    BadMetadata(String),
    #[error("stream names do not match: expected {expected:?}, snapshot has {found:?}")]
    NameMismatch { expected: String, found: String },
    #[error("consumer {0:?} metadata failed its checksum")]
    BadChecksum(String),
    #[error("error restoring consumer {name:?}: {reason}")]
    Consumer { name: String, reason: String },
}

/// Persisted identity of a stream inside its store directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMeta {
    pub config: StreamConfig,
    #[serde(with = "time::serde::rfc3339")]
    pub created: OffsetDateTime,
}

/// Persisted identity of a consumer under `consumers/<name>/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerMeta {
    #[serde(default)]
    pub name: String,
    pub config: ConsumerApiConfig,
    #[serde(default)]
    pub delivered: SequencePair,
    #[serde(with = "time::serde::rfc3339")]
    pub created: OffsetDateTime,
}

impl ConsumerMeta {
    /// Hex sha-256 of the serialized metadata, stored in `meta.sum`.
    pub fn checksum(payload: &[u8]) -> String {
        let digest = Sha256::digest(payload);
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// Consumer re-created from persisted metadata during restore. Delivery
/// resumes once a real consumer re-attaches; until then this placeholder
/// keeps registry accounting and retention semantics correct.
pub struct RestoredConsumer {
    name: String,
    filter_subject: String,
    direct: bool,
    /// Ack floor, synced against the stream's last sequence on restore.
    checkpoint: AtomicU64,
}

impl RestoredConsumer {
    pub fn checkpoint(&self) -> u64 {
        self.checkpoint.load(Ordering::Relaxed)
    }
}

impl Consumer for RestoredConsumer {
    fn name(&self) -> &str {
        &self.name
    }

    fn filter_subject(&self) -> &str {
        &self.filter_subject
    }

    fn is_direct(&self) -> bool {
        self.direct
    }

    fn need_ack(&self, seq: u64) -> bool {
        seq > self.checkpoint.load(Ordering::Relaxed)
    }

    fn signal_new_messages(&self) {}
}

impl Account {
    /// Restores a stream from a snapshot archive: a tar stream inside a
    /// gzip frame containing `meta.inf` plus per-consumer metadata.
    pub fn restore_stream(
        self: &Arc<Self>,
        config: &StreamConfig,
        reader: impl Read,
    ) -> Result<Arc<Stream>, StreamError> {
        let cfg = check_stream_config(config, self.limits())?;

        let snaps_dir = self.store_dir().join(SNAPSHOTS_DIR);
        fs::create_dir_all(&snaps_dir).map_err(RestoreError::Io)?;
        let staging = snaps_dir.join(format!("snap-{}", Uuid::new_v4().simple()));
        fs::create_dir_all(&staging).map_err(RestoreError::Io)?;

        let result = self.restore_into(&cfg, reader, &staging);
        // Staging is renamed away on success; anything left is debris.
        if staging.exists() {
            let _ = fs::remove_dir_all(&staging);
        }
        result
    }

    fn restore_into(
        self: &Arc<Self>,
        cfg: &StreamConfig,
        reader: impl Read,
        staging: &Path,
    ) -> Result<Arc<Stream>, StreamError> {
        extract_archive(reader, staging)?;

        let meta_path = staging.join(META_FILE);
        if !meta_path.exists() {
            return Err(RestoreError::MissingMetadata.into());
        }
        let meta: StreamMeta = serde_json::from_slice(&fs::read(&meta_path).map_err(RestoreError::Io)?)
            .map_err(|err| RestoreError::BadMetadata(err.to_string()))?;
        if meta.config.name != cfg.name {
            return Err(RestoreError::NameMismatch {
                expected: cfg.name.clone(),
                found: meta.config.name,
            }
            .into());
        }

        if self.lookup_stream(&cfg.name).is_some() {
            return Err(StreamError::NameInUse);
        }

        // Move the staged snapshot into place as the stream's store dir.
        let streams_dir = self.store_dir().join(STREAMS_DIR);
        fs::create_dir_all(&streams_dir).map_err(RestoreError::Io)?;
        let target = streams_dir.join(&cfg.name);
        if target.exists() {
            fs::remove_dir_all(&target).map_err(RestoreError::Io)?;
        }
        fs::rename(staging, &target).map_err(RestoreError::Io)?;

        let stream = self.add_stream(cfg)?;
        stream.set_created(meta.created);
        let last_seq = stream.last_seq();

        if let Err(err) = restore_consumers(&stream, &target.join(CONSUMERS_DIR), last_seq) {
            let _ = stream.stop(true, false);
            return Err(err.into());
        }
        Ok(stream)
    }
}

fn extract_archive(reader: impl Read, staging: &Path) -> Result<(), RestoreError> {
    let mut archive = tar::Archive::new(GzDecoder::new(reader));
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        if !entry.header().entry_type().is_file() {
            return Err(RestoreError::UnsupportedEntry(path));
        }
        if path
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(RestoreError::PathTraversal(path));
        }
        let dest = staging.join(&path);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(&dest)?;
        io::copy(&mut entry, &mut out)?;
    }
    Ok(())
}

// Re-creates every consumer found under the restored consumers directory,
// syncing each checkpoint against the stream's current last sequence.
// Ephemeral consumers ride through restore under their directory name.
fn restore_consumers(
    stream: &Arc<Stream>,
    consumers_dir: &Path,
    last_seq: u64,
) -> Result<(), RestoreError> {
    let entries = match fs::read_dir(consumers_dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(()),
    };
    for entry in entries.flatten() {
        if !entry.path().is_dir() {
            continue;
        }
        let dir_name = entry.file_name().to_string_lossy().into_owned();
        let meta_path = entry.path().join(META_FILE);
        let sum_path = entry.path().join(META_SUM_FILE);
        let consumer_err = |reason: String| RestoreError::Consumer {
            name: dir_name.clone(),
            reason,
        };

        let payload = fs::read(&meta_path).map_err(|e| consumer_err(e.to_string()))?;
        let sum = fs::read_to_string(&sum_path).map_err(|e| consumer_err(e.to_string()))?;
        if sum.trim() != ConsumerMeta::checksum(&payload) {
            return Err(RestoreError::BadChecksum(dir_name));
        }
        let meta: ConsumerMeta =
            serde_json::from_slice(&payload).map_err(|e| consumer_err(e.to_string()))?;

        let name = if meta.config.durable_name.is_empty() {
            // Ephemeral: restored under its directory name so it can be
            // reclaimed when the owner reconnects.
            dir_name.clone()
        } else {
            meta.config.durable_name.clone()
        };
        let checkpoint = meta.delivered.stream_seq.min(last_seq);
        if meta.delivered.stream_seq > last_seq {
            warn!(
                consumer = %name,
                delivered = meta.delivered.stream_seq,
                last_seq,
                "consumer checkpoint ahead of stream, clamping"
            );
        }
        stream
            .set_consumer(Arc::new(RestoredConsumer {
                name: name.clone(),
                filter_subject: meta.config.filter_subject.clone(),
                direct: meta.config.direct,
                checkpoint: AtomicU64::new(checkpoint),
            }))
            .map_err(|err| RestoreError::Consumer {
                name,
                reason: err.to_string(),
            })?;
    }
    Ok(())
}
