//! Account-scoped stream registry: idempotent create, subject-overlap
//! enforcement, resource reservations and the storage/consensus wiring a
//! stream is born with.

use crate::config::check::{check_stream_config, ConfigError};
use crate::config::core::{StorageType, StreamConfig};
use crate::config::limits::{AccountResources, EngineLimits};
use crate::raft::RaftNode;
use crate::relay::Relay;
use crate::store::core::{auto_tune_block_size, FileStoreConfig, StoreError, StreamStore};
use crate::store::memory::MemoryStore;
use crate::stream::core::{Stream, StreamError};
use crate::stream::restore::STREAMS_DIR;
use crate::subject::subjects_collide;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Factory for file-backed stores; the file backend itself lives outside
/// this crate and registers here.
pub type StoreFactory =
    dyn Fn(&StreamConfig, &FileStoreConfig) -> Result<Arc<dyn StreamStore>, StoreError>
        + Send
        + Sync;

/// Identity and limits for an account.
#[derive(Debug, Clone)]
pub struct AccountConfig {
    pub name: String,
    /// Optional deployment domain, carried in publish acks and advisories.
    pub domain: String,
    pub store_dir: PathBuf,
    pub limits: EngineLimits,
    pub resources: AccountResources,
}

impl AccountConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            domain: String::new(),
            store_dir: std::env::temp_dir().join("lodestream"),
            limits: EngineLimits::default(),
            resources: AccountResources::default(),
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    pub fn with_store_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.store_dir = dir.into();
        self
    }

    pub fn with_resources(mut self, resources: AccountResources) -> Self {
        self.resources = resources;
        self
    }
}

/// Owner of an account's streams and their shared resources.
pub struct Account {
    name: String,
    domain: String,
    store_dir: PathBuf,
    relay: Arc<dyn Relay>,
    limits: EngineLimits,
    resources: Mutex<AccountResources>,
    streams: Mutex<HashMap<String, Arc<Stream>>>,
    file_store_factory: Option<Box<StoreFactory>>,
    disabled: AtomicBool,
}

impl Account {
    pub fn new(config: AccountConfig, relay: Arc<dyn Relay>) -> Arc<Self> {
        Self::with_file_store_factory(config, relay, None)
    }

    /// Builds an account with a registered file-store backend.
    pub fn with_file_store_factory(
        config: AccountConfig,
        relay: Arc<dyn Relay>,
        factory: Option<Box<StoreFactory>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: config.name,
            domain: config.domain,
            store_dir: config.store_dir,
            relay,
            limits: config.limits,
            resources: Mutex::new(config.resources),
            streams: Mutex::new(HashMap::new()),
            file_store_factory: factory,
            disabled: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn store_dir(&self) -> &PathBuf {
        &self.store_dir
    }

    pub fn limits(&self) -> &EngineLimits {
        &self.limits
    }

    pub fn relay(&self) -> Arc<dyn Relay> {
        Arc::clone(&self.relay)
    }

    /// Creates a stream, or returns the existing one when the requested
    /// config matches exactly (create is idempotent).
    pub fn add_stream(self: &Arc<Self>, config: &StreamConfig) -> Result<Arc<Stream>, StreamError> {
        self.add_stream_with_node(config, None)
    }

    /// Creates a clustered stream bound to a consensus node.
    pub fn add_stream_with_node(
        self: &Arc<Self>,
        config: &StreamConfig,
        node: Option<Arc<dyn RaftNode>>,
    ) -> Result<Arc<Stream>, StreamError> {
        if self.is_disabled() {
            return Err(StreamError::EngineDisabled);
        }
        let cfg = check_stream_config(config, &self.limits)?;
        if cfg.sealed {
            return Err(ConfigError::SealedOnCreate.into());
        }

        {
            let streams = self.streams.lock().expect("account streams poisoned");
            if let Some(existing) = streams.get(&cfg.name) {
                if existing.config() == cfg {
                    return Ok(Arc::clone(existing));
                }
                return Err(StreamError::NameInUse);
            }
            if self.subjects_overlap_locked(&streams, &cfg.subjects) {
                return Err(StreamError::SubjectOverlap);
            }
        }

        self.resources
            .lock()
            .expect("account resources poisoned")
            .reserve_stream(&cfg)?;

        let store = match self.open_store(&cfg) {
            Ok(store) => store,
            Err(err) => {
                self.release_stream_resources(&cfg);
                return Err(err.into());
            }
        };

        let is_clustered = node.is_some();
        let stream = Stream::new(self, cfg.clone(), store, node);
        self.streams
            .lock()
            .expect("account streams poisoned")
            .insert(cfg.name.clone(), Arc::clone(&stream));

        // Single-node streams lead themselves immediately; clustered
        // streams wait for the consensus layer to call set_leader.
        if !is_clustered {
            if let Err(err) = stream.set_leader(true) {
                let _ = stream.stop(true, false);
                return Err(err);
            }
        }

        if stream.is_leader() && !(is_clustered && cfg.replicas > 1) {
            stream.send_create_advisory();
        }
        info!(account = %self.name, stream = %cfg.name, "stream created");
        Ok(stream)
    }

    pub fn lookup_stream(&self, name: &str) -> Option<Arc<Stream>> {
        self.streams
            .lock()
            .expect("account streams poisoned")
            .get(name)
            .cloned()
    }

    pub fn streams(&self) -> Vec<Arc<Stream>> {
        self.streams
            .lock()
            .expect("account streams poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn num_streams(&self) -> usize {
        self.streams.lock().expect("account streams poisoned").len()
    }

    /// Deletes a stream and its stored messages.
    pub fn delete_stream(&self, name: &str) -> Result<(), StreamError> {
        let stream = self.lookup_stream(name).ok_or(StreamError::NotFound)?;
        stream.delete()
    }

    pub(crate) fn unregister_stream(&self, name: &str) {
        self.streams
            .lock()
            .expect("account streams poisoned")
            .remove(name);
    }

    fn subjects_overlap_locked(
        &self,
        streams: &HashMap<String, Arc<Stream>>,
        subjects: &[String],
    ) -> bool {
        for stream in streams.values() {
            for existing in &stream.config().subjects {
                for subject in subjects {
                    if subjects_collide(subject, existing) {
                        return true;
                    }
                }
            }
        }
        false
    }

    fn open_store(&self, cfg: &StreamConfig) -> Result<Arc<dyn StreamStore>, StoreError> {
        match cfg.storage {
            StorageType::Memory => Ok(Arc::new(MemoryStore::new(cfg))),
            StorageType::File => {
                let mut fs_cfg = FileStoreConfig {
                    store_dir: self.store_dir.join(STREAMS_DIR).join(&cfg.name),
                    ..Default::default()
                };
                if let Some(block_size) = auto_tune_block_size(cfg, self.limits.max_payload) {
                    fs_cfg.block_size = block_size;
                }
                match &self.file_store_factory {
                    Some(factory) => factory(cfg, &fs_cfg),
                    None => {
                        debug!(stream = %cfg.name, "no file backend registered, using memory store");
                        Ok(Arc::new(MemoryStore::new(cfg)))
                    }
                }
            }
        }
    }

    pub fn limits_exceeded(&self, storage: StorageType) -> bool {
        self.resources
            .lock()
            .expect("account resources poisoned")
            .limits_exceeded(storage)
    }

    pub(crate) fn reserve_bytes(
        &self,
        storage: StorageType,
        bytes: i64,
    ) -> Result<(), crate::config::limits::ResourceError> {
        self.resources
            .lock()
            .expect("account resources poisoned")
            .reserve_bytes(storage, bytes)
    }

    pub(crate) fn release_bytes(&self, storage: StorageType, bytes: i64) {
        self.resources
            .lock()
            .expect("account resources poisoned")
            .release_bytes(storage, bytes)
    }

    pub(crate) fn release_stream_resources(&self, cfg: &StreamConfig) {
        self.resources
            .lock()
            .expect("account resources poisoned")
            .release_stream(cfg);
    }

    /// Kills ingest across the account; set when storage reports a fatal
    /// out-of-space condition.
    pub fn disable(&self) {
        self.disabled.store(true, Ordering::SeqCst);
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }
}
