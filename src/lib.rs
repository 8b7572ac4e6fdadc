//! Lodestream: the durable message-stream engine at the core of a
//! clustered publish/subscribe broker. Per-stream ingress with publish
//! preconditions and duplicate suppression, interest-based retention,
//! replication through a pluggable consensus node, and mirror/source
//! federation from upstream streams.

pub mod config {
    pub mod check;
    pub mod core;
    pub mod limits;

    pub use self::check::*;
    pub use self::core::*;
    pub use self::limits::*;
}

pub mod store {
    pub mod core;
    pub mod memory;

    pub use self::core::*;
    pub use self::memory::*;
}

pub mod stream {
    pub mod advisory;
    pub mod core;
    pub mod dedupe;
    pub mod ingress;
    pub mod leader;
    pub mod outq;
    pub mod registry;
    pub mod restore;
    pub mod sources;

    pub use self::core::*;
    pub use self::dedupe::*;
    pub use self::ingress::*;
    pub use self::outq::*;
    pub use self::registry::*;
    pub use self::restore::*;
    pub use self::sources::*;
}

pub mod account;
pub mod header;
pub mod raft;
pub mod relay;
pub mod subject;
pub mod wire;

pub use account::{Account, AccountConfig, StoreFactory};
pub use config::{
    check_stream_config, check_update_config, AccountResources, ConfigError, DiscardPolicy,
    EngineLimits, ExternalStream, ResourceError, RetentionPolicy, StorageType, StreamConfig,
    StreamSource, DEFAULT_DUPLICATE_WINDOW, MAX_REPLICAS,
};
pub use raft::{CommitSink, LoopbackNode, RaftError, RaftNode};
pub use relay::{InProcRelay, MsgHandler, Relay, RelayError, Sid};
pub use store::{
    auto_tune_block_size, now_unix_ns, FileStoreConfig, MemoryStore, PurgeRequest, StoreError,
    StoredMsg, StreamState, StreamStore, FILE_STORE_MAX_BLOCK_SIZE, FILE_STORE_MIN_BLOCK_SIZE,
};
pub use stream::{
    Consumer, ConsumerMeta, ConsumerRegistry, DedupeIndex, IngestError, OutQueue, PubMsg,
    RestoreError, RestoredConsumer, SourceInfoSnapshot, Stream, StreamError, StreamMeta,
    SOURCE_HEALTH_CHECK_INTERVAL,
};
pub use wire::{
    consumer_create_subject, decode_entry, decode_stream_msg, encode_msg_delete,
    encode_stream_msg, pub_ack_prefix, render_pub_ack, unique_subject, AckPolicy, ApiError,
    ConsumerApiConfig, ConsumerApiInfo, ConsumerCreateRequest, ConsumerCreateResponse,
    DeliverPolicy, FrameError, PubAck, PubAckResponse, ReplicatedOp, SequencePair, StreamAction,
    StreamActionAdvisory, StreamMsgFrame, ADVISORY_STREAM_CREATED_PRE,
    ADVISORY_STREAM_DELETED_PRE, ADVISORY_STREAM_UPDATED_PRE,
};
