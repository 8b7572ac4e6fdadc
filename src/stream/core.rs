//! The per-stream engine: owned store handle, inbound/outbound queues, the
//! internal loop that serializes all writes, and the lifecycle operations
//! (update, purge, stop, delete).

use crate::account::Account;
use crate::config::check::{check_update_config, ConfigError};
use crate::config::core::{RetentionPolicy, StreamConfig};
use crate::config::limits::ResourceError;
use crate::raft::{CommitSink, RaftNode};
use crate::relay::{Relay, RelayError, Sid};
use crate::store::core::{PurgeRequest, StoreError, StoredMsg, StreamState, StreamStore};
use crate::stream::dedupe::DedupeIndex;
use crate::stream::outq::{OutQueue, OUT_QUEUE_CAPACITY};
use crate::stream::registry::{Consumer, ConsumerRegistry};
use crate::stream::restore::RestoreError;
use crate::stream::sources::SourceState;
use crate::wire::{
    decode_entry, pub_ack_prefix, ApiError, PubAckResponse, ReplicatedOp, StreamMsgFrame,
};
use crossbeam::channel::{after, bounded, select, unbounded, Receiver, Sender};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, error, warn};

/// Failures from stream lifecycle operations.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Resources(#[from] ResourceError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error(transparent)]
    Restore(#[from] RestoreError),
    #[error("stream name already in use with a different configuration")]
    NameInUse,
    #[error("subjects overlap with an existing stream")]
    SubjectOverlap,
    #[error("engine is disabled")]
    EngineDisabled,
    #[error("invalid stream")]
    Closed,
    #[error("invalid operation on sealed stream")]
    Sealed,
    #[error("no message found")]
    NotFound,
    #[error("multiple non-filtered consumers not allowed on workqueue stream")]
    WorkQueueMultipleUnfiltered,
    #[error("filtered consumer not unique on workqueue stream")]
    WorkQueueConsumerNotUnique,
}

/// Message captured off the wire, queued for the internal loop.
#[derive(Debug, Clone, Default)]
pub(crate) struct InMsg {
    pub subject: String,
    pub reply: String,
    pub hdr: Vec<u8>,
    pub msg: Vec<u8>,
}

/// Introspection snapshot for a mirror or source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceInfoSnapshot {
    pub name: String,
    pub iname: String,
    pub lag: u64,
    /// Time since the upstream was last heard from; `None` before first
    /// contact.
    pub active: Option<Duration>,
    pub error: Option<ApiError>,
    pub sseq: u64,
    pub dseq: u64,
    pub consumer: Option<String>,
}

pub(crate) struct StreamMutable {
    pub cfg: StreamConfig,
    pub created: OffsetDateTime,
    pub lseq: u64,
    pub lmsg_id: String,
    /// Cluster-lost-from-state: proposals rejected before the store, used
    /// to reconcile proposed vs committed sequences.
    pub clfs: u64,
    /// Last proposed sequence on this leader.
    pub clseq: u64,
    pub dedupe: DedupeIndex,
    pub dd_deadline: Option<Instant>,
    pub registry: ConsumerRegistry,
    pub mirror: Option<SourceState>,
    pub sources: HashMap<String, SourceState>,
    pub subs: HashMap<String, Sid>,
    pub sync_sub: Option<Sid>,
    pub active: bool,
    pub leader: String,
    pub closed: bool,
    pub pub_ack: Vec<u8>,
    pub catchups: HashMap<String, u64>,
}

/// A named, ordered, durable log of messages with replication and
/// federation hooks.
pub struct Stream {
    myself: Weak<Stream>,
    pub(crate) account: Weak<Account>,
    pub(crate) relay: Arc<dyn Relay>,
    pub(crate) store: Arc<dyn StreamStore>,
    pub(crate) node: Option<Arc<dyn RaftNode>>,
    pub(crate) outq: Arc<OutQueue>,
    pub(crate) msgs_tx: Sender<InMsg>,
    pub(crate) ackq_tx: Sender<u64>,
    pub(crate) nudge_tx: Sender<()>,
    quit_tx: Mutex<Option<Sender<()>>>,
    pub(crate) state: Mutex<StreamMutable>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream").field("name", &self.name()).finish()
    }
}

impl Stream {
    pub(crate) fn new(
        account: &Arc<Account>,
        cfg: StreamConfig,
        store: Arc<dyn StreamStore>,
        node: Option<Arc<dyn RaftNode>>,
    ) -> Arc<Self> {
        let (outq, out_ready) = OutQueue::new(OUT_QUEUE_CAPACITY);
        let (msgs_tx, msgs_rx) = unbounded();
        let (ackq_tx, ackq_rx) = unbounded();
        let (nudge_tx, nudge_rx) = bounded(1);
        let (quit_tx, quit_rx) = bounded::<()>(1);

        let store_state = store.state();
        let mut dedupe = DedupeIndex::new(cfg.duplicates);
        if store_state.msgs == 0 {
            dedupe.mark_loaded();
        }
        let pub_ack = pub_ack_prefix(&cfg.name, account.domain());

        let relay = account.relay();
        let stream = Arc::new_cyclic(|myself| Self {
            myself: myself.clone(),
            account: Arc::downgrade(account),
            relay,
            store,
            node,
            outq: Arc::new(outq),
            msgs_tx,
            ackq_tx,
            nudge_tx,
            quit_tx: Mutex::new(Some(quit_tx)),
            state: Mutex::new(StreamMutable {
                cfg,
                created: OffsetDateTime::now_utc(),
                lseq: store_state.last_seq,
                lmsg_id: String::new(),
                clfs: 0,
                clseq: 0,
                dedupe,
                dd_deadline: None,
                registry: ConsumerRegistry::default(),
                mirror: None,
                sources: HashMap::new(),
                subs: HashMap::new(),
                sync_sub: None,
                active: false,
                leader: String::new(),
                closed: false,
                pub_ack,
                catchups: HashMap::new(),
            }),
        });

        let weak = Arc::downgrade(&stream);
        thread::Builder::new()
            .name(format!("lds-stream-{}", stream.name()))
            .spawn(move || internal_loop(weak, out_ready, msgs_rx, ackq_rx, nudge_rx, quit_rx))
            .expect("failed to spawn stream internal loop");

        stream
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, StreamMutable> {
        self.state.lock().expect("stream state poisoned")
    }

    pub fn name(&self) -> String {
        self.lock_state().cfg.name.clone()
    }

    pub fn config(&self) -> StreamConfig {
        self.lock_state().cfg.clone()
    }

    pub fn created(&self) -> OffsetDateTime {
        self.lock_state().created
    }

    pub(crate) fn set_created(&self, created: OffsetDateTime) {
        self.lock_state().created = created;
    }

    /// Current store state (fast path).
    pub fn state(&self) -> StreamState {
        self.store.state()
    }

    pub fn store(&self) -> Arc<dyn StreamStore> {
        Arc::clone(&self.store)
    }

    pub fn last_seq(&self) -> u64 {
        self.lock_state().lseq
    }

    pub(crate) fn set_last_seq(&self, lseq: u64) {
        self.lock_state().lseq = lseq;
    }

    /// Count of proposals rejected before reaching the store since the
    /// current leader epoch began.
    pub fn clfs(&self) -> u64 {
        self.lock_state().clfs
    }

    pub fn is_clustered(&self) -> bool {
        self.node.is_some()
    }

    pub fn is_leader(&self) -> bool {
        match &self.node {
            Some(node) => node.is_leader(),
            None => true,
        }
    }

    pub fn is_mirror(&self) -> bool {
        self.lock_state().cfg.mirror.is_some()
    }

    pub fn has_sources(&self) -> bool {
        !self.lock_state().sources.is_empty()
    }

    /// Number of tracked duplicate ids, forcing the lazy rebuild first.
    pub fn num_msg_ids(&self) -> usize {
        let mut st = self.lock_state();
        self.rebuild_dedupe_locked(&mut st);
        st.dedupe.num_ids()
    }

    pub fn get_msg(&self, seq: u64) -> Result<StoredMsg, StreamError> {
        Ok(self.store.load_msg(seq)?)
    }

    // Consumer registry surface; mutation always happens under the stream
    // state lock.

    /// Attaches a consumer. WorkQueue retention admits at most one
    /// competing non-direct consumer per subject partition.
    pub fn set_consumer(&self, consumer: Arc<dyn Consumer>) -> Result<(), StreamError> {
        let mut st = self.lock_state();
        if st.cfg.retention == RetentionPolicy::WorkQueue && !consumer.is_direct() {
            let filter = consumer.filter_subject();
            if filter.is_empty() {
                if st.registry.num_public_consumers() > 0 {
                    return Err(StreamError::WorkQueueMultipleUnfiltered);
                }
            } else if !st.registry.partition_unique(filter) {
                return Err(StreamError::WorkQueueConsumerNotUnique);
            }
        }
        st.registry.set_consumer(consumer);
        Ok(())
    }

    pub fn remove_consumer(&self, name: &str) -> Option<Arc<dyn Consumer>> {
        self.lock_state().registry.remove_consumer(name)
    }

    pub fn lookup_consumer(&self, name: &str) -> Option<Arc<dyn Consumer>> {
        self.lock_state().registry.lookup(name)
    }

    pub fn num_consumers(&self) -> usize {
        self.lock_state().registry.num_consumers()
    }

    pub fn num_public_consumers(&self) -> usize {
        self.lock_state().registry.num_public_consumers()
    }

    pub fn num_direct_consumers(&self) -> usize {
        self.lock_state().registry.num_directs()
    }

    /// Queues an acknowledgement for the internal loop.
    pub fn enqueue_ack(&self, seq: u64) {
        let _ = self.ackq_tx.send(seq);
    }

    /// Acknowledgement hook from consumers under Interest/WorkQueue
    /// retention. Removes the message once interest is drained.
    pub fn ack_msg(&self, consumer: Option<&str>, seq: u64) {
        let should_remove = {
            let st = self.lock_state();
            if st.closed {
                return;
            }
            match st.cfg.retention {
                RetentionPolicy::Limits => return,
                // Direct consumers feed downstream mirrors/sources; hold
                // messages until they have observed them too.
                RetentionPolicy::WorkQueue => {
                    st.registry.num_directs() == 0 || !st.registry.check_interest(seq, consumer)
                }
                RetentionPolicy::Interest => !st.registry.check_interest(seq, consumer),
            }
        };
        if !should_remove {
            return;
        }
        match self.store.remove_msg(seq) {
            Ok(_) => {}
            // The ack can race the write with AckNone consumers; hand the
            // removal to the leader through the log.
            Err(StoreError::Eof) => {
                if let Some(node) = &self.node {
                    let name = self.name();
                    let _ = node.forward_proposal(crate::wire::encode_msg_delete(seq, &name));
                }
            }
            Err(err) => debug!(%err, seq, "ack removal failed"),
        }
    }

    /// Removes all or a filtered subset of messages.
    pub fn purge(&self, req: &PurgeRequest) -> Result<u64, StreamError> {
        {
            let st = self.lock_state();
            if st.closed {
                return Err(StreamError::Closed);
            }
            if st.cfg.sealed {
                return Err(StreamError::Sealed);
            }
        }
        let purged = self.store.purge(req)?;
        let state = self.store.state();
        self.lock_state()
            .registry
            .notify_purge(&req.subject, state.first_seq, state.last_seq);
        Ok(purged)
    }

    /// Removes a single message from the stream.
    pub fn delete_msg(&self, seq: u64) -> Result<bool, StreamError> {
        if self.lock_state().closed {
            return Err(StreamError::Closed);
        }
        Ok(self.store.remove_msg(seq)?)
    }

    /// Applies a validated configuration update: subject delta
    /// subscriptions, source consumer diffs, resource reservation deltas
    /// and the persisted config.
    pub fn update(self: &Arc<Self>, config: &StreamConfig) -> Result<(), StreamError> {
        let account = self.account.upgrade().ok_or(StreamError::Closed)?;
        let ocfg = self.config();
        let cfg = check_update_config(&ocfg, config, account.limits())?;

        // Reserve any MaxBytes growth up front; release shrink after the
        // new config is in place.
        let max_bytes_diff = cfg.max_bytes.max(0) - ocfg.max_bytes.max(0);
        if max_bytes_diff > 0 {
            account.reserve_bytes(cfg.storage, max_bytes_diff)?;
        }

        {
            let mut st = self.lock_state();
            if st.closed {
                return Err(StreamError::Closed);
            }
            // Install the new config first so the source delta below can
            // resolve the added sources' configurations.
            st.cfg = cfg.clone();
            if self.is_leader() {
                // Subject delta: subscribe the added, unsubscribe the removed.
                for subject in &cfg.subjects {
                    if !ocfg.subjects.contains(subject) {
                        let sid = self.subscribe_stream_subject(subject)?;
                        st.subs.insert(subject.clone(), sid);
                    }
                }
                for subject in &ocfg.subjects {
                    if !cfg.subjects.contains(subject) {
                        if let Some(sid) = st.subs.remove(subject) {
                            let _ = self.relay.unsubscribe(sid);
                        }
                    }
                }

                // Source delta by indexed name.
                let new_inames: Vec<String> =
                    cfg.sources.iter().map(|s| s.indexed_name()).collect();
                let old_inames: Vec<String> = st.sources.keys().cloned().collect();
                for source in &cfg.sources {
                    let iname = source.indexed_name();
                    if !st.sources.contains_key(&iname) {
                        let mut si = SourceState::new(&source.name, &iname);
                        self.set_starting_sequence_for_source(&mut si);
                        let start = si.sseq + 1;
                        st.sources.insert(iname.clone(), si);
                        self.set_source_consumer(&mut st, &iname, start);
                    }
                }
                for iname in old_inames {
                    if !new_inames.contains(&iname) {
                        self.cancel_source_consumer(&mut st, &iname);
                        st.sources.remove(&iname);
                    }
                }
            }

            // A changed duplicates window takes effect on the next
            // eviction; fire it right away.
            if cfg.duplicates != ocfg.duplicates {
                st.dedupe.set_window(cfg.duplicates);
                st.dd_deadline = Some(Instant::now());
                let _ = self.nudge_tx.try_send(());
            }

            if self.is_leader() {
                self.send_update_advisory_locked(&st);
            }
        }

        if max_bytes_diff < 0 {
            account.release_bytes(ocfg.storage, -max_bytes_diff);
        }

        self.store.update_config(&cfg)?;
        Ok(())
    }

    /// Stops the stream and deletes its stored messages.
    pub fn delete(self: &Arc<Self>) -> Result<(), StreamError> {
        self.stop(true, true)
    }

    /// Stops the stream: cancels upstream consumers, drops subscriptions,
    /// halts the internal loop and closes the store.
    pub fn stop(self: &Arc<Self>, delete: bool, advisory: bool) -> Result<(), StreamError> {
        let account = self.account.upgrade();
        let cfg = {
            let mut st = self.lock_state();
            if st.closed {
                return Ok(());
            }
            st.closed = true;

            self.cancel_mirror_consumer_locked(&mut st);
            let inames: Vec<String> = st.sources.keys().cloned().collect();
            for iname in inames {
                self.cancel_source_consumer(&mut st, &iname);
            }
            st.sources.clear();

            self.stop_cluster_subs_locked(&mut st);
            let subs: Vec<Sid> = st.subs.drain().map(|(_, sid)| sid).collect();
            for sid in subs {
                let _ = self.relay.unsubscribe(sid);
            }
            st.active = false;

            if delete && advisory {
                self.send_delete_advisory_locked(&st);
            }

            st.dedupe.clear();
            st.dd_deadline = None;
            st.cfg.clone()
        };

        if let Some(acc) = &account {
            acc.unregister_stream(&cfg.name);
        }

        if let Some(node) = &self.node {
            if delete {
                node.delete();
            } else {
                node.stop();
            }
        }

        // Stop the internal loop, then flush whatever it did not get to.
        if let Some(quit) = self.quit_tx.lock().expect("stream state poisoned").take() {
            drop(quit);
        }
        self.drain_outq();

        if delete {
            self.store.delete()?;
            if let Some(acc) = &account {
                acc.release_stream_resources(&cfg);
            }
        } else {
            self.store.stop()?;
        }
        Ok(())
    }

    /// Snapshot of the mirror's runtime info, if this stream is a mirror.
    pub fn mirror_info(&self) -> Option<SourceInfoSnapshot> {
        let st = self.lock_state();
        st.mirror.as_ref().map(source_snapshot)
    }

    /// Snapshots for every configured source.
    pub fn sources_info(&self) -> Vec<SourceInfoSnapshot> {
        let st = self.lock_state();
        st.sources.values().map(source_snapshot).collect()
    }

    /// Rebuilds dedupe state from stored headers on first use; restores
    /// `lmsg_id` from the newest stored message.
    pub(crate) fn rebuild_dedupe_locked(&self, st: &mut StreamMutable) {
        if st.dedupe.is_loaded() {
            return;
        }
        st.dedupe.mark_loaded();

        let window_ns = st.dedupe.window().as_nanos().min(i64::MAX as u128) as i64;
        let start = self
            .store
            .seq_from_time(crate::store::core::now_unix_ns() - window_ns);
        let state = self.store.state();
        if start == 0 {
            return;
        }
        for seq in start..=state.last_seq {
            let Ok(sm) = self.store.load_msg(seq) else {
                continue;
            };
            let msg_id = crate::header::get_msg_id(&sm.hdr);
            if let Some(id) = &msg_id {
                if st.dedupe.insert(id.clone(), sm.seq, sm.ts) {
                    let now = crate::store::core::now_unix_ns();
                    st.dd_deadline = st.dedupe.next_deadline(now).map(|d| Instant::now() + d);
                    let _ = self.nudge_tx.try_send(());
                }
            }
            if seq == state.last_seq {
                st.lmsg_id = msg_id.unwrap_or_default();
            }
        }
    }

    // Runs one eviction pass and rearms the deadline.
    fn purge_msg_ids(&self) {
        let mut st = self.lock_state();
        let next = st.dedupe.evict_expired(crate::store::core::now_unix_ns());
        st.dd_deadline = next.map(|d| Instant::now() + d);
    }

    pub(crate) fn subscribe_stream_subject(&self, subject: &str) -> Result<Sid, RelayError> {
        let weak = self.weak();
        self.relay.subscribe(
            subject,
            Arc::new(move |subject, reply, hdr, msg| {
                if let Some(stream) = weak.upgrade() {
                    stream.process_inbound_stream_msg(subject, reply, hdr, msg);
                }
            }),
        )
    }

    /// Weak handle for tasks and subscriptions; the account map owns the
    /// strong reference.
    pub(crate) fn weak(&self) -> Weak<Stream> {
        self.myself.clone()
    }

    /// Entry point bound to every configured subject. Non-leaders drop,
    /// sealed streams reply with an error, everything else is queued for
    /// the internal loop.
    pub fn process_inbound_stream_msg(&self, subject: &str, reply: &str, hdr: &[u8], msg: &[u8]) {
        let (is_leader, sealed, name, no_ack) = {
            let st = self.lock_state();
            if st.closed {
                return;
            }
            (
                self.is_leader(),
                st.cfg.sealed,
                st.cfg.name.clone(),
                st.cfg.no_ack,
            )
        };
        if !is_leader {
            return;
        }
        if sealed {
            if !reply.is_empty() && !no_ack {
                self.outq
                    .send_msg(reply, PubAckResponse::failure(&name, ApiError::stream_sealed()));
            }
            return;
        }
        let _ = self.msgs_tx.send(InMsg {
            subject: subject.to_owned(),
            reply: reply.to_owned(),
            hdr: hdr.to_vec(),
            msg: msg.to_vec(),
        });
    }

    /// Publishes a message into the stream as if it arrived on the wire.
    pub fn publish(&self, subject: &str, reply: &str, hdr: &[u8], msg: &[u8]) {
        self.process_inbound_stream_msg(subject, reply, hdr, msg);
    }

    fn dispatch_inbound(&self, im: InMsg) {
        if self.is_clustered() {
            self.propose_stream_msg(&im.subject, &im.reply, &im.hdr, &im.msg);
        } else {
            let _ = self.process_stream_msg(&im.subject, &im.reply, &im.hdr, &im.msg, None);
        }
    }

    /// Leader-side replication: attaches the pre-assigned sequence and
    /// proposes the entry; commits re-enter through [`CommitSink`].
    pub(crate) fn propose_stream_msg(&self, subject: &str, reply: &str, hdr: &[u8], msg: &[u8]) {
        let Some(node) = &self.node else {
            return;
        };
        if let Some(account) = self.account.upgrade() {
            let storage = self.lock_state().cfg.storage;
            if account.limits_exceeded(storage) {
                let name = self.name();
                if !reply.is_empty() {
                    self.outq.send_msg(
                        reply,
                        PubAckResponse::failure(&name, ApiError::insufficient_resources()),
                    );
                }
                node.step_down();
                return;
            }
        }
        let entry = {
            let mut st = self.lock_state();
            if st.clseq < st.lseq + st.clfs {
                st.clseq = st.lseq + st.clfs;
            }
            let frame = StreamMsgFrame {
                subject: subject.to_owned(),
                reply: reply.to_owned(),
                hdr: hdr.to_vec(),
                msg: msg.to_vec(),
                pre_seq: st.clseq,
                ts: crate::store::core::now_unix_ns(),
            };
            st.clseq += 1;
            crate::wire::encode_stream_msg(&frame)
        };
        if let Err(err) = node.propose(entry) {
            warn!(%err, "stream proposal failed, stepping down");
            node.step_down();
        }
    }

    fn drain_outq(&self) {
        while let Some(pm) = self.outq.pop() {
            self.relay.publish(&pm.dest, &pm.reply, &pm.hdr, &pm.msg);
            self.outq.recycle(pm);
        }
    }
}

impl CommitSink for Stream {
    /// Applies a committed entry in log order. Skips advance the sequence
    /// without a payload; flow-control frames only render a reply.
    fn apply_committed(&self, entry: &[u8]) {
        match decode_entry(entry) {
            Ok(ReplicatedOp::Msg(frame)) => {
                if frame.msg.is_empty()
                    && frame.hdr.starts_with(crate::header::CTRL_LINE_PREFIX)
                    && !frame.reply.is_empty()
                {
                    if self.is_leader() {
                        self.outq.send_msg(frame.reply, Vec::new());
                    }
                    return;
                }
                if frame.is_skip() && frame.ts == 0 && frame.reply.is_empty() {
                    let lseq = self.store.skip_msg();
                    self.set_last_seq(lseq);
                    return;
                }
                let replay = crate::stream::ingress::Replay {
                    pre_seq: frame.pre_seq,
                    ts: frame.ts,
                };
                let _ = self.process_stream_msg(
                    &frame.subject,
                    &frame.reply,
                    &frame.hdr,
                    &frame.msg,
                    Some(replay),
                );
            }
            Ok(ReplicatedOp::DeleteMsg { seq, .. }) => {
                if let Err(err) = self.store.remove_msg(seq) {
                    debug!(%err, seq, "committed delete had nothing to remove");
                }
            }
            Err(err) => error!(%err, "dropping undecodable committed entry"),
        }
    }
}

fn source_snapshot(si: &SourceState) -> SourceInfoSnapshot {
    SourceInfoSnapshot {
        name: si.name.clone(),
        iname: si.iname.clone(),
        lag: si.lag,
        active: si.last.map(|t| t.elapsed()),
        error: si.err.clone(),
        sseq: si.sseq,
        dseq: si.dseq,
        consumer: (!si.cname.is_empty()).then(|| si.cname.clone()),
    }
}

// The internal loop: sole consumer of the inbound, ack and out queues plus
// the dedupe eviction deadline. Terminates when the quit channel closes.
fn internal_loop(
    stream: Weak<Stream>,
    out_ready: Receiver<()>,
    msgs_rx: Receiver<InMsg>,
    ackq_rx: Receiver<u64>,
    nudge_rx: Receiver<()>,
    quit_rx: Receiver<()>,
) {
    const IDLE: Duration = Duration::from_secs(3600);
    loop {
        let Some(s) = stream.upgrade() else {
            return;
        };
        let timeout = {
            let st = s.lock_state();
            st.dd_deadline
                .map(|dl| dl.saturating_duration_since(Instant::now()))
                .unwrap_or(IDLE)
        };
        select! {
            recv(quit_rx) -> _ => {
                s.drain_outq();
                return;
            }
            recv(out_ready) -> r => {
                if r.is_err() {
                    return;
                }
                s.drain_outq();
            }
            recv(msgs_rx) -> m => match m {
                Ok(im) => s.dispatch_inbound(im),
                Err(_) => return,
            },
            recv(ackq_rx) -> a => match a {
                Ok(seq) => s.ack_msg(None, seq),
                Err(_) => return,
            },
            recv(nudge_rx) -> _ => {}
            recv(after(timeout)) -> _ => s.purge_msg_ids(),
        }
        drop(s);
    }
}
