//! Mirror and source federation: upstream consumer lifecycle (create,
//! retry, cancel), health checks, flow control, sequence tracking with gap
//! reification, and origin-header stamping on sourced writes.

use crate::header::{
    ack_reply_consumer, classify_control, get_stream_source, parse_ack_reply, remove_header_if_present,
    set_header, ControlMsg, STREAM_SOURCE_HDR,
};
use crate::relay::Sid;
use crate::store::core::StoreError;
use crate::stream::core::{InMsg, Stream, StreamError, StreamMutable};
use crate::stream::ingress::{IngestError, Replay};
use crate::wire::{
    consumer_create_subject, encode_stream_msg, unique_subject, ApiError, ConsumerApiConfig,
    ConsumerCreateRequest, ConsumerCreateResponse, DeliverPolicy, StreamMsgFrame,
};
use crossbeam::channel::{after, bounded, select, tick, unbounded, Receiver, Sender};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Cadence of upstream health checks and requested idle heartbeats.
pub const SOURCE_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(2);
/// Consumer create requests are throttled to one per source per this.
const CONSUMER_CREATE_THROTTLE: Duration = Duration::from_secs(2);
/// How long to wait for a consumer create response before abandoning the
/// reply inbox.
const CONSUMER_CREATE_TIMEOUT: Duration = Duration::from_secs(10);
/// Ack wait requested from upstream consumers (effectively "never").
const SOURCE_ACK_WAIT: Duration = Duration::from_secs(22 * 60 * 60);
/// Skip proposals are batched so a single entry never gets too big.
const MAX_SKIP_BATCH: usize = 10_000;

/// Runtime state for one upstream (the mirror or one source).
pub(crate) struct SourceState {
    pub name: String,
    pub iname: String,
    /// Upstream consumer name; doubles as the subscription identity since
    /// subscription pointers do not survive cross-account imports.
    pub cname: String,
    pub sub: Option<Sid>,
    pub msgs_tx: Sender<InMsg>,
    /// Last upstream stream sequence observed.
    pub sseq: u64,
    /// Last upstream delivery sequence observed.
    pub dseq: u64,
    pub lag: u64,
    pub err: Option<ApiError>,
    pub last: Option<Instant>,
    pub lreq: Option<Instant>,
    pub quit_tx: Option<Sender<()>>,
    pub running: bool,
}

impl SourceState {
    pub fn new(name: impl Into<String>, iname: impl Into<String>) -> Self {
        // Replaced with a live channel when the task spawns.
        let (msgs_tx, _) = unbounded();
        Self {
            name: name.into(),
            iname: iname.into(),
            cname: String::new(),
            sub: None,
            msgs_tx,
            sseq: 0,
            dseq: 0,
            lag: 0,
            err: None,
            last: None,
            lreq: None,
            quit_tx: None,
            running: false,
        }
    }
}

enum UpstreamKind {
    Mirror,
    Source,
}

impl Stream {
    // ---------------------------------------------------------------
    // Mirror
    // ---------------------------------------------------------------

    /// Creates (or resets) the upstream consumer feeding this mirror.
    pub(crate) fn setup_mirror_consumer(
        self: &Arc<Self>,
        st: &mut StreamMutable,
    ) -> Result<(), StreamError> {
        let Some(mcfg) = st.cfg.mirror.clone() else {
            return Ok(());
        };

        let is_reset = st.mirror.is_some();
        if is_reset {
            let lseq = st.lseq;
            if let Some(mi) = st.mirror.as_mut() {
                if let Some(sid) = mi.sub.take() {
                    let _ = self.relay.unsubscribe(sid);
                }
                mi.dseq = 0;
                mi.sseq = lseq;
                mi.cname.clear();
            }
            if !self.is_leader() {
                return Ok(());
            }
        } else {
            st.mirror = Some(SourceState::new(&mcfg.name, &mcfg.name));
        }

        {
            let mi = st.mirror.as_mut().expect("mirror just ensured");
            if !mi.running {
                mi.running = true;
                mi.last = Some(Instant::now());
                let (msgs_tx, msgs_rx) = unbounded();
                let (quit_tx, quit_rx) = bounded(1);
                mi.msgs_tx = msgs_tx;
                mi.quit_tx = Some(quit_tx);
                let weak = self.weak();
                thread::Builder::new()
                    .name(format!("lds-mirror-{}", st.cfg.name))
                    .spawn(move || run_upstream_task(weak, UpstreamKind::Mirror, None, msgs_rx, quit_rx))
                    .expect("failed to spawn mirror task");
            }

            if let Some(lreq) = mi.lreq {
                if lreq.elapsed() < CONSUMER_CREATE_THROTTLE {
                    return Ok(());
                }
            }
            mi.lreq = Some(Instant::now());
        }

        let ext = mcfg.external.clone();
        let deliver_subject = match &ext {
            Some(e) if !e.deliver_prefix.is_empty() => {
                format!("{}{}", e.deliver_prefix, unique_subject(".M")).replace("..", ".")
            }
            _ => unique_subject("$JS.M"),
        };

        let state = self.store.state();
        let mut config = ConsumerApiConfig {
            deliver_subject: deliver_subject.clone(),
            deliver_policy: DeliverPolicy::ByStartSequence,
            opt_start_seq: state.last_seq + 1,
            ack_policy: crate::wire::AckPolicy::None,
            ack_wait_ns: SOURCE_ACK_WAIT.as_nanos() as u64,
            max_deliver: 1,
            idle_heartbeat_ns: SOURCE_HEALTH_CHECK_INTERVAL.as_nanos() as u64,
            flow_control: true,
            direct: true,
            ..Default::default()
        };
        // Only honor the configured start position on a genuinely fresh
        // stream; restarts resume at our own last sequence.
        if state.msgs == 0 && state.first_seq == 0 {
            config.opt_start_seq = 0;
            if mcfg.opt_start_seq > 0 {
                config.opt_start_seq = mcfg.opt_start_seq;
            } else if let Some(start) = mcfg.opt_start_time {
                config.opt_start_time = Some(start);
                config.deliver_policy = DeliverPolicy::ByStartTime;
            }
        }
        if config.opt_start_seq == 0 && config.opt_start_time.is_none() {
            config.deliver_policy = DeliverPolicy::All;
        }

        let request = ConsumerCreateRequest {
            stream: mcfg.name.clone(),
            config,
        };
        let subject =
            consumer_create_subject(&mcfg.name, ext.as_ref().map(|e| e.api_prefix.as_str()));
        self.request_upstream_consumer(subject, request, deliver_subject, UpstreamKind::Mirror, None);
        Ok(())
    }

    pub(crate) fn retry_mirror_consumer(self: &Arc<Self>) {
        debug!(stream = %self.name(), "retrying mirror consumer");
        let mut st = self.lock_state();
        let _ = self.setup_mirror_consumer(&mut st);
    }

    pub(crate) fn cancel_mirror_consumer(&self) {
        let mut st = self.lock_state();
        self.cancel_mirror_consumer_locked(&mut st);
    }

    pub(crate) fn cancel_mirror_consumer_locked(&self, st: &mut StreamMutable) {
        if let Some(mi) = st.mirror.as_mut() {
            if let Some(sid) = mi.sub.take() {
                let _ = self.relay.unsubscribe(sid);
            }
            mi.cname.clear();
            mi.quit_tx = None;
        }
    }

    pub(crate) fn set_mirror_err(&self, err: Option<ApiError>) {
        let mut st = self.lock_state();
        if let Some(mi) = st.mirror.as_mut() {
            mi.err = err;
        }
    }

    fn handle_mirror_create_response(
        self: &Arc<Self>,
        ccr: ConsumerCreateResponse,
        deliver_subject: &str,
    ) {
        if ccr.error.is_some() || ccr.consumer_info.is_none() {
            self.cancel_mirror_consumer();
            self.set_mirror_err(ccr.error);
            return;
        }
        let info = ccr.consumer_info.expect("checked above");

        // Upstream may have expired messages past our last sequence;
        // reify the hole as skips so replicas stay aligned.
        let state = self.store.state();
        if info.delivered.stream_seq > state.last_seq {
            self.skip_msgs(state.last_seq + 1, info.delivered.stream_seq);
        }

        let mut st = self.lock_state();
        if st.mirror.is_none() {
            drop(st);
            self.cancel_mirror_consumer();
            return;
        }
        let msgs_tx = st.mirror.as_ref().expect("checked above").msgs_tx.clone();
        let sub = self.subscribe_upstream_delivery(deliver_subject, msgs_tx);
        let mi = st.mirror.as_mut().expect("checked above");
        match sub {
            Ok(sid) => {
                mi.cname = info.name.clone();
                mi.err = None;
                mi.sub = Some(sid);
                mi.last = Some(Instant::now());
                mi.dseq = 0;
                mi.sseq = info.delivered.stream_seq;
            }
            Err(err) => {
                mi.err = Some(ApiError::mirror_consumer_setup_failed(&err.to_string()));
                mi.sub = None;
                mi.cname.clear();
            }
        }
    }

    /// Handles one delivery from the mirrored stream. Returns false when
    /// the remaining queued batch should be abandoned.
    pub(crate) fn process_inbound_mirror_msg(self: &Arc<Self>, im: &InMsg) -> bool {
        let mut st = self.lock_state();
        if st.mirror.is_none() {
            return false;
        }
        if !self.is_leader() {
            drop(st);
            self.cancel_mirror_consumer();
            return false;
        }

        let control = classify_control(&im.reply, &im.hdr, &im.msg);
        let current = {
            let mi = st.mirror.as_ref().expect("checked above");
            !mi.cname.is_empty() && ack_reply_consumer(&im.reply) == Some(mi.cname.as_str())
        };
        if control.is_none() && !current {
            return false;
        }
        st.mirror.as_mut().expect("checked above").last = Some(Instant::now());

        if let Some(ctrl) = control {
            let retry = self.handle_control_msg(&mut st, ctrl, |st| {
                st.mirror.as_ref().map(|mi| mi.dseq)
            });
            drop(st);
            if retry {
                self.retry_mirror_consumer();
            }
            return !retry;
        }

        let Some(info) = parse_ack_reply(&im.reply) else {
            return false;
        };
        if info.delivery_count > 1 {
            return false;
        }

        let mi = st.mirror.as_mut().expect("checked above");
        let (olag, osseq, odseq) = (mi.lag, mi.sseq, mi.dseq);
        let mut needs_skip = None;
        if info.stream_seq == mi.sseq + 1 {
            mi.dseq = info.consumer_seq;
            mi.sseq += 1;
        } else if info.stream_seq <= mi.sseq {
            // Old redelivery, ignore.
            return true;
        } else if mi.cname.is_empty() {
            mi.cname = ack_reply_consumer(&im.reply).unwrap_or_default().to_owned();
            mi.dseq = info.consumer_seq;
            mi.sseq = info.stream_seq;
        } else if info.consumer_seq == mi.dseq + 1 {
            // Delivery advanced by one but the stream jumped: the upstream
            // expired or deleted the range in between.
            needs_skip = Some((mi.sseq + 1, info.stream_seq - 1));
            mi.dseq += 1;
            mi.sseq = info.stream_seq;
        } else {
            drop(st);
            self.retry_mirror_consumer();
            return false;
        }
        mi.lag = info.pending.saturating_sub(1);
        drop(st);

        if let Some((start, end)) = needs_skip {
            self.skip_msgs(start, end);
        }

        let ingest_err = if let Some(node) = &self.node {
            let frame = StreamMsgFrame {
                subject: im.subject.clone(),
                reply: String::new(),
                hdr: im.hdr.clone(),
                msg: im.msg.clone(),
                pre_seq: info.stream_seq - 1,
                ts: info.timestamp,
            };
            match node.propose(encode_stream_msg(&frame)) {
                Ok(()) => None,
                Err(err) => {
                    warn!(%err, "mirror proposal failed");
                    return false;
                }
            }
        } else {
            self.process_stream_msg(
                &im.subject,
                "",
                &im.hdr,
                &im.msg,
                Some(Replay {
                    pre_seq: info.stream_seq - 1,
                    ts: info.timestamp,
                }),
            )
            .err()
        };

        match ingest_err {
            None => true,
            Some(IngestError::LastSeqMismatch) => {
                if info.stream_seq <= self.last_seq() {
                    // Stale delivery behind our log; rewind the tracking.
                    let mut st = self.lock_state();
                    if let Some(mi) = st.mirror.as_mut() {
                        mi.lag = olag;
                        mi.sseq = osseq;
                        mi.dseq = odseq;
                    }
                    false
                } else {
                    let mut st = self.lock_state();
                    if let Some(mi) = st.mirror.as_mut() {
                        mi.sseq = osseq;
                        mi.dseq = odseq;
                    }
                    drop(st);
                    self.retry_mirror_consumer();
                    false
                }
            }
            Some(err) => {
                warn!(stream = %self.name(), %err, "error processing mirror msg");
                if matches!(err, IngestError::Store(StoreError::NoSpace)) {
                    self.disable_engine();
                }
                false
            }
        }
    }

    // ---------------------------------------------------------------
    // Sources
    // ---------------------------------------------------------------

    /// Creates consumers for every configured source at its resume point.
    pub(crate) fn setup_source_consumers(
        self: &Arc<Self>,
        st: &mut StreamMutable,
    ) -> Result<(), StreamError> {
        let active: Vec<String> = st
            .sources
            .values()
            .filter(|si| si.sub.is_some())
            .map(|si| si.iname.clone())
            .collect();
        for iname in active {
            self.cancel_source_consumer(st, &iname);
        }

        self.starting_sequences_for_sources(st);

        let sources = st.cfg.sources.clone();
        for ssi in &sources {
            let iname = ssi.indexed_name();
            let start = match st.sources.get(&iname) {
                Some(si) => si.sseq + 1,
                None => continue,
            };
            self.set_source_consumer(st, &iname, start);
        }
        Ok(())
    }

    /// Installs (or reinstalls) the upstream consumer for `iname`,
    /// starting delivery at `seq`.
    pub(crate) fn set_source_consumer(self: &Arc<Self>, st: &mut StreamMutable, iname: &str, seq: u64) {
        let stream_name = st.cfg.name.clone();
        let Some(ssi) = st.cfg.source(iname).cloned() else {
            return;
        };
        let Some(si) = st.sources.get_mut(iname) else {
            return;
        };
        if let Some(sid) = si.sub.take() {
            let _ = self.relay.unsubscribe(sid);
        }
        si.cname.clear();
        si.sseq = seq;
        si.dseq = 0;
        si.last = Some(Instant::now());

        if !si.running {
            si.running = true;
            let (msgs_tx, msgs_rx) = unbounded();
            let (quit_tx, quit_rx) = bounded(1);
            si.msgs_tx = msgs_tx;
            si.quit_tx = Some(quit_tx);
            let weak = self.weak();
            let iname_owned = iname.to_owned();
            thread::Builder::new()
                .name(format!("lds-source-{stream_name}-{iname}"))
                .spawn(move || {
                    run_upstream_task(weak, UpstreamKind::Source, Some(iname_owned), msgs_rx, quit_rx)
                })
                .expect("failed to spawn source task");
        }

        if let Some(lreq) = si.lreq {
            if lreq.elapsed() < CONSUMER_CREATE_THROTTLE {
                return;
            }
        }
        si.lreq = Some(Instant::now());

        let ext = ssi.external.clone();
        let deliver_subject = match &ext {
            Some(e) if !e.deliver_prefix.is_empty() => {
                format!("{}{}", e.deliver_prefix, unique_subject(".S")).replace("..", ".")
            }
            _ => unique_subject("$JS.S"),
        };

        let mut config = ConsumerApiConfig {
            deliver_subject: deliver_subject.clone(),
            ack_policy: crate::wire::AckPolicy::None,
            ack_wait_ns: SOURCE_ACK_WAIT.as_nanos() as u64,
            max_deliver: 1,
            idle_heartbeat_ns: SOURCE_HEALTH_CHECK_INTERVAL.as_nanos() as u64,
            flow_control: true,
            direct: true,
            filter_subject: ssi.filter_subject.clone(),
            ..Default::default()
        };
        // First start honors the configured position; restarts resume.
        if seq <= 1 {
            if ssi.opt_start_seq > 0 {
                config.opt_start_seq = ssi.opt_start_seq;
                config.deliver_policy = DeliverPolicy::ByStartSequence;
            } else if let Some(start) = ssi.opt_start_time {
                config.opt_start_time = Some(start);
                config.deliver_policy = DeliverPolicy::ByStartTime;
            }
        } else {
            config.opt_start_seq = seq;
            config.deliver_policy = DeliverPolicy::ByStartSequence;
        }

        let request = ConsumerCreateRequest {
            stream: ssi.name.clone(),
            config,
        };
        let subject =
            consumer_create_subject(&ssi.name, ext.as_ref().map(|e| e.api_prefix.as_str()));
        self.request_upstream_consumer(
            subject,
            request,
            deliver_subject,
            UpstreamKind::Source,
            Some(iname.to_owned()),
        );
    }

    pub(crate) fn cancel_source_consumer(&self, st: &mut StreamMutable, iname: &str) {
        if let Some(si) = st.sources.get_mut(iname) {
            if let Some(sid) = si.sub.take() {
                let _ = self.relay.unsubscribe(sid);
            }
            si.sseq = 0;
            si.dseq = 0;
            si.cname.clear();
            si.quit_tx = None;
        }
    }

    pub(crate) fn retry_source_consumer(self: &Arc<Self>, iname: &str) {
        let mut st = self.lock_state();
        if !st.sources.contains_key(iname) {
            return;
        }
        debug!(stream = %st.cfg.name, source = iname, "retrying source consumer");
        {
            let mut si = st.sources.remove(iname).expect("checked above");
            self.set_starting_sequence_for_source(&mut si);
            st.sources.insert(iname.to_owned(), si);
        }
        let seq = st.sources[iname].sseq + 1;
        self.set_source_consumer(&mut st, iname, seq);
    }

    fn retry_source_consumer_at_seq(self: &Arc<Self>, iname: &str, seq: u64) {
        let mut st = self.lock_state();
        if !st.sources.contains_key(iname) {
            return;
        }
        self.set_source_consumer(&mut st, iname, seq);
    }

    fn handle_source_create_response(
        self: &Arc<Self>,
        iname: &str,
        ccr: ConsumerCreateResponse,
        deliver_subject: &str,
    ) {
        let mut st = self.lock_state();
        let Some(si) = st.sources.get_mut(iname) else {
            return;
        };
        si.err = None;
        if ccr.error.is_some() || ccr.consumer_info.is_none() {
            warn!(source = iname, error = ?ccr.error, "consumer create rejected upstream");
            si.err = ccr.error;
            self.cancel_source_consumer(&mut st, iname);
            return;
        }
        let info = ccr.consumer_info.expect("checked above");
        if si.sseq != info.delivered.stream_seq {
            si.sseq = info.delivered.stream_seq + 1;
        }
        si.cname = info.name.clone();
        let msgs_tx = si.msgs_tx.clone();
        let sub = self.subscribe_upstream_delivery(deliver_subject, msgs_tx);
        let si = st.sources.get_mut(iname).expect("checked above");
        match sub {
            Ok(sid) => {
                si.err = None;
                si.sub = Some(sid);
                si.last = Some(Instant::now());
            }
            Err(err) => {
                si.err = Some(ApiError::source_consumer_setup_failed(&err.to_string()));
                si.sub = None;
            }
        }
    }

    /// Handles one delivery from a source stream.
    pub(crate) fn process_inbound_source_msg(self: &Arc<Self>, iname: &str, im: &InMsg) -> bool {
        let mut st = self.lock_state();
        if !self.is_leader() {
            self.cancel_source_consumer(&mut st, iname);
            return false;
        }
        if !st.sources.contains_key(iname) {
            return false;
        }

        let control = classify_control(&im.reply, &im.hdr, &im.msg);
        let current = {
            let si = &st.sources[iname];
            !si.cname.is_empty() && ack_reply_consumer(&im.reply) == Some(si.cname.as_str())
        };
        if control.is_none() && !current {
            return false;
        }
        st.sources.get_mut(iname).expect("checked above").last = Some(Instant::now());

        if let Some(ctrl) = control {
            let retry = self.handle_control_msg(&mut st, ctrl, |st| {
                st.sources.get(iname).map(|si| si.dseq)
            });
            let resume = st.sources.get(iname).map(|si| si.sseq + 1).unwrap_or(1);
            drop(st);
            if retry {
                self.retry_source_consumer_at_seq(iname, resume);
            }
            return !retry;
        }

        let Some(info) = parse_ack_reply(&im.reply) else {
            return false;
        };
        if info.delivery_count > 1 {
            return false;
        }

        let si = st.sources.get_mut(iname).expect("checked above");
        if info.consumer_seq == si.dseq + 1 {
            si.dseq += 1;
            si.sseq = info.stream_seq;
        } else if info.consumer_seq > si.dseq {
            if si.cname.is_empty() {
                si.cname = ack_reply_consumer(&im.reply).unwrap_or_default().to_owned();
                si.dseq = info.consumer_seq;
                si.sseq = info.stream_seq;
            } else {
                let resume = si.sseq + 1;
                drop(st);
                self.retry_source_consumer_at_seq(iname, resume);
                return false;
            }
        } else {
            return false;
        }
        let si = st.sources.get_mut(iname).expect("checked above");
        si.lag = info.pending.saturating_sub(1);
        drop(st);

        // Strip any daisy-chained origin and stamp our own.
        let mut hdr = if im.hdr.is_empty() {
            Vec::new()
        } else {
            remove_header_if_present(&im.hdr, STREAM_SOURCE_HDR)
        };
        hdr = set_header(&hdr, STREAM_SOURCE_HDR, &format!("{iname} {}", info.stream_seq));

        let ingest_err = if self.is_clustered() {
            self.propose_stream_msg(&im.subject, "", &hdr, &im.msg);
            None
        } else {
            self.process_stream_msg(&im.subject, "", &hdr, &im.msg, None)
                .err()
        };

        if let Some(err) = ingest_err {
            match &err {
                IngestError::LastSeqMismatch => {
                    {
                        let mut st = self.lock_state();
                        self.cancel_source_consumer(&mut st, iname);
                    }
                    self.retry_source_consumer(iname);
                }
                IngestError::Store(StoreError::NoSpace) => {
                    error!("stream store out of space, disabling engine");
                    self.disable_engine();
                }
                other => {
                    warn!(stream = %self.name(), err = %other, "error processing inbound source msg");
                }
            }
        }
        true
    }

    /// Resume point for one source: reverse-scan the local log for the
    /// newest message carrying this source's origin header.
    pub(crate) fn set_starting_sequence_for_source(&self, si: &mut SourceState) {
        let state = self.store.state();
        // Keep sseq so purge/expiry is remembered; only delivery resets.
        if state.msgs == 0 {
            si.dseq = 0;
            return;
        }
        for seq in (state.first_seq..=state.last_seq).rev() {
            let Ok(sm) = self.store.load_msg(seq) else {
                continue;
            };
            if sm.hdr.is_empty() {
                continue;
            }
            let Some((iname, sseq)) = get_stream_source(&sm.hdr) else {
                continue;
            };
            if iname == si.iname {
                si.sseq = sseq;
                si.dseq = 0;
                return;
            }
        }
    }

    /// One reverse scan resolving resume points for every configured
    /// source. Can be slow on large logs in degenerate cases.
    pub(crate) fn starting_sequences_for_sources(&self, st: &mut StreamMutable) {
        if st.cfg.sources.is_empty() {
            return;
        }
        st.sources.clear();
        for ssi in &st.cfg.sources {
            let iname = ssi.indexed_name();
            st.sources
                .insert(iname.clone(), SourceState::new(&ssi.name, &iname));
        }

        let state = self.store.state();
        if state.msgs == 0 {
            return;
        }
        let expected = st.sources.len();
        let mut seqs: std::collections::HashMap<String, u64> = std::collections::HashMap::new();
        for seq in (state.first_seq..=state.last_seq).rev() {
            let Ok(sm) = self.store.load_msg(seq) else {
                continue;
            };
            if sm.hdr.is_empty() {
                continue;
            }
            let Some((iname, sseq)) = get_stream_source(&sm.hdr) else {
                continue;
            };
            if st.sources.contains_key(&iname) && !seqs.contains_key(&iname) {
                seqs.insert(iname, sseq);
                if seqs.len() == expected {
                    break;
                }
            }
        }
        for (iname, sseq) in seqs {
            if sseq == 0 {
                continue;
            }
            if let Some(si) = st.sources.get_mut(&iname) {
                si.sseq = sseq;
                si.dseq = 0;
            }
        }
    }

    pub(crate) fn stop_source_consumers_locked(&self, st: &mut StreamMutable) {
        let inames: Vec<String> = st.sources.keys().cloned().collect();
        for iname in inames {
            self.cancel_source_consumer(st, &iname);
        }
    }

    // ---------------------------------------------------------------
    // Shared plumbing
    // ---------------------------------------------------------------

    /// Reifies a gap `[start, end]` as skip entries: proposed through the
    /// log when clustered (batched), burned locally otherwise. Callers
    /// must not hold the state lock.
    pub(crate) fn skip_msgs(&self, start: u64, end: u64) {
        if start > end {
            return;
        }
        if let Some(node) = &self.node {
            let mut entries = Vec::new();
            for seq in start..=end {
                entries.push(encode_stream_msg(&StreamMsgFrame::skip(seq)));
                if entries.len() >= MAX_SKIP_BATCH {
                    if let Err(err) = node.propose_batch(std::mem::take(&mut entries)) {
                        warn!(%err, "skip batch proposal failed");
                        return;
                    }
                }
            }
            if !entries.is_empty() {
                if let Err(err) = node.propose_batch(entries) {
                    warn!(%err, "skip batch proposal failed");
                }
            }
        } else {
            let mut st = self.lock_state();
            for _ in start..=end {
                st.lseq = self.store.skip_msg();
            }
        }
    }

    // Flow control goes through the replication log when clustered so all
    // replicas observe it; heartbeats check for missed deliveries and
    // stall probes. Returns whether a consumer retry is needed.
    fn handle_control_msg(
        &self,
        st: &mut StreamMutable,
        ctrl: ControlMsg,
        dseq_of: impl Fn(&StreamMutable) -> Option<u64>,
    ) -> bool {
        match ctrl {
            ControlMsg::FlowControl { reply } => {
                if let Some(node) = &self.node {
                    let frame = StreamMsgFrame {
                        reply,
                        hdr: crate::header::CTRL_LINE_PREFIX.to_vec(),
                        ..Default::default()
                    };
                    let _ = node.propose(encode_stream_msg(&frame));
                } else {
                    self.outq.send_msg(reply, Vec::new());
                }
                false
            }
            ControlMsg::Heartbeat {
                last_consumer_seq,
                stalled_reply,
            } => {
                if let (Some(ldseq), Some(dseq)) = (last_consumer_seq, dseq_of(st)) {
                    if ldseq > 0 && ldseq != dseq {
                        return true;
                    }
                } else if let Some(stalled) = stalled_reply {
                    self.outq.send_msg(stalled, Vec::new());
                }
                false
            }
        }
    }

    fn subscribe_upstream_delivery(
        &self,
        deliver_subject: &str,
        msgs_tx: Sender<InMsg>,
    ) -> Result<Sid, crate::relay::RelayError> {
        self.relay.subscribe(
            deliver_subject,
            Arc::new(move |subject, reply, hdr, msg| {
                let _ = msgs_tx.send(InMsg {
                    subject: subject.to_owned(),
                    reply: reply.to_owned(),
                    hdr: hdr.to_vec(),
                    msg: msg.to_vec(),
                });
            }),
        )
    }

    // Publishes the consumer create request with a unique reply inbox and
    // arms the response/timeout handler.
    fn request_upstream_consumer(
        self: &Arc<Self>,
        subject: String,
        request: ConsumerCreateRequest,
        deliver_subject: String,
        kind: UpstreamKind,
        iname: Option<String>,
    ) {
        let (resp_tx, resp_rx) = bounded::<ConsumerCreateResponse>(1);
        let reply = unique_subject("_INBOX.lds");
        let inbox_sid = match self.relay.subscribe(
            &reply,
            Arc::new(move |_, _, _, msg| {
                let ccr = serde_json::from_slice::<ConsumerCreateResponse>(msg).unwrap_or_else(
                    |_| ConsumerCreateResponse {
                        error: Some(ApiError::invalid_json()),
                        consumer_info: None,
                    },
                );
                let _ = resp_tx.try_send(ccr);
            }),
        ) {
            Ok(sid) => sid,
            Err(err) => {
                warn!(%err, "failed to subscribe consumer create inbox");
                return;
            }
        };

        let payload = match serde_json::to_vec(&request) {
            Ok(p) => p,
            Err(err) => {
                warn!(%err, "failed to encode consumer create request");
                let _ = self.relay.unsubscribe(inbox_sid);
                return;
            }
        };
        self.outq.send_with_reply(subject, reply, payload);

        let weak = self.weak();
        let relay = Arc::clone(&self.relay);
        thread::spawn(move || {
            select! {
                recv(resp_rx) -> resp => {
                    let _ = relay.unsubscribe(inbox_sid);
                    let (Ok(ccr), Some(stream)) = (resp, weak.upgrade()) else {
                        return;
                    };
                    match kind {
                        UpstreamKind::Mirror => {
                            stream.handle_mirror_create_response(ccr, &deliver_subject)
                        }
                        UpstreamKind::Source => {
                            let iname = iname.expect("source response without iname");
                            stream.handle_source_create_response(&iname, ccr, &deliver_subject)
                        }
                    }
                }
                recv(after(CONSUMER_CREATE_TIMEOUT)) -> _ => {
                    // Abandon the inbox; the next health tick retries.
                    let _ = relay.unsubscribe(inbox_sid);
                }
            }
        });
    }

    pub(crate) fn disable_engine(&self) {
        if let Some(account) = self.account.upgrade() {
            error!("engine out of space, disabling");
            account.disable();
        }
    }
}

// Per-upstream worker: drains the delivery queue and runs health checks.
// Exits when no longer leader, on quit, or when the stream goes away.
fn run_upstream_task(
    stream: Weak<Stream>,
    kind: UpstreamKind,
    iname: Option<String>,
    msgs_rx: Receiver<InMsg>,
    quit_rx: Receiver<()>,
) {
    let health = tick(SOURCE_HEALTH_CHECK_INTERVAL);
    loop {
        select! {
            recv(quit_rx) -> _ => break,
            recv(msgs_rx) -> m => {
                let Ok(im) = m else { break };
                let Some(s) = stream.upgrade() else { break };
                let ok = match &kind {
                    UpstreamKind::Mirror => s.process_inbound_mirror_msg(&im),
                    UpstreamKind::Source => {
                        s.process_inbound_source_msg(iname.as_deref().expect("source task"), &im)
                    }
                };
                if !ok {
                    // Abandon the rest of this batch; tracking moved on.
                    while msgs_rx.try_recv().is_ok() {}
                }
            }
            recv(health) -> _ => {
                let Some(s) = stream.upgrade() else { break };
                if !s.is_leader() {
                    match &kind {
                        UpstreamKind::Mirror => s.cancel_mirror_consumer(),
                        UpstreamKind::Source => {
                            let mut st = s.lock_state();
                            let iname = iname.as_deref().expect("source task");
                            s.cancel_source_consumer(&mut st, iname);
                        }
                    }
                    break;
                }
                let stalled = {
                    let st = s.lock_state();
                    let last = match &kind {
                        UpstreamKind::Mirror => st.mirror.as_ref().and_then(|mi| mi.last),
                        UpstreamKind::Source => st
                            .sources
                            .get(iname.as_deref().expect("source task"))
                            .and_then(|si| si.last),
                    };
                    last.map(|l| l.elapsed() > 3 * SOURCE_HEALTH_CHECK_INTERVAL)
                        .unwrap_or(false)
                };
                if stalled {
                    match &kind {
                        UpstreamKind::Mirror => s.retry_mirror_consumer(),
                        UpstreamKind::Source => {
                            s.retry_source_consumer(iname.as_deref().expect("source task"))
                        }
                    }
                }
            }
        }
    }
    // Mark the task as stopped so a future setup respawns it.
    if let Some(s) = stream.upgrade() {
        let mut st = s.lock_state();
        match &kind {
            UpstreamKind::Mirror => {
                if let Some(mi) = st.mirror.as_mut() {
                    mi.running = false;
                    mi.quit_tx = None;
                }
            }
            UpstreamKind::Source => {
                if let Some(si) = st.sources.get_mut(iname.as_deref().expect("source task")) {
                    si.running = false;
                    si.quit_tx = None;
                }
            }
        }
    }
}
