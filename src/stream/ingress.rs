//! The publish pipeline: precondition checks, duplicate suppression,
//! rollups, the interest gate and the store append. Every write to the
//! stream lands here, whether direct, queued or replayed from the
//! consensus log.

use crate::header::{
    get_expected_last_msg_id, get_expected_last_seq, get_expected_last_subj_seq,
    get_expected_stream, get_msg_id, get_rollup, remove_header_if_present, CLIENT_INFO_HDR,
    ROLLUP_ALL, ROLLUP_SUBJECT,
};
use crate::store::core::{now_unix_ns, PurgeRequest, StoreError};
use crate::stream::core::Stream;
use crate::wire::{render_pub_ack, ApiError, PubAckResponse};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error};

/// Pre-assigned `(sequence, timestamp)` carried by entries replayed from
/// the consensus log. `pre_seq` is the proposing leader's `lseq + clfs`;
/// replicas must land identical sequences for identical entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Replay {
    pub pre_seq: u64,
    pub ts: i64,
}

/// Rejection reasons from the publish pipeline.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IngestError {
    #[error("last sequence mismatch")]
    LastSeqMismatch,
    #[error("msgid is duplicate of sequence {seq}")]
    MsgIdDuplicate { seq: u64 },
    #[error("expected stream does not match")]
    StreamMismatch,
    #[error("last sequence mismatch: {expected} vs {actual}")]
    WrongLastSequence { expected: u64, actual: u64 },
    #[error("last msgid mismatch: {expected:?} vs {actual:?}")]
    WrongLastMsgId { expected: String, actual: String },
    #[error("last sequence by subject mismatch: {expected} vs {actual}")]
    WrongLastSubjectSequence { expected: u64, actual: u64 },
    #[error("rollup not permitted")]
    RollupNotPermitted,
    #[error("rollup value invalid: {0:?}")]
    RollupValueInvalid(String),
    #[error("message size exceeds maximum allowed")]
    MaxPayload,
    #[error("header size exceeds maximum allowed")]
    HeaderTooLarge,
    #[error("insufficient resources")]
    InsufficientResources,
    #[error("stream is closed")]
    Closed,
    #[error(transparent)]
    Store(#[from] StoreError),
}

const MAX_HDR_LEN: usize = u16::MAX as usize;

impl Stream {
    /// Processes one message against the stream. Returns the assigned
    /// sequence on success. On any rejection the stream sequence is
    /// untouched and `clfs` is bumped so leader-assigned sequences stay
    /// reconciled with what actually landed in the store.
    pub(crate) fn process_stream_msg(
        &self,
        subject: &str,
        reply: &str,
        hdr: &[u8],
        msg: &[u8],
        replay: Option<Replay>,
    ) -> Result<u64, IngestError> {
        let mut st = self.lock_state();
        if st.closed {
            return Err(IngestError::Closed);
        }

        let name = st.cfg.name.clone();
        let is_leader = self.is_leader();
        let can_respond = !st.cfg.no_ack && !reply.is_empty() && is_leader;
        let ack_prefix = st.pub_ack.clone();

        // Committed entries carry the sequence the proposing leader
        // expected; a gap means this replica diverged. A fresh empty
        // stream (or a mirror adopting an upstream floor) may realign.
        if let Some(rp) = replay {
            if rp.pre_seq > 0 && rp.pre_seq != st.lseq + st.clfs {
                let mut mismatch = true;
                if st.lseq == 0 || st.cfg.mirror.is_some() {
                    let state = self.store.state();
                    if state.first_seq == 0 {
                        let _ = self.store.compact(rp.pre_seq + 1);
                        st.lseq = rp.pre_seq;
                        mismatch = false;
                    }
                }
                if mismatch {
                    drop(st);
                    if can_respond {
                        self.outq.send_msg(
                            reply,
                            PubAckResponse::failure(&name, ApiError::sequence_not_matched()),
                        );
                    }
                    return Err(IngestError::LastSeqMismatch);
                }
            }
        }

        let hdr = if hdr.is_empty() {
            Vec::new()
        } else {
            remove_header_if_present(hdr, CLIENT_INFO_HDR)
        };

        let mut msg_id = String::new();
        let mut rollup_sub = false;
        let mut rollup_all = false;

        if !hdr.is_empty() {
            // Duplicate suppression first: a replayed duplicate must ack
            // the original sequence on every replica.
            if let Some(id) = get_msg_id(&hdr) {
                self.rebuild_dedupe_locked(&mut st);
                if let Some((dseq, _)) = st.dedupe.check(&id) {
                    st.clfs += 1;
                    drop(st);
                    if can_respond {
                        self.outq
                            .send_msg(reply, render_pub_ack(&ack_prefix, dseq, true));
                    }
                    return Err(IngestError::MsgIdDuplicate { seq: dseq });
                }
                msg_id = id;
            }

            if let Some(sname) = get_expected_stream(&hdr) {
                if sname != name {
                    st.clfs += 1;
                    drop(st);
                    if can_respond {
                        self.outq.send_msg(
                            reply,
                            PubAckResponse::failure(&name, ApiError::stream_not_match()),
                        );
                    }
                    return Err(IngestError::StreamMismatch);
                }
            }

            if let Some(seq) = get_expected_last_seq(&hdr) {
                if seq > 0 && seq != st.lseq {
                    let actual = st.lseq;
                    st.clfs += 1;
                    drop(st);
                    if can_respond {
                        self.outq.send_msg(
                            reply,
                            PubAckResponse::failure(&name, ApiError::wrong_last_sequence(actual)),
                        );
                    }
                    return Err(IngestError::WrongLastSequence {
                        expected: seq,
                        actual,
                    });
                }
            }

            if let Some(expected_id) = get_expected_last_msg_id(&hdr) {
                if st.lmsg_id.is_empty() && !st.dedupe.is_loaded() {
                    self.rebuild_dedupe_locked(&mut st);
                }
                if expected_id != st.lmsg_id {
                    let actual = st.lmsg_id.clone();
                    st.clfs += 1;
                    drop(st);
                    if can_respond {
                        self.outq.send_msg(
                            reply,
                            PubAckResponse::failure(&name, ApiError::wrong_last_msg_id(&actual)),
                        );
                    }
                    return Err(IngestError::WrongLastMsgId {
                        expected: expected_id,
                        actual,
                    });
                }
            }

            if let Some(eseq) = get_expected_last_subj_seq(&hdr) {
                let found = match self.store.load_last_msg(subject) {
                    Ok(sm) => Some(sm.seq),
                    Err(StoreError::NotFound) => None,
                    Err(err) => {
                        debug!(%err, subject, "last msg lookup failed");
                        None
                    }
                };
                // A zero expectation asserts the subject has no messages.
                let ok = match found {
                    Some(fseq) => fseq == eseq,
                    None => eseq == 0,
                };
                if !ok {
                    let actual = found.unwrap_or(0);
                    st.clfs += 1;
                    drop(st);
                    if can_respond {
                        self.outq.send_msg(
                            reply,
                            PubAckResponse::failure(&name, ApiError::wrong_last_sequence(actual)),
                        );
                    }
                    return Err(IngestError::WrongLastSubjectSequence {
                        expected: eseq,
                        actual,
                    });
                }
            }

            if let Some(rollup) = get_rollup(&hdr) {
                if !st.cfg.allow_rollup || st.cfg.deny_purge {
                    st.clfs += 1;
                    drop(st);
                    if can_respond {
                        self.outq.send_msg(
                            reply,
                            PubAckResponse::failure(
                                &name,
                                ApiError::rollup_failed("rollup not permitted"),
                            ),
                        );
                    }
                    return Err(IngestError::RollupNotPermitted);
                }
                match rollup.as_str() {
                    ROLLUP_SUBJECT => rollup_sub = true,
                    ROLLUP_ALL => rollup_all = true,
                    other => {
                        return Err(IngestError::RollupValueInvalid(other.to_owned()));
                    }
                }
            }
        }

        let max_msg_size = st.cfg.max_msg_size;
        if max_msg_size >= 0 && hdr.len() + msg.len() > max_msg_size as usize {
            st.clfs += 1;
            drop(st);
            if can_respond {
                self.outq.send_msg(
                    reply,
                    PubAckResponse::failure(&name, ApiError::message_exceeds_maximum()),
                );
            }
            return Err(IngestError::MaxPayload);
        }
        if hdr.len() > MAX_HDR_LEN {
            st.clfs += 1;
            drop(st);
            if can_respond {
                self.outq.send_msg(
                    reply,
                    PubAckResponse::failure(&name, ApiError::header_exceeds_maximum()),
                );
            }
            return Err(IngestError::HeaderTooLarge);
        }

        // Global account/tier limits; on the leader this also requests a
        // consensus step-down so a healthier peer can take over.
        if let Some(account) = self.account.upgrade() {
            if account.limits_exceeded(st.cfg.storage) {
                st.clfs += 1;
                drop(st);
                if can_respond {
                    self.outq.send_msg(
                        reply,
                        PubAckResponse::failure(&name, ApiError::insufficient_resources()),
                    );
                }
                if let Some(node) = &self.node {
                    node.step_down();
                }
                return Err(IngestError::InsufficientResources);
            }
        }

        let interest_retention =
            st.cfg.retention == crate::config::core::RetentionPolicy::Interest;
        let no_interest = interest_retention && !st.registry.has_subject_interest(subject);

        let ts = match replay {
            Some(rp) if rp.ts != 0 => rp.ts,
            _ => now_unix_ns(),
        };

        // Interest gate: nothing will ever deliver this message, so burn
        // the sequence without storing the payload.
        if no_interest {
            st.lseq = self.store.skip_msg();
            st.lmsg_id = msg_id.clone();
            let seq = st.lseq;
            if !msg_id.is_empty() && st.dedupe.insert(msg_id, seq, ts) {
                st.dd_deadline = st
                    .dedupe
                    .next_deadline(now_unix_ns())
                    .map(|d| Instant::now() + d);
                let _ = self.nudge_tx.try_send(());
            }
            drop(st);
            if can_respond {
                self.outq
                    .send_msg(reply, render_pub_ack(&ack_prefix, seq, false));
            }
            return Ok(seq);
        }

        // Assume the append succeeds; rolled back below if it does not.
        let old_lmsg_id = st.lmsg_id.clone();
        st.lmsg_id = msg_id.clone();
        let clfs = st.clfs;
        st.lseq += 1;

        let stored = match replay {
            None => self.store.store_msg(subject, &hdr, msg),
            Some(rp) => {
                let seq = (rp.pre_seq + 1).saturating_sub(clfs);
                self.store
                    .store_raw_msg(subject, &hdr, msg, seq, ts)
                    .map(|_| (seq, ts))
            }
        };

        let (seq, ts) = match stored {
            Ok(pair) => pair,
            Err(err) => {
                // Roll back to whatever the store actually recorded.
                let state = self.store.state();
                st.lseq = state.last_seq;
                st.lmsg_id = old_lmsg_id;
                st.clfs += 1;
                drop(st);
                match &err {
                    StoreError::MaxMsgs
                    | StoreError::MaxBytes
                    | StoreError::MaxMsgsPerSubject
                    | StoreError::MsgTooLarge => {
                        debug!(stream = %name, %err, "message rejected by store")
                    }
                    StoreError::Closed => {}
                    _ => error!(stream = %name, %err, "failed to store message"),
                }
                if matches!(err, StoreError::NoSpace) {
                    if let Some(account) = self.account.upgrade() {
                        account.disable();
                    }
                }
                if can_respond {
                    self.outq.send_msg(
                        reply,
                        PubAckResponse::failure(&name, ApiError::store_failed(&err.to_string())),
                    );
                }
                return Err(IngestError::Store(err));
            }
        };

        if !msg_id.is_empty() && st.dedupe.insert(msg_id, seq, ts) {
            st.dd_deadline = st
                .dedupe
                .next_deadline(now_unix_ns())
                .map(|d| Instant::now() + d);
            let _ = self.nudge_tx.try_send(());
        }

        if rollup_sub || rollup_all {
            let req = if rollup_sub {
                PurgeRequest::keep_last(subject, 1)
            } else {
                PurgeRequest {
                    keep: 1,
                    ..Default::default()
                }
            };
            if let Err(err) = self.store.purge(&req) {
                debug!(stream = %name, %err, "rollup purge failed");
            }
            let state = self.store.state();
            st.registry
                .notify_purge(&req.subject, state.first_seq, state.last_seq);
        }

        st.registry.signal_new_messages(subject);
        drop(st);

        if can_respond {
            self.outq
                .send_msg(reply, render_pub_ack(&ack_prefix, seq, false));
        }
        Ok(seq)
    }
}
