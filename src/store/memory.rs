//! In-memory storage backend. Selected by `StorageType::Memory`; also the
//! store every integration test runs against.

use crate::config::core::{DiscardPolicy, StreamConfig};
use crate::store::core::{
    now_unix_ns, PurgeRequest, StoreError, StoredMsg, StreamState, StreamStore,
};
use crate::subject::subject_is_subset_match;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Memory-backed message log enforcing the stream's retention limits.
pub struct MemoryStore {
    inner: Mutex<MemInner>,
}

struct MemInner {
    cfg: StreamConfig,
    msgs: BTreeMap<u64, StoredMsg>,
    bytes: u64,
    last_seq: u64,
    last_ts: i64,
    closed: bool,
}

impl MemoryStore {
    pub fn new(cfg: &StreamConfig) -> Self {
        Self {
            inner: Mutex::new(MemInner {
                cfg: cfg.clone(),
                msgs: BTreeMap::new(),
                bytes: 0,
                last_seq: 0,
                last_ts: 0,
                closed: false,
            }),
        }
    }
}

impl MemInner {
    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn first_seq(&self) -> u64 {
        match self.msgs.keys().next() {
            Some(&seq) => seq,
            None if self.last_seq == 0 => 0,
            None => self.last_seq + 1,
        }
    }

    fn enforce_msg_size(&self, hdr: &[u8], msg: &[u8]) -> Result<(), StoreError> {
        let max = self.cfg.max_msg_size;
        if max >= 0 && hdr.len() + msg.len() > max as usize {
            return Err(StoreError::MsgTooLarge);
        }
        Ok(())
    }

    // Applies limit checks prior to admitting one more message of `size`
    // bytes, evicting when the discard policy allows it.
    fn make_room(&mut self, subject: &str, size: u64) -> Result<(), StoreError> {
        if self.cfg.max_msgs_per > 0 {
            let count = self.subject_count(subject);
            if count >= self.cfg.max_msgs_per as u64 {
                let excess = count - self.cfg.max_msgs_per as u64 + 1;
                self.remove_oldest_on_subject(subject, excess);
            }
        }
        if self.cfg.max_msgs > 0 {
            while self.msgs.len() as u64 >= self.cfg.max_msgs as u64 {
                if self.cfg.discard == DiscardPolicy::New {
                    return Err(StoreError::MaxMsgs);
                }
                self.remove_first();
            }
        }
        if self.cfg.max_bytes > 0 {
            while self.bytes + size > self.cfg.max_bytes as u64 && !self.msgs.is_empty() {
                if self.cfg.discard == DiscardPolicy::New {
                    return Err(StoreError::MaxBytes);
                }
                self.remove_first();
            }
            if self.bytes + size > self.cfg.max_bytes as u64 {
                return Err(StoreError::MaxBytes);
            }
        }
        Ok(())
    }

    fn expire_msgs(&mut self, now: i64) {
        if self.cfg.max_age.is_zero() {
            return;
        }
        let cutoff = now - self.cfg.max_age.as_nanos() as i64;
        let expired: Vec<u64> = self
            .msgs
            .iter()
            .take_while(|(_, sm)| sm.ts <= cutoff)
            .map(|(&seq, _)| seq)
            .collect();
        for seq in expired {
            self.remove_seq(seq);
        }
    }

    fn subject_count(&self, subject: &str) -> u64 {
        self.msgs.values().filter(|m| m.subject == subject).count() as u64
    }

    fn remove_oldest_on_subject(&mut self, subject: &str, count: u64) {
        let victims: Vec<u64> = self
            .msgs
            .values()
            .filter(|m| m.subject == subject)
            .take(count as usize)
            .map(|m| m.seq)
            .collect();
        for seq in victims {
            self.remove_seq(seq);
        }
    }

    fn remove_first(&mut self) {
        if let Some(&seq) = self.msgs.keys().next() {
            self.remove_seq(seq);
        }
    }

    fn remove_seq(&mut self, seq: u64) -> bool {
        match self.msgs.remove(&seq) {
            Some(sm) => {
                self.bytes = self.bytes.saturating_sub(msg_size(&sm));
                true
            }
            None => false,
        }
    }

    fn insert(&mut self, sm: StoredMsg) {
        self.bytes += msg_size(&sm);
        self.last_seq = sm.seq;
        self.last_ts = sm.ts;
        self.msgs.insert(sm.seq, sm);
    }
}

fn msg_size(sm: &StoredMsg) -> u64 {
    (sm.subject.len() + sm.hdr.len() + sm.msg.len() + 16) as u64
}

impl StreamStore for MemoryStore {
    fn store_msg(&self, subject: &str, hdr: &[u8], msg: &[u8]) -> Result<(u64, i64), StoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.check_open()?;
        let ts = now_unix_ns();
        inner.expire_msgs(ts);
        inner.enforce_msg_size(hdr, msg)?;
        inner.make_room(subject, (subject.len() + hdr.len() + msg.len() + 16) as u64)?;
        let seq = inner.last_seq + 1;
        inner.insert(StoredMsg {
            subject: subject.to_owned(),
            hdr: hdr.to_vec(),
            msg: msg.to_vec(),
            seq,
            ts,
        });
        Ok((seq, ts))
    }

    fn store_raw_msg(
        &self,
        subject: &str,
        hdr: &[u8],
        msg: &[u8],
        seq: u64,
        ts: i64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.check_open()?;
        if seq <= inner.last_seq {
            return Err(StoreError::SequenceInUse(seq));
        }
        inner.expire_msgs(ts);
        inner.enforce_msg_size(hdr, msg)?;
        inner.make_room(subject, (subject.len() + hdr.len() + msg.len() + 16) as u64)?;
        inner.insert(StoredMsg {
            subject: subject.to_owned(),
            hdr: hdr.to_vec(),
            msg: msg.to_vec(),
            seq,
            ts,
        });
        Ok(())
    }

    fn skip_msg(&self) -> u64 {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.last_seq += 1;
        inner.last_ts = now_unix_ns();
        inner.last_seq
    }

    fn load_msg(&self, seq: u64) -> Result<StoredMsg, StoreError> {
        let inner = self.inner.lock().expect("memory store poisoned");
        inner.check_open()?;
        inner.msgs.get(&seq).cloned().ok_or(StoreError::NotFound)
    }

    fn load_last_msg(&self, subject: &str) -> Result<StoredMsg, StoreError> {
        let inner = self.inner.lock().expect("memory store poisoned");
        inner.check_open()?;
        inner
            .msgs
            .values()
            .rev()
            .find(|m| m.subject == subject)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn remove_msg(&self, seq: u64) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.check_open()?;
        if seq > inner.last_seq {
            return Err(StoreError::Eof);
        }
        Ok(inner.remove_seq(seq))
    }

    fn purge(&self, req: &PurgeRequest) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.check_open()?;
        let matching: Vec<u64> = inner
            .msgs
            .values()
            .filter(|m| req.subject.is_empty() || subject_is_subset_match(&m.subject, &req.subject))
            .map(|m| m.seq)
            .collect();
        let victims: Vec<u64> = if req.keep > 0 {
            let keep = req.keep.min(matching.len() as u64) as usize;
            matching[..matching.len() - keep].to_vec()
        } else if req.sequence > 0 {
            matching.into_iter().filter(|&s| s < req.sequence).collect()
        } else {
            matching
        };
        let mut purged = 0;
        for seq in victims {
            if inner.remove_seq(seq) {
                purged += 1;
            }
        }
        Ok(purged)
    }

    fn compact(&self, first_seq: u64) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.check_open()?;
        let victims: Vec<u64> = inner.msgs.range(..first_seq).map(|(&s, _)| s).collect();
        let mut purged = 0;
        for seq in victims {
            if inner.remove_seq(seq) {
                purged += 1;
            }
        }
        if first_seq > 0 && inner.last_seq < first_seq - 1 {
            inner.last_seq = first_seq - 1;
        }
        Ok(purged)
    }

    fn seq_from_time(&self, ts: i64) -> u64 {
        let inner = self.inner.lock().expect("memory store poisoned");
        inner
            .msgs
            .values()
            .find(|m| m.ts >= ts)
            .map(|m| m.seq)
            .unwrap_or(0)
    }

    fn state(&self) -> StreamState {
        let inner = self.inner.lock().expect("memory store poisoned");
        let first = inner.msgs.values().next();
        StreamState {
            msgs: inner.msgs.len() as u64,
            bytes: inner.bytes,
            first_seq: inner.first_seq(),
            first_ts: first.map(|m| m.ts).unwrap_or(0),
            last_seq: inner.last_seq,
            last_ts: inner.last_ts,
        }
    }

    fn update_config(&self, cfg: &StreamConfig) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.check_open()?;
        inner.cfg = cfg.clone();
        // Tighter limits apply immediately.
        if inner.cfg.max_msgs > 0 {
            while inner.msgs.len() as u64 > inner.cfg.max_msgs as u64 {
                inner.remove_first();
            }
        }
        if inner.cfg.max_bytes > 0 {
            while inner.bytes > inner.cfg.max_bytes as u64 && !inner.msgs.is_empty() {
                inner.remove_first();
            }
        }
        Ok(())
    }

    fn stop(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.closed = true;
        Ok(())
    }

    fn delete(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.closed = true;
        inner.msgs.clear();
        inner.bytes = 0;
        Ok(())
    }
}
