//! Seam to the consensus engine. A clustered stream hands proposals to a
//! `RaftNode` and applies entries back in commit order; the consensus
//! algorithm itself lives outside this crate.

use std::sync::{Arc, Mutex, Weak};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RaftError {
    #[error("proposal failed: not the group leader")]
    NotLeader,
    #[error("consensus node is shut down")]
    Closed,
}

/// Consensus node contract for one stream's replication group.
pub trait RaftNode: Send + Sync {
    fn is_leader(&self) -> bool;
    /// Name of the current group leader, or empty when unknown.
    fn group_leader(&self) -> String;
    fn propose(&self, entry: Vec<u8>) -> Result<(), RaftError>;
    /// Proposes many entries as one batch (used for skip runs).
    fn propose_batch(&self, entries: Vec<Vec<u8>>) -> Result<(), RaftError>;
    /// Relays a proposal through the current leader from a follower.
    fn forward_proposal(&self, entry: Vec<u8>) -> Result<(), RaftError>;
    /// Asks the node to relinquish leadership.
    fn step_down(&self);
    fn stop(&self);
    /// Stops the node and removes its persistent state.
    fn delete(&self);
}

/// Receiver for committed entries, implemented by the stream.
pub trait CommitSink: Send + Sync {
    fn apply_committed(&self, entry: &[u8]);
}

/// Single-member consensus node that commits proposals straight back into
/// the registered sink. Stands in for a real consensus group in
/// single-process deployments and throughout the test suite.
pub struct LoopbackNode {
    leader: Mutex<bool>,
    sink: Mutex<Option<Weak<dyn CommitSink>>>,
    log: Mutex<Vec<Vec<u8>>>,
    name: String,
}

impl LoopbackNode {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            leader: Mutex::new(true),
            sink: Mutex::new(None),
            log: Mutex::new(Vec::new()),
            name: name.into(),
        })
    }

    pub fn register_sink(&self, sink: Weak<dyn CommitSink>) {
        *self.sink.lock().expect("raft node poisoned") = Some(sink);
    }

    pub fn set_leader(&self, leader: bool) {
        *self.leader.lock().expect("raft node poisoned") = leader;
    }

    /// Entries committed so far, in log order.
    pub fn committed(&self) -> Vec<Vec<u8>> {
        self.log.lock().expect("raft node poisoned").clone()
    }

    fn commit(&self, entry: Vec<u8>) {
        let sink = self
            .sink
            .lock()
            .expect("raft node poisoned")
            .as_ref()
            .and_then(Weak::upgrade);
        self.log.lock().expect("raft node poisoned").push(entry.clone());
        if let Some(sink) = sink {
            sink.apply_committed(&entry);
        }
    }
}

impl RaftNode for LoopbackNode {
    fn is_leader(&self) -> bool {
        *self.leader.lock().expect("raft node poisoned")
    }

    fn group_leader(&self) -> String {
        if self.is_leader() {
            self.name.clone()
        } else {
            String::new()
        }
    }

    fn propose(&self, entry: Vec<u8>) -> Result<(), RaftError> {
        if !self.is_leader() {
            return Err(RaftError::NotLeader);
        }
        self.commit(entry);
        Ok(())
    }

    fn propose_batch(&self, entries: Vec<Vec<u8>>) -> Result<(), RaftError> {
        for entry in entries {
            self.propose(entry)?;
        }
        Ok(())
    }

    fn forward_proposal(&self, entry: Vec<u8>) -> Result<(), RaftError> {
        self.propose(entry)
    }

    fn step_down(&self) {
        self.set_leader(false);
    }

    fn stop(&self) {}

    fn delete(&self) {}
}
