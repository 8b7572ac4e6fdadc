//! Outbound publish queue: a bounded multi-producer FIFO of pooled message
//! envelopes drained by the stream's internal loop.

use crossbeam::channel::{bounded, Receiver, Sender};
use crossbeam_queue::ArrayQueue;
use std::sync::Mutex;
use tracing::warn;

/// Default bound for a stream's out queue.
pub const OUT_QUEUE_CAPACITY: usize = 16 * 1024;

const POOL_LIMIT: usize = 256;

/// Outbound publish envelope. Pooled; every field is reset on return so
/// nothing leaks between uses.
#[derive(Debug, Default)]
pub struct PubMsg {
    /// Subject the message is sent to.
    pub dest: String,
    pub reply: String,
    pub hdr: Vec<u8>,
    pub msg: Vec<u8>,
    /// Stream sequence for consumer deliveries, zero otherwise.
    pub seq: u64,
}

impl PubMsg {
    fn reset(&mut self) {
        self.dest.clear();
        self.reply.clear();
        self.hdr.clear();
        self.msg.clear();
        self.seq = 0;
    }

    pub fn size(&self) -> usize {
        self.dest.len() + self.reply.len() + self.hdr.len() + self.msg.len()
    }
}

/// Multi-producer single-consumer bounded queue with an envelope pool.
pub struct OutQueue {
    queue: ArrayQueue<PubMsg>,
    ready_tx: Sender<()>,
    pool: Mutex<Vec<PubMsg>>,
}

impl OutQueue {
    /// Builds the queue plus the ready-signal receiver for the drain loop.
    pub fn new(capacity: usize) -> (Self, Receiver<()>) {
        let (ready_tx, ready_rx) = bounded(1);
        (
            Self {
                queue: ArrayQueue::new(capacity),
                ready_tx,
                pool: Mutex::new(Vec::new()),
            },
            ready_rx,
        )
    }

    /// Grabs a pooled envelope.
    pub fn new_msg(&self) -> PubMsg {
        self.pool
            .lock()
            .expect("out queue poisoned")
            .pop()
            .unwrap_or_default()
    }

    /// Returns an envelope to the pool after zeroing it.
    pub fn recycle(&self, mut pm: PubMsg) {
        pm.reset();
        let mut pool = self.pool.lock().expect("out queue poisoned");
        if pool.len() < POOL_LIMIT {
            pool.push(pm);
        }
    }

    /// Enqueues an envelope; a saturated queue drops the message.
    pub fn send(&self, pm: PubMsg) {
        if self.queue.push(pm).is_err() {
            warn!("out queue saturated, dropping outbound message");
        }
        let _ = self.ready_tx.try_send(());
    }

    /// Convenience for a bare `subject -> payload` publish.
    pub fn send_msg(&self, dest: impl Into<String>, msg: impl Into<Vec<u8>>) {
        let mut pm = self.new_msg();
        pm.dest = dest.into();
        pm.msg = msg.into();
        self.send(pm);
    }

    /// Publish with a reply subject attached.
    pub fn send_with_reply(
        &self,
        dest: impl Into<String>,
        reply: impl Into<String>,
        msg: impl Into<Vec<u8>>,
    ) {
        let mut pm = self.new_msg();
        pm.dest = dest.into();
        pm.reply = reply.into();
        pm.msg = msg.into();
        self.send(pm);
    }

    pub fn pop(&self) -> Option<PubMsg> {
        self.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
