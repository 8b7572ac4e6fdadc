//! Seam to the pub/sub transport fabric. The engine only needs subscribe,
//! unsubscribe and publish; routing, framing and auth live outside this
//! crate. An in-process relay ships here for single-process wiring and for
//! the integration tests.

use crate::subject::subject_is_subset_match;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Subscription identifier handed back by [`Relay::subscribe`].
pub type Sid = u64;

/// Delivery callback. Handlers run on the publisher's thread and must not
/// block; the engine enqueues into its own queues immediately.
pub type MsgHandler = Arc<dyn Fn(&str, &str, &[u8], &[u8]) + Send + Sync>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("invalid subscription subject {0:?}")]
    InvalidSubject(String),
    #[error("unknown subscription {0}")]
    UnknownSubscription(Sid),
}

/// Transport fabric contract.
pub trait Relay: Send + Sync {
    fn subscribe(&self, subject: &str, handler: MsgHandler) -> Result<Sid, RelayError>;
    fn unsubscribe(&self, sid: Sid) -> Result<(), RelayError>;
    fn publish(&self, subject: &str, reply: &str, hdr: &[u8], msg: &[u8]);
}

struct SubEntry {
    sid: Sid,
    pattern: String,
    handler: MsgHandler,
}

/// In-process relay with full wildcard matching; deliveries are dispatched
/// synchronously on the publishing thread.
#[derive(Default)]
pub struct InProcRelay {
    next_sid: AtomicU64,
    subs: Mutex<Vec<SubEntry>>,
}

impl InProcRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of live subscriptions, used by lifecycle tests.
    pub fn num_subscriptions(&self) -> usize {
        self.subs.lock().expect("relay poisoned").len()
    }
}

impl Relay for InProcRelay {
    fn subscribe(&self, subject: &str, handler: MsgHandler) -> Result<Sid, RelayError> {
        if subject.is_empty() {
            return Err(RelayError::InvalidSubject(subject.to_owned()));
        }
        let sid = self.next_sid.fetch_add(1, Ordering::Relaxed) + 1;
        self.subs.lock().expect("relay poisoned").push(SubEntry {
            sid,
            pattern: subject.to_owned(),
            handler,
        });
        Ok(sid)
    }

    fn unsubscribe(&self, sid: Sid) -> Result<(), RelayError> {
        let mut subs = self.subs.lock().expect("relay poisoned");
        let before = subs.len();
        subs.retain(|s| s.sid != sid);
        if subs.len() == before {
            return Err(RelayError::UnknownSubscription(sid));
        }
        Ok(())
    }

    fn publish(&self, subject: &str, reply: &str, hdr: &[u8], msg: &[u8]) {
        // Snapshot matching handlers first: a handler may subscribe or
        // unsubscribe from inside its callback.
        let matching: Vec<MsgHandler> = {
            let subs = self.subs.lock().expect("relay poisoned");
            subs.iter()
                .filter(|s| subject_is_subset_match(subject, &s.pattern))
                .map(|s| Arc::clone(&s.handler))
                .collect()
        };
        for handler in matching {
            handler(subject, reply, hdr, msg);
        }
    }
}
