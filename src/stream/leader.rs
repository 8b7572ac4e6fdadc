//! Leader/follower transitions: subscription install/teardown, cluster
//! sync subscription, source consumer lifecycle and epoch bookkeeping.

use crate::stream::core::{Stream, StreamError, StreamMutable};
use std::sync::Arc;
use tracing::debug;

impl Stream {
    /// Applies a leadership change. On leader-up the stream subscribes to
    /// its subjects, arms mirror/source consumers and listens for cluster
    /// sync requests; on leader-down all of that is torn down. `clfs` is
    /// cleared on any leader-epoch change.
    pub fn set_leader(self: &Arc<Self>, is_leader: bool) -> Result<(), StreamError> {
        let mut st = self.lock_state();
        if st.closed {
            return Err(StreamError::Closed);
        }
        if is_leader {
            self.start_cluster_subs_locked(&mut st)?;
            self.subscribe_to_stream(&mut st)?;
            st.clfs = 0;
        } else {
            self.stop_cluster_subs_locked(&mut st);
            self.unsubscribe_from_stream(&mut st);
            st.catchups.clear();
            if let Some(node) = &self.node {
                let leader = node.group_leader();
                if !st.leader.is_empty() && st.leader != leader {
                    st.clfs = 0;
                }
            }
        }
        st.leader = match &self.node {
            Some(node) => node.group_leader(),
            None => String::new(),
        };
        Ok(())
    }

    // Listen for peer sync/catch-up requests while leader.
    fn start_cluster_subs_locked(&self, st: &mut StreamMutable) -> Result<(), StreamError> {
        if !self.is_clustered() || st.sync_sub.is_some() {
            return Ok(());
        }
        let account_name = self
            .account
            .upgrade()
            .map(|a| a.name().to_owned())
            .unwrap_or_default();
        let subject = format!("$JS.SYNC.{}.{}", account_name, st.cfg.name);
        let weak = self.weak();
        let sid = self.relay.subscribe(
            &subject,
            Arc::new(move |_, reply, _, msg| {
                if let Some(stream) = weak.upgrade() {
                    stream.handle_cluster_sync_request(reply, msg);
                }
            }),
        )?;
        st.sync_sub = Some(sid);
        Ok(())
    }

    pub(crate) fn stop_cluster_subs_locked(&self, st: &mut StreamMutable) {
        if let Some(sid) = st.sync_sub.take() {
            let _ = self.relay.unsubscribe(sid);
        }
    }

    // Records a peer's catch-up position; snapshot shipping itself is the
    // cluster layer's job.
    fn handle_cluster_sync_request(&self, _reply: &str, msg: &[u8]) {
        let Ok(req) = serde_json::from_slice::<serde_json::Value>(msg) else {
            return;
        };
        let peer = req.get("peer").and_then(|v| v.as_str()).unwrap_or_default();
        let seq = req.get("first_seq").and_then(|v| v.as_u64()).unwrap_or(0);
        if peer.is_empty() {
            return;
        }
        let mut st = self.lock_state();
        debug!(stream = %st.cfg.name, peer, seq, "catch-up requested");
        st.catchups.insert(peer.to_owned(), seq);
    }

    /// Installs subscriptions for every configured subject and arms the
    /// mirror or source consumers.
    pub(crate) fn subscribe_to_stream(
        self: &Arc<Self>,
        st: &mut StreamMutable,
    ) -> Result<(), StreamError> {
        if st.active {
            return Ok(());
        }
        let subjects = st.cfg.subjects.clone();
        for subject in subjects {
            let sid = self.subscribe_stream_subject(&subject)?;
            st.subs.insert(subject, sid);
        }
        if st.cfg.mirror.is_some() {
            self.setup_mirror_consumer(st)?;
        } else if !st.cfg.sources.is_empty() {
            self.setup_source_consumers(st)?;
        }
        st.active = true;
        Ok(())
    }

    /// Drops all external subscriptions and cancels upstream consumers.
    pub(crate) fn unsubscribe_from_stream(&self, st: &mut StreamMutable) {
        let subs: Vec<_> = st.subs.drain().map(|(_, sid)| sid).collect();
        for sid in subs {
            let _ = self.relay.unsubscribe(sid);
        }
        if st.mirror.is_some() {
            self.cancel_mirror_consumer_locked(st);
            st.mirror = None;
        }
        if !st.cfg.sources.is_empty() {
            self.stop_source_consumers_locked(st);
        }
        st.active = false;
    }
}
