//! Stream lifecycle advisories published on the event subjects.

use crate::stream::core::{Stream, StreamMutable};
use crate::wire::{
    StreamAction, StreamActionAdvisory, ADVISORY_STREAM_CREATED_PRE, ADVISORY_STREAM_DELETED_PRE,
    ADVISORY_STREAM_UPDATED_PRE,
};
use tracing::debug;

impl Stream {
    /// Announces stream creation. Only the leader emits.
    pub(crate) fn send_create_advisory(&self) {
        if !self.is_leader() {
            return;
        }
        let st = self.lock_state();
        self.send_advisory_locked(&st, StreamAction::Create, ADVISORY_STREAM_CREATED_PRE);
    }

    pub(crate) fn send_update_advisory_locked(&self, st: &StreamMutable) {
        self.send_advisory_locked(st, StreamAction::Modify, ADVISORY_STREAM_UPDATED_PRE);
    }

    pub(crate) fn send_delete_advisory_locked(&self, st: &StreamMutable) {
        self.send_advisory_locked(st, StreamAction::Delete, ADVISORY_STREAM_DELETED_PRE);
    }

    fn send_advisory_locked(&self, st: &StreamMutable, action: StreamAction, prefix: &str) {
        let mut advisory = StreamActionAdvisory::new(&st.cfg.name, action);
        advisory.template = st.cfg.template.clone();
        if let Some(account) = self.account.upgrade() {
            advisory.domain = account.domain().to_owned();
        }
        let payload = match serde_json::to_vec(&advisory) {
            Ok(p) => p,
            Err(err) => {
                debug!(%err, "failed to encode stream advisory");
                return;
            }
        };
        self.outq
            .send_msg(format!("{prefix}.{}", st.cfg.name), payload);
    }
}
