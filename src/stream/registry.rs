//! Consumer bookkeeping for a stream: attach/detach accounting, the
//! interest test used by interest-based retention, and the acknowledgement
//! policy table.

use crate::subject::subject_is_subset_match;
use std::collections::HashMap;
use std::sync::Arc;

/// Surface a stream needs from an attached consumer. Delivery internals
/// (pending tracking, redelivery, ack policies toward subscribers) live in
/// the consumer implementation.
pub trait Consumer: Send + Sync {
    fn name(&self) -> &str;

    /// Subject filter, empty for the full stream.
    fn filter_subject(&self) -> &str {
        ""
    }

    /// Direct consumers feed mirrors/sources downstream and are excluded
    /// from the public consumer count.
    fn is_direct(&self) -> bool {
        false
    }

    fn is_leader(&self) -> bool {
        true
    }

    /// Whether this consumer still needs `seq` delivered or acknowledged.
    fn need_ack(&self, seq: u64) -> bool;

    fn filtered_match(&self, subject: &str) -> bool {
        let filter = self.filter_subject();
        filter.is_empty() || subject_is_subset_match(subject, filter)
    }

    /// Wakes the delivery loop after new messages were stored.
    fn signal_new_messages(&self);

    /// Notifies the consumer that the stream purged down to these bounds.
    fn purge(&self, first_seq: u64, last_seq: u64) {
        let _ = (first_seq, last_seq);
    }
}

/// Attached consumers plus the counters the hot path needs without
/// iterating: how many carry a subject filter and how many are direct.
#[derive(Default)]
pub struct ConsumerRegistry {
    consumers: HashMap<String, Arc<dyn Consumer>>,
    num_filter: usize,
    directs: usize,
}

impl ConsumerRegistry {
    pub fn set_consumer(&mut self, consumer: Arc<dyn Consumer>) {
        if !consumer.filter_subject().is_empty() {
            self.num_filter += 1;
        }
        if consumer.is_direct() {
            self.directs += 1;
        }
        self.consumers.insert(consumer.name().to_owned(), consumer);
    }

    pub fn remove_consumer(&mut self, name: &str) -> Option<Arc<dyn Consumer>> {
        let consumer = self.consumers.remove(name)?;
        if !consumer.filter_subject().is_empty() && self.num_filter > 0 {
            self.num_filter -= 1;
        }
        if consumer.is_direct() && self.directs > 0 {
            self.directs -= 1;
        }
        Some(consumer)
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Consumer>> {
        self.consumers.get(name).cloned()
    }

    pub fn consumers(&self) -> impl Iterator<Item = &Arc<dyn Consumer>> {
        self.consumers.values()
    }

    pub fn num_consumers(&self) -> usize {
        self.consumers.len()
    }

    pub fn num_filter(&self) -> usize {
        self.num_filter
    }

    pub fn num_directs(&self) -> usize {
        self.directs
    }

    /// Consumers visible to users; direct consumers are plumbing.
    pub fn num_public_consumers(&self) -> usize {
        self.consumers.len() - self.directs
    }

    /// True when some consumer would deliver a message on `subject`.
    /// With no filtered consumers any attached consumer implies interest.
    pub fn has_subject_interest(&self, subject: &str) -> bool {
        if self.consumers.is_empty() {
            return false;
        }
        if self.num_filter == 0 {
            return true;
        }
        self.consumers.values().any(|c| c.filtered_match(subject))
    }

    /// True when any consumer other than `except` still needs `seq`.
    pub fn check_interest(&self, seq: u64, except: Option<&str>) -> bool {
        self.consumers
            .values()
            .any(|c| Some(c.name()) != except && c.need_ack(seq))
    }

    /// Wakes every leader consumer whose filter covers `subject`.
    pub fn signal_new_messages(&self, subject: &str) {
        for consumer in self.consumers.values() {
            if consumer.is_leader() && consumer.filtered_match(subject) {
                consumer.signal_new_messages();
            }
        }
    }

    /// Fans a purge notification out to consumers matching `filter`.
    pub fn notify_purge(&self, filter: &str, first_seq: u64, last_seq: u64) {
        for consumer in self.consumers.values() {
            if filter.is_empty() || consumer.filtered_match(filter) {
                consumer.purge(first_seq, last_seq);
            }
        }
    }

    /// Whether `partition` stays disjoint from every existing non-direct
    /// consumer's filter. WorkQueue streams admit at most one competing
    /// consumer per subject partition; direct consumers are downstream
    /// plumbing and do not compete.
    pub fn partition_unique(&self, partition: &str) -> bool {
        for consumer in self.consumers.values() {
            if consumer.is_direct() {
                continue;
            }
            let filter = consumer.filter_subject();
            if filter.is_empty() || subject_is_subset_match(partition, filter) {
                return false;
            }
        }
        true
    }
}
