//! Window-bounded duplicate suppression: a map for O(1) id lookup paired
//! with an insertion-ordered array and an eviction cursor, so expiry walks
//! entries oldest-first without rescanning the map.

use std::collections::HashMap;
use std::time::Duration;

/// Eviction never fires faster than this.
pub const MIN_EVICTION_FIRE: Duration = Duration::from_millis(50);

/// One tracked publish id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupeEntry {
    pub id: String,
    pub seq: u64,
    pub ts: i64,
}

/// Duplicate-suppression index for a single stream.
///
/// `arr` keeps every live entry in insertion order starting at `index`;
/// the map always points at entries in that suffix. The prefix below
/// `index` is garbage that gets compacted away once it dominates.
#[derive(Debug, Default)]
pub struct DedupeIndex {
    map: HashMap<String, (u64, i64)>,
    arr: Vec<DedupeEntry>,
    index: usize,
    window: Duration,
    loaded: bool,
}

impl DedupeIndex {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            ..Default::default()
        }
    }

    /// Whether the index has been (re)built from the store yet. Streams
    /// that start empty are born loaded.
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn mark_loaded(&mut self) {
        self.loaded = true;
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn set_window(&mut self, window: Duration) {
        self.window = window;
    }

    /// Number of ids currently tracked.
    pub fn num_ids(&self) -> usize {
        self.map.len()
    }

    /// Returns the recorded `(seq, ts)` if `id` was seen inside the window.
    pub fn check(&self, id: &str) -> Option<(u64, i64)> {
        if id.is_empty() {
            return None;
        }
        self.map.get(id).copied()
    }

    /// Records an id. Returns true when this was the first live entry, in
    /// which case the owner must arm the eviction deadline.
    pub fn insert(&mut self, id: impl Into<String>, seq: u64, ts: i64) -> bool {
        let id = id.into();
        let was_empty = self.map.is_empty();
        self.map.insert(id.clone(), (seq, ts));
        self.arr.push(DedupeEntry { id, seq, ts });
        was_empty
    }

    /// Expires entries older than the window and returns how long to sleep
    /// until the next eviction, or `None` once the index is empty (arrays
    /// are dropped and the timer should stop).
    pub fn evict_expired(&mut self, now_ns: i64) -> Option<Duration> {
        let window_ns = self.window.as_nanos().min(i64::MAX as u128) as i64;
        let mut next: Option<Duration> = None;
        while self.index < self.arr.len() {
            let entry = &self.arr[self.index];
            let age = now_ns.saturating_sub(entry.ts);
            if age >= window_ns {
                self.map.remove(&entry.id);
                self.index += 1;
                continue;
            }
            next = Some(Duration::from_nanos((window_ns - age) as u64));
            break;
        }
        if self.map.is_empty() {
            self.arr = Vec::new();
            self.index = 0;
            return None;
        }
        // Compact once the dead prefix reaches two thirds of the array.
        let live = self.arr.len() - self.index;
        if self.arr.len() >= 3 * live {
            self.arr.drain(..self.index);
            self.index = 0;
        }
        Some(next.unwrap_or(self.window).max(MIN_EVICTION_FIRE))
    }

    /// Drops all state; used on stream stop.
    pub fn clear(&mut self) {
        self.map.clear();
        self.arr = Vec::new();
        self.index = 0;
    }

    /// The deadline for the oldest live entry, used to (re)arm the timer.
    pub fn next_deadline(&self, now_ns: i64) -> Option<Duration> {
        let entry = self.arr.get(self.index)?;
        let window_ns = self.window.as_nanos().min(i64::MAX as u128) as i64;
        let remaining = window_ns - now_ns.saturating_sub(entry.ts);
        Some(Duration::from_nanos(remaining.max(0) as u64).max(MIN_EVICTION_FIRE))
    }
}
