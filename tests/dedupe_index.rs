use lodestream::DedupeIndex;
use std::time::Duration;

const SEC: i64 = 1_000_000_000;

fn index(window_secs: u64) -> DedupeIndex {
    let mut index = DedupeIndex::new(Duration::from_secs(window_secs));
    index.mark_loaded();
    index
}

#[test]
fn records_and_reports_within_window() {
    let mut dd = index(2);
    assert!(dd.check("m-1").is_none());
    dd.insert("m-1", 7, SEC);
    assert_eq!(dd.check("m-1"), Some((7, SEC)));
    assert_eq!(dd.check(""), None);
    assert_eq!(dd.num_ids(), 1);
}

#[test]
fn first_insert_signals_timer_arm() {
    let mut dd = index(2);
    assert!(dd.insert("a", 1, SEC));
    assert!(!dd.insert("b", 2, SEC));
}

#[test]
fn eviction_pops_expired_head_and_rearms() {
    let mut dd = index(2);
    dd.insert("a", 1, SEC);
    dd.insert("b", 2, 3 * SEC);

    // At t=3s the first entry is exactly at the window boundary.
    let next = dd.evict_expired(3 * SEC);
    assert!(dd.check("a").is_none());
    assert_eq!(dd.check("b"), Some((2, 3 * SEC)));
    // Next fire is the remaining life of "b".
    assert_eq!(next, Some(Duration::from_secs(2)));

    // Everything gone: timer stops, arrays drop.
    assert_eq!(dd.evict_expired(10 * SEC), None);
    assert_eq!(dd.num_ids(), 0);
}

#[test]
fn eviction_never_fires_faster_than_floor() {
    let mut dd = index(2);
    dd.insert("a", 1, SEC);
    // 1ns of life left; floor kicks in.
    let next = dd.evict_expired(3 * SEC - 1).expect("entry alive");
    assert!(next >= Duration::from_millis(50));
}

#[test]
fn next_deadline_tracks_the_oldest_live_entry() {
    let mut dd = index(2);
    assert_eq!(dd.next_deadline(SEC), None);

    dd.insert("a", 1, SEC);
    // Half the window gone: half remains.
    assert_eq!(dd.next_deadline(2 * SEC), Some(Duration::from_secs(1)));
    // An entry already past its window still gets the floor, so the
    // eviction pass runs rather than firing in the past.
    let next = dd.next_deadline(10 * SEC).expect("entry still indexed");
    assert_eq!(next, Duration::from_millis(50));
}

#[test]
fn expired_ids_can_be_inserted_again() {
    let mut dd = index(2);
    dd.insert("a", 1, SEC);
    assert_eq!(dd.evict_expired(10 * SEC), None);
    assert!(dd.check("a").is_none());
    assert!(dd.insert("a", 9, 11 * SEC));
    assert_eq!(dd.check("a"), Some((9, 11 * SEC)));
}

#[test]
fn compaction_keeps_array_bounded() {
    let mut dd = index(100);
    // 300 entries spread over time, then expire most of them in stages so
    // the dead prefix forces a compaction pass.
    for i in 0..300u64 {
        dd.insert(format!("m-{i}"), i, i as i64 * SEC);
    }
    // Expire all but the last two entries.
    let next = dd.evict_expired(397 * SEC);
    assert!(next.is_some());
    assert_eq!(dd.num_ids(), 2);
    for i in 298..300u64 {
        assert!(dd.check(&format!("m-{i}")).is_some());
    }
    // Live entries survive compaction and further inserts behave.
    dd.insert("fresh", 300, 397 * SEC);
    assert_eq!(dd.num_ids(), 3);
}

#[test]
fn window_change_takes_effect_on_next_eviction() {
    let mut dd = index(60);
    dd.insert("a", 1, SEC);
    assert!(dd.evict_expired(5 * SEC).is_some());
    dd.set_window(Duration::from_secs(2));
    assert_eq!(dd.evict_expired(5 * SEC), None);
}

#[test]
fn clear_drops_everything() {
    let mut dd = index(60);
    dd.insert("a", 1, SEC);
    dd.clear();
    assert_eq!(dd.num_ids(), 0);
    assert!(dd.check("a").is_none());
}
