use lodestream::{
    check_stream_config, DiscardPolicy, EngineLimits, MemoryStore, PurgeRequest, StorageType,
    StoreError, StreamConfig, StreamStore,
};

fn store_with(f: impl FnOnce(&mut StreamConfig)) -> MemoryStore {
    let mut cfg = StreamConfig::with_name("S");
    cfg.storage = StorageType::Memory;
    f(&mut cfg);
    let cfg = check_stream_config(&cfg, &EngineLimits::default()).unwrap();
    MemoryStore::new(&cfg)
}

#[test]
fn sequences_are_contiguous_and_state_tracks() {
    let store = store_with(|_| {});
    let (seq1, ts1) = store.store_msg("s.a", b"", b"one").unwrap();
    let (seq2, _) = store.store_msg("s.b", b"", b"two").unwrap();
    assert_eq!((seq1, seq2), (1, 2));
    assert!(ts1 > 0);

    let state = store.state();
    assert_eq!(state.msgs, 2);
    assert_eq!(state.first_seq, 1);
    assert_eq!(state.last_seq, 2);

    let sm = store.load_msg(1).unwrap();
    assert_eq!(sm.subject, "s.a");
    assert_eq!(sm.msg, b"one");
}

#[test]
fn skip_advances_without_storing() {
    let store = store_with(|_| {});
    store.store_msg("s.a", b"", b"one").unwrap();
    assert_eq!(store.skip_msg(), 2);
    assert_eq!(store.skip_msg(), 3);
    let state = store.state();
    assert_eq!(state.msgs, 1);
    assert_eq!(state.last_seq, 3);
    assert_eq!(store.load_msg(2).unwrap_err(), StoreError::NotFound);
}

#[test]
fn raw_append_pins_sequence_and_timestamp() {
    let store = store_with(|_| {});
    store.store_raw_msg("s.a", b"", b"x", 5, 42).unwrap();
    let sm = store.load_msg(5).unwrap();
    assert_eq!(sm.ts, 42);
    assert_eq!(store.state().last_seq, 5);
    assert_eq!(
        store.store_raw_msg("s.a", b"", b"y", 5, 43).unwrap_err(),
        StoreError::SequenceInUse(5)
    );
}

#[test]
fn load_last_msg_by_subject() {
    let store = store_with(|_| {});
    store.store_msg("s.a", b"", b"1").unwrap();
    store.store_msg("s.b", b"", b"2").unwrap();
    store.store_msg("s.a", b"", b"3").unwrap();
    assert_eq!(store.load_last_msg("s.a").unwrap().seq, 3);
    assert_eq!(store.load_last_msg("s.b").unwrap().seq, 2);
    assert_eq!(store.load_last_msg("s.c").unwrap_err(), StoreError::NotFound);
}

#[test]
fn max_msgs_discard_old_evicts_head() {
    let store = store_with(|cfg| cfg.max_msgs = 3);
    for i in 0..5 {
        store.store_msg("s.a", b"", format!("m{i}").as_bytes()).unwrap();
    }
    let state = store.state();
    assert_eq!(state.msgs, 3);
    assert_eq!(state.first_seq, 3);
    assert_eq!(state.last_seq, 5);
}

#[test]
fn max_msgs_discard_new_rejects() {
    let store = store_with(|cfg| {
        cfg.max_msgs = 2;
        cfg.discard = DiscardPolicy::New;
    });
    store.store_msg("s.a", b"", b"1").unwrap();
    store.store_msg("s.a", b"", b"2").unwrap();
    assert_eq!(
        store.store_msg("s.a", b"", b"3").unwrap_err(),
        StoreError::MaxMsgs
    );
    assert_eq!(store.state().msgs, 2);
}

#[test]
fn per_subject_cap_evicts_oldest_on_subject() {
    let store = store_with(|cfg| cfg.max_msgs_per = 1);
    store.store_msg("s.a", b"", b"1").unwrap();
    store.store_msg("s.b", b"", b"2").unwrap();
    store.store_msg("s.a", b"", b"3").unwrap();
    let state = store.state();
    assert_eq!(state.msgs, 2);
    assert_eq!(store.load_last_msg("s.a").unwrap().seq, 3);
    assert_eq!(store.load_msg(1).unwrap_err(), StoreError::NotFound);
}

#[test]
fn msg_size_enforced() {
    let store = store_with(|cfg| cfg.max_msg_size = 4);
    assert_eq!(
        store.store_msg("s.a", b"", b"too large").unwrap_err(),
        StoreError::MsgTooLarge
    );
    store.store_msg("s.a", b"", b"ok").unwrap();
}

#[test]
fn remove_distinguishes_missing_from_never_written() {
    let store = store_with(|_| {});
    store.store_msg("s.a", b"", b"1").unwrap();
    assert_eq!(store.remove_msg(1).unwrap(), true);
    assert_eq!(store.remove_msg(1).unwrap(), false);
    assert_eq!(store.remove_msg(9).unwrap_err(), StoreError::Eof);
}

#[test]
fn purge_variants() {
    let store = store_with(|_| {});
    for i in 0..6u8 {
        let subject = if i % 2 == 0 { "s.even" } else { "s.odd" };
        store.store_msg(subject, b"", &[i]).unwrap();
    }

    // Keep the newest message on a subject.
    let purged = store.purge(&PurgeRequest::keep_last("s.even", 1)).unwrap();
    assert_eq!(purged, 2);
    assert_eq!(store.load_last_msg("s.even").unwrap().seq, 5);

    // Purge below a sequence.
    let purged = store
        .purge(&PurgeRequest {
            sequence: 4,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(purged, 1);

    // Full purge empties but preserves the sequence floor.
    store.purge(&PurgeRequest::all()).unwrap();
    let state = store.state();
    assert_eq!(state.msgs, 0);
    assert_eq!(state.last_seq, 6);
    assert_eq!(state.first_seq, 7);
}

#[test]
fn compact_raises_floor() {
    let store = store_with(|_| {});
    for i in 0..5u8 {
        store.store_msg("s.a", b"", &[i]).unwrap();
    }
    let purged = store.compact(4).unwrap();
    assert_eq!(purged, 3);
    let state = store.state();
    assert_eq!(state.first_seq, 4);
    assert_eq!(state.msgs, 2);

    // Compacting an empty store positions the next append.
    let empty = store_with(|_| {});
    empty.compact(11).unwrap();
    assert_eq!(empty.state().last_seq, 10);
    empty.store_raw_msg("s.a", b"", b"x", 11, 1).unwrap();
    assert_eq!(empty.state().first_seq, 11);
}

#[test]
fn seq_from_time_finds_first_at_or_after() {
    let store = store_with(|_| {});
    store.store_raw_msg("s.a", b"", b"1", 1, 100).unwrap();
    store.store_raw_msg("s.a", b"", b"2", 2, 200).unwrap();
    store.store_raw_msg("s.a", b"", b"3", 3, 300).unwrap();
    assert_eq!(store.seq_from_time(150), 2);
    assert_eq!(store.seq_from_time(200), 2);
    assert_eq!(store.seq_from_time(500), 0);
}

#[test]
fn closed_store_rejects_operations() {
    let store = store_with(|_| {});
    store.stop().unwrap();
    assert_eq!(
        store.store_msg("s.a", b"", b"1").unwrap_err(),
        StoreError::Closed
    );
    assert_eq!(store.load_msg(1).unwrap_err(), StoreError::Closed);
}
