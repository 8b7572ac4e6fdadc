use crossbeam::channel::{unbounded, Receiver};
use lodestream::{
    Account, AccountConfig, AccountResources, InProcRelay, PubAckResponse, Relay, StorageType,
    StreamActionAdvisory, StreamConfig, StreamError, unique_subject,
};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(2);

fn test_account() -> (Arc<Account>, Arc<InProcRelay>, tempfile::TempDir) {
    let relay = InProcRelay::new();
    let dir = tempfile::tempdir().expect("temp dir");
    let account = Account::new(
        AccountConfig::new("acme").with_store_dir(dir.path()),
        relay.clone(),
    );
    (account, relay, dir)
}

fn memory_config(name: &str, subjects: &[&str]) -> StreamConfig {
    let mut cfg = StreamConfig::with_name(name);
    cfg.storage = StorageType::Memory;
    cfg.subjects = subjects.iter().map(|s| s.to_string()).collect();
    cfg
}

fn capture(relay: &Arc<InProcRelay>, subject: &str) -> Receiver<Vec<u8>> {
    let (tx, rx) = unbounded();
    relay
        .subscribe(
            subject,
            Arc::new(move |_, _, _, msg| {
                let _ = tx.send(msg.to_vec());
            }),
        )
        .expect("subscribe capture");
    rx
}

fn publish_for_ack(relay: &Arc<InProcRelay>, subject: &str, msg: &[u8]) -> PubAckResponse {
    let reply = unique_subject("_INBOX.test");
    let acks = capture(relay, &reply);
    relay.publish(subject, &reply, b"", msg);
    let payload = acks.recv_timeout(WAIT).expect("publish ack");
    serde_json::from_slice(&payload).expect("ack json")
}

#[test]
fn create_is_idempotent_for_identical_configs() {
    let (account, _relay, _dir) = test_account();
    let first = account.add_stream(&memory_config("A", &["a"])).unwrap();
    let second = account.add_stream(&memory_config("A", &["a"])).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(account.num_streams(), 1);
}

#[test]
fn create_rejects_conflicting_config_for_same_name() {
    let (account, _relay, _dir) = test_account();
    account.add_stream(&memory_config("A", &["a"])).unwrap();
    let err = account
        .add_stream(&memory_config("A", &["different"]))
        .unwrap_err();
    assert!(matches!(err, StreamError::NameInUse));
}

#[test]
fn create_rejects_overlapping_subjects() {
    let (account, _relay, _dir) = test_account();
    account
        .add_stream(&memory_config("A", &["orders.*"]))
        .unwrap();
    let err = account
        .add_stream(&memory_config("B", &["orders.new"]))
        .unwrap_err();
    assert!(matches!(err, StreamError::SubjectOverlap));
}

#[test]
fn create_rejects_sealed_configs() {
    let (account, _relay, _dir) = test_account();
    let mut cfg = memory_config("A", &["a"]);
    cfg.sealed = true;
    assert!(account.add_stream(&cfg).is_err());
}

#[test]
fn stream_slots_are_limited() {
    let relay = InProcRelay::new();
    let dir = tempfile::tempdir().unwrap();
    let account = Account::new(
        AccountConfig::new("acme")
            .with_store_dir(dir.path())
            .with_resources(AccountResources::with_limits(-1, -1, 1)),
        relay,
    );
    account.add_stream(&memory_config("A", &["a"])).unwrap();
    let err = account.add_stream(&memory_config("B", &["b"])).unwrap_err();
    assert!(matches!(err, StreamError::Resources(_)));

    // Deleting frees the slot.
    account.delete_stream("A").unwrap();
    account.add_stream(&memory_config("B", &["b"])).unwrap();
}

#[test]
fn create_emits_advisory() {
    let (account, relay, _dir) = test_account();
    let advisories = capture(&relay, "$JS.EVENT.ADVISORY.STREAM.CREATED.A");
    account.add_stream(&memory_config("A", &["a"])).unwrap();
    let payload = advisories.recv_timeout(WAIT).expect("create advisory");
    let advisory: StreamActionAdvisory = serde_json::from_slice(&payload).unwrap();
    assert_eq!(advisory.stream, "A");
    assert!(!advisory.id.is_empty());
}

#[test]
fn update_applies_subject_delta() {
    let (account, relay, _dir) = test_account();
    let stream = account.add_stream(&memory_config("A", &["a"])).unwrap();
    let advisories = capture(&relay, "$JS.EVENT.ADVISORY.STREAM.UPDATED.A");

    let mut cfg = stream.config();
    cfg.subjects = vec!["b".into()];
    stream.update(&cfg).unwrap();

    // New subject ingests.
    let ack = publish_for_ack(&relay, "b", b"1");
    assert!(ack.error.is_none());
    assert_eq!(ack.ack.sequence, 1);

    // The removed subject no longer reaches the stream.
    let reply = unique_subject("_INBOX.test");
    let acks = capture(&relay, &reply);
    relay.publish("a", &reply, b"", b"2");
    assert!(acks.recv_timeout(Duration::from_millis(200)).is_err());
    assert_eq!(stream.last_seq(), 1);

    advisories.recv_timeout(WAIT).expect("update advisory");
}

#[test]
fn update_validates_against_running_config() {
    let (account, _relay, _dir) = test_account();
    let stream = account.add_stream(&memory_config("A", &["a"])).unwrap();
    let mut cfg = stream.config();
    cfg.retention = lodestream::RetentionPolicy::WorkQueue;
    assert!(matches!(
        stream.update(&cfg),
        Err(StreamError::Config(_))
    ));
}

#[test]
fn delete_removes_stream_and_emits_advisory() {
    let (account, relay, _dir) = test_account();
    let advisories = capture(&relay, "$JS.EVENT.ADVISORY.STREAM.DELETED.A");
    let stream = account.add_stream(&memory_config("A", &["a"])).unwrap();
    publish_for_ack(&relay, "a", b"1");

    stream.delete().unwrap();
    assert!(account.lookup_stream("A").is_none());
    advisories.recv_timeout(WAIT).expect("delete advisory");

    // Publishes after delete go nowhere.
    let reply = unique_subject("_INBOX.test");
    let acks = capture(&relay, &reply);
    relay.publish("a", &reply, b"", b"2");
    assert!(acks.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn stop_keeps_the_stream_out_of_the_account() {
    let (account, _relay, _dir) = test_account();
    let stream = account.add_stream(&memory_config("A", &["a"])).unwrap();
    stream.stop(false, false).unwrap();
    assert!(account.lookup_stream("A").is_none());
    // Stopping twice is a no-op.
    stream.stop(false, false).unwrap();
}

#[test]
fn purge_respects_seal_and_notifies() {
    let (account, relay, _dir) = test_account();
    let stream = account.add_stream(&memory_config("A", &["a"])).unwrap();
    publish_for_ack(&relay, "a", b"1");
    publish_for_ack(&relay, "a", b"2");

    let purged = stream.purge(&lodestream::PurgeRequest::all()).unwrap();
    assert_eq!(purged, 2);
    assert_eq!(stream.state().msgs, 0);

    let mut cfg = stream.config();
    cfg.sealed = true;
    stream.update(&cfg).unwrap();
    assert!(matches!(
        stream.purge(&lodestream::PurgeRequest::all()),
        Err(StreamError::Sealed)
    ));
}

#[test]
fn max_bytes_delta_is_reserved_and_released() {
    let relay = InProcRelay::new();
    let dir = tempfile::tempdir().unwrap();
    let account = Account::new(
        AccountConfig::new("acme")
            .with_store_dir(dir.path())
            .with_resources(AccountResources::with_limits(1_000, 1_000, -1)),
        relay,
    );
    let mut cfg = memory_config("A", &["a"]);
    cfg.max_bytes = 400;
    let stream = account.add_stream(&cfg).unwrap();

    // Growing past the account cap fails the update.
    let mut grow = stream.config();
    grow.max_bytes = 2_000;
    assert!(matches!(
        stream.update(&grow),
        Err(StreamError::Resources(_))
    ));

    // Growing within the cap works, and shrinking releases again.
    let mut grow = stream.config();
    grow.max_bytes = 900;
    stream.update(&grow).unwrap();
    let mut shrink = stream.config();
    shrink.max_bytes = 100;
    stream.update(&shrink).unwrap();
}
