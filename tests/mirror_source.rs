use crossbeam::channel::{unbounded, Receiver};
use lodestream::header::{get_stream_source, CTRL_LINE_PREFIX};
use lodestream::{
    Account, AccountConfig, ConsumerApiInfo, ConsumerCreateRequest, ConsumerCreateResponse,
    DeliverPolicy, InProcRelay, Relay, SequencePair, StorageType, StreamConfig, StreamSource,
};
use std::sync::Arc;
use std::time::Duration;

fn wait_for(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {what}");
}

fn test_account() -> (Arc<Account>, Arc<InProcRelay>, tempfile::TempDir) {
    let relay = InProcRelay::new();
    let dir = tempfile::tempdir().expect("temp dir");
    let account = Account::new(
        AccountConfig::new("acme").with_store_dir(dir.path()),
        relay.clone(),
    );
    (account, relay, dir)
}

// Answers consumer create requests for an upstream stream the way the real
// API would, handing each request's deliver subject to the test.
fn fake_upstream(
    relay: &Arc<InProcRelay>,
    upstream: &str,
    consumer_name: &str,
    delivered_stream_seq: u64,
) -> Receiver<ConsumerCreateRequest> {
    let (tx, rx) = unbounded();
    let relay_pub = Arc::clone(relay);
    let consumer_name = consumer_name.to_owned();
    relay
        .subscribe(
            &format!("$JS.API.CONSUMER.CREATE.{upstream}"),
            Arc::new(move |_, reply, _, msg| {
                let req: ConsumerCreateRequest =
                    serde_json::from_slice(msg).expect("consumer create request");
                let response = ConsumerCreateResponse {
                    error: None,
                    consumer_info: Some(ConsumerApiInfo {
                        name: consumer_name.clone(),
                        delivered: SequencePair {
                            consumer_seq: 0,
                            stream_seq: delivered_stream_seq,
                        },
                    }),
                };
                let payload = serde_json::to_vec(&response).expect("response json");
                let _ = tx.send(req);
                relay_pub.publish(reply, "", b"", &payload);
            }),
        )
        .expect("subscribe upstream api");
    rx
}

fn ack_reply(upstream: &str, consumer: &str, sseq: u64, dseq: u64, pending: u64) -> String {
    format!("$JS.ACK.{upstream}.{consumer}.1.{sseq}.{dseq}.1700000000.{pending}")
}

#[test]
fn mirror_reifies_upstream_gaps_as_skips() {
    let (account, relay, _dir) = test_account();
    let requests = fake_upstream(&relay, "B", "up1", 0);

    let mut cfg = StreamConfig::with_name("M");
    cfg.storage = StorageType::Memory;
    cfg.mirror = Some(StreamSource::new("B"));
    let stream = account.add_stream(&cfg).unwrap();

    let request = requests
        .recv_timeout(Duration::from_secs(2))
        .expect("consumer create request");
    assert_eq!(request.stream, "B");
    assert!(request.config.flow_control);
    assert!(request.config.direct);
    assert_eq!(request.config.max_deliver, 1);
    assert_eq!(request.config.deliver_policy, DeliverPolicy::All);
    let deliver = request.config.deliver_subject.clone();

    wait_for("mirror consumer", || {
        stream
            .mirror_info()
            .map(|mi| mi.consumer.as_deref() == Some("up1"))
            .unwrap_or(false)
    });

    // Upstream holds seqs 1..10 but 4..7 were deleted: deliveries jump
    // from stream seq 3 to 8 while the delivery seq stays contiguous.
    let deliveries = [(1u64, 1u64), (2, 2), (3, 3), (8, 4), (9, 5), (10, 6)];
    for (sseq, dseq) in deliveries {
        let reply = ack_reply("B", "up1", sseq, dseq, 0);
        relay.publish(&deliver, &reply, b"", format!("m{sseq}").as_bytes());
    }

    wait_for("mirror caught up", || stream.last_seq() == 10);
    let state = stream.state();
    assert_eq!(state.msgs, 6);
    assert_eq!(state.first_seq, 1);
    assert_eq!(state.last_seq, 10);
    // Local sequences match upstream exactly; the gap is unoccupied.
    assert_eq!(stream.get_msg(8).unwrap().msg, b"m8");
    assert!(stream.get_msg(5).is_err());
}

#[test]
fn mirror_drops_foreign_and_redelivered_messages() {
    let (account, relay, _dir) = test_account();
    let requests = fake_upstream(&relay, "B", "up1", 0);

    let mut cfg = StreamConfig::with_name("M");
    cfg.storage = StorageType::Memory;
    cfg.mirror = Some(StreamSource::new("B"));
    let stream = account.add_stream(&cfg).unwrap();

    let request = requests.recv_timeout(Duration::from_secs(2)).unwrap();
    let deliver = request.config.deliver_subject.clone();
    wait_for("mirror consumer", || {
        stream
            .mirror_info()
            .map(|mi| mi.consumer.is_some())
            .unwrap_or(false)
    });

    relay.publish(&deliver, &ack_reply("B", "up1", 1, 1, 0), b"", b"ok");
    wait_for("first msg", || stream.last_seq() == 1);

    // A delivery from a stale consumer subscription is ignored.
    relay.publish(&deliver, &ack_reply("B", "other", 2, 2, 0), b"", b"stale");
    // A redelivery (delivery count > 1) is ignored.
    relay.publish(
        &deliver,
        &format!("$JS.ACK.B.up1.2.2.2.1700000000.0"),
        b"",
        b"redelivered",
    );
    // An old sequence is ignored.
    relay.publish(&deliver, &ack_reply("B", "up1", 1, 3, 0), b"", b"old");

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(stream.last_seq(), 1);
    assert_eq!(stream.state().msgs, 1);
}

#[test]
fn mirror_answers_flow_control() {
    let (account, relay, _dir) = test_account();
    let requests = fake_upstream(&relay, "B", "up1", 0);

    let mut cfg = StreamConfig::with_name("M");
    cfg.storage = StorageType::Memory;
    cfg.mirror = Some(StreamSource::new("B"));
    let stream = account.add_stream(&cfg).unwrap();
    let request = requests.recv_timeout(Duration::from_secs(2)).unwrap();
    let deliver = request.config.deliver_subject.clone();
    wait_for("mirror consumer", || stream.mirror_info().is_some());

    let (fc_tx, fc_rx) = unbounded();
    relay
        .subscribe(
            "fc.reply.1",
            Arc::new(move |_, _, _, _| {
                let _ = fc_tx.send(());
            }),
        )
        .unwrap();

    let mut ctrl = CTRL_LINE_PREFIX.to_vec();
    ctrl.extend_from_slice(b"FlowControl Request\r\n\r\n");
    relay.publish(&deliver, "fc.reply.1", &ctrl, b"");
    fc_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("flow control reply");
}

#[test]
fn mirror_tracks_lag_from_pending() {
    let (account, relay, _dir) = test_account();
    let requests = fake_upstream(&relay, "B", "up1", 0);

    let mut cfg = StreamConfig::with_name("M");
    cfg.storage = StorageType::Memory;
    cfg.mirror = Some(StreamSource::new("B"));
    let stream = account.add_stream(&cfg).unwrap();
    let request = requests.recv_timeout(Duration::from_secs(2)).unwrap();
    let deliver = request.config.deliver_subject.clone();
    wait_for("mirror consumer", || stream.mirror_info().is_some());

    relay.publish(&deliver, &ack_reply("B", "up1", 1, 1, 5), b"", b"x");
    wait_for("lag recorded", || {
        stream.mirror_info().map(|mi| mi.lag == 4).unwrap_or(false)
    });
    relay.publish(&deliver, &ack_reply("B", "up1", 2, 2, 0), b"", b"y");
    wait_for("lag drained", || {
        stream.mirror_info().map(|mi| mi.lag == 0).unwrap_or(false)
    });
}

#[test]
fn source_messages_carry_origin_header() {
    let (account, relay, _dir) = test_account();
    let requests = fake_upstream(&relay, "UP", "sc1", 0);

    let mut cfg = StreamConfig::with_name("AGG");
    cfg.storage = StorageType::Memory;
    cfg.subjects = vec!["agg.>".into()];
    cfg.sources = vec![StreamSource::new("UP")];
    let stream = account.add_stream(&cfg).unwrap();

    let request = requests.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(request.stream, "UP");
    let deliver = request.config.deliver_subject.clone();
    wait_for("source consumer", || {
        stream
            .sources_info()
            .iter()
            .any(|si| si.consumer.as_deref() == Some("sc1"))
    });

    relay.publish(&deliver, &ack_reply("UP", "sc1", 11, 1, 0), b"", b"payload");
    wait_for("sourced msg", || stream.last_seq() == 1);

    let sm = stream.get_msg(1).unwrap();
    assert_eq!(get_stream_source(&sm.hdr), Some(("UP".to_owned(), 11)));
    assert_eq!(sm.msg, b"payload");
}

#[test]
fn added_source_resumes_from_origin_headers() {
    let (account, relay, _dir) = test_account();
    let requests = fake_upstream(&relay, "UP", "sc1", 0);

    let mut cfg = StreamConfig::with_name("AGG");
    cfg.storage = StorageType::Memory;
    cfg.subjects = vec!["agg.>".into()];
    cfg.sources = vec![StreamSource::new("UP")];
    let stream = account.add_stream(&cfg).unwrap();

    let request = requests.recv_timeout(Duration::from_secs(2)).unwrap();
    let deliver = request.config.deliver_subject.clone();
    wait_for("source consumer", || {
        stream.sources_info().iter().any(|si| si.consumer.is_some())
    });

    for (sseq, dseq) in [(11u64, 1u64), (12, 2), (13, 3)] {
        relay.publish(&deliver, &ack_reply("UP", "sc1", sseq, dseq, 0), b"", b"p");
    }
    wait_for("sourced msgs", || stream.last_seq() == 3);

    // Drop the source, then add it back: the reverse scan over origin
    // headers must resume delivery at upstream seq 14.
    let mut without = stream.config();
    without.sources.clear();
    without.subjects = vec!["agg.>".into()];
    stream.update(&without).unwrap();
    assert!(stream.sources_info().is_empty());

    let mut with = stream.config();
    with.sources = vec![StreamSource::new("UP")];
    stream.update(&with).unwrap();

    let request = requests
        .recv_timeout(Duration::from_secs(2))
        .expect("re-create request");
    assert_eq!(request.config.deliver_policy, DeliverPolicy::ByStartSequence);
    assert_eq!(request.config.opt_start_seq, 14);
}

#[test]
fn mirror_skips_forward_when_upstream_already_advanced() {
    let (account, relay, _dir) = test_account();
    // Upstream reports its consumer already delivered through seq 5.
    let requests = fake_upstream(&relay, "B", "up1", 5);

    let mut cfg = StreamConfig::with_name("M");
    cfg.storage = StorageType::Memory;
    cfg.mirror = Some(StreamSource::new("B"));
    let stream = account.add_stream(&cfg).unwrap();
    let _ = requests.recv_timeout(Duration::from_secs(2)).unwrap();

    // The create response advances us to the upstream position with
    // local skips so the next delivery lines up.
    wait_for("skips applied", || stream.last_seq() == 5);
    assert_eq!(stream.state().msgs, 0);
    assert_eq!(
        stream.mirror_info().expect("mirror info").sseq,
        5
    );
}
