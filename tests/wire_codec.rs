use lodestream::{
    consumer_create_subject, decode_entry, decode_stream_msg, encode_msg_delete,
    encode_stream_msg, pub_ack_prefix, render_pub_ack, ApiError, FrameError, OutQueue, PubAck,
    PubAckResponse, ReplicatedOp, StreamAction, StreamActionAdvisory, StreamMsgFrame,
};

#[test]
fn stream_msg_frame_round_trip() {
    let frame = StreamMsgFrame {
        subject: "orders.new".into(),
        reply: "_INBOX.reply".into(),
        hdr: b"NATS/1.0\r\nNats-Msg-Id: x\r\n\r\n".to_vec(),
        msg: b"payload".to_vec(),
        pre_seq: 41,
        ts: -3,
    };
    let decoded = decode_stream_msg(&encode_stream_msg(&frame)).unwrap();
    assert_eq!(decoded, frame);
    assert!(!frame.is_skip());
}

#[test]
fn skip_frames_are_compact_and_recognizable() {
    let frame = StreamMsgFrame::skip(10);
    assert!(frame.is_skip());
    assert_eq!(frame.pre_seq, 9);
    let decoded = decode_stream_msg(&encode_stream_msg(&frame)).unwrap();
    assert!(decoded.is_skip());
}

#[test]
fn decode_rejects_garbage() {
    assert_eq!(decode_stream_msg(&[]), Err(FrameError::Truncated));
    assert_eq!(decode_stream_msg(&[9, 1, 2]), Err(FrameError::UnknownOp(9)));
    let mut valid = encode_stream_msg(&StreamMsgFrame::skip(1));
    valid.truncate(valid.len() - 2);
    assert_eq!(decode_stream_msg(&valid), Err(FrameError::Truncated));
}

#[test]
fn delete_entries_round_trip() {
    let entry = encode_msg_delete(42, "ORDERS");
    match decode_entry(&entry).unwrap() {
        ReplicatedOp::DeleteMsg { seq, stream } => {
            assert_eq!(seq, 42);
            assert_eq!(stream, "ORDERS");
        }
        other => panic!("unexpected op: {other:?}"),
    }
}

#[test]
fn pub_ack_renders_without_marshaling() {
    let prefix = pub_ack_prefix("ORDERS", "");
    let ack = render_pub_ack(&prefix, 22, false);
    let parsed: PubAck = serde_json::from_slice(&ack).unwrap();
    assert_eq!(parsed.stream, "ORDERS");
    assert_eq!(parsed.sequence, 22);
    assert!(!parsed.duplicate);

    let dup = render_pub_ack(&prefix, 7, true);
    let parsed: PubAck = serde_json::from_slice(&dup).unwrap();
    assert_eq!(parsed.sequence, 7);
    assert!(parsed.duplicate);

    let prefix = pub_ack_prefix("ORDERS", "hub");
    let ack = render_pub_ack(&prefix, 1, false);
    let parsed: PubAck = serde_json::from_slice(&ack).unwrap();
    assert_eq!(parsed.domain, "hub");
}

#[test]
fn failure_responses_carry_the_error() {
    let payload = PubAckResponse::failure("ORDERS", ApiError::wrong_last_sequence(3));
    let parsed: PubAckResponse = serde_json::from_slice(&payload).unwrap();
    assert_eq!(parsed.ack.stream, "ORDERS");
    let err = parsed.error.unwrap();
    assert_eq!(err.err_code, 10071);
    assert!(err.description.contains('3'));
}

#[test]
fn advisory_serializes_with_action() {
    let advisory = StreamActionAdvisory::new("ORDERS", StreamAction::Create);
    let json: serde_json::Value =
        serde_json::from_slice(&serde_json::to_vec(&advisory).unwrap()).unwrap();
    assert_eq!(json["stream"], "ORDERS");
    assert_eq!(json["action"], "create");
    assert!(json.get("domain").is_none());
}

#[test]
fn consumer_create_subject_honors_api_prefixes() {
    assert_eq!(
        consumer_create_subject("UP", None),
        "$JS.API.CONSUMER.CREATE.UP"
    );
    assert_eq!(
        consumer_create_subject("UP", Some("$JS.hub.API")),
        "$JS.hub.API.CONSUMER.CREATE.UP"
    );
    // Double dots from prefix concatenation collapse.
    assert_eq!(
        consumer_create_subject("UP", Some("$JS.hub.API.")),
        "$JS.hub.API.CONSUMER.CREATE.UP"
    );
}

#[test]
fn out_queue_pools_and_zeroes_envelopes() {
    let (outq, ready) = OutQueue::new(8);
    outq.send_with_reply("subj", "reply", b"payload".to_vec());
    assert!(ready.try_recv().is_ok());

    let pm = outq.pop().expect("queued message");
    assert_eq!(pm.dest, "subj");
    assert_eq!(pm.reply, "reply");
    assert_eq!(pm.msg, b"payload");
    outq.recycle(pm);

    // The pooled envelope comes back with every field reset.
    let fresh = outq.new_msg();
    assert!(fresh.dest.is_empty());
    assert!(fresh.reply.is_empty());
    assert!(fresh.hdr.is_empty());
    assert!(fresh.msg.is_empty());
    assert_eq!(fresh.seq, 0);
    assert!(outq.is_empty());
}
