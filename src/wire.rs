//! JSON envelopes exchanged with publishers and the upstream consumer API,
//! plus the binary framing for entries proposed into the consensus log.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

/// API error envelope attached to failed publish acks and API responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{description} (code {code}, err_code {err_code})")]
pub struct ApiError {
    pub code: u16,
    pub err_code: u32,
    pub description: String,
}

impl ApiError {
    fn new(code: u16, err_code: u32, description: impl Into<String>) -> Self {
        Self {
            code,
            err_code,
            description: description.into(),
        }
    }

    pub fn stream_not_match() -> Self {
        Self::new(400, 10060, "expected stream does not match")
    }

    pub fn wrong_last_sequence(lseq: u64) -> Self {
        Self::new(400, 10071, format!("wrong last sequence: {lseq}"))
    }

    pub fn wrong_last_msg_id(last: &str) -> Self {
        Self::new(400, 10070, format!("wrong last msg ID: {last}"))
    }

    pub fn sequence_not_matched() -> Self {
        Self::new(503, 10052, "expected stream sequence does not match")
    }

    pub fn rollup_failed(reason: &str) -> Self {
        Self::new(400, 10098, format!("rollup not permitted: {reason}"))
    }

    pub fn stream_sealed() -> Self {
        Self::new(400, 10109, "invalid operation on sealed stream")
    }

    pub fn message_exceeds_maximum() -> Self {
        Self::new(400, 10054, "message size exceeds maximum allowed")
    }

    pub fn header_exceeds_maximum() -> Self {
        Self::new(400, 10097, "header size exceeds maximum allowed")
    }

    pub fn insufficient_resources() -> Self {
        Self::new(503, 10023, "insufficient resources")
    }

    pub fn account_resources_exceeded() -> Self {
        Self::new(400, 10002, "resource limits exceeded for account")
    }

    pub fn store_failed(err: &str) -> Self {
        Self::new(503, 10077, format!("storage failure: {err}"))
    }

    pub fn mirror_consumer_setup_failed(err: &str) -> Self {
        Self::new(500, 10029, format!("mirror consumer setup failed: {err}"))
    }

    pub fn source_consumer_setup_failed(err: &str) -> Self {
        Self::new(500, 10045, format!("source consumer setup failed: {err}"))
    }

    pub fn invalid_json() -> Self {
        Self::new(400, 10025, "invalid JSON")
    }
}

/// Detail returned from a successful publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PubAck {
    pub stream: String,
    #[serde(rename = "seq")]
    pub sequence: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub domain: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub duplicate: bool,
}

/// Formal response to a publish operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PubAckResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
    #[serde(flatten)]
    pub ack: PubAck,
}

impl PubAckResponse {
    pub fn failure(stream: &str, error: ApiError) -> Vec<u8> {
        let resp = Self {
            error: Some(error),
            ack: PubAck {
                stream: stream.to_owned(),
                ..Default::default()
            },
        };
        serde_json::to_vec(&resp).unwrap_or_default()
    }
}

/// Prebuilt `{"stream":...,"seq":` prefix so the publish hot path appends
/// digits instead of marshaling JSON per message.
pub fn pub_ack_prefix(stream: &str, domain: &str) -> Vec<u8> {
    if domain.is_empty() {
        format!("{{\"stream\":{:?},\"seq\":", stream).into_bytes()
    } else {
        format!("{{\"stream\":{:?},\"domain\":{:?},\"seq\":", stream, domain).into_bytes()
    }
}

/// Renders a success ack from the prebuilt prefix.
pub fn render_pub_ack(prefix: &[u8], seq: u64, duplicate: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(prefix.len() + 32);
    out.extend_from_slice(prefix);
    out.extend_from_slice(seq.to_string().as_bytes());
    if duplicate {
        out.extend_from_slice(b",\"duplicate\":true}");
    } else {
        out.push(b'}');
    }
    out
}

/// Stream lifecycle actions reported through advisories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamAction {
    Create,
    Modify,
    Delete,
}

pub const STREAM_ACTION_ADVISORY_TYPE: &str = "io.lodestream.advisory.v1.stream_action";

pub const ADVISORY_STREAM_CREATED_PRE: &str = "$JS.EVENT.ADVISORY.STREAM.CREATED";
pub const ADVISORY_STREAM_UPDATED_PRE: &str = "$JS.EVENT.ADVISORY.STREAM.UPDATED";
pub const ADVISORY_STREAM_DELETED_PRE: &str = "$JS.EVENT.ADVISORY.STREAM.DELETED";

/// Event published when a stream is created, updated or deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamActionAdvisory {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub time: OffsetDateTime,
    pub stream: String,
    pub action: StreamAction,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub template: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub domain: String,
}

impl StreamActionAdvisory {
    pub fn new(stream: &str, action: StreamAction) -> Self {
        Self {
            kind: STREAM_ACTION_ADVISORY_TYPE.to_owned(),
            id: Uuid::new_v4().simple().to_string(),
            time: OffsetDateTime::now_utc(),
            stream: stream.to_owned(),
            action,
            template: String::new(),
            domain: String::new(),
        }
    }
}

/// API prefix replaced with an external source's `api_prefix`.
pub const API_PREFIX: &str = "$JS.API";

/// API subject for creating a consumer on the upstream stream.
pub fn consumer_create_subject(stream: &str, api_prefix: Option<&str>) -> String {
    let subject = format!("{API_PREFIX}.CONSUMER.CREATE.{stream}");
    match api_prefix {
        Some(prefix) if !prefix.is_empty() => {
            subject.replacen(API_PREFIX, prefix, 1).replace("..", ".")
        }
        _ => subject,
    }
}

/// How the upstream consumer picks its first delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliverPolicy {
    #[default]
    All,
    ByStartSequence,
    ByStartTime,
}

/// Acknowledgement mode requested for the upstream consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    #[default]
    None,
    All,
    Explicit,
}

/// Consumer configuration requested from the upstream API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ConsumerApiConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub deliver_subject: String,
    #[serde(default)]
    pub deliver_policy: DeliverPolicy,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub opt_start_seq: u64,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub opt_start_time: Option<OffsetDateTime>,
    #[serde(default)]
    pub ack_policy: AckPolicy,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub ack_wait_ns: u64,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub max_deliver: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub filter_subject: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub idle_heartbeat_ns: u64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub flow_control: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub direct: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub durable_name: String,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

/// Request payload for `$JS.API.CONSUMER.CREATE.<stream>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerCreateRequest {
    pub stream: String,
    pub config: ConsumerApiConfig,
}

/// Delivery cursor reported by the upstream consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SequencePair {
    pub consumer_seq: u64,
    pub stream_seq: u64,
}

/// Subset of consumer info the source manager consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ConsumerApiInfo {
    pub name: String,
    #[serde(default)]
    pub delivered: SequencePair,
}

/// Response payload from the upstream consumer create API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ConsumerCreateResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumer_info: Option<ConsumerApiInfo>,
}

/// Errors from the replicated-entry codec.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("replicated entry truncated")]
    Truncated,
    #[error("unknown replicated entry op {0}")]
    UnknownOp(u8),
    #[error("replicated entry field is not valid UTF-8")]
    BadUtf8,
}

const STREAM_MSG_OP: u8 = 1;
const MSG_DELETE_OP: u8 = 2;

/// Message proposed into the consensus log. `pre_seq` is the leader's
/// `lseq + clfs` at proposal time; skip entries carry empty fields.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamMsgFrame {
    pub subject: String,
    pub reply: String,
    pub hdr: Vec<u8>,
    pub msg: Vec<u8>,
    pub pre_seq: u64,
    pub ts: i64,
}

impl StreamMsgFrame {
    /// A skip entry reserving `seq` without a payload.
    pub fn skip(seq: u64) -> Self {
        Self {
            pre_seq: seq.saturating_sub(1),
            ..Default::default()
        }
    }

    pub fn is_skip(&self) -> bool {
        self.subject.is_empty() && self.hdr.is_empty() && self.msg.is_empty()
    }
}

/// Encodes a stream message for proposal into the consensus log.
pub fn encode_stream_msg(frame: &StreamMsgFrame) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        1 + 16 + frame.subject.len() + frame.reply.len() + frame.hdr.len() + frame.msg.len() + 16,
    );
    out.push(STREAM_MSG_OP);
    out.extend_from_slice(&frame.pre_seq.to_le_bytes());
    out.extend_from_slice(&frame.ts.to_le_bytes());
    for field in [
        frame.subject.as_bytes(),
        frame.reply.as_bytes(),
        &frame.hdr[..],
        &frame.msg[..],
    ] {
        out.extend_from_slice(&(field.len() as u32).to_le_bytes());
        out.extend_from_slice(field);
    }
    out
}

/// Decodes an entry previously produced by [`encode_stream_msg`].
pub fn decode_stream_msg(buf: &[u8]) -> Result<StreamMsgFrame, FrameError> {
    let (&op, mut rest) = buf.split_first().ok_or(FrameError::Truncated)?;
    if op != STREAM_MSG_OP {
        return Err(FrameError::UnknownOp(op));
    }
    let pre_seq = take_u64(&mut rest)?;
    let ts = take_u64(&mut rest)? as i64;
    let subject = take_field(&mut rest)?;
    let reply = take_field(&mut rest)?;
    let hdr = take_field(&mut rest)?;
    let msg = take_field(&mut rest)?;
    Ok(StreamMsgFrame {
        subject: String::from_utf8(subject).map_err(|_| FrameError::BadUtf8)?,
        reply: String::from_utf8(reply).map_err(|_| FrameError::BadUtf8)?,
        hdr,
        msg,
        pre_seq,
        ts,
    })
}

fn take_u64(rest: &mut &[u8]) -> Result<u64, FrameError> {
    if rest.len() < 8 {
        return Err(FrameError::Truncated);
    }
    let (head, tail) = rest.split_at(8);
    *rest = tail;
    Ok(u64::from_le_bytes(head.try_into().expect("8 bytes")))
}

fn take_field(rest: &mut &[u8]) -> Result<Vec<u8>, FrameError> {
    if rest.len() < 4 {
        return Err(FrameError::Truncated);
    }
    let (head, tail) = rest.split_at(4);
    let len = u32::from_le_bytes(head.try_into().expect("4 bytes")) as usize;
    if tail.len() < len {
        return Err(FrameError::Truncated);
    }
    let (field, tail) = tail.split_at(len);
    *rest = tail;
    Ok(field.to_vec())
}

/// Entry decoded from the consensus log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicatedOp {
    Msg(StreamMsgFrame),
    /// Message removal forwarded from an ack that raced its write.
    DeleteMsg { seq: u64, stream: String },
}

/// Encodes a forwarded message-delete proposal.
pub fn encode_msg_delete(seq: u64, stream: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 8 + 4 + stream.len());
    out.push(MSG_DELETE_OP);
    out.extend_from_slice(&seq.to_le_bytes());
    out.extend_from_slice(&(stream.len() as u32).to_le_bytes());
    out.extend_from_slice(stream.as_bytes());
    out
}

/// Decodes any entry from the consensus log.
pub fn decode_entry(buf: &[u8]) -> Result<ReplicatedOp, FrameError> {
    match buf.first() {
        Some(&STREAM_MSG_OP) => decode_stream_msg(buf).map(ReplicatedOp::Msg),
        Some(&MSG_DELETE_OP) => {
            let mut rest = &buf[1..];
            let seq = take_u64(&mut rest)?;
            let stream = String::from_utf8(take_field(&mut rest)?)
                .map_err(|_| FrameError::BadUtf8)?;
            Ok(ReplicatedOp::DeleteMsg { seq, stream })
        }
        Some(&op) => Err(FrameError::UnknownOp(op)),
        None => Err(FrameError::Truncated),
    }
}

/// Generates a unique inbox-style subject under `prefix`.
pub fn unique_subject(prefix: &str) -> String {
    format!("{prefix}.{}", Uuid::new_v4().simple())
}
