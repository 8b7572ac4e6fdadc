//! Wire header block codec plus the typed views the ingress pipeline and
//! the source manager need: publish precondition headers, origin tracking
//! and upstream control messages.

use crate::subject::token_at;

/// Status line every header block starts with.
pub const HDR_LINE: &[u8] = b"NATS/1.0\r\n";
/// Prefix identifying an upstream control message (heartbeat/flow control).
pub const CTRL_LINE_PREFIX: &[u8] = b"NATS/1.0 100 ";

pub const MSG_ID_HDR: &str = "Nats-Msg-Id";
pub const EXPECTED_STREAM_HDR: &str = "Nats-Expected-Stream";
pub const EXPECTED_LAST_SEQ_HDR: &str = "Nats-Expected-Last-Sequence";
pub const EXPECTED_LAST_SUBJ_SEQ_HDR: &str = "Nats-Expected-Last-Subject-Sequence";
pub const EXPECTED_LAST_MSG_ID_HDR: &str = "Nats-Expected-Last-Msg-Id";
pub const STREAM_SOURCE_HDR: &str = "Nats-Stream-Source";
pub const LAST_CONSUMER_SEQ_HDR: &str = "Nats-Last-Consumer";
pub const LAST_STREAM_SEQ_HDR: &str = "Nats-Last-Stream";
pub const CONSUMER_STALLED_HDR: &str = "Nats-Consumer-Stalled";
pub const ROLLUP_HDR: &str = "Nats-Rollup";
/// Request metadata attached by cross-account imports; always stripped.
pub const CLIENT_INFO_HDR: &str = "Nats-Request-Info";

/// Rollup header values.
pub const ROLLUP_SUBJECT: &str = "sub";
pub const ROLLUP_ALL: &str = "all";

const CRLF: &[u8] = b"\r\n";

/// Returns the value of `key` inside a raw header block, if present.
pub fn get_header<'a>(key: &str, hdr: &'a [u8]) -> Option<&'a [u8]> {
    if hdr.is_empty() {
        return None;
    }
    for line in split_lines(hdr).skip(1) {
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            continue;
        };
        let (name, rest) = line.split_at(colon);
        if name.eq_ignore_ascii_case(key.as_bytes()) {
            return Some(trim_ascii(&rest[1..]));
        }
    }
    None
}

/// Appends `key: value` to a header block, creating the block if needed.
pub fn set_header(hdr: &[u8], key: &str, value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(hdr.len() + key.len() + value.len() + 8);
    if hdr.is_empty() {
        out.extend_from_slice(HDR_LINE);
    } else {
        let mut end = hdr.len();
        while end >= 2 && &hdr[end - 2..end] == CRLF {
            end -= 2;
        }
        out.extend_from_slice(&hdr[..end]);
        out.extend_from_slice(CRLF);
    }
    out.extend_from_slice(key.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value.as_bytes());
    out.extend_from_slice(CRLF);
    out.extend_from_slice(CRLF);
    out
}

/// Removes every occurrence of `key`, returning the original slice as an
/// owned block when nothing matched.
pub fn remove_header_if_present(hdr: &[u8], key: &str) -> Vec<u8> {
    if hdr.is_empty() || get_header(key, hdr).is_none() {
        return hdr.to_vec();
    }
    let mut out = Vec::with_capacity(hdr.len());
    for (idx, line) in split_lines(hdr).enumerate() {
        if idx > 0 {
            if let Some(colon) = line.iter().position(|&b| b == b':') {
                if line[..colon].eq_ignore_ascii_case(key.as_bytes()) {
                    continue;
                }
            }
        }
        out.extend_from_slice(line);
        out.extend_from_slice(CRLF);
    }
    out.extend_from_slice(CRLF);
    out
}

fn split_lines(hdr: &[u8]) -> impl Iterator<Item = &[u8]> {
    hdr.split(|&b| b == b'\n').filter_map(|line| {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        (!line.is_empty()).then_some(line)
    })
}

fn trim_ascii(b: &[u8]) -> &[u8] {
    let start = b.iter().position(|c| !c.is_ascii_whitespace());
    let end = b.iter().rposition(|c| !c.is_ascii_whitespace());
    match (start, end) {
        (Some(s), Some(e)) => &b[s..=e],
        _ => &[],
    }
}

fn header_str<'a>(key: &str, hdr: &'a [u8]) -> Option<&'a str> {
    get_header(key, hdr).and_then(|v| std::str::from_utf8(v).ok())
}

fn header_u64(key: &str, hdr: &[u8]) -> Option<u64> {
    header_str(key, hdr).and_then(|v| v.parse().ok())
}

/// Publish msg-id used for duplicate suppression.
pub fn get_msg_id(hdr: &[u8]) -> Option<String> {
    header_str(MSG_ID_HDR, hdr).map(str::to_owned)
}

pub fn get_expected_stream(hdr: &[u8]) -> Option<String> {
    header_str(EXPECTED_STREAM_HDR, hdr).map(str::to_owned)
}

pub fn get_expected_last_seq(hdr: &[u8]) -> Option<u64> {
    header_u64(EXPECTED_LAST_SEQ_HDR, hdr)
}

pub fn get_expected_last_msg_id(hdr: &[u8]) -> Option<String> {
    header_str(EXPECTED_LAST_MSG_ID_HDR, hdr).map(str::to_owned)
}

/// Distinguishes "header absent" from "present with value 0": zero asserts
/// that no message exists on the subject yet.
pub fn get_expected_last_subj_seq(hdr: &[u8]) -> Option<u64> {
    header_u64(EXPECTED_LAST_SUBJ_SEQ_HDR, hdr)
}

/// Rollup directive, normalized to lowercase.
pub fn get_rollup(hdr: &[u8]) -> Option<String> {
    header_str(ROLLUP_HDR, hdr).map(|v| v.to_ascii_lowercase())
}

/// Origin annotation `"<indexed-name> <upstream-seq>"` written on sourced
/// messages and read back when computing resume points.
pub fn get_stream_source(hdr: &[u8]) -> Option<(String, u64)> {
    let value = header_str(STREAM_SOURCE_HDR, hdr)?;
    parse_stream_source(value)
}

pub fn parse_stream_source(value: &str) -> Option<(String, u64)> {
    let mut fields = value.split_whitespace();
    let iname = fields.next()?;
    let seq = fields.next()?.parse().ok()?;
    if fields.next().is_some() {
        return None;
    }
    Some((iname.to_owned(), seq))
}

/// Upstream consumer control message, classified once at the edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMsg {
    /// Idle heartbeat; carries the consumer sequence the upstream believes
    /// it last delivered, and optionally a stall-probe reply subject.
    Heartbeat {
        last_consumer_seq: Option<u64>,
        stalled_reply: Option<String>,
    },
    /// Flow-control request that must be answered on `reply`.
    FlowControl { reply: String },
}

/// Classifies a delivery as a control message, or returns `None` for data.
pub fn classify_control(reply: &str, hdr: &[u8], msg: &[u8]) -> Option<ControlMsg> {
    if !msg.is_empty() || !hdr.starts_with(CTRL_LINE_PREFIX) {
        return None;
    }
    if !reply.is_empty() {
        return Some(ControlMsg::FlowControl {
            reply: reply.to_owned(),
        });
    }
    Some(ControlMsg::Heartbeat {
        last_consumer_seq: header_u64(LAST_CONSUMER_SEQ_HDR, hdr),
        stalled_reply: header_str(CONSUMER_STALLED_HDR, hdr).map(str::to_owned),
    })
}

/// Prefix of every delivery acknowledgement reply subject.
pub const ACK_REPLY_PREFIX: &str = "$JS.ACK.";
const ACK_REPLY_TOKENS: usize = 9;

/// Metadata carried in a `$JS.ACK.<stream>.<consumer>.<dc>.<sseq>.<dseq>.<ts>.<pending>` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AckReplyInfo {
    pub stream_seq: u64,
    pub consumer_seq: u64,
    pub delivery_count: u64,
    pub timestamp: i64,
    pub pending: u64,
}

/// Parses delivery metadata out of an ACK reply subject.
pub fn parse_ack_reply(reply: &str) -> Option<AckReplyInfo> {
    if !reply.starts_with(ACK_REPLY_PREFIX) {
        return None;
    }
    let tokens: Vec<&str> = reply.split('.').collect();
    if tokens.len() != ACK_REPLY_TOKENS {
        return None;
    }
    Some(AckReplyInfo {
        delivery_count: tokens[4].parse().ok()?,
        stream_seq: tokens[5].parse().ok()?,
        consumer_seq: tokens[6].parse().ok()?,
        timestamp: tokens[7].parse().ok()?,
        pending: tokens[8].parse().ok()?,
    })
}

/// Consumer name token of an ACK reply (used for subscription identity,
/// since subscription pointers do not survive cross-account imports).
pub fn ack_reply_consumer(reply: &str) -> Option<&str> {
    if !reply.starts_with(ACK_REPLY_PREFIX) {
        return None;
    }
    let name = token_at(reply, 4);
    (!name.is_empty()).then_some(name)
}

/// Stream (or indexed source name) and sequence from either an old-style
/// raw ACK reply or the `"<iname> <seq>"` origin form.
pub fn stream_and_seq(value: &str) -> Option<(String, u64)> {
    if value.starts_with(ACK_REPLY_PREFIX) {
        let tokens: Vec<&str> = value.split('.').collect();
        if tokens.len() != ACK_REPLY_TOKENS {
            return None;
        }
        return Some((tokens[2].to_owned(), tokens[5].parse().ok()?));
    }
    parse_stream_source(value)
}
