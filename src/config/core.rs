//! Stream configuration model. Validation and normalization live in
//! [`crate::config::check`].

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;
use time::OffsetDateTime;

/// When stored messages are discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RetentionPolicy {
    /// Age/size limits only.
    #[default]
    Limits,
    /// Remove once no consumer has remaining interest.
    Interest,
    /// Remove on first acknowledgement.
    #[serde(rename = "workqueue")]
    WorkQueue,
}

/// Behaviour when a limit is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DiscardPolicy {
    /// Evict the oldest message to admit the new one.
    #[default]
    Old,
    /// Reject the new publish.
    New,
}

/// Storage backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    File,
    Memory,
}

/// Cross-account/external qualification of an upstream stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ExternalStream {
    #[serde(rename = "api")]
    pub api_prefix: String,
    #[serde(rename = "deliver", default, skip_serializing_if = "String::is_empty")]
    pub deliver_prefix: String,
}

/// Upstream stream this stream mirrors or sources from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StreamSource {
    pub name: String,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub opt_start_seq: u64,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub opt_start_time: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub filter_subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<ExternalStream>,
}

impl StreamSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Stable index key: the plain name, or `name:<hash>` when the source
    /// lives behind an external API prefix (names may repeat across
    /// accounts).
    pub fn indexed_name(&self) -> String {
        match &self.external {
            Some(ext) => format!("{}:{}", self.name, prefix_hash(&ext.api_prefix)),
            None => self.name.clone(),
        }
    }
}

fn prefix_hash(api_prefix: &str) -> String {
    let digest = Sha256::digest(api_prefix.as_bytes());
    let mut out = String::with_capacity(8);
    for byte in &digest[..4] {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Name, subjects, limits and retention for a stream. If `subjects` is
/// empty and no mirror/sources are configured the name is used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StreamConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subjects: Vec<String>,
    #[serde(default)]
    pub retention: RetentionPolicy,
    #[serde(default)]
    pub max_consumers: i32,
    #[serde(default)]
    pub max_msgs: i64,
    #[serde(default)]
    pub max_bytes: i64,
    #[serde(default, with = "duration_nanos")]
    pub max_age: Duration,
    #[serde(rename = "max_msgs_per_subject", default)]
    pub max_msgs_per: i64,
    #[serde(default, skip_serializing_if = "is_zero_i32")]
    pub max_msg_size: i32,
    #[serde(default)]
    pub discard: DiscardPolicy,
    #[serde(default)]
    pub storage: StorageType,
    #[serde(rename = "num_replicas", default)]
    pub replicas: usize,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub no_ack: bool,
    #[serde(rename = "template_owner", default, skip_serializing_if = "String::is_empty")]
    pub template: String,
    #[serde(rename = "duplicate_window", default, with = "duration_nanos")]
    pub duplicates: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror: Option<StreamSource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<StreamSource>,

    // One-way qualifiers: once true they can never be cleared again.
    #[serde(default)]
    pub sealed: bool,
    #[serde(default)]
    pub deny_delete: bool,
    #[serde(default)]
    pub deny_purge: bool,
    #[serde(rename = "allow_rollup_hdrs", default)]
    pub allow_rollup: bool,
}

impl StreamConfig {
    /// Minimal config with defaults applied on validation.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn is_mirror(&self) -> bool {
        self.mirror.is_some()
    }

    pub fn has_sources(&self) -> bool {
        !self.sources.is_empty()
    }

    /// Looks up a configured source by indexed name.
    pub fn source(&self, iname: &str) -> Option<&StreamSource> {
        self.sources.iter().find(|s| s.indexed_name() == iname)
    }
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

fn is_zero_i32(v: &i32) -> bool {
    *v == 0
}

/// Durations ride the wire as integer nanoseconds.
pub(crate) mod duration_nanos {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_nanos().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_nanos)
    }
}
