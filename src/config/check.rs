//! Configuration normalization and cross-field validation, for both stream
//! create and update.

use crate::config::core::{DiscardPolicy, StreamConfig};
use crate::config::limits::{EngineLimits, MAX_REPLICAS};
use crate::subject::{is_valid_name, is_valid_subject, subject_is_subset_match};
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

/// Default duplicate-suppression window when the config leaves it unset.
pub const DEFAULT_DUPLICATE_WINDOW: Duration = Duration::from_secs(120);

/// Subject space reserved for the engine API; user subjects must not fall
/// inside it.
pub const API_RESERVED_SUBJECTS: &str = "$JS.API.>";

/// Rejection reasons from stream config validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("stream name is required and can not contain '.', '*', '>'")]
    InvalidName,
    #[error("stream name is too long, maximum allowed is {0}")]
    NameTooLong(usize),
    #[error("stream description is too long, maximum allowed is {0}")]
    DescriptionTooLong(usize),
    #[error("maximum replicas is {MAX_REPLICAS}")]
    ReplicasOutOfRange,
    #[error("duplicates window can not be larger than max age")]
    DuplicatesExceedsMaxAge,
    #[error("duplicates window can not be larger than server limit")]
    DuplicatesExceedsLimit,
    #[error("roll-ups require the purge permission")]
    RollupRequiresPurge,
    #[error("stream mirrors may not have subjects")]
    MirrorWithSubjects,
    #[error("stream mirrors can not also contain other sources")]
    MirrorWithSources,
    #[error("stream mirrors can not contain filtered subjects")]
    MirrorWithFilter,
    #[error("stream mirrors can not have both start seq and start time configured")]
    MirrorStartConflict,
    #[error("duplicate subjects detected")]
    DuplicateSubjects,
    #[error("subjects overlap with the reserved api space")]
    SubjectOverlapsApi,
    #[error("invalid subject {0:?}")]
    InvalidSubject(String),
    #[error("duplicate source {0:?} detected")]
    DuplicateSource(String),
    #[error("stream configuration for create can not be sealed")]
    SealedOnCreate,
    #[error("stream configuration name must match original")]
    UpdateNameMismatch,
    #[error("stream configuration update can not change max consumers")]
    UpdateMaxConsumers,
    #[error("stream configuration update can not change storage type")]
    UpdateStorage,
    #[error("stream configuration update can not change retention policy")]
    UpdateRetention,
    #[error("stream configuration update not allowed on template owned stream")]
    UpdateTemplateOwned,
    #[error("stream configuration update can not be owned by a template")]
    UpdateTemplateAdopt,
    #[error("stream configuration update can not unseal a sealed stream")]
    UpdateUnseal,
    #[error("stream configuration update can not cancel deny message deletes")]
    UpdateDenyDelete,
    #[error("stream configuration update can not cancel deny purge")]
    UpdateDenyPurge,
}

/// Normalizes a raw config and enforces every create-time invariant.
/// Returns the canonical config with defaults applied.
pub fn check_stream_config(
    config: &StreamConfig,
    limits: &EngineLimits,
) -> Result<StreamConfig, ConfigError> {
    if !is_valid_name(&config.name) {
        return Err(ConfigError::InvalidName);
    }
    if config.name.len() > limits.max_name_len {
        return Err(ConfigError::NameTooLong(limits.max_name_len));
    }
    if config.description.len() > limits.max_description_len {
        return Err(ConfigError::DescriptionTooLong(limits.max_description_len));
    }

    let mut cfg = config.clone();

    if cfg.replicas == 0 {
        cfg.replicas = 1;
    }
    if cfg.replicas > MAX_REPLICAS {
        return Err(ConfigError::ReplicasOutOfRange);
    }
    if cfg.max_msgs == 0 {
        cfg.max_msgs = -1;
    }
    if cfg.max_msgs_per == 0 {
        cfg.max_msgs_per = -1;
    }
    if cfg.max_bytes == 0 {
        cfg.max_bytes = -1;
    }
    if cfg.max_msg_size == 0 {
        cfg.max_msg_size = -1;
    }
    if cfg.max_consumers == 0 {
        cfg.max_consumers = -1;
    }

    if cfg.duplicates.is_zero() {
        let mut window = DEFAULT_DUPLICATE_WINDOW;
        if let Some(cap) = limits.duplicates {
            window = window.min(cap);
        }
        if !cfg.max_age.is_zero() && cfg.max_age < window {
            window = cfg.max_age;
        }
        cfg.duplicates = window;
    }
    if !cfg.max_age.is_zero() && cfg.duplicates > cfg.max_age {
        return Err(ConfigError::DuplicatesExceedsMaxAge);
    }
    if let Some(cap) = limits.duplicates {
        if cfg.duplicates > cap {
            return Err(ConfigError::DuplicatesExceedsLimit);
        }
    }

    if cfg.deny_purge && cfg.allow_rollup {
        return Err(ConfigError::RollupRequiresPurge);
    }

    if let Some(mirror) = &cfg.mirror {
        if !cfg.subjects.is_empty() {
            return Err(ConfigError::MirrorWithSubjects);
        }
        if !cfg.sources.is_empty() {
            return Err(ConfigError::MirrorWithSources);
        }
        if !mirror.filter_subject.is_empty() {
            return Err(ConfigError::MirrorWithFilter);
        }
        if mirror.opt_start_seq > 0 && mirror.opt_start_time.is_some() {
            return Err(ConfigError::MirrorStartConflict);
        }
    } else if cfg.subjects.is_empty() {
        if cfg.sources.is_empty() {
            cfg.subjects.push(cfg.name.clone());
        }
    }

    let mut seen = HashSet::with_capacity(cfg.subjects.len());
    for subject in &cfg.subjects {
        if !seen.insert(subject.as_str()) {
            return Err(ConfigError::DuplicateSubjects);
        }
        if subject_is_subset_match(subject, API_RESERVED_SUBJECTS) {
            return Err(ConfigError::SubjectOverlapsApi);
        }
        if !is_valid_subject(subject) {
            return Err(ConfigError::InvalidSubject(subject.clone()));
        }
    }

    let mut inames = HashSet::with_capacity(cfg.sources.len());
    for source in &cfg.sources {
        let iname = source.indexed_name();
        if !inames.insert(iname.clone()) {
            return Err(ConfigError::DuplicateSource(iname));
        }
    }

    if cfg.sealed {
        apply_sealed_adjustments(&mut cfg);
    }

    Ok(cfg)
}

/// Validates a config update against the running config. Returns the new
/// canonical config; immutable fields and one-way flags are enforced here.
pub fn check_update_config(
    old: &StreamConfig,
    new: &StreamConfig,
    limits: &EngineLimits,
) -> Result<StreamConfig, ConfigError> {
    let mut cfg = check_stream_config(new, limits)?;

    if cfg.name != old.name {
        return Err(ConfigError::UpdateNameMismatch);
    }
    if cfg.max_consumers != old.max_consumers {
        return Err(ConfigError::UpdateMaxConsumers);
    }
    if cfg.storage != old.storage {
        return Err(ConfigError::UpdateStorage);
    }
    if cfg.retention != old.retention {
        return Err(ConfigError::UpdateRetention);
    }
    if !old.template.is_empty() {
        return Err(ConfigError::UpdateTemplateOwned);
    }
    if !cfg.template.is_empty() {
        return Err(ConfigError::UpdateTemplateAdopt);
    }
    if !cfg.sealed && old.sealed {
        return Err(ConfigError::UpdateUnseal);
    }
    if !cfg.deny_delete && old.deny_delete {
        return Err(ConfigError::UpdateDenyDelete);
    }
    if !cfg.deny_purge && old.deny_purge {
        return Err(ConfigError::UpdateDenyPurge);
    }

    if cfg.sealed {
        apply_sealed_adjustments(&mut cfg);
    }

    Ok(cfg)
}

// Sealing pins the stream shut: nothing ages out, nothing new gets in and
// destructive operations stay denied.
fn apply_sealed_adjustments(cfg: &mut StreamConfig) {
    cfg.max_age = Duration::ZERO;
    cfg.discard = DiscardPolicy::New;
    cfg.deny_delete = true;
    cfg.deny_purge = true;
    cfg.allow_rollup = false;
}
