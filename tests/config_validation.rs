use lodestream::{
    check_stream_config, check_update_config, ConfigError, DiscardPolicy, EngineLimits,
    ExternalStream, RetentionPolicy, StorageType, StreamConfig, StreamSource,
    DEFAULT_DUPLICATE_WINDOW,
};
use std::time::Duration;

fn limits() -> EngineLimits {
    EngineLimits::default()
}

#[test]
fn defaults_applied_on_create() {
    let cfg = check_stream_config(&StreamConfig::with_name("ORDERS"), &limits()).unwrap();
    assert_eq!(cfg.storage, StorageType::File);
    assert_eq!(cfg.replicas, 1);
    assert_eq!(cfg.max_msgs, -1);
    assert_eq!(cfg.max_bytes, -1);
    assert_eq!(cfg.max_msg_size, -1);
    assert_eq!(cfg.max_msgs_per, -1);
    assert_eq!(cfg.max_consumers, -1);
    assert_eq!(cfg.duplicates, DEFAULT_DUPLICATE_WINDOW);
    assert_eq!(cfg.retention, RetentionPolicy::Limits);
    assert_eq!(cfg.discard, DiscardPolicy::Old);
    // No subjects, mirror or sources: the name becomes the subject.
    assert_eq!(cfg.subjects, vec!["ORDERS".to_owned()]);
}

#[test]
fn duplicates_window_capped_by_max_age_and_server_limit() {
    let mut cfg = StreamConfig::with_name("A");
    cfg.max_age = Duration::from_secs(30);
    let cfg = check_stream_config(&cfg, &limits()).unwrap();
    assert_eq!(cfg.duplicates, Duration::from_secs(30));

    let mut capped = limits();
    capped.duplicates = Some(Duration::from_secs(60));
    let cfg = check_stream_config(&StreamConfig::with_name("A"), &capped).unwrap();
    assert_eq!(cfg.duplicates, Duration::from_secs(60));

    let mut cfg = StreamConfig::with_name("A");
    cfg.duplicates = Duration::from_secs(120);
    cfg.max_age = Duration::from_secs(30);
    assert_eq!(
        check_stream_config(&cfg, &limits()),
        Err(ConfigError::DuplicatesExceedsMaxAge)
    );

    let mut cfg = StreamConfig::with_name("A");
    cfg.duplicates = Duration::from_secs(600);
    assert_eq!(
        check_stream_config(&cfg, &capped),
        Err(ConfigError::DuplicatesExceedsLimit)
    );
}

#[test]
fn name_and_subject_rules() {
    assert_eq!(
        check_stream_config(&StreamConfig::with_name("bad.name"), &limits()),
        Err(ConfigError::InvalidName)
    );
    assert!(matches!(
        check_stream_config(&StreamConfig::with_name("x".repeat(300)), &limits()),
        Err(ConfigError::NameTooLong(_))
    ));

    let mut cfg = StreamConfig::with_name("A");
    cfg.subjects = vec!["orders.*".into(), "orders.*".into()];
    assert_eq!(
        check_stream_config(&cfg, &limits()),
        Err(ConfigError::DuplicateSubjects)
    );

    let mut cfg = StreamConfig::with_name("A");
    cfg.subjects = vec!["$JS.API.STREAM.>".into()];
    assert_eq!(
        check_stream_config(&cfg, &limits()),
        Err(ConfigError::SubjectOverlapsApi)
    );

    let mut cfg = StreamConfig::with_name("A");
    cfg.subjects = vec!["orders..new".into()];
    assert!(matches!(
        check_stream_config(&cfg, &limits()),
        Err(ConfigError::InvalidSubject(_))
    ));
}

#[test]
fn replica_bounds() {
    let mut cfg = StreamConfig::with_name("A");
    cfg.replicas = 5;
    assert!(check_stream_config(&cfg, &limits()).is_ok());
    cfg.replicas = 6;
    assert_eq!(
        check_stream_config(&cfg, &limits()),
        Err(ConfigError::ReplicasOutOfRange)
    );
}

#[test]
fn rollup_requires_purge_permission() {
    let mut cfg = StreamConfig::with_name("A");
    cfg.allow_rollup = true;
    cfg.deny_purge = true;
    assert_eq!(
        check_stream_config(&cfg, &limits()),
        Err(ConfigError::RollupRequiresPurge)
    );
}

#[test]
fn mirror_exclusivity() {
    let mut cfg = StreamConfig::with_name("M");
    cfg.mirror = Some(StreamSource::new("UP"));
    cfg.subjects = vec!["a".into()];
    assert_eq!(
        check_stream_config(&cfg, &limits()),
        Err(ConfigError::MirrorWithSubjects)
    );

    let mut cfg = StreamConfig::with_name("M");
    cfg.mirror = Some(StreamSource::new("UP"));
    cfg.sources = vec![StreamSource::new("OTHER")];
    assert_eq!(
        check_stream_config(&cfg, &limits()),
        Err(ConfigError::MirrorWithSources)
    );

    let mut cfg = StreamConfig::with_name("M");
    let mut mirror = StreamSource::new("UP");
    mirror.filter_subject = "a.*".into();
    cfg.mirror = Some(mirror);
    assert_eq!(
        check_stream_config(&cfg, &limits()),
        Err(ConfigError::MirrorWithFilter)
    );

    let mut cfg = StreamConfig::with_name("M");
    let mut mirror = StreamSource::new("UP");
    mirror.opt_start_seq = 10;
    mirror.opt_start_time = Some(time::OffsetDateTime::now_utc());
    cfg.mirror = Some(mirror);
    assert_eq!(
        check_stream_config(&cfg, &limits()),
        Err(ConfigError::MirrorStartConflict)
    );

    // A clean mirror keeps an empty subject list.
    let mut cfg = StreamConfig::with_name("M");
    cfg.mirror = Some(StreamSource::new("UP"));
    let cfg = check_stream_config(&cfg, &limits()).unwrap();
    assert!(cfg.subjects.is_empty());
}

#[test]
fn source_index_names_must_be_unique() {
    let mut cfg = StreamConfig::with_name("AGG");
    cfg.sources = vec![StreamSource::new("UP"), StreamSource::new("UP")];
    assert!(matches!(
        check_stream_config(&cfg, &limits()),
        Err(ConfigError::DuplicateSource(_))
    ));

    // Same name behind different API prefixes is fine: the prefix hash
    // disambiguates the indexed name.
    let mut external = StreamSource::new("UP");
    external.external = Some(ExternalStream {
        api_prefix: "$JS.hub.API".into(),
        deliver_prefix: String::new(),
    });
    let mut cfg = StreamConfig::with_name("AGG");
    cfg.sources = vec![StreamSource::new("UP"), external.clone()];
    let cfg = check_stream_config(&cfg, &limits()).unwrap();
    assert_ne!(cfg.sources[0].indexed_name(), cfg.sources[1].indexed_name());
    assert!(external.indexed_name().starts_with("UP:"));
}

#[test]
fn update_rejects_immutable_changes() {
    let old = check_stream_config(&StreamConfig::with_name("A"), &limits()).unwrap();

    let mut new = old.clone();
    new.name = "B".into();
    assert_eq!(
        check_update_config(&old, &new, &limits()),
        Err(ConfigError::UpdateNameMismatch)
    );

    let mut new = old.clone();
    new.storage = StorageType::Memory;
    assert_eq!(
        check_update_config(&old, &new, &limits()),
        Err(ConfigError::UpdateStorage)
    );

    let mut new = old.clone();
    new.retention = RetentionPolicy::Interest;
    assert_eq!(
        check_update_config(&old, &new, &limits()),
        Err(ConfigError::UpdateRetention)
    );

    let mut new = old.clone();
    new.max_consumers = 7;
    assert_eq!(
        check_update_config(&old, &new, &limits()),
        Err(ConfigError::UpdateMaxConsumers)
    );

    let mut new = old.clone();
    new.template = "tmpl".into();
    assert_eq!(
        check_update_config(&old, &new, &limits()),
        Err(ConfigError::UpdateTemplateAdopt)
    );
}

#[test]
fn one_way_flags_never_clear() {
    let mut sealed = StreamConfig::with_name("A");
    sealed.sealed = true;
    let sealed = check_stream_config(&sealed, &limits()).unwrap();

    let mut unseal = sealed.clone();
    unseal.sealed = false;
    assert_eq!(
        check_update_config(&sealed, &unseal, &limits()),
        Err(ConfigError::UpdateUnseal)
    );

    let mut old = StreamConfig::with_name("A");
    old.deny_delete = true;
    let old = check_stream_config(&old, &limits()).unwrap();
    let mut new = old.clone();
    new.deny_delete = false;
    assert_eq!(
        check_update_config(&old, &new, &limits()),
        Err(ConfigError::UpdateDenyDelete)
    );

    let mut old = StreamConfig::with_name("A");
    old.deny_purge = true;
    let old = check_stream_config(&old, &limits()).unwrap();
    let mut new = old.clone();
    new.deny_purge = false;
    assert_eq!(
        check_update_config(&old, &new, &limits()),
        Err(ConfigError::UpdateDenyPurge)
    );
}

#[test]
fn sealing_forces_closed_posture() {
    let old = check_stream_config(&StreamConfig::with_name("A"), &limits()).unwrap();
    let mut new = old.clone();
    new.sealed = true;
    new.max_age = Duration::from_secs(3600);
    new.allow_rollup = true;
    let updated = check_update_config(&old, &new, &limits()).unwrap();
    assert!(updated.sealed);
    assert_eq!(updated.max_age, Duration::ZERO);
    assert_eq!(updated.discard, DiscardPolicy::New);
    assert!(updated.deny_delete);
    assert!(updated.deny_purge);
    assert!(!updated.allow_rollup);
}
