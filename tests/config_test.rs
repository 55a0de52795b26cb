use batchq::config::{Config, EngineConfig, FileConfig};
use batchq::error::Error;
use batchq::queue::QueueLimit;
use std::io::Write;
use std::time::Duration;

const ENV_VARS: &[&str] = &[
    "BATCHQ_BATCH_SIZE",
    "BATCHQ_PERIOD_MS",
    "BATCHQ_MIN_BACKOFF_MS",
    "BATCHQ_MAX_BACKOFF_MS",
    "BATCHQ_QUEUE_LIMIT",
    "BATCHQ_EAGER_FIRST_ITEM",
];

fn clear_env() {
    unsafe {
        for var in ENV_VARS {
            std::env::remove_var(var);
        }
    }
}

// Environment variables are process-global, so every env scenario lives in
// this one test.
#[test]
fn config_from_env_overlays_defaults_and_rejects_garbage() {
    clear_env();
    let config = Config::from_env().unwrap();
    assert_eq!(config.engine, EngineConfig::default());
    assert!(!config.log_level.is_empty());

    unsafe {
        std::env::set_var("BATCHQ_BATCH_SIZE", "100");
        std::env::set_var("BATCHQ_PERIOD_MS", "250");
        std::env::set_var("BATCHQ_QUEUE_LIMIT", "5000");
        std::env::set_var("BATCHQ_EAGER_FIRST_ITEM", "true");
    }
    let engine = EngineConfig::from_env().unwrap();
    assert_eq!(engine.batch_size_limit, 100);
    assert_eq!(engine.period, Duration::from_millis(250));
    assert_eq!(engine.queue_limit, QueueLimit::Bounded(5000));
    assert!(engine.eagerly_emit_first_item);
    assert_eq!(engine.max_backoff, EngineConfig::default().max_backoff);

    unsafe {
        std::env::set_var("BATCHQ_QUEUE_LIMIT", "unbounded");
    }
    assert_eq!(EngineConfig::from_env().unwrap().queue_limit, QueueLimit::Unbounded);

    unsafe {
        std::env::set_var("BATCHQ_PERIOD_MS", "soon");
    }
    assert!(matches!(EngineConfig::from_env(), Err(Error::Config(_))));

    unsafe {
        std::env::set_var("BATCHQ_PERIOD_MS", "250");
        std::env::set_var("BATCHQ_BATCH_SIZE", "0");
    }
    assert!(matches!(EngineConfig::from_env(), Err(Error::Config(_))));

    clear_env();
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[test]
fn default_config_is_valid() {
    let config = EngineConfig::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.batch_size_limit, 50);
    assert_eq!(config.period, Duration::from_secs(2));
    assert_eq!(config.min_backoff, Duration::from_secs(5));
    assert_eq!(config.max_backoff, Duration::from_secs(600));
    assert_eq!(config.queue_limit, QueueLimit::Unbounded);
    assert!(!config.eagerly_emit_first_item);
}

#[test]
fn zero_values_are_rejected() {
    let invalid = [
        EngineConfig {
            batch_size_limit: 0,
            ..EngineConfig::default()
        },
        EngineConfig {
            period: Duration::ZERO,
            ..EngineConfig::default()
        },
        EngineConfig {
            min_backoff: Duration::ZERO,
            ..EngineConfig::default()
        },
        EngineConfig {
            max_backoff: Duration::ZERO,
            ..EngineConfig::default()
        },
        EngineConfig {
            queue_limit: QueueLimit::Bounded(0),
            ..EngineConfig::default()
        },
    ];
    for config in invalid {
        assert!(matches!(config.validate(), Err(Error::Config(_))), "{config:?}");
    }
}

// ---------------------------------------------------------------------------
// TOML
// ---------------------------------------------------------------------------

#[test]
fn toml_overrides_selected_keys() {
    let config = EngineConfig::from_toml_str(
        r#"
        batch_size_limit = 10
        period_ms = 500
        queue_limit = 1000
        "#,
    )
    .unwrap();
    assert_eq!(config.batch_size_limit, 10);
    assert_eq!(config.period, Duration::from_millis(500));
    assert_eq!(config.queue_limit, QueueLimit::Bounded(1000));
    assert_eq!(config.min_backoff, Duration::from_secs(5));
}

#[test]
fn empty_toml_is_all_defaults() {
    let file = FileConfig::from_toml_str("").unwrap();
    assert_eq!(file, FileConfig::default());
}

#[test]
fn toml_unknown_key_is_rejected() {
    let result = FileConfig::from_toml_str("batch_size = 10");
    assert!(matches!(result, Err(Error::Toml(_))));
}

#[test]
fn toml_invalid_value_is_rejected() {
    let result = FileConfig::from_toml_str("batch_size_limit = 0");
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn toml_retry_section() {
    let file = FileConfig::from_toml_str(
        r#"
        [retry]
        default_delay_ms = 2000
        delays_ms = { "0" = 1000, "3" = 30000, "10" = 300000 }
        "#,
    )
    .unwrap();

    assert_eq!(file.retry.default_delay, Duration::from_secs(2));
    let table = file.retry.table.unwrap();
    assert_eq!(table.len(), 3);
    assert_eq!(
        batchq::retry::find_delay(4, Some(&table), file.retry.default_delay),
        Duration::from_secs(30)
    );
}

#[test]
fn toml_file_is_loaded_from_disk() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "batch_size_limit = 7\neagerly_emit_first_item = true").unwrap();

    let config = FileConfig::from_toml_file(file.path()).unwrap();
    assert_eq!(config.engine.batch_size_limit, 7);
    assert!(config.engine.eagerly_emit_first_item);
}

#[test]
fn missing_toml_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = FileConfig::from_toml_file(dir.path().join("absent.toml"));
    match result {
        Err(Error::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::NotFound),
        other => panic!("expected Io error, got {other:?}"),
    }
}
