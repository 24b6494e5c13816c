use std::time::Duration;

use flowcoord::config::{Config, DEFAULT_CONNECTOR_TIMEOUT, DEFAULT_LOCK_TIMEOUT};

#[test]
fn defaults_are_valid() {
    let config = Config::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.lock_timeout, DEFAULT_LOCK_TIMEOUT);
    assert_eq!(config.connector_timeout, DEFAULT_CONNECTOR_TIMEOUT);
    assert_eq!(config.max_concurrent_connectors, 10);
    assert_eq!(config.reset_page_size, 100);
    assert_eq!(config.log_level, "info");
}

#[test]
fn toml_overrides_only_given_keys() {
    let config = Config::from_toml_str(
        r#"
        lock_timeout_secs = 5
        reset_page_size = 25

        [audit]
        executions_threshold = 3

        [dispatch]
        max_attempts = 7
        "#,
    )
    .unwrap();

    assert_eq!(config.lock_timeout, Duration::from_secs(5));
    assert_eq!(config.reset_page_size, 25);
    assert_eq!(config.audit.executions_threshold, 3);
    assert_eq!(config.audit.elapsed_duration, chrono::Duration::days(1));
    assert_eq!(config.dispatch.max_attempts, 7);
    assert_eq!(config.dispatch.max_concurrent, 4);
    assert_eq!(config.connector_timeout, DEFAULT_CONNECTOR_TIMEOUT);
}

#[test]
fn unknown_keys_are_rejected() {
    assert!(Config::from_toml_str("lock_timeout = 5").is_err());
}

#[test]
fn zero_values_fail_validation() {
    assert!(Config::from_toml_str("reset_page_size = 0").is_err());
    assert!(Config::from_toml_str("connector_timeout_secs = 0").is_err());
    assert!(Config::from_toml_str("[audit]\nelapsed_duration_secs = 60").is_err());
}

#[test]
fn audit_windows_beyond_chrono_range_are_rejected() {
    let err = Config::from_toml_str("[audit]\nelapsed_duration_secs = 9223372036854775807")
        .unwrap_err();
    assert!(matches!(err, flowcoord::Error::Config(_)));
    assert!(
        Config::from_toml_str("[audit]\nexecutions_duration_secs = -9223372036854775808")
            .is_err()
    );
}

#[test]
fn huge_lock_timeout_is_accepted() {
    let config = Config::from_toml_str("lock_timeout_secs = 9223372036854775807").unwrap();
    assert_eq!(config.lock_timeout, Duration::from_secs(i64::MAX as u64));
}

#[test]
fn missing_file_is_a_config_error() {
    let err = Config::load_from_file(std::path::Path::new("/nonexistent/flowcoord.toml"))
        .unwrap_err();
    assert!(matches!(err, flowcoord::Error::Config(_)));
}

// All environment handling lives in one test: the process environment is
// shared between test threads.
#[test]
fn config_from_env_reads_overrides_and_rejects_garbage() {
    unsafe {
        std::env::set_var("FLOWCOORD_LOCK_TIMEOUT_SECS", "15");
        std::env::set_var("FLOWCOORD_AUDIT_EXECUTIONS_THRESHOLD", "4");
        std::env::set_var("LOG_LEVEL", "debug");
    }

    let config = Config::from_env().unwrap();
    assert_eq!(config.lock_timeout, Duration::from_secs(15));
    assert_eq!(config.audit.executions_threshold, 4);
    assert_eq!(config.log_level, "debug");

    unsafe {
        std::env::set_var("FLOWCOORD_RESET_PAGE_SIZE", "lots");
    }
    assert!(Config::from_env().is_err());

    unsafe {
        std::env::remove_var("FLOWCOORD_RESET_PAGE_SIZE");
        std::env::set_var("FLOWCOORD_AUDIT_ELAPSED_DURATION_SECS", "9223372036854775807");
    }
    assert!(matches!(Config::from_env(), Err(flowcoord::Error::Config(_))));

    unsafe {
        std::env::remove_var("FLOWCOORD_AUDIT_ELAPSED_DURATION_SECS");
        std::env::remove_var("FLOWCOORD_LOCK_TIMEOUT_SECS");
        std::env::remove_var("FLOWCOORD_AUDIT_EXECUTIONS_THRESHOLD");
        std::env::remove_var("FLOWCOORD_RESET_PAGE_SIZE");
        std::env::remove_var("LOG_LEVEL");
    }
}
