use std::sync::Mutex;
use vessel::config::resolve_config;

/* Environment-variable overrides are process-global, keep these tests
 * from interleaving. */
static ENV_MUTEX: Mutex<()> = Mutex::new(());

#[test]
fn test_defaults() {
    let _guard = ENV_MUTEX.lock().expect("lock");

    let config = resolve_config().expect("resolve");
    assert!(config.network_enabled);
    assert!(!config.network_debug);
    assert!(config.tmp_dir.is_absolute());
    assert_eq!(config.sources.get("network_enabled").map(String::as_str), Some("default"));
}

#[test]
fn test_environment_overrides() {
    let _guard = ENV_MUTEX.lock().expect("lock");

    unsafe {
        std::env::set_var("VESSEL_NETWORK_ENABLED", "false");
        std::env::set_var("VESSEL_TMP_DIR", "/tmp/vessel-test");
        std::env::set_var("VESSEL_LOG_VERBOSE", "true");
    }

    let config = resolve_config().expect("resolve");
    assert!(!config.network_enabled);
    assert!(config.log_verbose);
    assert_eq!(config.tmp_dir, std::path::PathBuf::from("/tmp/vessel-test"));
    assert_eq!(
        config.sources.get("network_enabled").map(String::as_str),
        Some("environment")
    );

    unsafe {
        std::env::remove_var("VESSEL_NETWORK_ENABLED");
        std::env::remove_var("VESSEL_TMP_DIR");
        std::env::remove_var("VESSEL_LOG_VERBOSE");
    }
}

#[test]
fn test_invalid_environment_value_is_rejected() {
    let _guard = ENV_MUTEX.lock().expect("lock");

    unsafe {
        std::env::set_var("VESSEL_NETWORK_ENABLED", "maybe");
    }

    assert!(resolve_config().is_err());

    unsafe {
        std::env::remove_var("VESSEL_NETWORK_ENABLED");
    }
}
