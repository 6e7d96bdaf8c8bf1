use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, OnceLock};

use odo::config::{default_config_path, default_state_path, resolve_config_path, Settings};

static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

fn env_lock() -> MutexGuard<'static, ()> {
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct EnvGuard {
    key: &'static str,
    old: Option<std::ffi::OsString>,
}

impl EnvGuard {
    fn set(key: &'static str, val: &str) -> Self {
        let old = std::env::var_os(key);
        std::env::set_var(key, val);
        Self { key, old }
    }

    fn remove(key: &'static str) -> Self {
        let old = std::env::var_os(key);
        std::env::remove_var(key);
        Self { key, old }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        match self.old.take() {
            Some(v) => std::env::set_var(self.key, v),
            None => std::env::remove_var(self.key),
        }
    }
}

#[test]
fn test_defaults() {
    let settings = Settings::default();
    assert!(settings.validate().is_ok());
    assert_eq!(settings.server_url(false), "https://odo.ist");
    assert_eq!(settings.server_url(true), "http://localhost:8080");
    assert_eq!(settings.tracking.recheck_delays_ms, vec![1500, 3000]);
    assert_eq!(settings.detector.title_suffix, "YouTube Music");

    let tracker = settings.tracker_config();
    assert_eq!(tracker.stale_after, chrono::Duration::minutes(5));
    assert_eq!(tracker.artist_retry_limit, 5);
    assert_eq!(tracker.min_listen_secs, 3.0);
    assert_eq!(tracker.history_cap, 1000);
}

#[test]
fn test_validate_rejects_bad_values() {
    let mut settings = Settings::default();
    settings.tracking.poll_interval_ms = 0;
    assert!(settings.validate().is_err());

    let mut settings = Settings::default();
    settings.tracking.artist_retry_delay_ms = 0;
    assert!(settings.validate().is_err());

    let mut settings = Settings::default();
    settings.server.prod_url = "  ".to_string();
    assert!(settings.validate().is_err());
}

#[test]
fn test_file_then_env_precedence() {
    let _lock = env_lock();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
[server]
prod_url = "https://example.test"

[tracking]
poll_interval_ms = 2500
debounce_ms = 250

[detector]
title_suffix = "Music"
"#,
    )
    .unwrap();

    let _g1 = EnvGuard::set("ODO_CONFIG_PATH", path.to_str().unwrap());
    let _g2 = EnvGuard::set("ODO__TRACKING__DEBOUNCE_MS", "750");

    let settings = Settings::load().unwrap();
    assert_eq!(settings.server.prod_url, "https://example.test");
    assert_eq!(settings.server.dev_url, "http://localhost:8080");
    assert_eq!(settings.tracking.poll_interval_ms, 2500);
    assert_eq!(settings.tracking.debounce_ms, 750);
    assert_eq!(settings.detector.title_suffix, "Music");
    assert_eq!(settings.detector.player_bar_selector, "ytmusic-player-bar");
}

#[test]
fn test_missing_file_falls_back_to_defaults() {
    let _lock = env_lock();
    let _g1 = EnvGuard::set("ODO_CONFIG_PATH", "/nonexistent/odo/config.toml");
    let settings = Settings::load().unwrap();
    assert_eq!(settings.tracking.poll_interval_ms, 10_000);
}

#[test]
fn test_config_path_resolution() {
    let _lock = env_lock();
    let _g1 = EnvGuard::set("ODO_CONFIG_PATH", "/tmp/odo-test-config.toml");
    assert_eq!(resolve_config_path(), Some(PathBuf::from("/tmp/odo-test-config.toml")));

    let _g2 = EnvGuard::remove("ODO_CONFIG_PATH");
    let _g3 = EnvGuard::set("XDG_CONFIG_HOME", "/tmp/xdg-config-home");
    assert_eq!(
        default_config_path(),
        Some(PathBuf::from("/tmp/xdg-config-home/odo/config.toml"))
    );
    assert_eq!(resolve_config_path(), default_config_path());
}

#[test]
fn test_state_path_resolution() {
    let _lock = env_lock();
    let _g1 = EnvGuard::set("XDG_DATA_HOME", "/tmp/xdg-data-home");
    assert_eq!(
        default_state_path(),
        Some(PathBuf::from("/tmp/xdg-data-home/odo/state.json"))
    );

    let mut settings = Settings::default();
    assert_eq!(settings.state_path(), default_state_path());
    settings.storage.path = Some(PathBuf::from("/var/lib/odo/state.json"));
    assert_eq!(settings.state_path(), Some(PathBuf::from("/var/lib/odo/state.json")));
}
