use super::*;

use std::{
    collections::HashMap,
    env,
    time::{SystemTime, UNIX_EPOCH},
};

fn temp_settings_file(contents: &str) -> std::path::PathBuf {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let path = env::temp_dir().join(format!("console_settings_test_{suffix}.toml"));
    fs::write(&path, contents).expect("write settings");
    path
}

#[test]
fn missing_file_and_env_yield_defaults() {
    let settings = load_settings_from(Path::new("/nonexistent/console.toml"), |_| None);
    assert_eq!(settings, SyncSettings::default());
}

#[test]
fn file_values_override_defaults() {
    let path = temp_settings_file(
        r#"
server_url = "https://console.example.com/"
reconnect_max_attempts = 3
attachment_ttl_secs = 30
history_page_size = 500
"#,
    );

    let settings = load_settings_from(&path, |_| None);
    assert_eq!(settings.server_url, "https://console.example.com");
    assert_eq!(settings.reconnect_max_attempts, 3);
    assert_eq!(settings.attachment_ttl, Duration::from_secs(30));
    assert_eq!(settings.history_page_size, 100);

    fs::remove_file(path).expect("cleanup");
}

#[test]
fn environment_overrides_file() {
    let path = temp_settings_file("poll_interval_secs = 9\nmatch_tolerance_secs = 4\n");
    let vars: HashMap<&str, &str> = HashMap::from([
        ("APP__POLL_INTERVAL_SECS", "2"),
        ("CONSOLE_SERVER_URL", "http://10.0.0.5:9000"),
        ("APP__RECONNECT_MAX_ATTEMPTS", "not-a-number"),
    ]);

    let settings = load_settings_from(&path, |key| vars.get(key).map(|v| v.to_string()));
    assert_eq!(settings.poll_interval, Duration::from_secs(2));
    assert_eq!(settings.match_tolerance, Duration::from_secs(4));
    assert_eq!(settings.server_url, "http://10.0.0.5:9000");
    assert_eq!(
        settings.reconnect_max_attempts,
        SyncSettings::default().reconnect_max_attempts
    );

    fs::remove_file(path).expect("cleanup");
}

#[test]
fn malformed_file_is_ignored() {
    let path = temp_settings_file("server_url = [unterminated");
    let settings = load_settings_from(&path, |_| None);
    assert_eq!(settings.server_url, SyncSettings::default().server_url);
    fs::remove_file(path).expect("cleanup");
}

#[test]
fn zero_timer_periods_are_raised_to_the_floor() {
    let path = temp_settings_file("poll_interval_secs = 0\nattachment_ttl_secs = 0\n");
    let vars: HashMap<&str, &str> = HashMap::from([("APP__ATTACHMENT_SWEEP_INTERVAL_SECS", "0")]);

    let settings = load_settings_from(&path, |key| vars.get(key).map(|v| v.to_string()));
    assert_eq!(settings.attachment_sweep_interval, MIN_TIMER_PERIOD);
    assert_eq!(settings.poll_interval, MIN_TIMER_PERIOD);
    assert_eq!(settings.attachment_ttl, MIN_TIMER_PERIOD);

    fs::remove_file(path).expect("cleanup");
}
