use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use tracing::warn;

pub const DEFAULT_SETTINGS_FILE: &str = "console.toml";

/// Floor for every timer period and the attachment TTL. A zero period would
/// make `tokio::time::interval` panic inside the timer task.
pub const MIN_TIMER_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub struct SyncSettings {
    pub server_url: String,
    pub reconnect_max_attempts: u32,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub match_tolerance: Duration,
    pub attachment_ttl: Duration,
    pub attachment_sweep_interval: Duration,
    pub poll_interval: Duration,
    pub history_page_size: u32,
    pub conversation_page_size: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            reconnect_max_attempts: 5,
            reconnect_base_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(8),
            match_tolerance: Duration::from_secs(10),
            attachment_ttl: Duration::from_secs(600),
            attachment_sweep_interval: Duration::from_secs(60),
            poll_interval: Duration::from_secs(5),
            history_page_size: 50,
            conversation_page_size: 25,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    server_url: Option<String>,
    reconnect_max_attempts: Option<u32>,
    reconnect_base_delay_ms: Option<u64>,
    reconnect_max_delay_ms: Option<u64>,
    match_tolerance_secs: Option<u64>,
    attachment_ttl_secs: Option<u64>,
    attachment_sweep_interval_secs: Option<u64>,
    poll_interval_secs: Option<u64>,
    history_page_size: Option<u32>,
    conversation_page_size: Option<u32>,
}

/// Raises a timer period below `MIN_TIMER_PERIOD` to the floor.
pub(crate) fn floor_period(name: &str, period: Duration) -> Duration {
    if period < MIN_TIMER_PERIOD {
        warn!(?period, floor = ?MIN_TIMER_PERIOD, "{name} below the minimum, raised");
        return MIN_TIMER_PERIOD;
    }
    period
}

/// Defaults, then `console.toml` in the working directory, then environment.
pub fn load_settings() -> SyncSettings {
    load_settings_from(Path::new(DEFAULT_SETTINGS_FILE), |key| std::env::var(key).ok())
}

pub fn load_settings_from(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> SyncSettings {
    let mut settings = SyncSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<FileSettings>(&raw) {
            Ok(file_cfg) => apply_file_settings(&mut settings, file_cfg),
            Err(err) => warn!(path = %path.display(), "ignoring malformed settings file: {err}"),
        }
    }

    if let Some(v) = env_value(&env, "CONSOLE_SERVER_URL", "APP__SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = env_parsed::<u32>(&env, "APP__RECONNECT_MAX_ATTEMPTS") {
        settings.reconnect_max_attempts = v;
    }
    if let Some(v) = env_parsed::<u64>(&env, "APP__RECONNECT_BASE_DELAY_MS") {
        settings.reconnect_base_delay = Duration::from_millis(v);
    }
    if let Some(v) = env_parsed::<u64>(&env, "APP__RECONNECT_MAX_DELAY_MS") {
        settings.reconnect_max_delay = Duration::from_millis(v);
    }
    if let Some(v) = env_parsed::<u64>(&env, "APP__MATCH_TOLERANCE_SECS") {
        settings.match_tolerance = Duration::from_secs(v);
    }
    if let Some(v) = env_parsed::<u64>(&env, "APP__ATTACHMENT_TTL_SECS") {
        settings.attachment_ttl = Duration::from_secs(v);
    }
    if let Some(v) = env_parsed::<u64>(&env, "APP__ATTACHMENT_SWEEP_INTERVAL_SECS") {
        settings.attachment_sweep_interval = Duration::from_secs(v);
    }
    if let Some(v) = env_parsed::<u64>(&env, "APP__POLL_INTERVAL_SECS") {
        settings.poll_interval = Duration::from_secs(v);
    }
    if let Some(v) = env_parsed::<u32>(&env, "APP__HISTORY_PAGE_SIZE") {
        settings.history_page_size = v;
    }
    if let Some(v) = env_parsed::<u32>(&env, "APP__CONVERSATION_PAGE_SIZE") {
        settings.conversation_page_size = v;
    }

    settings.normalized()
}

impl SyncSettings {
    fn normalized(mut self) -> Self {
        self.server_url = self.server_url.trim().trim_end_matches('/').to_string();
        self.reconnect_max_attempts = self.reconnect_max_attempts.max(1);
        self.history_page_size = self.history_page_size.clamp(1, 100);
        self.conversation_page_size = self.conversation_page_size.clamp(1, 100);
        self.attachment_ttl = self.attachment_ttl.max(MIN_TIMER_PERIOD);
        self.attachment_sweep_interval = self.attachment_sweep_interval.max(MIN_TIMER_PERIOD);
        self.poll_interval = self.poll_interval.max(MIN_TIMER_PERIOD);
        if self.reconnect_max_delay < self.reconnect_base_delay {
            self.reconnect_max_delay = self.reconnect_base_delay;
        }
        self
    }
}

fn apply_file_settings(settings: &mut SyncSettings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.server_url {
        settings.server_url = v;
    }
    if let Some(v) = file_cfg.reconnect_max_attempts {
        settings.reconnect_max_attempts = v;
    }
    if let Some(v) = file_cfg.reconnect_base_delay_ms {
        settings.reconnect_base_delay = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg.reconnect_max_delay_ms {
        settings.reconnect_max_delay = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg.match_tolerance_secs {
        settings.match_tolerance = Duration::from_secs(v);
    }
    if let Some(v) = file_cfg.attachment_ttl_secs {
        settings.attachment_ttl = Duration::from_secs(v);
    }
    if let Some(v) = file_cfg.attachment_sweep_interval_secs {
        settings.attachment_sweep_interval = Duration::from_secs(v);
    }
    if let Some(v) = file_cfg.poll_interval_secs {
        settings.poll_interval = Duration::from_secs(v);
    }
    if let Some(v) = file_cfg.history_page_size {
        settings.history_page_size = v;
    }
    if let Some(v) = file_cfg.conversation_page_size {
        settings.conversation_page_size = v;
    }
}

fn env_value(env: &impl Fn(&str) -> Option<String>, key: &str, alias: &str) -> Option<String> {
    env(alias).or_else(|| env(key))
}

fn env_parsed<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.trim().parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
