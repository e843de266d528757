use std::{fs, path::Path, time::Duration};

use tracing::warn;
use url::Url;

use crate::error::{ClientError, ClientResult};

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8000";
pub const DEFAULT_NOTIFICATION_TIMEOUT_MS: u64 = 5000;
const SETTINGS_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub api_base_url: String,
    pub notification_timeout_ms: u64,
    /// No client-side timeout unless set; a hanging request keeps the caller waiting.
    pub request_timeout_secs: Option<u64>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.into(),
            notification_timeout_ms: DEFAULT_NOTIFICATION_TIMEOUT_MS,
            request_timeout_secs: None,
        }
    }
}

impl ClientSettings {
    pub fn notification_timeout(&self) -> Duration {
        Duration::from_millis(self.notification_timeout_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn base_url(&self) -> ClientResult<Url> {
        parse_base_url(&self.api_base_url)
    }
}

pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new(SETTINGS_FILE), |key| std::env::var(key).ok())
}

pub fn load_settings_from(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<toml::Table>(&raw) {
            Ok(file_cfg) => {
                if let Some(v) = file_cfg.get("api_base_url").and_then(|v| v.as_str()) {
                    settings.api_base_url = v.to_string();
                }
                if let Some(v) = file_cfg.get("notification_timeout_ms") {
                    match v.as_integer().and_then(|n| u64::try_from(n).ok()) {
                        Some(ms) => settings.notification_timeout_ms = ms,
                        None => warn!(value = %v, "ignoring invalid notification_timeout_ms"),
                    }
                }
                if let Some(v) = file_cfg.get("request_timeout_secs") {
                    match v.as_integer().and_then(|n| u64::try_from(n).ok()) {
                        Some(secs) => settings.request_timeout_secs = Some(secs),
                        None => warn!(value = %v, "ignoring invalid request_timeout_secs"),
                    }
                }
            }
            Err(err) => warn!(path = %path.display(), "ignoring unreadable settings file: {err}"),
        }
    }

    if let Some(v) = env("POLIS_API_URL") {
        settings.api_base_url = v;
    }
    if let Some(v) = env("APP__API_URL") {
        settings.api_base_url = v;
    }

    if let Some(v) = env("APP__NOTIFICATION_TIMEOUT_MS") {
        match v.parse::<u64>() {
            Ok(ms) => settings.notification_timeout_ms = ms,
            Err(_) => warn!(value = %v, "ignoring invalid APP__NOTIFICATION_TIMEOUT_MS"),
        }
    }

    if let Some(v) = env("APP__REQUEST_TIMEOUT_SECS") {
        match v.parse::<u64>() {
            Ok(secs) => settings.request_timeout_secs = Some(secs),
            Err(_) => warn!(value = %v, "ignoring invalid APP__REQUEST_TIMEOUT_SECS"),
        }
    }

    settings
}

pub fn parse_base_url(raw: &str) -> ClientResult<Url> {
    let trimmed = raw.trim().trim_end_matches('/');
    let invalid = |reason: String| ClientError::InvalidBaseUrl {
        url: raw.to_string(),
        reason,
    };

    if trimmed.is_empty() {
        return Err(invalid("empty".into()));
    }

    let url = Url::parse(trimmed).map_err(|e| invalid(e.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(invalid(format!("unsupported scheme '{other}'"))),
    }
}

#[cfg(test)]
#[path = "tests/settings_tests.rs"]
mod tests;
