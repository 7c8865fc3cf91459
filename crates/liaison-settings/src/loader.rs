//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`LiaisonSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `LIAISON_*` environment overrides (highest priority)
//! 4. Validate

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::{liaison_home, LiaisonSettings};

/// Default settings file, `~/.liaison/settings.json`.
pub fn settings_path() -> PathBuf {
    liaison_home().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<LiaisonSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. A file with invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<LiaisonSettings> {
    let mut settings = read_file_layer(path)?;
    apply_env_overrides(&mut settings);
    validate(&settings)?;
    Ok(settings)
}

fn read_file_layer(path: &Path) -> Result<LiaisonSettings> {
    let defaults = serde_json::to_value(LiaisonSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `LIAISON_*` overrides from the process environment.
pub fn apply_env_overrides(settings: &mut LiaisonSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary lookup. Invalid values are logged and
/// ignored, leaving the file/default value in place.
pub fn apply_overrides_from<F>(settings: &mut LiaisonSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    if let Some(v) = env.string("LIAISON_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u16("LIAISON_PORT", 1, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = env.string("LIAISON_DB_PATH") {
        settings.storage.db_path = v;
    }
    if let Some(v) = env.bool("LIAISON_LOG_TO_SQLITE") {
        settings.storage.log_to_sqlite = v;
    }
    if let Some(v) = env.string("LIAISON_LIVE_AGENT_URL") {
        settings.live_agent.base_url = v;
    }
    if let Some(v) = env.string("LIAISON_BOT_CHANNEL_URL") {
        settings.bot_channel.base_url = v;
    }
    if let Some(v) = env.string("LIAISON_BOT_CHANNEL_TOKEN") {
        settings.bot_channel.token = Some(v);
    }
    if let Some(v) = env.string("LIAISON_CONTACTS_URL") {
        settings.contacts.base_url = v;
    }
    if let Some(v) = env.string("LIAISON_CLIENT_SCOPE") {
        settings.session.client_scope = v;
    }
    if let Some(v) = env.u64("LIAISON_POLL_INTERVAL_MS", 100, 600_000) {
        settings.session.poll_interval_ms = v;
    }
    if let Some(v) = env.string("LIAISON_LOG_LEVEL") {
        settings.logging.level = v;
    }
}

/// Reject settings the bridge cannot run with.
pub fn validate(settings: &LiaisonSettings) -> Result<()> {
    let session = &settings.session;
    if session.client_scope.trim().is_empty() {
        return Err(SettingsError::InvalidValue("session.clientScope must not be empty".into()));
    }
    if session.poll_interval_ms == 0 {
        return Err(SettingsError::InvalidValue("session.pollIntervalMs must be > 0".into()));
    }
    if session.dispatch_timeout_ms == 0 {
        return Err(SettingsError::InvalidValue("session.dispatchTimeoutMs must be > 0".into()));
    }
    if settings.live_agent.poll_timeout_ms == 0 || settings.live_agent.request_timeout_ms == 0 {
        return Err(SettingsError::InvalidValue("liveAgent timeouts must be > 0".into()));
    }
    Ok(())
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.lookup)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        let val = (self.lookup)(name)?;
        let result = parse_u16_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }
}
