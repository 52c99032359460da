//! Settings loading with deep merge and environment variable overrides.
//!
//! 1. Start with compiled [`ParleySettings::default()`]
//! 2. Deep-merge `~/.parley/settings.json` (or an explicit file) over it
//! 3. Apply `PARLEY_*` environment overrides
//!
//! Merge rules: objects merge per key, arrays and primitives are replaced,
//! nulls in the file are skipped.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::{expand_home, ParleySettings, StoreSettings};

pub(crate) fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}

/// `~/.parley/settings.json`, or `$PARLEY_SETTINGS` when set.
pub fn settings_path() -> PathBuf {
    match std::env::var("PARLEY_SETTINGS") {
        Ok(path) if !path.is_empty() => expand_home(&path),
        _ => home_dir().join(".parley").join("settings.json"),
    }
}

/// Load from [`settings_path`] and apply `PARLEY_*` overrides.
pub fn load_settings() -> Result<ParleySettings> {
    load_settings_from_path(&settings_path())
}

/// A missing file yields defaults; a malformed one is an error.
pub fn load_settings_from_path(path: &Path) -> Result<ParleySettings> {
    let defaults = serde_json::to_value(ParleySettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let file: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, file)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: ParleySettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Recursive merge of `source` over `target`.
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
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `PARLEY_*` environment overrides.
pub fn apply_env_overrides(settings: &mut ParleySettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`. Values that fail to parse or
/// fall outside their range are ignored with a warning.
pub fn apply_overrides_from<F>(settings: &mut ParleySettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = Env { lookup };

    // server
    if let Some(v) = env.string("PARLEY_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u64_in("PARLEY_PORT", 1, 65_535) {
        settings.server.port = v as u16;
    }

    // executor
    if let Some(v) = env.u64_in("PARLEY_TURN_TIMEOUT_MS", 100, 3_600_000) {
        settings.executor.turn_timeout_ms = v;
    }
    if let Some(v) = env.u64_in("PARLEY_MAX_CLARIFICATION_ROUNDS", 1, 100) {
        settings.executor.max_clarification_rounds = v as u32;
    }
    if let Some(v) = env.u64_in("PARLEY_MAX_CONCURRENT_AGENTS", 1, 10_000) {
        settings.executor.max_concurrent_agents = Some(v as usize);
    }

    // webhook
    if let Some(v) = env.string("PARLEY_WEBHOOK_SECRET") {
        settings.webhook.secret = Some(v);
    }
    if let Some(v) = env.string("PARLEY_WEBHOOK_URL_TEMPLATE") {
        settings.webhook.url_template = Some(v);
    }
    if let Some(v) = env.u64_in("PARLEY_WEBHOOK_TOLERANCE_SECS", 1, 86_400) {
        settings.webhook.tolerance_secs = v;
    }

    // store
    if let Some(path) = env.string("PARLEY_STORE_PATH") {
        settings.store = StoreSettings::Sqlite { path };
    }

    // retry
    if let Some(v) = env.u64_in("PARLEY_MAX_RETRIES", 0, 10) {
        settings.retry.max_retries = v as u32;
    }

    // logging
    if let Some(v) = env.string("PARLEY_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("PARLEY_LOG_JSON") {
        settings.logging.json = v;
    }
}

/// Accepts (case-insensitive) `true`/`1`/`yes`/`on` and `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse an integer within `min..=max`.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = self.string(name)?;
        let parsed = parse_bool(&val);
        if parsed.is_none() {
            warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        parsed
    }

    fn u64_in(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = self.string(name)?;
        let parsed = parse_u64_range(&val, min, max);
        if parsed.is_none() {
            warn!(key = name, value = %val, min, max, "invalid integer env var, ignoring");
        }
        parsed
    }
}
