//! Driver configuration maps and backend composition options.

use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{PhysicalError, Result};
use crate::permit::DEFAULT_PARALLEL_OPERATIONS;

/// The string map every driver is configured from.
#[derive(Debug, Clone, Default)]
pub struct BackendConfig {
    values: HashMap<String, String>,
}

impl BackendConfig {
    pub fn new(values: HashMap<String, String>) -> Self {
        Self { values }
    }

    /// Value for `key`, treating empty strings as missing.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// Value for `key`, failing startup if it is missing.
    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| PhysicalError::Config(format!("'{key}' must be set")))
    }

    /// Environment variable `env` if set, else the config value.
    pub fn get_or_env(&self, key: &str, env: &str) -> Option<String> {
        match std::env::var(env) {
            Ok(v) if !v.is_empty() => Some(v),
            _ => self.get(key).map(str::to_string),
        }
    }

    /// Like [`get_or_env`](Self::get_or_env) but mandatory.
    pub fn require_or_env(&self, key: &str, env: &str) -> Result<String> {
        self.get_or_env(key, env).ok_or_else(|| {
            PhysicalError::Config(format!("'{key}' must be set (or the {env} environment variable)"))
        })
    }

    /// Parse `key` into `T`, or `None` when unset.
    pub fn parse<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.get(key) {
            Some(raw) => parse_value(key, raw).map(Some),
            None => Ok(None),
        }
    }

    pub fn parse_or<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        Ok(self.parse(key)?.unwrap_or(default))
    }

    pub fn parse_bool(&self, key: &str) -> Result<bool> {
        match self.get(key) {
            Some(raw) => parse_bool(key, raw),
            None => Ok(false),
        }
    }

    pub fn parse_duration(&self, key: &str, default: Duration) -> Result<Duration> {
        match self.get(key) {
            Some(raw) => parse_duration(raw)
                .ok_or_else(|| PhysicalError::Config(format!("invalid duration for '{key}': {raw}"))),
            None => Ok(default),
        }
    }

    /// The `max_parallel` setting, defaulting to 128.
    pub fn max_parallel(&self) -> Result<usize> {
        let value = self.parse_or("max_parallel", DEFAULT_PARALLEL_OPERATIONS)?;
        if value > 0 {
            tracing::debug!(max_parallel = value, "max_parallel set");
            Ok(value)
        } else {
            Ok(DEFAULT_PARALLEL_OPERATIONS)
        }
    }
}

impl From<HashMap<String, String>> for BackendConfig {
    fn from(values: HashMap<String, String>) -> Self {
        Self::new(values)
    }
}

impl<const N: usize> From<[(&str, &str); N]> for BackendConfig {
    fn from(pairs: [(&str, &str); N]) -> Self {
        Self::new(
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    raw.trim()
        .parse()
        .map_err(|e| PhysicalError::Config(format!("failed parsing '{key}' = {raw:?}: {e}")))
}

pub(crate) fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "t" | "true" | "yes" => Ok(true),
        "0" | "f" | "false" | "no" => Ok(false),
        _ => Err(PhysicalError::Config(format!(
            "failed parsing '{key}' as a boolean: {raw:?}"
        ))),
    }
}

/// Parse `"500ms"`, `"30s"`, `"2m"`, `"1h"` or a bare number of seconds.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (num, unit) = raw.split_at(split);
    let n: u64 = num.parse().ok()?;
    match unit {
        "" | "s" => Some(Duration::from_secs(n)),
        "ms" => Some(Duration::from_millis(n)),
        "m" => n.checked_mul(60).map(Duration::from_secs),
        "h" => n.checked_mul(3600).map(Duration::from_secs),
        _ => None,
    }
}

/// Which decorators wrap the configured driver at boot.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LayerOptions {
    /// Confine every key under this prefix.
    pub view_prefix: Option<String>,
    /// Reject non-UTF-8 and non-printable keys before they reach storage.
    pub enforce_key_encoding: bool,
    pub disable_cache: bool,
    /// Cache size in entries; 0 selects the default.
    pub cache_size: i64,
    pub cache_exceptions: Vec<String>,
    /// Latency to inject before every operation, in milliseconds.
    pub latency_ms: Option<u64>,
    pub jitter_percent: Option<i64>,
}
