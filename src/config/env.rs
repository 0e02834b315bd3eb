use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

use super::{ConfigError, TlsConfig};
use crate::core::engine::EngineKind;

/// Every environment variable the gateway reads
pub(crate) const ALL_VARS: &[&str] = &[
    "HOST",
    "PORT",
    "TLS_ENABLED",
    "TLS_CERT_PATH",
    "TLS_KEY_PATH",
    "CORS_ALLOWED_ORIGINS",
    "RATE_LIMIT_REQUESTS_PER_SECOND",
    "RATE_LIMIT_BURST_SIZE",
    "MAX_CONCURRENT_SEGMENTS",
    "ENABLE_ACCELERATED_A",
    "ENABLE_ACCELERATED_B",
    "DRAIN_TIMEOUT_MS",
    "WATCHDOG_ENABLED",
    "WATCHDOG_INTERVAL_SECS",
    "WATCHDOG_MEMORY_DELTA_MB",
    "CACHE_ENABLED",
    "CACHE_CAPACITY",
    "CACHE_TTL_SECS",
    "ENGINE_KIND",
    "REMOTE_BASELINE_URL",
    "REMOTE_ACCELERATED_A_URL",
    "REMOTE_ACCELERATED_B_URL",
    "REMOTE_API_KEY",
    "REMOTE_TIMEOUT_MS",
];

/// Values read from the environment
///
/// Every field is optional; unset variables leave the default (or the YAML
/// value) in place during the merge.
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub tls: Option<TlsConfig>,
    pub cors_allowed_origins: Option<String>,
    pub rate_limit_requests_per_second: Option<u32>,
    pub rate_limit_burst_size: Option<u32>,
    pub max_concurrent_segments: Option<usize>,
    pub enable_accelerated_a: Option<bool>,
    pub enable_accelerated_b: Option<bool>,
    pub drain_timeout_ms: Option<u64>,
    pub watchdog_enabled: Option<bool>,
    pub watchdog_interval_secs: Option<u64>,
    pub watchdog_memory_delta_mb: Option<u64>,
    pub cache_enabled: Option<bool>,
    pub cache_capacity: Option<u64>,
    pub cache_ttl_secs: Option<u64>,
    pub engine_kind: Option<EngineKind>,
    /// Sidecar endpoints keyed like the YAML `engine.remote.endpoints` map
    pub remote_endpoints: HashMap<String, String>,
    pub remote_api_key: Option<String>,
    pub remote_timeout_ms: Option<u64>,
}

impl EnvConfig {
    /// Read the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Read values through `lookup`; empty values count as unset
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|value| !value.trim().is_empty());

        let tls = if parse_bool(&get, "TLS_ENABLED")?.unwrap_or(false) {
            let cert_path = get("TLS_CERT_PATH").ok_or_else(|| ConfigError::InvalidEnv {
                var: "TLS_CERT_PATH",
                value: String::new(),
                reason: "required when TLS_ENABLED is true".to_string(),
            })?;
            let key_path = get("TLS_KEY_PATH").ok_or_else(|| ConfigError::InvalidEnv {
                var: "TLS_KEY_PATH",
                value: String::new(),
                reason: "required when TLS_ENABLED is true".to_string(),
            })?;
            Some(TlsConfig {
                cert_path: PathBuf::from(cert_path),
                key_path: PathBuf::from(key_path),
            })
        } else {
            None
        };

        let engine_kind = match get("ENGINE_KIND") {
            None => None,
            Some(value) => Some(match value.trim().to_ascii_lowercase().as_str() {
                "tone" => EngineKind::Tone,
                "remote" => EngineKind::Remote,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        var: "ENGINE_KIND",
                        value,
                        reason: "expected 'tone' or 'remote'".to_string(),
                    });
                }
            }),
        };

        let mut remote_endpoints = HashMap::new();
        for (var, key) in [
            ("REMOTE_BASELINE_URL", "baseline"),
            ("REMOTE_ACCELERATED_A_URL", "accelerated_a"),
            ("REMOTE_ACCELERATED_B_URL", "accelerated_b"),
        ] {
            if let Some(url) = get(var) {
                remote_endpoints.insert(key.to_string(), url);
            }
        }

        Ok(Self {
            host: get("HOST"),
            port: parse(&get, "PORT")?,
            tls,
            cors_allowed_origins: get("CORS_ALLOWED_ORIGINS"),
            rate_limit_requests_per_second: parse(&get, "RATE_LIMIT_REQUESTS_PER_SECOND")?,
            rate_limit_burst_size: parse(&get, "RATE_LIMIT_BURST_SIZE")?,
            max_concurrent_segments: parse(&get, "MAX_CONCURRENT_SEGMENTS")?,
            enable_accelerated_a: parse_bool(&get, "ENABLE_ACCELERATED_A")?,
            enable_accelerated_b: parse_bool(&get, "ENABLE_ACCELERATED_B")?,
            drain_timeout_ms: parse(&get, "DRAIN_TIMEOUT_MS")?,
            watchdog_enabled: parse_bool(&get, "WATCHDOG_ENABLED")?,
            watchdog_interval_secs: parse(&get, "WATCHDOG_INTERVAL_SECS")?,
            watchdog_memory_delta_mb: parse(&get, "WATCHDOG_MEMORY_DELTA_MB")?,
            cache_enabled: parse_bool(&get, "CACHE_ENABLED")?,
            cache_capacity: parse(&get, "CACHE_CAPACITY")?,
            cache_ttl_secs: parse(&get, "CACHE_TTL_SECS")?,
            engine_kind,
            remote_endpoints,
            remote_api_key: get("REMOTE_API_KEY"),
            remote_timeout_ms: parse(&get, "REMOTE_TIMEOUT_MS")?,
        })
    }
}

fn parse<T, G>(get: &G, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidEnv {
                var,
                reason: e.to_string(),
                value,
            }),
    }
}

fn parse_bool<G>(get: &G, var: &'static str) -> Result<Option<bool>, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        None => Ok(None),
        Some(value) => match value.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Some(true)),
            "false" | "0" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidEnv {
                var,
                value,
                reason: "expected a boolean".to_string(),
            }),
        },
    }
}
