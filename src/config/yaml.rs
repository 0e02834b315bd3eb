use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

use super::ConfigError;
use crate::core::engine::{EngineKind, ToneEngineConfig};
use crate::core::pool::RoutingConfig;
use crate::core::segmenter::SegmenterConfig;
use crate::core::stream::ChunkingConfig;

/// Complete YAML configuration structure
///
/// All sections are optional to allow partial configuration. Sections that
/// environment variables can also set use all-optional fields so that a
/// partial YAML section only overrides what it names. The `segmenter`,
/// `routing` and `chunking` sections are YAML-only and fill unnamed fields
/// from defaults.
///
/// # Example YAML structure
/// ```yaml
/// server:
///   host: "0.0.0.0"
///   port: 3001
///   tls:
///     enabled: true
///     cert_path: "/etc/cadence/cert.pem"
///     key_path: "/etc/cadence/key.pem"
///
/// security:
///   cors_allowed_origins: "https://example.com"
///   rate_limit_requests_per_second: 60
///   rate_limit_burst_size: 10
///
/// segmenter:
///   max_segment_len: 300
///   first_segment_min_len: 10
///
/// pool:
///   max_concurrent_segments: 2
///   enable_accelerated_a: true
///   drain_timeout_ms: 30000
///
/// routing:
///   length_weight: 0.5
///   diversity_weight: 0.3
///   special_weight: 0.2
///
/// watchdog:
///   interval_secs: 3600
///   memory_delta_mb: 512
///   consecutive_checks: 3
///
/// chunking:
///   short_chunk_ms: 100
///
/// cache:
///   enabled: true
///   capacity: 1024
///   ttl_secs: 600
///
/// engine:
///   kind: remote
///   remote:
///     endpoints:
///       baseline: "http://127.0.0.1:8880/synthesize"
///     api_key: "sidecar-key"
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub server: Option<ServerYaml>,
    pub security: Option<SecurityYaml>,
    pub segmenter: Option<SegmenterConfig>,
    pub pool: Option<PoolYaml>,
    pub routing: Option<RoutingConfig>,
    pub watchdog: Option<WatchdogYaml>,
    pub chunking: Option<ChunkingConfig>,
    pub cache: Option<CacheYaml>,
    pub engine: Option<EngineYaml>,
}

/// Server configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ServerYaml {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub tls: Option<TlsYaml>,
}

/// TLS configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TlsYaml {
    pub enabled: Option<bool>,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
}

/// Security configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SecurityYaml {
    /// CORS allowed origins (comma-separated list or "*" for all)
    pub cors_allowed_origins: Option<String>,
    /// Maximum requests per second per IP address
    pub rate_limit_requests_per_second: Option<u32>,
    /// Maximum burst size for rate limiting
    pub rate_limit_burst_size: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PoolYaml {
    pub max_concurrent_segments: Option<usize>,
    pub enable_accelerated_a: Option<bool>,
    pub enable_accelerated_b: Option<bool>,
    pub accelerated_b_min_cores: Option<usize>,
    pub drain_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct WatchdogYaml {
    pub enabled: Option<bool>,
    pub interval_secs: Option<u64>,
    pub sample_interval_secs: Option<u64>,
    pub memory_delta_mb: Option<u64>,
    pub consecutive_checks: Option<u32>,
    pub fragmentation_threshold_pct: Option<f64>,
    pub cooldown_secs: Option<u64>,
    pub min_check_spacing_ms: Option<u64>,
    pub sample_capacity: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CacheYaml {
    pub enabled: Option<bool>,
    pub capacity: Option<u64>,
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct EngineYaml {
    pub kind: Option<EngineKind>,
    pub tone: Option<ToneEngineConfig>,
    pub remote: Option<RemoteYaml>,
}

/// Inference sidecar settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RemoteYaml {
    /// Endpoint per backend kind; merged over endpoints from the environment
    pub endpoints: HashMap<String, String>,
    pub api_key: Option<String>,
    pub timeout_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
}

impl YamlConfig {
    /// Load configuration from a YAML file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or the YAML is malformed
    pub fn from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        // An empty document deserializes to unit, not to an empty mapping
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(contents)?)
    }
}
