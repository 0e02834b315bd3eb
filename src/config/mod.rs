//! Configuration module for the Cadence gateway
//!
//! This module handles server configuration from various sources: .env files, YAML files,
//! and environment variables. Priority: YAML > ENV vars > .env values > defaults.
//!
//! # Modules
//! - `yaml`: YAML configuration file loading
//! - `env`: Environment variable loading
//! - `merge`: Merging YAML and environment configurations
//! - `validation`: Configuration validation logic
//!
//! # Example
//! ```rust,no_run
//! use cadence_gateway::config::ServerConfig;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load from environment variables only
//! let config = ServerConfig::from_env()?;
//!
//! // Load from YAML file with environment variable base
//! let config_path = PathBuf::from("config.yaml");
//! let config = ServerConfig::from_file(&config_path)?;
//!
//! println!("Server listening on {}", config.address());
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;

mod env;
mod merge;
mod validation;
mod yaml;

pub use env::EnvConfig;
pub use yaml::YamlConfig;

use crate::core::cache::CacheConfig;
use crate::core::engine::EngineConfig;
use crate::core::pipeline::PipelineConfig;
use crate::core::pool::{PoolConfig, RoutingConfig};
use crate::core::segmenter::SegmenterConfig;
use crate::core::stream::ChunkingConfig;
use crate::core::watchdog::WatchdogConfig;

/// Configuration loading and validation failures
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse YAML config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid value '{value}' for {var}: {reason}")]
    InvalidEnv {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// TLS configuration for HTTPS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    /// Path to the TLS certificate file (PEM format)
    pub cert_path: PathBuf,
    /// Path to the TLS private key file (PEM format)
    pub key_path: PathBuf,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,

    /// TLS configuration (optional)
    pub tls: Option<TlsConfig>,

    // Security
    /// CORS allowed origins (comma-separated list or "*" for all)
    /// Default: None (CORS disabled)
    pub cors_allowed_origins: Option<String>,
    /// Maximum requests per second per IP address
    /// Default: 60
    pub rate_limit_requests_per_second: u32,
    /// Maximum burst size for rate limiting
    /// Default: 10
    pub rate_limit_burst_size: u32,

    // Synthesis pipeline
    pub segmenter: SegmenterConfig,
    pub pool: PoolConfig,
    pub routing: RoutingConfig,
    pub watchdog: WatchdogConfig,
    pub chunking: ChunkingConfig,
    pub cache: CacheConfig,
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            tls: None,
            cors_allowed_origins: None,
            rate_limit_requests_per_second: 60,
            rate_limit_burst_size: 10,
            segmenter: SegmenterConfig::default(),
            pool: PoolConfig::default(),
            routing: RoutingConfig::default(),
            watchdog: WatchdogConfig::default(),
            chunking: ChunkingConfig::default(),
            cache: CacheConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

/// Zeroize the sidecar API key when the configuration is dropped
impl Drop for ServerConfig {
    fn drop(&mut self) {
        use zeroize::Zeroize;

        if let Some(ref mut key) = self.engine.remote.api_key {
            key.zeroize();
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables only
    ///
    /// The `.env` file is loaded into the process environment in `main.rs`,
    /// so actual environment variables take precedence over it.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_sources(None, &EnvConfig::from_env()?)
    }

    /// Load configuration from a YAML file with environment variable base
    ///
    /// Priority order (highest to lowest):
    /// 1. YAML file values
    /// 2. Environment variables (actual ENV vars override .env values)
    /// 3. .env file values
    /// 4. Default values
    ///
    /// # Errors
    /// Returns an error if:
    /// - The YAML file cannot be read or is malformed
    /// - Environment variables have invalid formats
    /// - Configuration validation fails
    ///
    /// # Example
    /// ```rust,no_run
    /// use cadence_gateway::config::ServerConfig;
    /// use std::path::PathBuf;
    ///
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let config = ServerConfig::from_file(&PathBuf::from("config.yaml"))?;
    /// println!("Server listening on {}", config.address());
    /// # Ok(())
    /// # }
    /// ```
    pub fn from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let yaml_config = YamlConfig::from_file(path)?;
        Self::from_sources(Some(yaml_config), &EnvConfig::from_env()?)
    }

    /// Merge explicit sources and validate the result
    pub fn from_sources(yaml: Option<YamlConfig>, env: &EnvConfig) -> Result<Self, ConfigError> {
        let config = merge::merge_config(yaml, env);
        validation::validate(&config)?;
        Ok(config)
    }

    /// Get the server address as "host:port"
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if TLS is enabled
    pub fn is_tls_enabled(&self) -> bool {
        self.tls.is_some()
    }

    /// Pipeline settings for [`crate::core::PipelineContext`]
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            segmenter: self.segmenter.clone(),
            pool: self.pool.clone(),
            routing: self.routing.clone(),
            watchdog: self.watchdog.clone(),
            chunking: self.chunking.clone(),
            cache: self.cache.clone(),
        }
    }
}
