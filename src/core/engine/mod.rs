//! Synthesis engine boundary
//!
//! The neural synthesis engine is an opaque collaborator. This module defines
//! the blocking [`SynthesisEngine`] trait the backend pool drives, the
//! [`EngineFactory`] that constructs one engine per [`BackendKind`], and the
//! two engines shipped with the gateway:
//!
//! - [`ToneEngine`] - deterministic built-in engine for development and load tests
//! - [`RemoteEngine`] - forwards requests to an inference sidecar over HTTP
//!
//! Engine calls are synchronous and potentially slow. Callers must run them on
//! a blocking thread (`tokio::task::spawn_blocking`), never on a request task.

pub mod capabilities;
pub mod remote;
pub mod tone;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub use capabilities::{BackendKind, HardwareCapabilities};
pub use remote::{RemoteEngine, RemoteEngineConfig};
pub use tone::{ToneEngine, ToneEngineConfig};

/// Voice parameters shared by every segment of a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceSettings {
    pub voice: String,
    pub speed: f32,
    pub lang: String,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            voice: "default".to_string(),
            speed: 1.0,
            lang: "en-us".to_string(),
        }
    }
}

/// A single synthesis call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SynthesisRequest {
    pub text: String,
    pub voice: String,
    pub speed: f32,
    pub lang: String,
}

impl SynthesisRequest {
    pub fn new(text: impl Into<String>, settings: &VoiceSettings) -> Self {
        Self {
            text: text.into(),
            voice: settings.voice.clone(),
            speed: settings.speed,
            lang: settings.lang.clone(),
        }
    }
}

/// Mono PCM produced by an engine
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedAudio {
    /// Samples normalized to [-1, 1]
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl SynthesizedAudio {
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.samples.len() as u64 * 1000 / self.sample_rate as u64
    }
}

/// Tagged failure of a synthesis call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SynthesisError {
    /// Retryable on another backend
    #[error("Transient synthesis failure: {0}")]
    Transient(String),

    /// Not retryable
    #[error("Fatal synthesis failure: {0}")]
    Fatal(String),
}

impl SynthesisError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SynthesisError::Transient(_))
    }
}

pub type SynthesisResult<T> = Result<T, SynthesisError>;

/// Engine construction failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineInitError {
    #[error("Backend kind {0} is not supported by this engine configuration")]
    Unsupported(BackendKind),

    #[error("Failed to initialize {kind} engine: {reason}")]
    Failed { kind: BackendKind, reason: String },
}

/// A synthesis engine instance bound to one backend
///
/// Implementations are driven from a blocking thread while the owning
/// backend's mutex is held, so `&mut self` access is exclusive.
pub trait SynthesisEngine: Send {
    /// Synthesize one segment
    fn synthesize(&mut self, request: &SynthesisRequest) -> SynthesisResult<SynthesizedAudio>;

    /// Release native resources before the engine is dropped
    fn teardown(&mut self) {}

    /// Short name for logs
    fn name(&self) -> &str;
}

/// Constructs engines for the backend pool
pub trait EngineFactory: Send + Sync {
    /// Build the engine for `kind`; called on a blocking thread
    fn create(
        &self,
        kind: BackendKind,
        capabilities: &HardwareCapabilities,
    ) -> Result<Box<dyn SynthesisEngine>, EngineInitError>;

    /// Backend kinds this factory can construct
    fn supported_kinds(&self) -> Vec<BackendKind> {
        BackendKind::ALL.to_vec()
    }

    /// Reclaim shared resources after every engine has been torn down
    fn reclaim(&self) {}
}

/// Which engine implementation the built-in factory constructs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    #[default]
    Tone,
    Remote,
}

/// Engine configuration
///
/// # Example YAML
/// ```yaml
/// engine:
///   kind: remote
///   remote:
///     endpoints:
///       baseline: "http://127.0.0.1:8880/synthesize"
///       accelerated_a: "http://gpu-host:8880/synthesize"
///     timeout_ms: 30000
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub kind: EngineKind,
    pub tone: ToneEngineConfig,
    pub remote: RemoteEngineConfig,
}

/// Factory for the engines shipped with the gateway
pub struct BuiltinEngineFactory {
    config: EngineConfig,
}

impl BuiltinEngineFactory {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }
}

impl EngineFactory for BuiltinEngineFactory {
    fn supported_kinds(&self) -> Vec<BackendKind> {
        match self.config.kind {
            EngineKind::Tone => BackendKind::ALL.to_vec(),
            EngineKind::Remote => BackendKind::ALL
                .into_iter()
                .filter(|kind| self.config.remote.endpoint_for(*kind).is_some())
                .collect(),
        }
    }

    fn create(
        &self,
        kind: BackendKind,
        _capabilities: &HardwareCapabilities,
    ) -> Result<Box<dyn SynthesisEngine>, EngineInitError> {
        match self.config.kind {
            EngineKind::Tone => Ok(Box::new(ToneEngine::new(kind, &self.config.tone))),
            EngineKind::Remote => {
                let endpoint = self
                    .config
                    .remote
                    .endpoint_for(kind)
                    .ok_or(EngineInitError::Unsupported(kind))?;
                Ok(Box::new(RemoteEngine::new(
                    kind,
                    endpoint,
                    &self.config.remote,
                )?))
            }
        }
    }
}

/// Per-kind string map used by engine configs
pub(crate) fn kind_key(kind: BackendKind) -> &'static str {
    match kind {
        BackendKind::AcceleratedA => "accelerated_a",
        BackendKind::AcceleratedB => "accelerated_b",
        BackendKind::Baseline => "baseline",
    }
}

pub(crate) fn lookup_by_kind<T>(map: &HashMap<String, T>, kind: BackendKind) -> Option<&T> {
    map.get(kind_key(kind))
}
