//! Inference sidecar engine
//!
//! Forwards each segment to an HTTP inference service and decodes the WAV
//! response. One endpoint may be configured per backend kind, which lets an
//! accelerated host and a CPU host sit behind the same pool.
//!
//! # Wire format
//!
//! ```text
//! POST {endpoint}
//! Content-Type: application/json
//! Authorization: Bearer {api_key}        (optional)
//!
//! {"text": "...", "voice": "...", "speed": 1.0, "lang": "en-us"}
//!
//! 200 OK
//! Content-Type: audio/wav
//! <RIFF/WAVE bytes>
//! ```
//!
//! 429, 5xx, timeouts and connection failures are transient; any other
//! failure is fatal.

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::debug;
use url::Url;
use zeroize::Zeroizing;

use super::{
    BackendKind, EngineInitError, SynthesisEngine, SynthesisError, SynthesisRequest,
    SynthesisResult, SynthesizedAudio, lookup_by_kind,
};
use crate::utils::audio::decode_wav;

/// Remote engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteEngineConfig {
    /// Endpoint per backend kind, keyed `accelerated_a` / `accelerated_b` / `baseline`
    pub endpoints: HashMap<String, String>,
    /// Bearer token sent to every endpoint
    pub api_key: Option<String>,
    pub timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for RemoteEngineConfig {
    fn default() -> Self {
        Self {
            endpoints: HashMap::new(),
            api_key: None,
            timeout_ms: 30_000,
            connect_timeout_ms: 2_000,
        }
    }
}

impl RemoteEngineConfig {
    pub fn endpoint_for(&self, kind: BackendKind) -> Option<&str> {
        lookup_by_kind(&self.endpoints, kind).map(String::as_str)
    }
}

pub struct RemoteEngine {
    kind: BackendKind,
    endpoint: Url,
    client: reqwest::Client,
    api_key: Option<Zeroizing<String>>,
    runtime: Handle,
}

impl RemoteEngine {
    /// Build an engine for `endpoint`
    ///
    /// Must be called from within a Tokio runtime (including its blocking
    /// pool); the engine drives its HTTP client on that runtime.
    pub fn new(
        kind: BackendKind,
        endpoint: &str,
        config: &RemoteEngineConfig,
    ) -> Result<Self, EngineInitError> {
        let failed = |reason: String| EngineInitError::Failed { kind, reason };

        let endpoint =
            Url::parse(endpoint).map_err(|e| failed(format!("invalid endpoint '{endpoint}': {e}")))?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(failed(format!(
                "unsupported endpoint scheme '{}'",
                endpoint.scheme()
            )));
        }

        let runtime = Handle::try_current()
            .map_err(|e| failed(format!("no async runtime available: {e}")))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .build()
            .map_err(|e| failed(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            kind,
            endpoint,
            client,
            api_key: config.api_key.clone().map(Zeroizing::new),
            runtime,
        })
    }

    async fn call(&self, request: &SynthesisRequest) -> SynthesisResult<SynthesizedAudio> {
        let mut builder = self.client.post(self.endpoint.clone()).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.as_str());
        }

        let response = builder.send().await.map_err(classify_transport_error)?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("sidecar returned {status}: {}", body.trim());
            return Err(if is_retryable_status(status) {
                SynthesisError::Transient(message)
            } else {
                SynthesisError::Fatal(message)
            });
        }

        let bytes = response.bytes().await.map_err(classify_transport_error)?;
        debug!(
            backend = %self.kind,
            bytes = bytes.len(),
            "Received sidecar audio"
        );

        let (samples, sample_rate) =
            decode_wav(&bytes).map_err(|e| SynthesisError::Fatal(e.to_string()))?;
        Ok(SynthesizedAudio {
            samples,
            sample_rate,
        })
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn classify_transport_error(err: reqwest::Error) -> SynthesisError {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        SynthesisError::Transient(err.to_string())
    } else {
        SynthesisError::Fatal(err.to_string())
    }
}

impl SynthesisEngine for RemoteEngine {
    fn synthesize(&mut self, request: &SynthesisRequest) -> SynthesisResult<SynthesizedAudio> {
        let runtime = self.runtime.clone();
        runtime.block_on(self.call(request))
    }

    fn name(&self) -> &str {
        "remote"
    }
}
