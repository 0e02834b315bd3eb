//! Deterministic built-in engine
//!
//! Renders each non-space character as a short sine burst and each space as
//! silence. Pitch is derived from the voice id and duration scales inversely
//! with speed. Output depends only on the request, so every backend kind
//! produces byte-identical audio.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::f32::consts::PI;
use std::time::Duration;
use xxhash_rust::xxh3::xxh3_64;

use super::{
    BackendKind, SynthesisEngine, SynthesisError, SynthesisRequest, SynthesisResult,
    SynthesizedAudio, lookup_by_kind,
};

/// Built-in tone engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToneEngineConfig {
    pub sample_rate: u32,
    /// Milliseconds of audio per character at speed 1.0
    pub ms_per_char: u32,
    /// Simulated inference latency per backend kind, keyed
    /// `accelerated_a` / `accelerated_b` / `baseline`
    pub latency_ms: HashMap<String, u64>,
}

impl Default for ToneEngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24_000,
            ms_per_char: 55,
            latency_ms: HashMap::new(),
        }
    }
}

pub struct ToneEngine {
    kind: BackendKind,
    sample_rate: u32,
    ms_per_char: u32,
    latency: Duration,
}

impl ToneEngine {
    pub fn new(kind: BackendKind, config: &ToneEngineConfig) -> Self {
        let latency = lookup_by_kind(&config.latency_ms, kind)
            .copied()
            .map(Duration::from_millis)
            .unwrap_or_default();

        Self {
            kind,
            sample_rate: config.sample_rate.max(1),
            ms_per_char: config.ms_per_char.max(1),
            latency,
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    fn pitch_hz(voice: &str) -> f32 {
        140.0 + (xxh3_64(voice.as_bytes()) % 160) as f32
    }
}

impl SynthesisEngine for ToneEngine {
    fn synthesize(&mut self, request: &SynthesisRequest) -> SynthesisResult<SynthesizedAudio> {
        if request.text.trim().is_empty() {
            return Err(SynthesisError::Fatal("empty text".to_string()));
        }
        if !request.speed.is_finite() || request.speed <= 0.0 {
            return Err(SynthesisError::Fatal(format!(
                "invalid speed {}",
                request.speed
            )));
        }

        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }

        let frames_per_char = ((self.sample_rate as f32 * self.ms_per_char as f32 / 1000.0)
            / request.speed)
            .round()
            .max(1.0) as usize;
        let pitch = Self::pitch_hz(&request.voice);
        let step = 2.0 * PI * pitch / self.sample_rate as f32;

        let mut samples = Vec::with_capacity(request.text.chars().count() * frames_per_char);
        for c in request.text.chars() {
            if c.is_whitespace() {
                samples.extend(std::iter::repeat_n(0.0f32, frames_per_char));
                continue;
            }
            for i in 0..frames_per_char {
                // Linear fade at both ends of each burst avoids clicks
                let edge = (i.min(frames_per_char - 1 - i) as f32 / 48.0).min(1.0);
                samples.push(0.3 * edge * (step * i as f32).sin());
            }
        }

        Ok(SynthesizedAudio {
            samples,
            sample_rate: self.sample_rate,
        })
    }

    fn name(&self) -> &str {
        "tone"
    }
}
