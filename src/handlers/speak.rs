//! Text-to-speech REST endpoint
//!
//! `POST /speak` segments the text and synthesizes the segments in parallel.
//! Streaming requests receive ordered PCM16LE as it becomes available;
//! non-streaming requests receive the whole rendering or an error.

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::engine::VoiceSettings;
use crate::core::stream::StreamMode;
use crate::errors::{AppError, AppResult};
use crate::state::AppState;
use crate::utils::audio::wav_from_pcm16;

/// Longest accepted request text, in characters
pub const MAX_TEXT_CHARS: usize = 20_000;

pub const SAMPLE_RATE_HEADER: &str = "x-sample-rate";
pub const SEGMENT_COUNT_HEADER: &str = "x-segment-count";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

static VOICE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]{0,63}$").expect("valid voice pattern"));

static LANG_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z]{2,3}(-[A-Za-z0-9]{2,8})*$").expect("valid lang pattern"));

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    /// Raw little-endian 16-bit mono PCM
    #[default]
    Pcm,
    Wav,
}

#[derive(Debug, Deserialize)]
pub struct SpeakRequest {
    pub text: String,
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default)]
    pub speed: Option<f32>,
    #[serde(default)]
    pub lang: Option<String>,
    #[serde(default)]
    pub format: AudioFormat,
    /// Stream ordered audio as it is produced; failed segments are skipped
    #[serde(default)]
    pub stream: bool,
}

impl SpeakRequest {
    /// Validate the request and resolve voice settings
    pub fn voice_settings(&self) -> AppResult<VoiceSettings> {
        if self.text.chars().count() > MAX_TEXT_CHARS {
            return Err(AppError::BadRequest(format!(
                "text exceeds {MAX_TEXT_CHARS} characters"
            )));
        }
        if self.stream && self.format == AudioFormat::Wav {
            return Err(AppError::BadRequest(
                "wav output is only available for non-streaming requests".to_string(),
            ));
        }

        let mut settings = VoiceSettings::default();
        if let Some(voice) = &self.voice {
            if !VOICE_PATTERN.is_match(voice) {
                return Err(AppError::BadRequest(format!("invalid voice '{voice}'")));
            }
            settings.voice = voice.clone();
        }
        if let Some(lang) = &self.lang {
            if !LANG_PATTERN.is_match(lang) {
                return Err(AppError::BadRequest(format!("invalid lang '{lang}'")));
            }
            settings.lang = lang.to_ascii_lowercase();
        }
        if let Some(speed) = self.speed {
            if !(0.25..=4.0).contains(&speed) {
                return Err(AppError::BadRequest(format!(
                    "speed must be between 0.25 and 4.0, got {speed}"
                )));
            }
            settings.speed = speed;
        }
        Ok(settings)
    }
}

pub async fn speak_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SpeakRequest>,
) -> AppResult<Response> {
    let voice = request.voice_settings()?;
    if request.stream {
        stream_response(&state, &request.text, &voice).await
    } else {
        complete_response(&state, &request.text, &voice, request.format).await
    }
}

async fn complete_response(
    state: &AppState,
    text: &str,
    voice: &VoiceSettings,
    format: AudioFormat,
) -> AppResult<Response> {
    // Dropping this future (client disconnect) stops dispatch of remaining segments
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let audio = state
        .pipeline
        .synthesize_complete_with_cancel(text, voice, cancel)
        .await?;
    debug!(
        segments = audio.segment_count,
        bytes = audio.pcm.len(),
        ?format,
        "Complete synthesis finished"
    );

    let (content_type, body) = match format {
        AudioFormat::Pcm => ("audio/pcm", audio.pcm),
        AudioFormat::Wav => {
            let wav = wav_from_pcm16(&audio.pcm, audio.sample_rate)
                .map_err(|e| AppError::Internal(format!("failed to encode wav: {e}")))?;
            ("audio/wav", Bytes::from(wav))
        }
    };

    let mut response = (StatusCode::OK, body).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(SAMPLE_RATE_HEADER, HeaderValue::from(audio.sample_rate));
    headers.insert(SEGMENT_COUNT_HEADER, HeaderValue::from(audio.segment_count));
    Ok(response)
}

async fn stream_response(
    state: &AppState,
    text: &str,
    voice: &VoiceSettings,
) -> AppResult<Response> {
    let cancel = CancellationToken::new();
    let prepared = state
        .pipeline
        .stream_chunks(text, voice, StreamMode::BestEffort, cancel.clone())?;
    let request_id = prepared.request_id;
    let segment_count = prepared.segment_count;
    let mut chunks = prepared.chunks;

    // Dropping the guard (early error or client disconnect) cancels outstanding segments
    let guard = cancel.drop_guard();

    // Headers go out with the first chunk so the sample rate is known
    let first = match chunks.next().await {
        Some(chunk) => chunk?,
        None => return Err(AppError::NoAudio),
    };
    let sample_rate = first.sample_rate;

    let log_id = request_id.clone();
    let body = async_stream::stream! {
        let _guard = guard;
        yield Ok::<Bytes, std::io::Error>(first.bytes);
        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(chunk) => yield Ok(chunk.bytes),
                Err(e) => {
                    debug!(request_id = %log_id, error = %e, "Stream ended early");
                    break;
                }
            }
        }
    };

    info!(request_id = %request_id, segments = segment_count, "Streaming response started");

    let mut response = Body::from_stream(body).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("audio/pcm"));
    headers.insert(SAMPLE_RATE_HEADER, HeaderValue::from(sample_rate));
    headers.insert(SEGMENT_COUNT_HEADER, HeaderValue::from(segment_count));
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(REQUEST_ID_HEADER, value);
    }
    Ok(response)
}
