//! Remote engine against a stubbed inference sidecar

use std::sync::Arc;

use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use cadence_gateway::core::engine::{
    BackendKind, BuiltinEngineFactory, EngineConfig, EngineKind, HardwareCapabilities,
    RemoteEngine, RemoteEngineConfig, SynthesisEngine, SynthesisError, SynthesisRequest,
    SynthesisResult, SynthesizedAudio, VoiceSettings,
};
use cadence_gateway::core::pipeline::{PipelineConfig, PipelineContext};
use cadence_gateway::core::pool::PoolHealth;
use cadence_gateway::core::watchdog::{MemoryProbe, MemoryReading, WatchdogConfig};
use cadence_gateway::utils::audio::encode_wav;

struct NoMemory;

impl MemoryProbe for NoMemory {
    fn read(&self) -> Option<MemoryReading> {
        None
    }
}

fn wav_fixture(sample_rate: u32) -> Vec<u8> {
    let samples: Vec<f32> = (0..480).map(|i| ((i % 48) as f32 / 48.0) - 0.5).collect();
    encode_wav(&samples, sample_rate).unwrap()
}

fn remote_config(endpoint: String, api_key: Option<&str>) -> RemoteEngineConfig {
    let mut config = RemoteEngineConfig {
        api_key: api_key.map(str::to_string),
        timeout_ms: 2_000,
        connect_timeout_ms: 500,
        ..Default::default()
    };
    config.endpoints.insert("baseline".to_string(), endpoint);
    config
}

/// Run one synthesis call on a blocking thread, as the pool does
async fn synthesize_once(
    config: RemoteEngineConfig,
    text: &str,
) -> SynthesisResult<SynthesizedAudio> {
    let request = SynthesisRequest::new(text, &VoiceSettings::default());
    tokio::task::spawn_blocking(move || {
        let endpoint = config.endpoint_for(BackendKind::Baseline).unwrap().to_string();
        let mut engine = RemoteEngine::new(BackendKind::Baseline, &endpoint, &config).unwrap();
        engine.synthesize(&request)
    })
    .await
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_decodes_sidecar_wav() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/synthesize"))
        .and(header("authorization", "Bearer sidecar-key"))
        .and(body_partial_json(json!({ "text": "Hello there.", "voice": "default" })))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "audio/wav")
                .set_body_bytes(wav_fixture(16_000)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let config = remote_config(format!("{}/synthesize", server.uri()), Some("sidecar-key"));
    let audio = synthesize_once(config, "Hello there.").await.unwrap();

    assert_eq!(audio.sample_rate, 16_000);
    assert_eq!(audio.samples.len(), 480);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_server_errors_are_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&server)
        .await;

    let config = remote_config(format!("{}/synthesize", server.uri()), None);
    let err = synthesize_once(config, "Busy.").await.unwrap_err();
    assert!(err.is_transient(), "{err}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rate_limit_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let config = remote_config(format!("{}/synthesize", server.uri()), None);
    assert!(synthesize_once(config, "Slow down.").await.unwrap_err().is_transient());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_client_errors_are_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_string("unknown voice"))
        .mount(&server)
        .await;

    let config = remote_config(format!("{}/synthesize", server.uri()), None);
    let err = synthesize_once(config, "Bad voice.").await.unwrap_err();
    match err {
        SynthesisError::Fatal(message) => assert!(message.contains("unknown voice")),
        other => panic!("expected fatal error, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_undecodable_audio_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"definitely not a wav".to_vec()))
        .mount(&server)
        .await;

    let config = remote_config(format!("{}/synthesize", server.uri()), None);
    let err = synthesize_once(config, "Garbage.").await.unwrap_err();
    assert!(!err.is_transient());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connection_refused_is_transient() {
    // Bind and drop a listener to get a port nothing listens on
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let config = remote_config(format!("http://127.0.0.1:{port}/synthesize"), None);
    assert!(synthesize_once(config, "Anyone?").await.unwrap_err().is_transient());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pipeline_with_remote_baseline() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/synthesize"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(wav_fixture(22_050)))
        .mount(&server)
        .await;

    let engine = EngineConfig {
        kind: EngineKind::Remote,
        remote: remote_config(format!("{}/synthesize", server.uri()), None),
        ..Default::default()
    };
    let config = PipelineConfig {
        watchdog: WatchdogConfig {
            enabled: false,
            ..Default::default()
        },
        ..Default::default()
    };
    let ctx = PipelineContext::with_parts(
        config,
        Arc::new(BuiltinEngineFactory::new(engine)),
        HardwareCapabilities::all_kinds(),
        Arc::new(NoMemory),
    )
    .await
    .unwrap();

    // Only the baseline has an endpoint, so that is the whole pool
    assert_eq!(ctx.pool().available_kinds(), vec![BackendKind::Baseline]);
    assert_eq!(ctx.health(), PoolHealth::Ready);

    let audio = ctx
        .synthesize_complete(
            "The first sentence is right here. The second sentence follows it closely!",
            &VoiceSettings::default(),
        )
        .await
        .unwrap();
    assert_eq!(audio.sample_rate, 22_050);
    assert_eq!(audio.segment_count, 2);
    assert_eq!(audio.pcm.len(), 2 * 480 * 2);
    ctx.shutdown().await;
}
