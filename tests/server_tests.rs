//! HTTP surface tests driven through the router without a socket

mod mock_engines;

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use cadence_gateway::core::engine::HardwareCapabilities;
use cadence_gateway::core::pipeline::{PipelineConfig, PipelineContext};
use cadence_gateway::core::watchdog::WatchdogConfig;
use cadence_gateway::handlers::speak::{SAMPLE_RATE_HEADER, SEGMENT_COUNT_HEADER};
use cadence_gateway::{AppState, ServerConfig, routes};

use mock_engines::{FailureMode, MockEngineFactory, ScriptedMemory};

const TEXT: &str = "The first sentence is right here. The second sentence follows it closely! \
                    And a third one arrives at the end?";

async fn app_with(factory: MockEngineFactory) -> Router {
    let config = PipelineConfig {
        watchdog: WatchdogConfig {
            enabled: false,
            ..Default::default()
        },
        ..Default::default()
    };
    let pipeline = PipelineContext::with_parts(
        config,
        Arc::new(factory),
        HardwareCapabilities::all_kinds(),
        ScriptedMemory::new(100),
    )
    .await
    .unwrap();
    let state = AppState::with_pipeline(ServerConfig::default(), Arc::new(pipeline));

    routes::api::create_public_router()
        .merge(routes::api::create_api_router())
        .with_state(state)
}

async fn app() -> Router {
    app_with(MockEngineFactory::new()).await
}

fn speak(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/speak")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_reports_pool() {
    let response = app()
        .await
        .oneshot(Request::get("/").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "OK");
    assert_eq!(body["pool"], "ready");
}

#[tokio::test]
async fn test_speak_complete_pcm() {
    let response = app()
        .await
        .oneshot(speak(json!({ "text": TEXT })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers[header::CONTENT_TYPE], "audio/pcm");
    assert_eq!(headers[SAMPLE_RATE_HEADER], "24000");
    assert_eq!(headers[SEGMENT_COUNT_HEADER], "3");

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert!(!bytes.is_empty());
    assert_eq!(bytes.len() % 2, 0);
}

#[tokio::test]
async fn test_speak_wav_has_riff_header() {
    let response = app()
        .await
        .oneshot(speak(json!({ "text": TEXT, "format": "wav" })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "audio/wav");
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..4], b"RIFF");
    assert_eq!(&bytes[8..12], b"WAVE");
}

#[tokio::test]
async fn test_streamed_bytes_match_complete() {
    let app = app().await;

    let complete = app
        .clone()
        .oneshot(speak(json!({ "text": TEXT })))
        .await
        .unwrap()
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes();

    let response = app
        .oneshot(speak(json!({ "text": TEXT, "stream": true })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[SEGMENT_COUNT_HEADER], "3");
    assert!(response.headers().contains_key("x-request-id"));
    let streamed = response.into_body().collect().await.unwrap().to_bytes();

    assert_eq!(streamed, complete);
}

#[tokio::test]
async fn test_speak_rejects_empty_text() {
    let response = app()
        .await
        .oneshot(speak(json!({ "text": "  \n\t " })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert!(body["error"].as_str().unwrap().contains("empty"));
}

#[tokio::test]
async fn test_speak_rejects_invalid_voice() {
    let response = app()
        .await
        .oneshot(speak(json!({ "text": TEXT, "voice": "no spaces allowed" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_failed_segment_is_bad_gateway_when_not_streaming() {
    let app = app_with(MockEngineFactory::new().failing_text("second", FailureMode::Fatal)).await;

    let response = app
        .clone()
        .oneshot(speak(json!({ "text": TEXT })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    // Streaming skips the failed segment
    let response = app
        .oneshot(speak(json!({ "text": TEXT, "stream": true })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert!(!bytes.is_empty());
}

#[tokio::test]
async fn test_stats_reset_and_recycle() {
    let app = app().await;
    app.clone()
        .oneshot(speak(json!({ "text": TEXT })))
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(Request::get("/stats").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let stats = json_body(response).await;
    let total: u64 = stats["utilization"]["backends"]
        .as_array()
        .unwrap()
        .iter()
        .map(|b| b["requests"].as_u64().unwrap())
        .sum();
    assert_eq!(total, 3);
    assert_eq!(stats["watchdog"]["cleanup_count"], 0);
    assert_eq!(stats["pool"]["health"], "ready");
    assert!(stats.get("cache").is_none());

    let response = app
        .clone()
        .oneshot(Request::post("/stats/reset").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .clone()
        .oneshot(Request::post("/admin/recycle").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let outcome = json_body(response).await;
    assert_eq!(outcome["status"], "completed");
    assert_eq!(outcome["generation"], 2);

    let stats = json_body(
        app.oneshot(Request::get("/stats").body(Body::empty()).unwrap())
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(stats["watchdog"]["cleanup_count"], 1);
    let requests: Vec<u64> = stats["utilization"]["backends"]
        .as_array()
        .unwrap()
        .iter()
        .map(|b| b["requests"].as_u64().unwrap())
        .collect();
    assert!(requests.iter().all(|r| *r == 0));
    assert!(
        stats["pool"]["backends"]
            .as_array()
            .unwrap()
            .iter()
            .any(|b| b["kind"] == "baseline")
    );
}
