//! HTTP surface tests
//!
//! The router is driven in-process with `tower::ServiceExt::oneshot`;
//! response bodies are collected and decoded with the client frame decoder.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use pretty_assertions::assert_eq;
use tower::ServiceExt;

use answer_core::config::{FallbackConfig, ServerConfig};
use answer_core::transport::decode_client_frames;
use answer_core::{
    AnswerPipeline, ClientFrame, FallbackSynthesizer, FinalizeStage, MemoryAnswerStore,
    ScriptedBackend, TermModerator, UpstreamFrame,
};
use answer_daemon::{router, AppState, REQUEST_ID_HEADER};

// =============================================================================
// Helpers
// =============================================================================

fn state(backend: ScriptedBackend) -> AppState {
    let finalize = FinalizeStage::new(
        Arc::new(TermModerator::default()),
        Arc::new(MemoryAnswerStore::new()),
    );
    let pipeline = AnswerPipeline::new(Arc::new(backend), finalize).with_fallback(
        FallbackSynthesizer::new(FallbackConfig {
            piece_chars: 16,
            piece_delay: Duration::ZERO,
        }),
    );
    let config = ServerConfig {
        max_question_chars: 20,
        ..ServerConfig::default()
    };
    AppState::new(pipeline, &config)
}

fn post_json(uri: &str, body: &str) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

// =============================================================================
// Streaming endpoints
// =============================================================================

#[tokio::test]
async fn test_answer_stream_frames() {
    let app = router(state(ScriptedBackend::from_deltas(&["正当防卫", "是指..."])));

    let response = app
        .oneshot(post_json(
            "/api/answer/stream",
            r#"{"question":"什么是正当防卫","sessionId":"chat-1"}"#,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"],
        "text/event-stream"
    );
    assert!(response.headers().contains_key(REQUEST_ID_HEADER));

    let bytes = body_bytes(response).await;
    let raw = String::from_utf8(bytes.clone()).unwrap();
    assert!(raw.starts_with("data: {\"type\":\"init\"}\n\n"));
    assert!(raw.ends_with("data: [DONE]\n\n"));

    assert_eq!(
        decode_client_frames(&bytes),
        vec![
            ClientFrame::Init,
            ClientFrame::content("正当防卫"),
            ClientFrame::content("是指..."),
            ClientFrame::Done,
        ]
    );
}

/// Both entry points run the same pipeline, moderation included.
#[tokio::test]
async fn test_ask_stream_is_equivalent() {
    let app = router(state(ScriptedBackend::from_deltas(&["答"])));
    let response = app
        .oneshot(post_json("/api/ask/stream", r#"{"question":"合同无效"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let frames = decode_client_frames(&body_bytes(response).await);
    assert_eq!(frames.last(), Some(&ClientFrame::Done));
}

/// Upstream failure never becomes an HTTP error.
#[tokio::test]
async fn test_upstream_failure_is_still_200() {
    let app = router(state(ScriptedBackend::failing("connection refused")));
    let response = app
        .oneshot(post_json("/api/answer/stream", r#"{"question":"什么是正当防卫"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let frames = decode_client_frames(&body_bytes(response).await);
    assert_eq!(frames[0], ClientFrame::Init);
    assert!(matches!(frames[1], ClientFrame::Error { .. }));
    assert!(frames.iter().any(|f| f.content_text().is_some()));
    assert_eq!(frames.iter().filter(|f| f.is_terminal()).count(), 1);
}

// =============================================================================
// Validation
// =============================================================================

#[tokio::test]
async fn test_blank_question_rejected() {
    let app = router(state(ScriptedBackend::from_deltas(&["x"])));
    let response = app
        .oneshot(post_json("/api/answer/stream", r#"{"question":"   "}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn test_overlong_question_rejected() {
    let app = router(state(ScriptedBackend::from_deltas(&["x"])));
    let long = "问".repeat(21);
    let response = app
        .oneshot(post_json(
            "/api/answer/stream",
            &format!(r#"{{"question":"{long}"}}"#),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

/// Bodies that do not parse get the same JSON error shape as validation.
#[tokio::test]
async fn test_malformed_body_rejected_as_json_error() {
    for body in [r#"{"subject":"刑法"}"#, "not json"] {
        let app = router(state(ScriptedBackend::from_deltas(&["x"])));
        let response = app.oneshot(post_json("/api/answer/stream", body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body {body}");

        let json: serde_json::Value =
            serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(json["error"]["code"], "bad_request");
        assert!(json["error"]["message"].is_string());
    }
}

/// An unknown subject label is ignored, not rejected.
#[tokio::test]
async fn test_unknown_subject_is_not_an_error() {
    let app = router(state(ScriptedBackend::from_deltas(&["x"])));
    let response = app
        .oneshot(post_json(
            "/api/answer/stream",
            r#"{"question":"什么是正当防卫","subject":"天文学"}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    body_bytes(response).await;
}

// =============================================================================
// Stop and health
// =============================================================================

#[tokio::test]
async fn test_stop_unknown_request_is_404() {
    let app = router(state(ScriptedBackend::from_deltas(&["x"])));
    let response = app
        .oneshot(
            Request::post("/api/answer/missing/stop")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

/// Stopping an in-flight stream ends its body with a single done.
#[tokio::test]
async fn test_stop_in_flight_stream() {
    let backend = ScriptedBackend::new()
        .frame(&UpstreamFrame::Delta("开头".into()))
        .hang();
    let state = state(backend);
    let app = router(state.clone());

    let response = app
        .clone()
        .oneshot(post_json("/api/answer/stream", r#"{"question":"什么是正当防卫"}"#))
        .await
        .unwrap();
    let request_id = response.headers()[REQUEST_ID_HEADER]
        .to_str()
        .unwrap()
        .to_string();
    assert!(state.active().contains(&request_id));

    let stop = app
        .oneshot(
            Request::post(format!("/api/answer/{request_id}/stop"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(stop.status(), StatusCode::OK);

    let bytes = tokio::time::timeout(Duration::from_secs(5), body_bytes(response))
        .await
        .expect("stream ends after stop");
    let frames = decode_client_frames(&bytes);
    assert!(frames.iter().filter(|f| f.is_terminal()).count() <= 1);
    // A stop is not a failure: no diagnostic frame and no fallback
    assert!(!frames
        .iter()
        .any(|f| matches!(f, ClientFrame::Error { .. })));
}

#[tokio::test]
async fn test_health_reports_upstream() {
    let app = router(state(ScriptedBackend::from_deltas(&["x"])));
    let response = app
        .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["upstream"], true);
    assert_eq!(body["active_streams"], 0);
}

#[tokio::test]
async fn test_shutdown_refuses_new_streams() {
    let state = state(ScriptedBackend::from_deltas(&["x"]));
    state.begin_shutdown();

    let response = router(state)
        .oneshot(post_json("/api/answer/stream", r#"{"question":"q"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}
