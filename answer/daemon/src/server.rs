//! HTTP Server
//!
//! Axum router exposing the answer pipeline:
//!
//! ```text
//!   POST /api/answer/stream          ─┐
//!   POST /api/ask/stream             ─┴─▶ spawn AnswerPipeline::run
//!                                           │ mpsc<ClientFrame>
//!                                           ▼
//!                                  text/event-stream body
//!
//!   POST /api/answer/:request_id/stop ──▶ ActiveRequests::cancel
//!   GET  /api/health                  ──▶ upstream probe + active count
//! ```
//!
//! Each stream runs on its own task. The response body owns the receiving
//! side of the frame channel, so a client that goes away drops it and the
//! pipeline observes the disconnect.

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, Instrument};

use answer_core::config::ServerConfig;
use answer_core::transport::encode;
use answer_core::{ActiveRequests, AnswerPipeline, AnswerRequest, Question, RequestId};

use crate::error::ApiError;

/// Header carrying the id used by the stop endpoint
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Shared state of the HTTP surface
#[derive(Clone, Debug)]
pub struct AppState {
    pipeline: AnswerPipeline,
    active: ActiveRequests,
    channel_capacity: usize,
    max_question_chars: usize,
    shutdown: CancellationToken,
}

impl AppState {
    /// State serving `pipeline` with the given server limits
    #[must_use]
    pub fn new(pipeline: AnswerPipeline, config: &ServerConfig) -> Self {
        Self {
            pipeline,
            active: ActiveRequests::new(),
            channel_capacity: config.channel_capacity.max(1),
            max_question_chars: config.max_question_chars,
            shutdown: CancellationToken::new(),
        }
    }

    /// In-flight request registry
    #[must_use]
    pub fn active(&self) -> &ActiveRequests {
        &self.active
    }

    /// Token that stops new streams from being accepted
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Refuse new streams and cancel every in-flight one
    pub fn begin_shutdown(&self) -> usize {
        self.shutdown.cancel();
        let cancelled = self.active.cancel_all();
        info!(cancelled, "Cancelled in-flight requests");
        cancelled
    }
}

/// Build the router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/answer/stream", post(answer_stream))
        .route("/api/ask/stream", post(answer_stream))
        .route("/api/answer/:request_id/stop", post(stop_answer))
        .route("/api/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `state`'s shutdown token fires
///
/// # Errors
///
/// Returns an error if the address cannot be bound or the server fails.
pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Listening for requests");

    let shutdown = state.shutdown_token();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

/// Validate an inbound request
fn validate(request: AnswerRequest, max_chars: usize) -> Result<Question, ApiError> {
    let question = Question::from(request);
    if question.text.is_empty() {
        return Err(ApiError::BadRequest("question must not be empty".to_string()));
    }
    let chars = question.text.chars().count();
    if chars > max_chars {
        return Err(ApiError::BadRequest(format!(
            "question is {chars} characters, limit is {max_chars}"
        )));
    }
    Ok(question)
}

async fn answer_stream(
    State(state): State<AppState>,
    payload: Result<Json<AnswerRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    if state.shutdown.is_cancelled() {
        return Err(ApiError::Unavailable);
    }
    let Json(request) = payload?;
    let question = validate(request, state.max_question_chars)?;

    let request_id = RequestId::new();
    let guard = state.active.register(&request_id);
    let token = guard.token();
    let (tx, rx) = mpsc::channel(state.channel_capacity);

    let pipeline = state.pipeline.clone();
    let run_id = request_id.clone();
    let span = tracing::info_span!("answer", request_id = %request_id);
    tokio::spawn(
        async move {
            // Deregisters when the run ends
            let _guard = guard;
            pipeline.run(run_id, question, tx, token).await;
        }
        .instrument(span),
    );

    let body = Body::from_stream(
        ReceiverStream::new(rx).map(|frame| Ok::<_, Infallible>(encode(&frame))),
    );
    let headers = [
        ("content-type", "text/event-stream".to_string()),
        ("cache-control", "no-cache".to_string()),
        (REQUEST_ID_HEADER, request_id.to_string()),
    ];
    Ok((headers, body).into_response())
}

async fn stop_answer(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if state.active.cancel(&request_id) {
        Ok(Json(serde_json::json!({
            "requestId": request_id,
            "stopped": true,
        })))
    } else {
        Err(ApiError::NotFound(request_id))
    }
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let upstream = state.pipeline.upstream_healthy().await;
    Json(serde_json::json!({
        "status": if state.shutdown.is_cancelled() { "shutting_down" } else { "ok" },
        "upstream": upstream,
        "active_streams": state.active.len(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(question: &str) -> AnswerRequest {
        AnswerRequest {
            question: question.to_string(),
            ..AnswerRequest::default()
        }
    }

    #[test]
    fn test_validate_rejects_blank() {
        assert!(matches!(
            validate(request("   "), 100),
            Err(ApiError::BadRequest(_))
        ));
    }

    #[test]
    fn test_validate_counts_characters() {
        // Four characters, twelve bytes
        assert!(validate(request("正当防卫"), 4).is_ok());
        assert!(validate(request("正当防卫"), 3).is_err());
    }
}
