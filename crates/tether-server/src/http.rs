//! HTTP surface: run submission over SSE, thread deletion and health.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Serialize;
use tether_core::ids::ThreadId;
use tether_core::protocol::RunInput;
use tracing::{info, warn};

use crate::orchestrator::RunOrchestrator;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("thread not found: {0}")]
    ThreadNotFound(String),

    #[error("client must accept text/event-stream")]
    NotAcceptable,

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::ThreadNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::NotAcceptable => StatusCode::NOT_ACCEPTABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (code, body).into_response()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<RunOrchestrator>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/agent", post(run_agent))
        .route("/agent/{thread_id}", delete(delete_thread))
        .route("/health", get(health))
        .with_state(state)
}

/// A missing `Accept` header counts as accepting anything.
pub fn accepts_event_stream(headers: &HeaderMap) -> bool {
    let Some(accept) = headers.get(header::ACCEPT) else {
        return true;
    };
    let Ok(accept) = accept.to_str() else {
        return false;
    };
    accept.split(',').any(|range| {
        let media = range.split(';').next().unwrap_or_default().trim();
        media.eq_ignore_ascii_case("text/event-stream")
            || media.eq_ignore_ascii_case("text/*")
            || media == "*/*"
    })
}

/// One SSE frame: `data: <json>\n\n`.
pub fn sse_frame<T: Serialize>(event: &T) -> Result<Bytes, serde_json::Error> {
    let json = serde_json::to_string(event)?;
    Ok(Bytes::from(format!("data: {json}\n\n")))
}

pub fn sse_response<S>(stream: S) -> Response
where
    S: Stream<Item = Result<Bytes, Infallible>> + Send + 'static,
{
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    (headers, Body::from_stream(stream)).into_response()
}

async fn run_agent(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    if !accepts_event_stream(&headers) {
        return Err(ApiError::NotAcceptable);
    }
    let input: RunInput =
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    input
        .validate()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    info!(
        thread_id = %input.thread_id,
        run_id = %input.run_id,
        messages = input.messages.len(),
        tools = input.tools.len(),
        "run accepted"
    );

    let frames = state.orchestrator.run(input).filter_map(|event| async move {
        match sse_frame(&event) {
            Ok(frame) => Some(Ok::<Bytes, Infallible>(frame)),
            Err(e) => {
                warn!(error = %e, event = event.event_type(), "dropping unserializable event");
                None
            }
        }
    });
    Ok(sse_response(frames))
}

async fn delete_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let thread = ThreadId::from_raw(thread_id);
    match state.orchestrator.delete_thread(&thread).await {
        Ok(true) => Ok(Json(serde_json::json!({ "deleted": thread.as_str() }))),
        Ok(false) => Err(ApiError::ThreadNotFound(thread.to_string())),
        Err(e) => Err(ApiError::Internal(e.to_string())),
    }
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.orchestrator.health())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::events::RunEvent;

    fn accept(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn accept_negotiation() {
        assert!(accepts_event_stream(&HeaderMap::new()));
        assert!(accepts_event_stream(&accept("text/event-stream")));
        assert!(accepts_event_stream(&accept("application/json, text/event-stream;q=0.9")));
        assert!(accepts_event_stream(&accept("*/*")));
        assert!(!accepts_event_stream(&accept("application/json")));
    }

    #[test]
    fn frames_are_data_lines() {
        let frame = sse_frame(&RunEvent::TextDelta { delta: "hi".into() }).unwrap();
        assert_eq!(&frame[..], b"data: {\"type\":\"text-delta\",\"delta\":\"hi\"}\n\n");
    }

    #[test]
    fn api_error_status_codes() {
        assert_eq!(
            ApiError::BadRequest("x".into()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::ThreadNotFound("t".into()).into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(ApiError::NotAcceptable.into_response().status(), StatusCode::NOT_ACCEPTABLE);
        assert_eq!(
            ApiError::Internal("boom".into()).into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
