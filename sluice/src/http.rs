//! HTTP surface
//!
//! Two routes: `POST /v1/chat` accepts a normalized request and returns a
//! `message_id` immediately while the conversation task runs in the
//! background; `GET /v1/stream/{id}` delivers that session's frames as SSE,
//! with heartbeat frames on idle and a concurrency-limit semaphore. A client
//! disconnect stops delivery but never cancels the upstream task.

use crate::orchestrator::Orchestrator;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use sluice_core::broker::{ChannelBroker, SessionConfig};
use sluice_core::error::GatewayError;
use sluice_core::events::{SessionEvent, CLOSE_EVENT, HEARTBEAT_EVENT};
use sluice_core::types::ChatRequest;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Closes the session when the delivery stream is dropped, whether the
/// client drained it to the sentinel or disconnected mid-stream. Without
/// this the registry entry would outlive its one reader.
struct SessionCloser {
    broker: Arc<ChannelBroker>,
    id: String,
}

impl Drop for SessionCloser {
    fn drop(&mut self) {
        self.broker.close(&self.id);
    }
}

#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<ChannelBroker>,
    pub orchestrator: Arc<Orchestrator>,
    pub stream_slots: Arc<Semaphore>,
    pub heartbeat: Duration,
    pub chunk_max_chars: usize,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat", post(accept_chat))
        .route("/v1/stream/{id}", get(stream_session))
        .with_state(state)
}

fn error_response(status: StatusCode, error: &GatewayError) -> (StatusCode, Json<serde_json::Value>) {
    (
        status,
        Json(serde_json::json!({
            "error": {"code": error.code(), "message": error.to_string()}
        })),
    )
}

async fn accept_chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> impl IntoResponse {
    if request.messages.is_empty() {
        let error = GatewayError::InvalidRequest("messages must not be empty".into());
        return error_response(StatusCode::BAD_REQUEST, &error).into_response();
    }

    let message_id = uuid::Uuid::new_v4().to_string();
    let request_id = uuid::Uuid::new_v4().to_string();
    let cfg = SessionConfig {
        id: message_id.clone(),
        owner_id: String::new(),
        conversation_id: String::new(),
        request_id: Some(request_id.clone()),
        output_mode: request.output_mode,
        chunk_max_chars: state.chunk_max_chars,
    };
    if let Err(error) = state.broker.open(cfg) {
        return error_response(StatusCode::CONFLICT, &error).into_response();
    }
    let _ = state
        .broker
        .publish(&message_id, SessionEvent::status("accepted"));

    tracing::info!(message_id, request_id, model = %request.model, "request accepted");
    let orchestrator = Arc::clone(&state.orchestrator);
    let sid = message_id.clone();
    tokio::spawn(async move {
        orchestrator.run(&sid, request).await;
    });

    Json(serde_json::json!({"message_id": message_id, "request_id": request_id})).into_response()
}

async fn stream_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let Ok(permit) = Arc::clone(&state.stream_slots).try_acquire_owned() else {
        let error = GatewayError::InvalidRequest("too many concurrent streams".into());
        return error_response(StatusCode::TOO_MANY_REQUESTS, &error).into_response();
    };
    let mut rx = match state.broker.subscribe(&id) {
        Ok(rx) => rx,
        Err(error) => return error_response(StatusCode::NOT_FOUND, &error).into_response(),
    };

    let closer = SessionCloser {
        broker: Arc::clone(&state.broker),
        id,
    };
    let heartbeat = state.heartbeat;
    let frames = async_stream::stream! {
        // Both dropped with the stream on disconnect: the slot frees and the
        // session closes while the conversation task runs on to completion.
        let _permit = permit;
        let _closer = closer;
        loop {
            match tokio::time::timeout(heartbeat, rx.recv()).await {
                Ok(Some(frame)) => {
                    let done = frame.name == CLOSE_EVENT;
                    yield Ok::<_, Infallible>(
                        Event::default().event(frame.name).data(frame.data.to_string()),
                    );
                    if done {
                        break;
                    }
                }
                Ok(None) => break,
                Err(_idle) => {
                    yield Ok(Event::default().event(HEARTBEAT_EVENT).data("{}"));
                }
            }
        }
    };

    Sse::new(frames).keep_alive(KeepAlive::default()).into_response()
}
