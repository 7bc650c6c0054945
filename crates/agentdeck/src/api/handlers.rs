//! HTTP handlers: thin consumers and producers of the distribution
//! layer. No business logic lives here.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::{Stream, StreamExt};
use log::debug;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::bus::{BusEvent, EventFilter};
use crate::capture::CaptureService;
use crate::gateway::HealthSnapshot;

use super::error::{ApiError, ApiResult};
use super::state::AppState;

fn sse_event(event: &BusEvent) -> Result<Event, axum::Error> {
    Event::default().json_data(event)
}

/// GET /api/health
///
/// Read-only connection state + last error.
pub async fn health(State(state): State<AppState>) -> Json<HealthSnapshot> {
    Json(state.gateway.health())
}

/// GET /api/events
///
/// Live filtered stream of bus events as SSE.
pub async fn stream_events(
    State(state): State<AppState>,
    Query(filter): Query<EventFilter>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let subscriber = state.bus.subscribe(filter);
    let stream = subscriber.map(|event| sse_event(&event));
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// GET /api/terminals/{run_id}/stream
///
/// Replay the retained history as one `snapshot` frame, then live
/// chunks. Snapshot and subscription are taken atomically, so the
/// client observes no gap and no duplicate at the boundary.
pub async fn stream_terminal(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let (snapshot, subscriber) = state.replay.attach(&run_id);

    let initial = Event::default()
        .event("snapshot")
        .data(BASE64.encode(&snapshot));
    let stream = futures::stream::once(async move { Ok(initial) })
        .chain(subscriber.map(|event| sse_event(&event)));
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    /// Stable across client retries of the same logical send.
    pub idempotency_token: Option<String>,
}

/// POST /api/sessions/{session_id}/chat
pub async fn send_chat(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<ChatRequest>,
) -> ApiResult<Json<Value>> {
    let result = state
        .gateway
        .call_with_token(
            "session.chat",
            json!({ "session_id": session_id, "message": body.message }),
            body.idempotency_token,
        )
        .await?;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
pub struct TerminalInput {
    pub data: String,
}

/// POST /api/terminals/{run_id}/input
///
/// Keystroke delivery is deliberately non-fatal: failures are logged,
/// the client always gets 202.
pub async fn terminal_input(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(body): Json<TerminalInput>,
) -> StatusCode {
    state.gateway.call_detached(
        "terminal.input",
        json!({ "run_id": run_id, "data": body.data }),
    );
    StatusCode::ACCEPTED
}

#[derive(Debug, Deserialize)]
pub struct ResizeRequest {
    pub cols: u32,
    pub rows: u32,
}

/// POST /api/terminals/{run_id}/resize
pub async fn terminal_resize(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(body): Json<ResizeRequest>,
) -> ApiResult<StatusCode> {
    state
        .gateway
        .call(
            "terminal.resize",
            json!({ "run_id": run_id, "cols": body.cols, "rows": body.rows }),
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/terminals/{run_id}/kill
pub async fn terminal_kill(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<StatusCode> {
    state
        .gateway
        .call("terminal.kill", json!({ "run_id": run_id }))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Holds capture interest for as long as the SSE stream lives.
struct CaptureInterest(Arc<CaptureService>);

impl Drop for CaptureInterest {
    fn drop(&mut self) {
        self.0.remove_client();
        debug!("capture stream client detached");
    }
}

/// GET /api/capture/stream
///
/// Current screen state first (if any), then every change. Attaching
/// acquires polling interest; disconnecting releases it.
pub async fn stream_capture(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    Arc::clone(&state.capture).add_client();
    let interest = CaptureInterest(Arc::clone(&state.capture));

    let (initial, subscriber) = state.capture.attach();
    let head = futures::stream::iter(initial).map(|event| sse_event(&event));
    let live = subscriber.map(move |event| {
        let _ = &interest;
        sse_event(&event)
    });
    Sse::new(head.chain(live)).keep_alive(KeepAlive::default())
}

#[derive(Debug, Deserialize)]
pub struct CaptureTarget {
    pub target: String,
}

/// POST /api/capture/target
pub async fn capture_target(
    State(state): State<AppState>,
    Json(body): Json<CaptureTarget>,
) -> ApiResult<StatusCode> {
    if body.target.is_empty() {
        return Err(ApiError::BadRequest("target must not be empty".to_string()));
    }
    state.capture.set_target(body.target);
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct CaptureInput {
    pub data: String,
    /// Send as literal text rather than tmux key names.
    #[serde(default)]
    pub literal: bool,
}

/// POST /api/capture/input
pub async fn capture_input(
    State(state): State<AppState>,
    Json(body): Json<CaptureInput>,
) -> ApiResult<StatusCode> {
    state.capture.send_input(&body.data, body.literal).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/capture/resize
pub async fn capture_resize(
    State(state): State<AppState>,
    Json(body): Json<ResizeRequest>,
) -> ApiResult<StatusCode> {
    state.capture.resize(body.cols, body.rows).await?;
    Ok(StatusCode::NO_CONTENT)
}
