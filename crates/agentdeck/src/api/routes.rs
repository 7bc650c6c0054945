//! API route definitions.

use axum::http::{Method, header};
use axum::{
    Router,
    routing::{get, post},
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::handlers;
use super::state::AppState;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT]);

    let api_routes = Router::new()
        .route("/health", get(handlers::health))
        // Live event stream
        .route("/events", get(handlers::stream_events))
        // Terminal replay + control
        .route("/terminals/{run_id}/stream", get(handlers::stream_terminal))
        .route("/terminals/{run_id}/input", post(handlers::terminal_input))
        .route("/terminals/{run_id}/resize", post(handlers::terminal_resize))
        .route("/terminals/{run_id}/kill", post(handlers::terminal_kill))
        // Chat
        .route("/sessions/{session_id}/chat", post(handlers::send_chat))
        // Screen capture
        .route("/capture/stream", get(handlers::stream_capture))
        .route("/capture/target", post(handlers::capture_target))
        .route("/capture/input", post(handlers::capture_input))
        .route("/capture/resize", post(handlers::capture_resize));

    Router::new()
        .nest("/api", api_routes)
        .layer(cors)
        .layer(trace_layer)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::http::StatusCode;
    use axum_test::TestServer;
    use serde_json::{Value, json};

    use crate::bus::EventBus;
    use crate::capture::{CaptureService, TmuxSampler};
    use crate::config::GatewayConfig;
    use crate::gateway::{ConnectionManager, DeviceIdentity};
    use crate::replay::ReplayRegistry;

    use super::super::state::AppState;
    use super::create_router;

    // Builds a fully wired router whose gateway has never connected.
    fn test_server() -> TestServer {
        let bus = Arc::new(EventBus::new());
        let replay = Arc::new(ReplayRegistry::new(Arc::clone(&bus), 64 * 1024));
        let capture = Arc::new(CaptureService::new(
            Arc::clone(&bus),
            Arc::new(TmuxSampler),
            Duration::from_millis(100),
            "main",
        ));
        let (_manager, gateway) = ConnectionManager::new(
            &GatewayConfig::default(),
            DeviceIdentity::generate(),
            Arc::clone(&bus),
            Arc::clone(&replay),
        );

        let state = AppState {
            bus,
            replay,
            capture,
            gateway,
        };
        TestServer::new(create_router(state)).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_disconnected_before_connect() {
        let server = test_server();

        let response = server.get("/api/health").await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["state"], "disconnected");
    }

    #[tokio::test]
    async fn test_chat_fails_fast_while_disconnected() {
        let server = test_server();

        let response = server
            .post("/api/sessions/sess-1/chat")
            .json(&json!({ "message": "hello" }))
            .await;
        response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
        let body: Value = response.json();
        assert_eq!(body["code"], "SERVICE_UNAVAILABLE");
    }

    #[tokio::test]
    async fn test_capture_target_rejects_empty() {
        let server = test_server();

        let response = server
            .post("/api/capture/target")
            .json(&json!({ "target": "" }))
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_capture_target_accepts_update() {
        let server = test_server();

        let response = server
            .post("/api/capture/target")
            .json(&json!({ "target": "work:1" }))
            .await;
        response.assert_status(StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_terminal_input_always_accepted() {
        let server = test_server();

        let response = server
            .post("/api/terminals/run-1/input")
            .json(&json!({ "data": "ls\n" }))
            .await;
        response.assert_status(StatusCode::ACCEPTED);
    }
}
