use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{ws::WebSocket, Path, Query, State, WebSocketUpgrade},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, put},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::ServerConfig;
use crate::policy::CommandPolicy;
use crate::registry::{SessionRegistry, SessionSnapshot};
use crate::supervisor::ExecutionSupervisor;
use crate::transport::{HostTransports, Target};

pub struct AppState {
    pub registry: SessionRegistry,
    pub policy: Arc<CommandPolicy>,
    pub metrics: PrometheusHandle,
}

impl AppState {
    pub fn new(registry: SessionRegistry, metrics: PrometheusHandle) -> Arc<Self> {
        let policy = Arc::clone(registry.supervisor().policy());
        Arc::new(Self {
            registry,
            policy,
            metrics,
        })
    }

    /// Wires policy, inventory and transports from `config`.
    pub fn from_config(config: &ServerConfig, metrics: PrometheusHandle) -> Result<Arc<Self>> {
        let policy = Arc::new(config.load_policy()?);
        let inventory = Arc::new(config.load_inventory()?);
        info!(
            allowed = ?policy.allowed_commands(),
            denied = ?policy.denied_tokens(),
            inventory_hosts = inventory.len(),
            "command policy loaded"
        );
        let transports = HostTransports::new(config.shell.clone(), inventory, config.ssh.clone());
        let supervisor = ExecutionSupervisor::new(policy, Arc::new(transports), config.limits);
        let registry = SessionRegistry::new(config.session.clone(), supervisor);
        Ok(Self::new(registry, metrics))
    }
}

pub fn router(state: Arc<AppState>, enable_admin: bool) -> Router {
    let mut router = Router::new()
        .route("/healthz", get(health_handler))
        .route("/http/health", get(health_handler))
        .route("/http/allowed", get(allowed_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(ws_handler));

    if enable_admin {
        router = router.route(
            "/http/allowed/:command",
            put(allow_handler).delete(revoke_handler),
        );
    }

    router
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn allowed_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "success",
        "commands": state.policy.allowed_commands(),
    }))
}

async fn allow_handler(
    State(state): State<Arc<AppState>>,
    Path(command): Path<String>,
) -> impl IntoResponse {
    let command = command.trim().to_string();
    if command.is_empty() || command.contains(char::is_whitespace) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "status": "error", "message": "command must be a single word" })),
        );
    }
    let status = if state.policy.allow(&command) {
        info!(%command, "command allowed");
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    (status, Json(json!({ "status": "success", "command": command })))
}

async fn revoke_handler(
    State(state): State<Arc<AppState>>,
    Path(command): Path<String>,
) -> impl IntoResponse {
    if state.policy.revoke(&command) {
        info!(%command, "command revoked");
        (
            StatusCode::OK,
            Json(json!({ "status": "success", "command": command })),
        )
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "status": "error", "message": "command was not allowed" })),
        )
    }
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    active_sessions: usize,
    executing: usize,
    sessions: Vec<SessionSnapshot>,
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let sessions = state.registry.snapshot();
    Json(StatsResponse {
        active_sessions: sessions.len(),
        executing: sessions.iter().filter(|s| s.executing).count(),
        sessions,
    })
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

#[derive(Debug, Default, Deserialize)]
struct WsQuery {
    #[serde(default)]
    target: Option<String>,
}

async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let target = Target::parse(query.target.as_deref());
    let max_frame = state.registry.config().max_frame_bytes;
    ws.max_message_size(max_frame)
        .max_frame_size(max_frame)
        .on_upgrade(move |socket| handle_connection(socket, state, target))
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>, target: Target) {
    let (session, outbound) = state.registry.open(target);
    let session_id = session.id();
    info!(
        session_id = %session_id,
        target = %session.target(),
        "session opened"
    );

    session.serve(socket, outbound).await;
    state.registry.remove(session_id);
    info!(session_id = %session_id, "session finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionConfig;
    use crate::supervisor::ExecutionLimits;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use tower::ServiceExt;

    fn state() -> Arc<AppState> {
        let supervisor = ExecutionSupervisor::new(
            Arc::new(CommandPolicy::default()),
            Arc::new(HostTransports::local_only("/bin/sh")),
            ExecutionLimits::default(),
        );
        let registry = SessionRegistry::new(SessionConfig::default(), supervisor);
        AppState::new(registry, crate::telemetry::detached_metrics_handle().unwrap())
    }

    async fn call(app: Router, method: Method, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn health_and_allowed_listing() {
        let app = router(state(), false);
        let (status, body) = call(app.clone(), Method::GET, "/http/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "status": "ok" }));

        let (status, body) = call(app, Method::GET, "/http/allowed").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({ "status": "success", "commands": ["journalctl", "ls", "tail", "tcpdump"] })
        );
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn admin_routes_are_only_mounted_on_request() {
        let (status, _) = call(router(state(), false), Method::PUT, "/http/allowed/uptime").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let state = state();
        let app = router(Arc::clone(&state), true);
        let (status, _) = call(app.clone(), Method::PUT, "/http/allowed/uptime").await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, _) = call(app.clone(), Method::PUT, "/http/allowed/uptime").await;
        assert_eq!(status, StatusCode::OK);
        assert!(state.policy.allowed_commands().contains(&"uptime".to_string()));

        let (status, _) = call(app.clone(), Method::DELETE, "/http/allowed/uptime").await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(app, Method::DELETE, "/http/allowed/uptime").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn stats_start_empty() {
        let (status, body) = call(router(state(), false), Method::GET, "/debug/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["active_sessions"], 0);
        assert_eq!(body["sessions"], json!([]));
    }
}
