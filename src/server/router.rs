//! HTTP/WS surface of the relay.
//!
//! Two endpoint families: `/cdp/<id>` for CDP clients and `/extension` for
//! the single privileged extension socket, plus the JSON convenience wrappers
//! around the recording channel. The reachability probe (`HEAD /`) and
//! `/version` stay outside the auth guard so the extension can poll them
//! while reconnecting.

use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, Path, Query, State},
    http::{Method, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use relay_core::StartRecordingRequest;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use super::state::ServeState;
use super::ws::{run_client_socket, run_extension_socket};

pub fn build_router(state: ServeState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    let public = Router::new()
        .route("/", get(probe_handler))
        .route("/version", get(version_handler));

    let mut api = Router::new()
        .route("/status", get(status_handler))
        .route("/shutdown", post(shutdown_handler))
        .route("/cdp/:client_id", get(cdp_ws_handler))
        .route("/extension", get(extension_ws_handler))
        .route("/recording/start", post(recording_start_handler))
        .route("/recording/stop", post(recording_stop_handler))
        .route("/recording/cancel", post(recording_cancel_handler))
        .route("/recording/status", get(recording_status_handler));

    if let Some(policy) = state.policy.clone() {
        api = api.layer(middleware::from_fn_with_state(
            policy,
            super::auth::relay_auth_middleware,
        ));
    }

    Router::new()
        .merge(public)
        .merge(api)
        .layer(cors)
        .with_state(state)
}

/// `HEAD /` (and `GET /`): the extension's reachability probe.
async fn probe_handler() -> StatusCode {
    StatusCode::OK
}

async fn version_handler() -> Json<serde_json::Value> {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "builtAt": env!("BUILD_DATE"),
        "gitHash": env!("GIT_HASH"),
    }))
}

async fn status_handler(State(state): State<ServeState>) -> Json<serde_json::Value> {
    let snapshot = state.relay.status().await;
    Json(serde_json::to_value(snapshot).unwrap_or_else(|_| json!({})))
}

/// Loopback-only administrative stop; the mechanism behind `serve --replace`.
async fn shutdown_handler(
    State(state): State<ServeState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    if !peer.ip().is_loopback() {
        warn!(target: "relay-server", %peer, "shutdown refused for non-loopback peer");
        return (StatusCode::FORBIDDEN, Json(json!({"ok": false})));
    }
    info!(target: "relay-server", %peer, "shutdown requested over http");
    state.request_shutdown();
    (StatusCode::OK, Json(json!({"ok": true})))
}

#[derive(Deserialize)]
struct CdpQuery {
    /// Pin to a specific extension in multi-extension deployments. Single
    /// extension today; logged so misconfiguration is visible.
    #[serde(rename = "extensionId")]
    extension_id: Option<String>,
}

async fn cdp_ws_handler(
    Path(client_id): Path<String>,
    Query(query): Query<CdpQuery>,
    State(state): State<ServeState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if let Some(extension_id) = query.extension_id {
        info!(target: "relay-server", %client_id, %extension_id, "client pinned extension id");
    }
    ws.on_upgrade(move |socket| run_client_socket(state.relay, client_id, socket))
}

async fn extension_ws_handler(
    State(state): State<ServeState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_extension_socket(state.relay, socket))
}

async fn recording_start_handler(
    State(state): State<ServeState>,
    Json(request): Json<StartRecordingRequest>,
) -> impl IntoResponse {
    Json(state.relay.recording_start(request).await)
}

#[derive(Deserialize, Default)]
struct RecordingSelector {
    #[serde(rename = "sessionId", default)]
    session_id: Option<String>,
}

async fn recording_stop_handler(
    State(state): State<ServeState>,
    body: Option<Json<RecordingSelector>>,
) -> impl IntoResponse {
    let selector = body.map(|Json(body)| body.session_id).unwrap_or_default();
    Json(state.relay.recording_stop(selector).await)
}

async fn recording_cancel_handler(
    State(state): State<ServeState>,
    body: Option<Json<RecordingSelector>>,
) -> impl IntoResponse {
    let selector = body.map(|Json(body)| body.session_id).unwrap_or_default();
    Json(state.relay.recording_cancel(selector).await)
}

async fn recording_status_handler(
    State(state): State<ServeState>,
    Query(query): Query<RecordingSelector>,
) -> impl IntoResponse {
    Json(state.relay.recording_status(query.session_id).await)
}
