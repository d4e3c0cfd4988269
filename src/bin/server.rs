use std::process::ExitCode;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::Deserialize;
use serde_json::json;
use tower_http::services::{ServeDir, ServeFile};
use tracing::{error, info, warn};

use mmo_lanes_server::auth::DevAuthenticator;
use mmo_lanes_server::config::ServerConfig;
use mmo_lanes_server::coordinator::ControlRequest;
use mmo_lanes_server::runtime::Runtime;
use mmo_lanes_server::telemetry;
use mmo_lanes_server::transport::{handle_socket, WsTransport};
use mmo_lanes_server::types::{ControlMessage, ControlScope};

#[derive(Clone)]
struct AppState {
    transport: Arc<WsTransport>,
    runtime: Arc<Runtime>,
}

#[derive(Debug, Deserialize)]
struct AnnounceBody {
    text: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = ServerConfig::parse();
    if let Err(err) = telemetry::init(config.log_format, &config.log_filter) {
        eprintln!("[server] {err}");
        return ExitCode::from(2);
    }
    if let Err(err) = config.validate() {
        error!(%err, "invalid configuration");
        return ExitCode::from(2);
    }

    let transport = Arc::new(WsTransport::new(config.outbound_capacity));
    let runtime = match Runtime::start(
        &config,
        transport.clone(),
        Box::new(DevAuthenticator::new()),
    ) {
        Ok(runtime) => Arc::new(runtime),
        Err(err) => {
            error!(%err, "failed to start runtime");
            return ExitCode::FAILURE;
        }
    };

    let state = AppState {
        transport,
        runtime: runtime.clone(),
    };
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/api/status", get(status_handler))
        .route("/api/announce", post(announce_handler))
        .route("/ws", get(ws_handler))
        .with_state(state);

    let app = match &config.static_dir {
        Some(static_dir) if static_dir.join("index.html").is_file() => {
            info!(root = %static_dir.display(), "serving static files");
            let index_file = static_dir.join("index.html");
            app.fallback_service(
                ServeDir::new(static_dir).not_found_service(ServeFile::new(index_file)),
            )
        }
        Some(static_dir) => {
            warn!(root = %static_dir.display(), "static dir has no index.html; not serving it");
            app
        }
        None => app,
    };

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(%err, addr = %bind_addr, "failed to bind server socket");
            shutdown_runtime(runtime);
            return ExitCode::FAILURE;
        }
    };

    info!(port = config.port, role = ?config.role, lanes = config.lanes, "listening");
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;
    shutdown_runtime(runtime);
    match served {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "server runtime failed");
            ExitCode::FAILURE
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(%err, "failed to listen for ctrl-c");
        return;
    }
    info!("shutdown requested");
}

fn shutdown_runtime(runtime: Arc<Runtime>) {
    match Arc::try_unwrap(runtime) {
        Ok(runtime) => runtime.shutdown(),
        Err(_) => warn!("runtime still shared at exit; threads not joined"),
    }
}

async fn healthz() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let mut status = serde_json::to_value(state.runtime.status()).unwrap_or_else(|_| json!({}));
    status["websockets"] = json!(state.transport.connection_count());
    Json(status)
}

async fn announce_handler(
    State(state): State<AppState>,
    Json(body): Json<AnnounceBody>,
) -> impl IntoResponse {
    let request = ControlRequest::Route {
        scope: ControlScope::Broadcast,
        message: ControlMessage::Announcement { text: body.text },
    };
    match state.runtime.control().try_send(request) {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({ "ok": true }))),
        Err(err) => {
            warn!(%err, "announcement dropped");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "ok": false, "error": "control queue unavailable" })),
            )
        }
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let transport = state.transport.clone();
    ws.on_upgrade(move |socket| handle_socket(transport, socket))
}
