//! HTTP surface: JSON-RPC tool endpoint plus orchestration routes.

use anyhow::{anyhow, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{debug, error, info, instrument};

use crate::error::{codes, OrchestratorError, ToolError};
use crate::orchestrator::Orchestrator;
use crate::protocol;
use crate::settings::ServerConfig;
use crate::store::PersistentRegistry;

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<PersistentRegistry>,
    pub orchestrator: Arc<Orchestrator>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    agent_count: usize,
}

#[derive(Deserialize)]
struct OrchestrateRequest {
    goal: String,
}

#[derive(Deserialize)]
struct RpcRequest {
    jsonrpc: String,
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ToolError>,
}

impl RpcResponse {
    fn reply(id: Value, outcome: Result<Value, ToolError>) -> Self {
        let (result, error) = match outcome {
            Ok(value) => (Some(value), None),
            Err(e) => (None, Some(e)),
        };
        Self {
            jsonrpc: "2.0",
            id,
            result,
            error,
        }
    }
}

pub fn create_router(state: AppState, config: &ServerConfig) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/rpc", post(rpc))
        .route("/orchestrate", post(orchestrate))
        .route("/state", get(current_state))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(config.max_request_size_mb * 1024 * 1024))
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        agent_count: state.registry.get_stats().total,
    })
}

/// JSON-RPC 2.0 envelope around the tool protocol.
#[instrument(skip(state, body))]
async fn rpc(State(state): State<AppState>, body: Bytes) -> Json<RpcResponse> {
    let raw: Value = match serde_json::from_slice(&body) {
        Ok(raw) => raw,
        Err(e) => {
            return Json(RpcResponse::reply(
                Value::Null,
                Err(ToolError::new(codes::PARSE_ERROR, format!("Parse error: {}", e))),
            ))
        }
    };

    let id = raw.get("id").cloned().unwrap_or(Value::Null);
    let request: RpcRequest = match serde_json::from_value(raw) {
        Ok(request) => request,
        Err(e) => {
            return Json(RpcResponse::reply(
                id,
                Err(ToolError::new(codes::INVALID_REQUEST, format!("Invalid request: {}", e))),
            ))
        }
    };
    if request.jsonrpc != "2.0" {
        return Json(RpcResponse::reply(
            request.id,
            Err(ToolError::new(codes::INVALID_REQUEST, "jsonrpc must be \"2.0\"")),
        ));
    }

    debug!("RPC call {}", request.method);
    let outcome = protocol::handle(&state.registry, &request.method, request.params).await;
    Json(RpcResponse::reply(request.id, outcome))
}

#[instrument(skip(state, request))]
async fn orchestrate(
    State(state): State<AppState>,
    Json(request): Json<OrchestrateRequest>,
) -> Response {
    if request.goal.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "goal must not be empty"}))).into_response();
    }

    match state.orchestrator.execute(&request.goal).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => {
            error!("Orchestration failed: {}", e);
            let status = match e {
                OrchestratorError::Planning(_) => StatusCode::BAD_GATEWAY,
                OrchestratorError::State(_) => StatusCode::CONFLICT,
                OrchestratorError::Exhausted { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, Json(json!({"error": e.to_string()}))).into_response()
        }
    }
}

async fn current_state(State(state): State<AppState>) -> Response {
    Json(state.orchestrator.export_state()).into_response()
}

/// Bind `addr` and serve until Ctrl+C or SIGTERM.
pub async fn serve(addr: SocketAddr, state: AppState, config: &ServerConfig) -> Result<()> {
    let app = create_router(state, config);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow!("Failed to bind {}: {}", addr, e))?;
    info!("HTTP server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown())
        .await
        .map_err(|e| anyhow!("HTTP server error: {}", e))?;

    info!("HTTP server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C, or SIGTERM on unix)
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down gracefully"),
        _ = terminate => info!("Received SIGTERM, shutting down gracefully"),
    }
}
