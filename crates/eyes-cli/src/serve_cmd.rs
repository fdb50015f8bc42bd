use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::CorsLayer;

use eyes_core::{AgentProbeResult, AgentSummary, Controller, ControllerError, LatencyRequest};

use crate::config::EyesConfig;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn gateway_timeout(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::GATEWAY_TIMEOUT,
            message: msg.into(),
        }
    }

    pub fn bad_gateway(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            message: msg.into(),
        }
    }
}

impl From<ControllerError> for AppError {
    fn from(err: ControllerError) -> Self {
        match err {
            ControllerError::UnknownAgent(_) => Self::not_found(err.to_string()),
            ControllerError::Timeout { .. } | ControllerError::Expired(_) => {
                Self::gateway_timeout(err.to_string())
            }
            ControllerError::Session(_) | ControllerError::Bind { .. } => {
                Self::bad_gateway(err.to_string())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// State and response types
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ServeState {
    controller: Controller,
    probe_timeout: Duration,
}

impl ServeState {
    pub fn new(controller: Controller, probe_timeout: Duration) -> Self {
        Self {
            controller,
            probe_timeout,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: ServeState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/version", get(version))
        .route("/api/agents", get(list_agents))
        .route("/api/agents/{id}/probe", post(probe_agent))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Run the agent listener and the operator HTTP API until Ctrl+C.
pub async fn run_serve(config: EyesConfig) -> Result<()> {
    let controller = Controller::new(config.controller);
    controller.add_result_listener(|result: &AgentProbeResult| {
        tracing::debug!(
            agent_id = %result.agent_id,
            result_id = %result.result_id,
            samples = result.datapoints.len(),
            "probe result received"
        );
    });

    let agent_listener = controller
        .bind()
        .await
        .context("failed to start agent listener")?;
    let serving = controller.clone();
    let agents = tokio::spawn(async move { serving.serve(agent_listener).await });

    let app = build_router(ServeState::new(controller.clone(), config.probe_timeout));
    let addr: SocketAddr = format!("{}:{}", config.http_bind, config.http_port)
        .parse()
        .with_context(|| {
            format!(
                "invalid HTTP address {}:{}",
                config.http_bind, config.http_port
            )
        })?;
    tracing::info!("eyes serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {addr}"))?;

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    controller.close();
    if let Err(e) = agents.await {
        tracing::warn!(error = %e, "agent listener task failed");
    }
    served?;
    tracing::info!("eyes serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install Ctrl+C handler");
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn index(State(state): State<ServeState>) -> Html<String> {
    let agents = state.controller.agents();
    let rows = if agents.is_empty() {
        "<tr><td colspan=\"4\">No agents connected.</td></tr>".to_string()
    } else {
        agents
            .iter()
            .map(|a| {
                format!(
                    "<tr><td>{id}</td><td>{label}</td><td>{address}</td><td>{since}</td></tr>",
                    id = escape_html(&a.id),
                    label = escape_html(&a.label),
                    address = escape_html(&a.address),
                    since = a.connected_at.to_rfc3339(),
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    let (major, minor, patch) = state.controller.version();
    Html(format!(
        "<!DOCTYPE html>\
<html><head><title>eyes</title></head><body>\
<h1>eyes {major}.{minor}.{patch}</h1>\
<p><a href=\"/api/agents\">/api/agents</a> | <a href=\"/api/version\">/api/version</a></p>\
<table><tr><th>Agent</th><th>Label</th><th>Address</th><th>Connected</th></tr>{rows}</table>\
</body></html>"
    ))
}

/// Agent identities and labels are client-supplied.
fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

async fn version(State(state): State<ServeState>) -> Json<VersionResponse> {
    let (major, minor, patch) = state.controller.version();
    Json(VersionResponse {
        major,
        minor,
        patch,
    })
}

async fn list_agents(State(state): State<ServeState>) -> Json<Vec<AgentSummary>> {
    Json(state.controller.agents())
}

async fn probe_agent(
    State(state): State<ServeState>,
    Path(id): Path<String>,
    Json(request): Json<LatencyRequest>,
) -> Result<Json<AgentProbeResult>, AppError> {
    let result = state
        .controller
        .probe(&id, request, state.probe_timeout)
        .await?;
    Ok(Json(result))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
