//! HTTP API Server
//!
//! Status queries for the router and the write surface a cluster monitor
//! uses to report server state.

use std::sync::Arc;
use axum::{
    extract::{Path, State, Json},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::router::{RouterDiagnostics, RouterInstance};
use crate::server::ServerUpdate;

/// Shared application state
pub struct AppState {
    /// Router whose servers and counters are exposed
    pub instance: Arc<RouterInstance>,
    /// When the service started
    pub started_at: DateTime<Utc>,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(config: ApiConfig, instance: Arc<RouterInstance>) -> Self {
        let state = Arc::new(AppState {
            instance,
            started_at: Utc::now(),
        });

        Self { config, state }
    }

    /// Get the state for sharing with other components
    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Create the router
    fn create_router(state: Arc<AppState>, cors_enabled: bool) -> Router {
        let router = Router::new()
            .route("/health", get(handle_health))
            .route("/stats", get(handle_stats))
            .route("/servers", get(handle_servers))
            .route("/servers/:name", get(handle_server_info).put(handle_server_update))
            .with_state(state)
            .layer(TraceLayer::new_for_http());

        if cors_enabled {
            router.layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            )
        } else {
            router
        }
    }

    /// Start the HTTP server
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let app = Self::create_router(Arc::clone(&self.state), self.config.cors_enabled);

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .await
            .map_err(|e| Error::Internal(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Request/Response Types ============

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// A running master exists
    pub healthy: bool,
    pub master: Option<String>,
    pub servers_running: usize,
    pub servers_total: usize,
    pub sessions_current: u64,
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: i64,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

fn not_found(name: &str) -> axum::response::Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: format!("Server {} not found", name),
            code: "SERVER_NOT_FOUND".to_string(),
        }),
    )
        .into_response()
}

// ============ Handlers ============

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let registry = state.instance.registry();
    let master = registry
        .iter()
        .filter(|s| s.is_master())
        .min_by_key(|s| s.depth())
        .map(|s| s.name().to_string());

    let body = HealthResponse {
        healthy: master.is_some(),
        master,
        servers_running: registry.iter().filter(|s| s.is_usable()).count(),
        servers_total: registry.len(),
        sessions_current: state.instance.stats().snapshot().sessions_current,
        started_at: state.started_at,
        uptime_seconds: (Utc::now() - state.started_at).num_seconds(),
    };

    let status = if body.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

async fn handle_stats(State(state): State<Arc<AppState>>) -> Json<RouterDiagnostics> {
    Json(state.instance.diagnostics())
}

async fn handle_servers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.instance.diagnostics().servers)
}

async fn handle_server_info(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state
        .instance
        .diagnostics()
        .servers
        .into_iter()
        .find(|s| s.server.name == name)
    {
        Some(server) => Json(server).into_response(),
        None => not_found(&name),
    }
}

async fn handle_server_update(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(update): Json<ServerUpdate>,
) -> impl IntoResponse {
    match state.instance.registry().update(&name, &update) {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(Error::UnknownServer(_)) => not_found(&name),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: e.to_string(),
                code: "UPDATE_FAILED".to_string(),
            }),
        )
            .into_response(),
    }
}
