//! HTTP trigger server.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/sync` | Run one sync pass and return its report |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! When `server.trigger_secret` (or `SYNC_SECRET`) is set, `POST /api/sync`
//! requires `Authorization: Bearer <secret>`.
//!
//! # Responses
//!
//! ```json
//! { "success": true, "message": "Sync completed", "report": { ... } }
//! { "success": false, "error": "Unauthorized" }
//! { "success": false, "error": "Sync failed", "details": "..." }
//! ```
//!
//! A pass already in progress yields 409 with `error: "Sync already running"`.
//! A pass runs to completion even if the caller disconnects first.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use registry_mirror_core::RegistryStore;

use crate::client::{CatalogSource, HttpCatalogClient};
use crate::config::Config;
use crate::error::SyncError;
use crate::sqlite_store::SqliteStore;
use crate::sync::{SyncEngine, SyncOptions, SyncReport};

/// Shared state of the route handlers.
#[derive(Clone)]
pub struct AppState {
    engine: Arc<SyncEngine>,
    trigger_secret: Option<Arc<str>>,
}

impl AppState {
    pub fn new(engine: Arc<SyncEngine>, trigger_secret: Option<String>) -> Self {
        Self {
            engine,
            trigger_secret: trigger_secret.map(Arc::from),
        }
    }
}

/// Build the router. Split from [`run_server`] so tests can bind it to an
/// ephemeral port with their own store and catalog source.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/sync", post(handle_sync))
        .route("/health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the trigger server on `server.bind`, backed by the configured
/// database and upstream. Runs until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = crate::db::connect(config).await?;
    crate::migrate::migrate_pool(&pool).await?;

    let store: Arc<dyn RegistryStore> = Arc::new(SqliteStore::new(pool));
    let source: Arc<dyn CatalogSource> = Arc::new(HttpCatalogClient::new(&config.upstream)?);
    let engine = Arc::new(SyncEngine::new(
        store,
        source,
        SyncOptions::from_config(config),
    ));

    let app = build_router(AppState::new(engine, config.server.trigger_secret.clone()));

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(bind = %config.server.bind, "trigger server listening");
    println!("Trigger server listening on http://{}", config.server.bind);

    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

struct AppError {
    status: StatusCode,
    error: &'static str,
    details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            success: false,
            error: self.error,
            details: self.details,
        };
        (self.status, Json(body)).into_response()
    }
}

fn unauthorized() -> AppError {
    AppError {
        status: StatusCode::UNAUTHORIZED,
        error: "Unauthorized",
        details: None,
    }
}

impl From<SyncError> for AppError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::AlreadyRunning { .. } => AppError {
                status: StatusCode::CONFLICT,
                error: "Sync already running",
                details: Some(err.to_string()),
            },
            other => AppError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                error: "Sync failed",
                details: Some(other.to_string()),
            },
        }
    }
}

// ============ POST /api/sync ============

#[derive(Serialize)]
struct SyncResponse {
    success: bool,
    message: String,
    report: SyncReport,
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

/// Compare digests so the comparison cost does not depend on how much of
/// the token matches.
fn token_matches(provided: &str, secret: &str) -> bool {
    Sha256::digest(provided.as_bytes()) == Sha256::digest(secret.as_bytes())
}

async fn handle_sync(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<SyncResponse>, AppError> {
    if let Some(secret) = &state.trigger_secret {
        let authorized = bearer_token(&headers)
            .map(|token| token_matches(token, secret))
            .unwrap_or(false);
        if !authorized {
            return Err(unauthorized());
        }
    }

    // Detached so a dropped request cannot cancel the pass between its
    // lease acquisition and release.
    let engine = Arc::clone(&state.engine);
    let result = tokio::spawn(async move { engine.run().await })
        .await
        .map_err(|e| {
            error!(error = %e, "sync task did not complete");
            AppError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                error: "Sync failed",
                details: Some(e.to_string()),
            }
        })?;

    match result {
        Ok(report) => Ok(Json(SyncResponse {
            success: true,
            message: format!(
                "Sync completed: {} created, {} updated, {} failed",
                report.created,
                report.updated,
                report.failed.len()
            ),
            report,
        })),
        Err(e) => {
            error!(error = %e, "triggered sync failed");
            Err(e.into())
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn extracts_bearer_token() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer s3cret"));
        assert_eq!(bearer_token(&headers), Some("s3cret"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn compares_tokens_exactly() {
        assert!(token_matches("s3cret", "s3cret"));
        assert!(!token_matches("s3cre", "s3cret"));
        assert!(!token_matches("", "s3cret"));
    }
}
