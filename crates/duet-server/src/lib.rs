//! Duet Web Server
//!
//! Axum-based HTTP surface for the duet pipeline:
//! - `POST /api/submissions` runs a notification through ingestion
//! - Read-only inspection of transactions and enrichment jobs
//! - Background enrichment worker, stopped gracefully with the server
//!
//! Authentication is expected to be handled in front of this service.

use std::sync::Arc;

use axum::{
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use duet_core::{Database, Ingestor, PipelineConfig, WorkerConfig};

mod handlers;
mod worker;

pub use worker::{start_enrichment_worker, WorkerHandle};

/// Maximum pagination limit
pub const MAX_PAGE_LIMIT: i64 = 1000;

/// Server configuration
#[derive(Clone, Default)]
pub struct ServerConfig {
    /// Allowed CORS origins (empty = same-origin only)
    pub allowed_origins: Vec<String>,
    /// Run the enrichment worker inside the server process
    pub run_worker: bool,
    pub pipeline: PipelineConfig,
    pub worker: WorkerConfig,
}

impl ServerConfig {
    /// Pipeline and worker settings from the environment, worker enabled
    pub fn from_env() -> Self {
        Self {
            allowed_origins: vec![],
            run_worker: true,
            pipeline: PipelineConfig::from_env(),
            worker: WorkerConfig::from_env(),
        }
    }
}

/// Shared application state
pub struct AppState {
    pub db: Database,
    pub ingestor: Ingestor,
}

/// Create the router with all routes
pub fn create_router(db: Database, config: &ServerConfig) -> Router {
    let state = Arc::new(AppState {
        ingestor: Ingestor::new(db.clone(), config.pipeline.clone(), config.worker.clone()),
        db,
    });

    let api_routes = Router::new()
        .route("/health", get(handlers::health))
        .route("/submissions", post(handlers::submit))
        .route("/transactions", get(handlers::list_transactions))
        .route("/transactions/:id", get(handlers::get_transaction))
        .route("/jobs", get(handlers::list_jobs));

    let cors = if config.allowed_origins.is_empty() {
        CorsLayer::new()
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
    } else {
        let origins: Vec<HeaderValue> = config
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
    };

    Router::new()
        .nest("/api", api_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Start the server and, if configured, the enrichment worker
///
/// Runs until Ctrl-C; the worker then finishes its in-flight jobs before
/// this returns.
pub async fn serve(db: Database, host: &str, port: u16, config: ServerConfig) -> anyhow::Result<()> {
    // Jobs leased by a previous process that died mid-run
    match db.requeue_expired_leases(Utc::now()) {
        Ok(count) if count > 0 => warn!("Requeued {} job(s) from a previous session", count),
        Ok(_) => {}
        Err(e) => warn!("Failed to requeue expired job leases: {}", e),
    }

    let worker = if config.run_worker {
        Some(start_enrichment_worker(
            db.clone(),
            config.worker.clone(),
            config.pipeline.clone(),
        ))
    } else {
        info!("Enrichment worker disabled for this process");
        None
    };

    let app = create_router(db, &config);
    let addr = format!("{}:{}", host, port);

    info!("Starting server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(worker) = worker {
        worker.stop().await;
    }
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

// ============================================================================
// Error Handling
// ============================================================================

/// Application error type with proper HTTP status codes
pub struct AppError {
    status: StatusCode,
    message: String,
    internal: Option<anyhow::Error>,
}

impl AppError {
    pub fn bad_request(msg: &str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.to_string(),
            internal: None,
        }
    }

    pub fn not_found(msg: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.to_string(),
            internal: None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // Log the full internal error if present
        if let Some(err) = &self.internal {
            error!(error = %err, "Internal error");
        }

        let body = Json(serde_json::json!({
            "error": self.message
        }));

        (self.status, body).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            // Return generic message to client
            message: "An internal error occurred".to_string(),
            // Keep full error for logging
            internal: Some(err.into()),
        }
    }
}
