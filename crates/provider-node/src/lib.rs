//! API Provider Node
//!
//! Hosts API handlers, advertises them to aggregators and keeps the ledger of
//! jobs, payments and earnings. Exposes a read-only status API.

pub mod config;
pub mod handlers;
pub mod jobs;

use axum::{routing::get, Router};
use std::path::Path;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

pub use handlers::AppState;
pub use jobs::{ApiHandler, EchoHandler, JobContext, JobRunner, Payment, QueueTicket, ResultStore};

/// Create the application router. Saved results are served from
/// `results_dir` under `/results`.
pub fn create_router(state: AppState, results_dir: &Path) -> Router {
    let shared_state = Arc::new(state);

    Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/api/stats", get(handlers::list_stats_handler))
        .route("/api/stats/{api_id}", get(handlers::get_stat_handler))
        .route("/api/jobs/{job_id}", get(handlers::get_job_handler))
        .route("/api/apis/{api_id}/jobs", get(handlers::list_api_jobs_handler))
        .route("/api/earnings", get(handlers::list_earnings_handler))
        .route(
            "/api/queue/{api_id}/position",
            get(handlers::queue_position_handler),
        )
        .route("/api/registrations", get(handlers::registrations_handler))
        .nest_service("/results", ServeDir::new(results_dir))
        .with_state(shared_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
