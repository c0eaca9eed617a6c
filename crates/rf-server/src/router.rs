//! Axum router construction.

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::context::AppContext;
use crate::routes;

/// Build the complete Axum router.
pub fn build_router(ctx: AppContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        // Jobs
        .route(
            "/jobs",
            get(routes::jobs::list_jobs).post(routes::jobs::submit_job),
        )
        .route("/jobs/{job_id}", get(routes::jobs::get_job))
        // Executions
        .route(
            "/executions/{execution_id}",
            get(routes::executions::get_execution),
        )
        .route(
            "/executions/{execution_id}/cancel",
            post(routes::executions::cancel_execution),
        )
        // Pipeline
        .route("/pipeline", get(routes::pipeline::get_pipeline))
        .route("/pipeline/plan/{job_id}", get(routes::pipeline::plan))
        // SSE Events
        .route("/events", get(routes::events::events_handler));

    Router::new()
        .route("/health", get(routes::health::health_check))
        .nest("/api", api)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}
