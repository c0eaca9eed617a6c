//! Execution handles: status and cancellation.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use rf_core::{ExecutionId, Job};
use rf_pipeline::ExecutionHandle;

use crate::context::AppContext;
use crate::error::AppError;

fn handle(ctx: &AppContext, raw: &str) -> Result<ExecutionHandle, AppError> {
    let execution_id: ExecutionId = raw
        .parse()
        .map_err(|_| rf_core::Error::Validation(format!("invalid execution id '{raw}'")))?;
    Ok(ctx.orchestrator.execution(&execution_id)?)
}

/// GET /api/executions/{execution_id}
pub async fn get_execution(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<Json<Job>, AppError> {
    let handle = handle(&ctx, &id)?;
    Ok(Json(ctx.orchestrator.status(&handle).await?))
}

/// POST /api/executions/{execution_id}/cancel
pub async fn cancel_execution(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let handle = handle(&ctx, &id)?;
    let cancelled = ctx.orchestrator.cancel(&handle)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "execution_id": handle.execution_id,
            "job_id": handle.job_id,
            "cancelled": cancelled,
        })),
    ))
}
