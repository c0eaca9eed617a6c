//! Job submission and lookup.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use rf_core::{Job, JobId, JobStatus};
use serde::Deserialize;

use crate::context::AppContext;
use crate::error::AppError;

/// Upper bound on `limit` for listings.
const MAX_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
pub struct ListJobsParams {
    pub status: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    pub job_id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// GET /api/jobs
pub async fn list_jobs(
    State(ctx): State<AppContext>,
    Query(params): Query<ListJobsParams>,
) -> Result<Json<Vec<Job>>, AppError> {
    let status = params
        .status
        .as_deref()
        .map(str::parse::<JobStatus>)
        .transpose()?;
    let jobs = ctx
        .orchestrator
        .list_jobs(status, params.limit.min(MAX_LIMIT))
        .await?;
    Ok(Json(jobs))
}

/// POST /api/jobs
pub async fn submit_job(
    State(ctx): State<AppContext>,
    Json(body): Json<SubmitJobRequest>,
) -> Result<impl IntoResponse, AppError> {
    let job_id = JobId::parse(body.job_id)?;
    let payload = match body.payload {
        serde_json::Value::Null => serde_json::json!({}),
        serde_json::Value::Object(map) => serde_json::Value::Object(map),
        _ => {
            return Err(rf_core::Error::Validation("payload must be a JSON object".into()).into());
        }
    };

    let handle = ctx.orchestrator.start(job_id, payload).await?;
    Ok((StatusCode::CREATED, Json(handle)))
}

/// GET /api/jobs/{job_id}
pub async fn get_job(
    State(ctx): State<AppContext>,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, AppError> {
    let job_id = JobId::parse(job_id)?;
    Ok(Json(ctx.orchestrator.get_job(&job_id).await?))
}
