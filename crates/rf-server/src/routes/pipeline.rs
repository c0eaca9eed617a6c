//! Pipeline introspection.

use axum::extract::{Path, State};
use axum::Json;
use rf_core::{CapabilitySet, JobId, StageName};
use rf_pipeline::StageSpec;
use serde::Serialize;

use crate::context::AppContext;
use crate::error::AppError;

/// GET /api/pipeline
pub async fn get_pipeline(State(ctx): State<AppContext>) -> Json<Vec<StageSpec>> {
    Json(ctx.orchestrator.definition().stages().to_vec())
}

#[derive(Debug, Serialize)]
pub struct PlannedStage {
    pub stage: StageName,
    pub capabilities: CapabilitySet,
}

/// GET /api/pipeline/plan/{job_id}
///
/// The capability set each stage would be granted for `job_id`.
pub async fn plan(
    State(ctx): State<AppContext>,
    Path(job_id): Path<String>,
) -> Result<Json<Vec<PlannedStage>>, AppError> {
    let job_id = JobId::parse(job_id)?;
    let plan = ctx
        .orchestrator
        .plan(&job_id)?
        .into_iter()
        .map(|(stage, capabilities)| PlannedStage {
            stage,
            capabilities,
        })
        .collect();
    Ok(Json(plan))
}
