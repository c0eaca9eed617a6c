//! Stage invokers.
//!
//! The orchestrator runs every stage through one of two seams, chosen by the
//! stage's [`ExecutionModel`](crate::stage::ExecutionModel):
//!
//! - [`FunctionInvoker`] for short request/response stages
//!   ([`HttpFunctionInvoker`], [`LocalFunctionInvoker`]);
//! - [`ContainerRunner`] for the long-running render task
//!   ([`ProcessContainerRunner`]).

pub mod builtin;
mod container;
mod http;
mod local;

pub use container::ProcessContainerRunner;
pub use http::HttpFunctionInvoker;
pub use local::{LocalFunctionInvoker, StageContext, StageFunction};

use std::sync::Arc;

use async_trait::async_trait;
use rf_core::{CapabilitySet, JobId, ObjectRef, StageError};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::stage::{ResourceFootprint, StageSpec};

/// What a stage is given to work on.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageInput {
    pub job_id: JobId,
    /// The accumulated job document (payload plus earlier stage results).
    pub document: serde_json::Value,
    pub bucket: String,
    pub region: String,
}

impl StageInput {
    /// Reference to `name` under this job's prefix.
    pub fn object(&self, name: &str) -> ObjectRef {
        ObjectRef::new(&self.bucket, format!("{}{name}", self.job_id.prefix()))
    }
}

/// What a successful stage reports back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageOutput {
    pub output_refs: Vec<ObjectRef>,
}

/// Runs function-model stages.
#[async_trait]
pub trait FunctionInvoker: Send + Sync {
    async fn invoke(
        &self,
        spec: &StageSpec,
        input: &StageInput,
        capabilities: Arc<CapabilitySet>,
    ) -> Result<StageOutput, StageError>;
}

/// Runs container-model stages.
///
/// Implementations must stop the task and return promptly once `cancel`
/// fires.
#[async_trait]
pub trait ContainerRunner: Send + Sync {
    async fn run(
        &self,
        spec: &StageSpec,
        input: &StageInput,
        capabilities: Arc<CapabilitySet>,
        footprint: &ResourceFootprint,
        cancel: CancellationToken,
    ) -> Result<StageOutput, StageError>;
}

/// Check a stage's reported outputs: every reference must live under the
/// job's prefix in the job's bucket, and every required file must be
/// reported.
pub fn check_outputs(
    spec: &StageSpec,
    input: &StageInput,
    output: &StageOutput,
) -> Result<(), StageError> {
    let prefix = input.job_id.prefix();
    for r in &output.output_refs {
        if r.bucket != input.bucket || !r.key.starts_with(&prefix) {
            return Err(StageError::output_invalid(format!(
                "output {r} is outside the job prefix"
            )));
        }
    }
    for required in &spec.required_outputs {
        let expected = format!("{prefix}{required}");
        if !output.output_refs.iter().any(|r| r.key == expected) {
            return Err(StageError::output_invalid(format!(
                "missing required output '{required}'"
            )));
        }
    }
    Ok(())
}
