//! Function stages served by remote HTTP endpoints.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rf_core::{CapabilitySet, ObjectRef, StageError, StageName};
use serde::{Deserialize, Serialize};

use super::{FunctionInvoker, StageInput, StageOutput};
use crate::stage::StageSpec;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InvokeRequest<'a> {
    job_id: &'a str,
    stage: StageName,
    document: &'a serde_json::Value,
    capabilities: &'a CapabilitySet,
    bucket: &'a str,
    region: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvokeResponse {
    status: String,
    #[serde(default)]
    output_refs: Vec<ObjectRef>,
    #[serde(default)]
    error: Option<String>,
}

/// POSTs each stage to its configured endpoint.
///
/// The request carries the job document and the stage's scoped capability
/// set; the endpoint is expected to answer `{"status": "ok", "outputRefs":
/// [...]}`.
#[derive(Debug, Clone)]
pub struct HttpFunctionInvoker {
    client: reqwest::Client,
    endpoints: HashMap<StageName, String>,
}

impl HttpFunctionInvoker {
    pub fn new(endpoints: HashMap<StageName, String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoints,
        }
    }

    pub fn endpoint(&self, stage: StageName) -> Option<&str> {
        self.endpoints.get(&stage).map(String::as_str)
    }
}

#[async_trait]
impl FunctionInvoker for HttpFunctionInvoker {
    async fn invoke(
        &self,
        spec: &StageSpec,
        input: &StageInput,
        capabilities: Arc<CapabilitySet>,
    ) -> Result<StageOutput, StageError> {
        let url = self.endpoint(spec.name).ok_or_else(|| {
            StageError::execution(format!("no endpoint configured for stage '{}'", spec.name))
        })?;

        let body = InvokeRequest {
            job_id: input.job_id.as_str(),
            stage: spec.name,
            document: &input.document,
            capabilities: &capabilities,
            bucket: &input.bucket,
            region: &input.region,
        };

        tracing::debug!(stage = %spec.name, url, "Invoking stage endpoint");

        let resp = self
            .client
            .post(url)
            .timeout(spec.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    StageError::Timeout(spec.timeout)
                } else {
                    StageError::execution(format!("request to {url} failed: {e}"))
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(StageError::execution(format!(
                "endpoint returned {status}: {}",
                text.trim()
            )));
        }

        let parsed: InvokeResponse = resp
            .json()
            .await
            .map_err(|e| StageError::output_invalid(format!("unparsable response: {e}")))?;

        if parsed.status != "ok" {
            return Err(StageError::execution(
                parsed
                    .error
                    .unwrap_or_else(|| format!("stage reported status '{}'", parsed.status)),
            ));
        }

        Ok(StageOutput {
            output_refs: parsed.output_refs,
        })
    }
}
