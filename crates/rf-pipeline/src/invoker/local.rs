//! In-process function stages.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use rf_core::{Action, CapabilitySet, JobId, ObjectRef, ResourceKind, StageError, StageName};
use rf_store::{ObjectStore, ScopedObjectStore, ScopedVault, SecretVault};

use super::{FunctionInvoker, StageInput, StageOutput};
use crate::stage::StageSpec;

/// Everything an in-process stage may touch.
///
/// Storage and secrets are reachable only through capability-checked
/// wrappers; any other external call must first pass
/// [`authorize`](StageContext::authorize).
pub struct StageContext {
    pub stage: StageName,
    pub job_id: JobId,
    pub document: serde_json::Value,
    pub region: String,
    pub store: ScopedObjectStore,
    pub vault: ScopedVault,
    capabilities: Arc<CapabilitySet>,
}

impl StageContext {
    /// Check that the stage may perform `action` on `resource`.
    pub fn authorize(
        &self,
        kind: ResourceKind,
        resource: &str,
        action: Action,
    ) -> Result<(), StageError> {
        Ok(self.capabilities.check(kind, resource, action)?)
    }

    /// Write `name` under the job prefix.
    pub async fn put(&self, name: &str, bytes: impl Into<Bytes>) -> Result<ObjectRef, StageError> {
        Ok(self
            .store
            .put(&self.job_id.prefix(), name, bytes.into())
            .await?)
    }

    /// Read `name` from the job prefix.
    pub async fn get(&self, name: &str) -> Result<Bytes, StageError> {
        Ok(self.store.get(&self.object(name)).await?)
    }

    /// Reference to `name` under the job prefix.
    pub fn object(&self, name: &str) -> ObjectRef {
        ObjectRef::new(self.store.bucket(), format!("{}{name}", self.job_id.prefix()))
    }

    /// String payload field, e.g. `topic`.
    pub fn payload_str(&self, field: &str) -> Option<&str> {
        self.document
            .get("payload")
            .and_then(|p| p.get(field))
            .and_then(|v| v.as_str())
    }
}

/// One in-process stage implementation.
#[async_trait]
pub trait StageFunction: Send + Sync {
    async fn call(&self, ctx: StageContext) -> Result<Vec<ObjectRef>, StageError>;
}

/// Dispatches function stages to registered [`StageFunction`]s.
#[derive(Clone)]
pub struct LocalFunctionInvoker {
    store: Arc<dyn ObjectStore>,
    vault: Arc<dyn SecretVault>,
    functions: HashMap<StageName, Arc<dyn StageFunction>>,
}

impl LocalFunctionInvoker {
    pub fn new(store: Arc<dyn ObjectStore>, vault: Arc<dyn SecretVault>) -> Self {
        Self {
            store,
            vault,
            functions: HashMap::new(),
        }
    }

    /// An invoker with the built-in stand-in stages registered.
    pub fn with_builtins(store: Arc<dyn ObjectStore>, vault: Arc<dyn SecretVault>) -> Self {
        super::builtin::register_all(Self::new(store, vault))
    }

    pub fn register(mut self, stage: StageName, function: Arc<dyn StageFunction>) -> Self {
        self.functions.insert(stage, function);
        self
    }
}

#[async_trait]
impl FunctionInvoker for LocalFunctionInvoker {
    async fn invoke(
        &self,
        spec: &StageSpec,
        input: &StageInput,
        capabilities: Arc<CapabilitySet>,
    ) -> Result<StageOutput, StageError> {
        let function = self.functions.get(&spec.name).ok_or_else(|| {
            StageError::execution(format!("no function registered for stage '{}'", spec.name))
        })?;

        let ctx = StageContext {
            stage: spec.name,
            job_id: input.job_id.clone(),
            document: input.document.clone(),
            region: input.region.clone(),
            store: ScopedObjectStore::new(self.store.clone(), capabilities.clone()),
            vault: ScopedVault::new(self.vault.clone(), capabilities.clone()),
            capabilities,
        };

        let output_refs = function.call(ctx).await?;
        Ok(StageOutput { output_refs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rf_core::Capability;
    use rf_store::{MemoryObjectStore, MemoryVault};
    use std::time::Duration;

    struct Snoop;

    #[async_trait]
    impl StageFunction for Snoop {
        async fn call(&self, ctx: StageContext) -> Result<Vec<ObjectRef>, StageError> {
            ctx.store
                .get(&ObjectRef::new("media", "job-002/voice.wav"))
                .await?;
            Ok(vec![])
        }
    }

    struct Writer;

    #[async_trait]
    impl StageFunction for Writer {
        async fn call(&self, ctx: StageContext) -> Result<Vec<ObjectRef>, StageError> {
            let key = ctx.vault.get_secret("pexels/apiKey").await?;
            Ok(vec![ctx.put("clip.txt", key.into_bytes()).await?])
        }
    }

    fn invoker() -> LocalFunctionInvoker {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new("media"));
        let vault = MemoryVault::new();
        vault.insert("pexels/apiKey", "px");
        LocalFunctionInvoker::new(store, Arc::new(vault))
            .register(StageName::Tts, Arc::new(Snoop))
            .register(StageName::Broll, Arc::new(Writer))
    }

    fn input() -> StageInput {
        StageInput {
            job_id: JobId::parse("job-001").unwrap(),
            document: serde_json::json!({}),
            bucket: "media".into(),
            region: "local".into(),
        }
    }

    fn caps() -> Arc<CapabilitySet> {
        Arc::new(
            [
                Capability::new(
                    ResourceKind::ObjectStore,
                    "media/job-001/*",
                    [Action::Read, Action::Write],
                ),
                Capability::new(ResourceKind::Secret, "pexels/apiKey", [Action::Read]),
            ]
            .into_iter()
            .collect(),
        )
    }

    #[tokio::test]
    async fn stage_reading_another_job_is_denied() {
        let spec = StageSpec::function(StageName::Tts, Duration::from_secs(1));
        let err = invoker().invoke(&spec, &input(), caps()).await.unwrap_err();
        assert_matches!(err, StageError::CapabilityDenied(_));
    }

    #[tokio::test]
    async fn stage_uses_granted_resources() {
        let spec = StageSpec::function(StageName::Broll, Duration::from_secs(1));
        let out = invoker().invoke(&spec, &input(), caps()).await.unwrap();
        assert_eq!(out.output_refs, vec![ObjectRef::new("media", "job-001/clip.txt")]);
    }

    #[tokio::test]
    async fn unregistered_stage_is_execution_error() {
        let spec = StageSpec::function(StageName::Upload, Duration::from_secs(1));
        let err = invoker().invoke(&spec, &input(), caps()).await.unwrap_err();
        assert_matches!(err, StageError::Execution(_));
    }
}
