//! Shared test harness for integration tests.
//!
//! [`TestHarness`] wires an [`Orchestrator`] to an in-memory ledger and
//! object store with scripted invokers: each stage can be told to succeed,
//! fail, or hang, and every invocation is recorded together with the
//! capability set it was given. [`TestHarness::with_server`] additionally
//! serves the HTTP API on a random port.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rf_core::config::{Config, PipelineConfig};
use rf_core::events::EventBus;
use rf_core::{CapabilitySet, JobId, StageError, StageName};
use rf_pipeline::{
    CapabilityScoper, ContainerRunner, FunctionInvoker, Orchestrator, OrchestratorSettings,
    PipelineDefinition, ResourceContext, ResourceFootprint, StageInput, StageOutput, StageSpec,
};
use rf_server::context::AppContext;
use rf_server::router::build_router;
use rf_store::{JobLedger, MemoryLedger, MemoryObjectStore, ObjectStore};
use tokio_util::sync::CancellationToken;

pub const BUCKET: &str = "media";
pub const REGION: &str = "local";

/// How a scripted stage behaves when invoked.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Write the required outputs and report them.
    Succeed,
    /// Fail immediately with the given error.
    Fail(StageError),
    /// Sleep, then succeed.
    Delay(Duration),
    /// Never finish on its own.
    Hang,
    /// Succeed without reporting any output.
    NoOutputs,
    /// Panic inside the invocation.
    Panic,
}

/// One recorded invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub stage: StageName,
    pub job_id: JobId,
    pub capabilities: CapabilitySet,
    /// Stages present in the job document when the stage was invoked.
    pub visible_stages: Vec<String>,
    /// Stages present in the ledger record when the stage was invoked.
    pub persisted_stages: Vec<StageName>,
}

/// Scripted function and container invoker.
pub struct Scripted {
    behaviors: Mutex<HashMap<StageName, Behavior>>,
    invocations: Mutex<Vec<Invocation>>,
    store: Arc<MemoryObjectStore>,
    ledger: Arc<dyn JobLedger>,
    container_saw_cancel: AtomicBool,
}

impl Scripted {
    fn new(store: Arc<MemoryObjectStore>, ledger: Arc<dyn JobLedger>) -> Self {
        Self {
            behaviors: Mutex::new(HashMap::new()),
            invocations: Mutex::new(Vec::new()),
            store,
            ledger,
            container_saw_cancel: AtomicBool::new(false),
        }
    }

    pub fn set(&self, stage: StageName, behavior: Behavior) {
        self.behaviors.lock().unwrap().insert(stage, behavior);
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn invoked_stages(&self, job_id: &str) -> Vec<StageName> {
        self.invocations()
            .into_iter()
            .filter(|i| i.job_id.as_str() == job_id)
            .map(|i| i.stage)
            .collect()
    }

    pub fn container_saw_cancel(&self) -> bool {
        self.container_saw_cancel.load(Ordering::SeqCst)
    }

    async fn record(&self, spec: &StageSpec, input: &StageInput, caps: &CapabilitySet) {
        let visible_stages = input.document["stages"]
            .as_object()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        let persisted_stages = self
            .ledger
            .get(&input.job_id)
            .await
            .unwrap()
            .map(|job| job.stages.keys())
            .unwrap_or_default();
        self.invocations.lock().unwrap().push(Invocation {
            stage: spec.name,
            job_id: input.job_id.clone(),
            capabilities: caps.clone(),
            visible_stages,
            persisted_stages,
        });
    }

    fn behavior(&self, stage: StageName) -> Behavior {
        self.behaviors
            .lock()
            .unwrap()
            .get(&stage)
            .cloned()
            .unwrap_or(Behavior::Succeed)
    }

    async fn outputs(&self, spec: &StageSpec, input: &StageInput) -> StageOutput {
        let mut output_refs = Vec::new();
        for name in &spec.required_outputs {
            let r = self
                .store
                .put(
                    &input.job_id.prefix(),
                    name,
                    Bytes::from(format!("{} output", spec.name)),
                )
                .await
                .unwrap();
            output_refs.push(r);
        }
        StageOutput { output_refs }
    }

    async fn act(&self, spec: &StageSpec, input: &StageInput) -> Result<StageOutput, StageError> {
        match self.behavior(spec.name) {
            Behavior::Succeed => Ok(self.outputs(spec, input).await),
            Behavior::Fail(err) => Err(err),
            Behavior::Delay(d) => {
                tokio::time::sleep(d).await;
                Ok(self.outputs(spec, input).await)
            }
            Behavior::Hang => std::future::pending().await,
            Behavior::NoOutputs => Ok(StageOutput::default()),
            Behavior::Panic => panic!("scripted {} stage panicked", spec.name),
        }
    }
}

#[async_trait]
impl FunctionInvoker for Scripted {
    async fn invoke(
        &self,
        spec: &StageSpec,
        input: &StageInput,
        capabilities: Arc<CapabilitySet>,
    ) -> Result<StageOutput, StageError> {
        self.record(spec, input, &capabilities).await;
        self.act(spec, input).await
    }
}

#[async_trait]
impl ContainerRunner for Scripted {
    async fn run(
        &self,
        spec: &StageSpec,
        input: &StageInput,
        capabilities: Arc<CapabilitySet>,
        _footprint: &ResourceFootprint,
        cancel: CancellationToken,
    ) -> Result<StageOutput, StageError> {
        self.record(spec, input, &capabilities).await;
        tokio::select! {
            result = self.act(spec, input) => result,
            _ = cancel.cancelled() => {
                self.container_saw_cancel.store(true, Ordering::SeqCst);
                Err(StageError::execution("container task stopped"))
            }
        }
    }
}

/// Bridges the shared [`Scripted`] into both invoker seams.
struct Shared(Arc<Scripted>);

#[async_trait]
impl FunctionInvoker for Shared {
    async fn invoke(
        &self,
        spec: &StageSpec,
        input: &StageInput,
        capabilities: Arc<CapabilitySet>,
    ) -> Result<StageOutput, StageError> {
        FunctionInvoker::invoke(self.0.as_ref(), spec, input, capabilities).await
    }
}

#[async_trait]
impl ContainerRunner for Shared {
    async fn run(
        &self,
        spec: &StageSpec,
        input: &StageInput,
        capabilities: Arc<CapabilitySet>,
        footprint: &ResourceFootprint,
        cancel: CancellationToken,
    ) -> Result<StageOutput, StageError> {
        self.0
            .run(spec, input, capabilities, footprint, cancel)
            .await
    }
}

/// Orchestrator over in-memory resources and scripted stages.
pub struct TestHarness {
    pub orchestrator: Orchestrator,
    pub scripted: Arc<Scripted>,
    pub store: Arc<MemoryObjectStore>,
    pub ledger: Arc<MemoryLedger>,
    pub events: Arc<EventBus>,
}

impl TestHarness {
    /// Default stage timeouts and a 20 minute pipeline budget.
    pub fn new() -> Self {
        Self::with(PipelineConfig::default(), OrchestratorSettings::default())
    }

    pub fn with(pipeline: PipelineConfig, settings: OrchestratorSettings) -> Self {
        let store = Arc::new(MemoryObjectStore::new(BUCKET));
        let ledger = Arc::new(MemoryLedger::new());
        let scripted = Arc::new(Scripted::new(store.clone(), ledger.clone()));
        let events = Arc::new(EventBus::default());

        let orchestrator = Orchestrator::new(
            PipelineDefinition::standard(&pipeline).expect("standard pipeline"),
            CapabilityScoper::new(ResourceContext::new(BUCKET, REGION)),
            ledger.clone(),
            Arc::new(Shared(scripted.clone())),
            Arc::new(Shared(scripted.clone())),
            events.clone(),
            settings,
        )
        .expect("orchestrator");

        Self {
            orchestrator,
            scripted,
            store,
            ledger,
            events,
        }
    }

    /// Serve the HTTP API for this harness on a random port.
    pub async fn with_server() -> (Self, SocketAddr) {
        let harness = Self::new();
        let ctx = AppContext {
            orchestrator: harness.orchestrator.clone(),
            config: Arc::new(Config::default()),
            event_bus: harness.events.clone(),
        };
        let app = build_router(ctx);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind random port");
        let addr = listener.local_addr().expect("failed to get local addr");

        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        (harness, addr)
    }
}

pub fn job_id(raw: &str) -> JobId {
    JobId::parse(raw).expect("valid job id")
}
