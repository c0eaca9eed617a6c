//! rf-pipeline: stage sequencing, capability scoping and stage invocation.
//!
//! This crate provides:
//!
//! - [`stage`]: the declarative pipeline definition (stages, execution
//!   models, resource footprints and capability templates)
//! - [`scope`]: resolution of capability templates into a job-scoped
//!   [`CapabilitySet`](rf_core::CapabilitySet)
//! - [`invoker`]: function and container invokers, plus stand-in stage
//!   functions for running without external services
//! - [`orchestrator`]: the execution engine that drives a job through the
//!   stages under timeouts and cancellation
//! - [`runtime`]: assembly of all of the above from configuration

pub mod invoker;
pub mod orchestrator;
pub mod runtime;
pub mod scope;
pub mod stage;

pub use invoker::{
    check_outputs, ContainerRunner, FunctionInvoker, HttpFunctionInvoker, LocalFunctionInvoker,
    ProcessContainerRunner, StageContext, StageFunction, StageInput, StageOutput,
};
pub use orchestrator::{ExecutionHandle, Orchestrator, OrchestratorSettings};
pub use runtime::Runtime;
pub use scope::{CapabilityScoper, ResourceContext};
pub use stage::{
    CapabilityTemplate, ExecutionModel, PipelineDefinition, ResourceFootprint, StageSpec,
};
