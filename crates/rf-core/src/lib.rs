//! rf-core: shared job model, capabilities, errors, configuration, and event
//! system.
//!
//! This crate is the foundational dependency for all other rf-* crates. It
//! provides the typed job document the orchestrator merges stage results
//! into, the capability types the scoper produces and the resource wrappers
//! enforce, a unified error type, application configuration, and a broadcast
//! event bus for execution telemetry.

pub mod capability;
pub mod config;
pub mod error;
pub mod events;
pub mod ids;
pub mod job;

// Re-export the most commonly used items at the crate root.
pub use capability::{Action, Capability, CapabilitySet, ResourceKind};
pub use error::{Error, Result, StageError};
pub use ids::*;
pub use job::*;
