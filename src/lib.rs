//! Reelforge - media production pipeline orchestrator.
//!
//! Re-exports the workspace crates so integration tests and embedders can
//! reach everything through one dependency.

pub use rf_core as core;
pub use rf_pipeline as pipeline;
pub use rf_server as server;
pub use rf_store as store;
