//! Application context shared across route handlers via Axum state.

use std::sync::Arc;

use rf_core::config::Config;
use rf_core::events::EventBus;
use rf_pipeline::{Orchestrator, Runtime};

/// Everything a handler needs. Cheap to clone.
#[derive(Clone)]
pub struct AppContext {
    pub orchestrator: Orchestrator,
    pub config: Arc<Config>,
    pub event_bus: Arc<EventBus>,
}

impl AppContext {
    pub fn new(runtime: &Runtime, config: Config) -> Self {
        Self {
            orchestrator: runtime.orchestrator.clone(),
            config: Arc::new(config),
            event_bus: runtime.events.clone(),
        }
    }
}
