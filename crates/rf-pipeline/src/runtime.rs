//! Wiring an [`Orchestrator`] from [`Config`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rf_core::config::{Config, FunctionMode, LedgerBackend, StorageBackend};
use rf_core::events::EventBus;
use rf_core::{Error, Result, StageName};
use rf_store::{
    FsObjectStore, JobLedger, MemoryLedger, MemoryObjectStore, MemoryVault, ObjectStore,
    SqliteLedger,
};

use crate::invoker::{
    ContainerRunner, FunctionInvoker, HttpFunctionInvoker, LocalFunctionInvoker,
    ProcessContainerRunner,
};
use crate::orchestrator::{Orchestrator, OrchestratorSettings};
use crate::scope::{CapabilityScoper, ResourceContext};
use crate::stage::PipelineDefinition;

/// A configured orchestrator plus the shared resources behind it.
#[derive(Clone)]
pub struct Runtime {
    pub orchestrator: Orchestrator,
    pub ledger: Arc<dyn JobLedger>,
    pub store: Arc<dyn ObjectStore>,
    pub events: Arc<EventBus>,
}

impl Runtime {
    /// Open the ledger and object store named by `config` and assemble the
    /// standard pipeline on top of them.
    pub async fn build(config: &Config) -> Result<Self> {
        for warning in config.validate() {
            tracing::warn!("Config warning: {warning}");
        }

        let ledger: Arc<dyn JobLedger> = match config.ledger.backend {
            LedgerBackend::Memory => Arc::new(MemoryLedger::new()),
            LedgerBackend::Sqlite => {
                let pool = rf_store::init_pool(&config.ledger.db_path)?;
                tracing::info!("Job ledger at {}", config.ledger.db_path.display());
                Arc::new(SqliteLedger::new(pool))
            }
        };

        let store: Arc<dyn ObjectStore> = match config.storage.backend {
            StorageBackend::Memory => Arc::new(MemoryObjectStore::new(&config.storage.bucket)),
            StorageBackend::Fs => {
                let store =
                    FsObjectStore::open(&config.storage.root_dir, &config.storage.bucket).await?;
                tracing::info!(
                    "Object store at {} (bucket {})",
                    config.storage.root_dir.display(),
                    config.storage.bucket
                );
                Arc::new(store)
            }
        };

        let vault = Arc::new(MemoryVault::from_map(config.secrets.clone()));

        let functions: Arc<dyn FunctionInvoker> = match config.functions.mode {
            FunctionMode::Local => Arc::new(LocalFunctionInvoker::with_builtins(store.clone(), vault)),
            FunctionMode::Http => {
                let mut endpoints = HashMap::new();
                for (stage, url) in &config.functions.endpoints {
                    let stage: StageName = stage.parse().map_err(|_| {
                        Error::Validation(format!("functions.endpoints: unknown stage '{stage}'"))
                    })?;
                    endpoints.insert(stage, url.clone());
                }
                Arc::new(HttpFunctionInvoker::new(endpoints))
            }
        };

        let containers: Arc<dyn ContainerRunner> = Arc::new(
            ProcessContainerRunner::new(
                config.container.program.clone(),
                config.container.args.clone(),
                store.clone(),
                config.container.max_concurrent_tasks,
            )
            .with_grace(Duration::from_secs(config.pipeline.cancel_grace_secs)),
        );

        let events = Arc::new(EventBus::default());
        let orchestrator = Orchestrator::new(
            PipelineDefinition::standard(&config.pipeline)?,
            CapabilityScoper::new(ResourceContext::new(
                &config.storage.bucket,
                &config.storage.region,
            )),
            ledger.clone(),
            functions,
            containers,
            events.clone(),
            OrchestratorSettings::from_config(config),
        )?;

        let recovered = orchestrator.recover_interrupted().await?;
        if recovered > 0 {
            tracing::warn!(recovered, "Closed out jobs left running by a previous process");
        }

        Ok(Self {
            orchestrator,
            ledger,
            store,
            events,
        })
    }
}
