//! Third-party credential storage.
//!
//! Stages reach secrets only through a [`ScopedVault`], which requires a
//! `read` capability on the exact secret name.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use rf_core::{Action, CapabilitySet, Error, ResourceKind, Result};

/// Named secret lookup.
#[async_trait]
pub trait SecretVault: Send + Sync {
    async fn get_secret(&self, name: &str) -> Result<String>;
}

/// Vault holding secrets in memory.
///
/// A stored value of the form `env:VAR` is resolved from the process
/// environment at lookup time.
#[derive(Debug, Default)]
pub struct MemoryVault {
    secrets: RwLock<BTreeMap<String, String>>,
}

impl MemoryVault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(secrets: BTreeMap<String, String>) -> Self {
        Self {
            secrets: RwLock::new(secrets),
        }
    }

    pub fn insert(&self, name: impl Into<String>, value: impl Into<String>) {
        self.secrets.write().insert(name.into(), value.into());
    }

    pub fn names(&self) -> Vec<String> {
        self.secrets.read().keys().cloned().collect()
    }
}

#[async_trait]
impl SecretVault for MemoryVault {
    async fn get_secret(&self, name: &str) -> Result<String> {
        let raw = self
            .secrets
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found("secret", name))?;
        match raw.strip_prefix("env:") {
            Some(var) => std::env::var(var).map_err(|_| {
                Error::Storage(format!("secret '{name}' references unset env var {var}"))
            }),
            None => Ok(raw),
        }
    }
}

/// Capability-checked view of a [`SecretVault`].
#[derive(Clone)]
pub struct ScopedVault {
    inner: Arc<dyn SecretVault>,
    capabilities: Arc<CapabilitySet>,
}

impl ScopedVault {
    pub fn new(inner: Arc<dyn SecretVault>, capabilities: Arc<CapabilitySet>) -> Self {
        Self {
            inner,
            capabilities,
        }
    }

    pub async fn get_secret(&self, name: &str) -> Result<String> {
        self.capabilities
            .check(ResourceKind::Secret, name, Action::Read)?;
        self.inner.get_secret(name).await
    }
}
