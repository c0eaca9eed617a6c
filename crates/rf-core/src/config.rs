//! Application configuration types.
//!
//! The top-level [`Config`] struct is deserialized from TOML or JSON and
//! carries the sub-configs for the server, ledger, object store, pipeline
//! timing, stage functions, the container runner and the secret vault. Every
//! section defaults sensibly so an empty document is valid.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::Error;

/// Locations searched when no config path is given, in order.
pub const DEFAULT_CONFIG_PATHS: &[&str] = &[
    "./reelforge.toml",
    "~/.config/reelforge/config.toml",
    "/etc/reelforge/config.toml",
];

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub ledger: LedgerConfig,
    pub storage: StorageConfig,
    pub pipeline: PipelineConfig,
    pub functions: FunctionsConfig,
    pub container: ContainerConfig,
    /// Secret name to value. A value of the form `env:VAR` is read from the
    /// environment when the vault is built.
    pub secrets: BTreeMap<String, String>,
}

impl Config {
    /// Deserialize a `Config` from a JSON string.
    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str)
            .map_err(|e| Error::Validation(format!("config parse error: {e}")))
    }

    /// Deserialize a `Config` from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).map_err(|e| Error::Validation(format!("config parse error: {e}")))
    }

    /// Read and parse a config file, choosing the format by extension
    /// (`.json` is JSON, anything else TOML).
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&contents),
            _ => Self::from_toml(&contents),
        }
    }

    /// Load configuration from `path`, or from the first existing default
    /// location when `path` is `None`. Falls back to defaults when nothing is
    /// found or the file cannot be parsed.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match find_default_config() {
                Some(p) => p,
                None => {
                    tracing::info!("No config file found; using defaults");
                    return Self::default();
                }
            },
        };

        match Self::load(&path) {
            Ok(cfg) => {
                tracing::info!("Loaded config from {}", path.display());
                cfg
            }
            Err(Error::Io { source }) if source.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config file at {}; using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Failed to load config file {}: {e}", path.display());
                Self::default()
            }
        }
    }

    /// Return a list of validation warnings (non-fatal issues).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.server.port == 0 {
            warnings.push("server.port is 0; a random port will be assigned".into());
        }

        if self.storage.bucket.is_empty() {
            warnings.push("storage.bucket is empty".into());
        }
        if self.storage.bucket.contains('/') || self.storage.bucket.contains('*') {
            warnings.push(format!(
                "storage.bucket '{}' contains '/' or '*'",
                self.storage.bucket
            ));
        }

        if self.ledger.ttl_days == 0 {
            warnings.push("ledger.ttl_days is 0; jobs expire immediately".into());
        }

        let p = &self.pipeline;
        let longest_stage = p
            .function_timeout_secs
            .max(p.upload_timeout_secs)
            .max(p.render_timeout_secs);
        if p.timeout_secs < longest_stage {
            warnings.push(format!(
                "pipeline.timeout_secs ({}) is shorter than the longest stage timeout ({longest_stage})",
                p.timeout_secs
            ));
        }
        if p.function_timeout_secs == 0 || p.upload_timeout_secs == 0 || p.render_timeout_secs == 0 {
            warnings.push("a stage timeout is 0; that stage can never succeed".into());
        }

        if self.functions.mode == FunctionMode::Http {
            for stage in ["script", "tts", "broll", "upload"] {
                if !self.functions.endpoints.contains_key(stage) {
                    warnings.push(format!(
                        "functions.mode is http but functions.endpoints.{stage} is not set"
                    ));
                }
            }
        }

        if self.container.program.is_empty() {
            warnings.push("container.program is empty".into());
        }
        if self.container.max_concurrent_tasks == 0 {
            warnings.push("container.max_concurrent_tasks is 0; render can never start".into());
        }

        for (name, value) in &self.secrets {
            if let Some(var) = value.strip_prefix("env:") {
                if std::env::var(var).is_err() {
                    warnings.push(format!("secret '{name}' references unset env var {var}"));
                }
            }
        }

        warnings
    }
}

fn find_default_config() -> Option<PathBuf> {
    DEFAULT_CONFIG_PATHS
        .iter()
        .map(|p| PathBuf::from(shellexpand::tilde(p).into_owned()))
        .find(|p| p.exists())
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Seconds between ledger reaper sweeps.
    pub reap_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            reap_interval_secs: 300,
        }
    }
}

/// Which job ledger implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    Memory,
    Sqlite,
}

/// Job ledger settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub backend: LedgerBackend,
    pub db_path: PathBuf,
    /// Days a job record is retained before the ledger reaps it.
    pub ttl_days: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            backend: LedgerBackend::Sqlite,
            db_path: PathBuf::from("./data/reelforge.db"),
            ttl_days: 7,
        }
    }
}

/// Which object store implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Fs,
}

/// Object store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub bucket: String,
    pub region: String,
    /// Root directory for the `fs` backend; buckets are subdirectories.
    pub root_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Fs,
            bucket: "reelforge-media".into(),
            region: "local".into(),
            root_dir: PathBuf::from("./data/media"),
        }
    }
}

/// Pipeline timing and render footprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Whole-pipeline wall clock, measured from job creation.
    pub timeout_secs: u64,
    /// Default timeout for function stages.
    pub function_timeout_secs: u64,
    pub upload_timeout_secs: u64,
    pub render_timeout_secs: u64,
    /// Time a stopped container task gets between SIGTERM and kill.
    pub cancel_grace_secs: u64,
    pub render_cpu_units: u32,
    pub render_memory_mib: u32,
    pub render_ephemeral_storage_gib: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 20 * 60,
            function_timeout_secs: 60,
            upload_timeout_secs: 120,
            render_timeout_secs: 15 * 60,
            cancel_grace_secs: 10,
            render_cpu_units: 2048,
            render_memory_mib: 4096,
            render_ephemeral_storage_gib: 50,
        }
    }
}

/// How function stages are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FunctionMode {
    /// In-process stand-in implementations.
    Local,
    /// POST to a remote endpoint per stage.
    Http,
}

/// Function stage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FunctionsConfig {
    pub mode: FunctionMode,
    /// Stage key to endpoint URL, used in `http` mode.
    pub endpoints: BTreeMap<String, String>,
}

impl Default for FunctionsConfig {
    fn default() -> Self {
        Self {
            mode: FunctionMode::Local,
            endpoints: BTreeMap::new(),
        }
    }
}

/// Container task runner settings.
///
/// `program` and `args` may use the placeholders `{cpus}`, `{cpu_units}`,
/// `{memory_mib}`, `{storage_gib}`, `{job_id}`, `{bucket}` and `{region}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    pub program: String,
    pub args: Vec<String>,
    pub max_concurrent_tasks: usize,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            program: "docker".into(),
            args: vec![
                "run".into(),
                "--rm".into(),
                "--cpus".into(),
                "{cpus}".into(),
                "--memory".into(),
                "{memory_mib}m".into(),
                "-e".into(),
                "JOB_ID".into(),
                "-e".into(),
                "MEDIA_BUCKET".into(),
                "-e".into(),
                "MEDIA_REGION".into(),
                "reelforge-renderer:latest".into(),
            ],
            max_concurrent_tasks: 2,
        }
    }
}
