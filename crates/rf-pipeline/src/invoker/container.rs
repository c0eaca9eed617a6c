//! Container stages run as local processes.
//!
//! [`ProcessContainerRunner`] launches a configured command (typically
//! `docker run ...`) per task, with the task's footprint substituted into the
//! command line and the job's identifiers passed as environment variables.
//! Concurrency is bounded by a slot pool. A cancelled task receives SIGTERM
//! and is killed if it has not exited after the grace period.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rf_core::{Action, CapabilitySet, ResourceKind, StageError};
use rf_store::ObjectStore;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::{ContainerRunner, StageInput, StageOutput};
use crate::stage::{ResourceFootprint, StageSpec, RENDER_TASK_DEFINITION};

/// Runs container stages through a local command.
pub struct ProcessContainerRunner {
    program: String,
    args: Vec<String>,
    store: Arc<dyn ObjectStore>,
    slots: Arc<Semaphore>,
    grace: Duration,
    task_definition: String,
}

impl ProcessContainerRunner {
    pub fn new(
        program: impl Into<String>,
        args: Vec<String>,
        store: Arc<dyn ObjectStore>,
        max_concurrent_tasks: usize,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            store,
            slots: Arc::new(Semaphore::new(max_concurrent_tasks)),
            grace: Duration::from_secs(10),
            task_definition: RENDER_TASK_DEFINITION.to_string(),
        }
    }

    /// Time between SIGTERM and kill when a task is stopped.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Slots currently free.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    fn render(&self, template: &str, input: &StageInput, fp: &ResourceFootprint) -> String {
        template
            .replace("{cpus}", &fp.cpus())
            .replace("{cpu_units}", &fp.cpu_units.to_string())
            .replace("{memory_mib}", &fp.memory_mib.to_string())
            .replace("{storage_gib}", &fp.ephemeral_storage_gib.to_string())
            .replace("{job_id}", input.job_id.as_str())
            .replace("{bucket}", &input.bucket)
            .replace("{region}", &input.region)
    }

    fn command(&self, input: &StageInput, fp: &ResourceFootprint) -> Command {
        let mut cmd = Command::new(self.render(&self.program, input, fp));
        cmd.args(self.args.iter().map(|a| self.render(a, input, fp)))
            .env("JOB_ID", input.job_id.as_str())
            .env("MEDIA_BUCKET", &input.bucket)
            .env("MEDIA_REGION", &input.region)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(root) = self.store.local_root() {
            cmd.env("MEDIA_ROOT", root);
        }
        cmd
    }

    /// SIGTERM, then kill after the grace period.
    async fn stop(&self, child: &mut Child, stage: &StageSpec) {
        if terminate(child) {
            match tokio::time::timeout(self.grace, child.wait()).await {
                Ok(_) => {
                    tracing::info!(stage = %stage.name, "Container task stopped");
                    return;
                }
                Err(_) => {
                    tracing::warn!(
                        stage = %stage.name,
                        grace_secs = self.grace.as_secs(),
                        "Container task ignored SIGTERM; killing"
                    );
                }
            }
        }
        if let Err(e) = child.kill().await {
            tracing::warn!(stage = %stage.name, "Failed to kill container task: {e}");
        }
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match child.id().and_then(|pid| i32::try_from(pid).ok()) {
        Some(pid) => kill(Pid::from_raw(pid), Signal::SIGTERM).is_ok(),
        None => false,
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) -> bool {
    child.start_kill().is_ok()
}

fn forward_lines<R>(reader: R, job_id: String, stream: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::info!(job_id = %job_id, stream, "{line}");
        }
    });
}

#[async_trait]
impl ContainerRunner for ProcessContainerRunner {
    async fn run(
        &self,
        spec: &StageSpec,
        input: &StageInput,
        capabilities: Arc<CapabilitySet>,
        footprint: &ResourceFootprint,
        cancel: CancellationToken,
    ) -> Result<StageOutput, StageError> {
        let task = format!("{}/{}", input.region, self.task_definition);
        capabilities.check(ResourceKind::ContainerTask, &task, Action::Run)?;

        let _permit = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(StageError::execution("cancelled while waiting for a task slot"));
            }
            permit = self.slots.acquire() => permit
                .map_err(|_| StageError::execution("container slot pool closed"))?,
        };

        let mut cmd = self.command(input, footprint);
        let mut child = cmd
            .spawn()
            .map_err(|e| StageError::execution(format!("failed to launch {task}: {e}")))?;

        tracing::info!(
            job_id = %input.job_id,
            stage = %spec.name,
            task = %task,
            cpu_units = footprint.cpu_units,
            memory_mib = footprint.memory_mib,
            pid = child.id(),
            "Container task started"
        );

        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, input.job_id.to_string(), "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, input.job_id.to_string(), "stderr");
        }

        let status = tokio::select! {
            status = child.wait() => status
                .map_err(|e| StageError::execution(format!("waiting for {task} failed: {e}")))?,
            _ = cancel.cancelled() => {
                if let Err(e) = capabilities.check(ResourceKind::ContainerTask, &task, Action::Stop) {
                    tracing::warn!(task = %task, "{e}; killing without grace");
                    if let Err(e) = child.kill().await {
                        tracing::warn!(stage = %spec.name, "Failed to kill container task: {e}");
                    }
                } else {
                    self.stop(&mut child, spec).await;
                }
                return Err(StageError::execution("container task stopped"));
            }
        };

        if !status.success() {
            return Err(StageError::execution(format!("{task} exited with {status}")));
        }

        let mut output_refs = Vec::with_capacity(spec.required_outputs.len());
        for name in &spec.required_outputs {
            let object = input.object(name);
            let present = self
                .store
                .exists(&object)
                .await
                .map_err(|e| StageError::execution(format!("checking {object}: {e}")))?;
            if !present {
                return Err(StageError::output_invalid(format!(
                    "{task} exited cleanly but {object} was not written"
                )));
            }
            output_refs.push(object);
        }

        Ok(StageOutput { output_refs })
    }
}
