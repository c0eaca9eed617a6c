//! The pipeline orchestrator.
//!
//! [`Orchestrator::start`] records a new `PENDING` job and spawns one task that
//! walks the [`PipelineDefinition`] in order. For each stage the task scopes
//! the stage's capabilities to the job, invokes it through the invoker its
//! execution model selects, and races that invocation against cancellation,
//! the whole-pipeline deadline and the stage's own timeout. A successful
//! result is merged under the stage's key and persisted before the next stage
//! starts; the first failure ends the job and no later stage is invoked.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rf_core::config::Config;
use rf_core::events::{EventBus, EventPayload};
use rf_core::{
    CapabilitySet, ErrorCode, Error, ExecutionId, Job, JobId, JobStatus, Result, StageError,
    StageName, StageResult,
};
use rf_store::JobLedger;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::invoker::{check_outputs, ContainerRunner, FunctionInvoker, StageInput, StageOutput};
use crate::scope::CapabilityScoper;
use crate::stage::{ExecutionModel, PipelineDefinition, StageSpec};

/// Stand-in for "never" when a configured timeout does not fit in an
/// [`Instant`].
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

const TERMINAL_WRITE_ATTEMPTS: u32 = 3;

/// Extra time [`Orchestrator::shutdown`] allows beyond a container's wind-down.
const SHUTDOWN_SLACK: Duration = Duration::from_secs(5);

/// Orchestrator-wide limits.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Wall clock allowed from job creation to a terminal state.
    pub pipeline_timeout: Duration,
    /// How long an interrupted container stage gets to wind down.
    pub cancel_grace: Duration,
    /// How long job records are kept.
    pub retention: chrono::Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            pipeline_timeout: Duration::from_secs(20 * 60),
            cancel_grace: Duration::from_secs(10),
            retention: chrono::Duration::days(7),
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            pipeline_timeout: Duration::from_secs(config.pipeline.timeout_secs),
            cancel_grace: Duration::from_secs(config.pipeline.cancel_grace_secs),
            retention: chrono::Duration::days(i64::from(config.ledger.ttl_days)),
        }
    }
}

/// Names one execution of the pipeline for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionHandle {
    pub execution_id: ExecutionId,
    pub job_id: JobId,
}

struct Execution {
    job_id: JobId,
    cancel: CancellationToken,
    done: watch::Receiver<Option<Job>>,
    expires_at: DateTime<Utc>,
}

impl Execution {
    fn is_finished(&self) -> bool {
        self.done.borrow().is_some()
    }

    fn finished_job(&self) -> Option<Job> {
        self.done.borrow().clone()
    }
}

/// Why an invocation did not produce output.
enum Interrupt {
    Stage(StageError),
    PipelineTimeout,
    Cancelled,
}

enum Outcome {
    Succeeded,
    Ended {
        status: JobStatus,
        failure: StageResult,
    },
}

impl Outcome {
    fn failed(stage: StageName, started_at: DateTime<Utc>, code: ErrorCode, msg: impl Into<String>) -> Self {
        Outcome::Ended {
            status: JobStatus::Failed,
            failure: StageResult::failed(stage, started_at, code, msg),
        }
    }
}

struct Inner {
    definition: PipelineDefinition,
    scoper: CapabilityScoper,
    ledger: Arc<dyn JobLedger>,
    functions: Arc<dyn FunctionInvoker>,
    containers: Arc<dyn ContainerRunner>,
    events: Arc<EventBus>,
    settings: OrchestratorSettings,
    executions: DashMap<ExecutionId, Execution>,
    /// Jobs with an execution in flight.
    active: DashMap<JobId, ExecutionId>,
}

/// Drives jobs through the pipeline. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Build an orchestrator. Every stage's capability templates are checked
    /// up front, so an over-granting definition is refused here rather than
    /// failing jobs later.
    pub fn new(
        definition: PipelineDefinition,
        scoper: CapabilityScoper,
        ledger: Arc<dyn JobLedger>,
        functions: Arc<dyn FunctionInvoker>,
        containers: Arc<dyn ContainerRunner>,
        events: Arc<EventBus>,
        settings: OrchestratorSettings,
    ) -> Result<Self> {
        for spec in definition.stages() {
            scoper.check_templates(spec)?;
        }
        Ok(Self {
            inner: Arc::new(Inner {
                definition,
                scoper,
                ledger,
                functions,
                containers,
                events,
                settings,
                executions: DashMap::new(),
                active: DashMap::new(),
            }),
        })
    }

    pub fn definition(&self) -> &PipelineDefinition {
        &self.inner.definition
    }

    pub fn scoper(&self) -> &CapabilityScoper {
        &self.inner.scoper
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.events
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.inner.settings
    }

    pub fn ledger(&self) -> &Arc<dyn JobLedger> {
        &self.inner.ledger
    }

    /// Capability set each stage would hold for `job_id`.
    pub fn plan(&self, job_id: &JobId) -> Result<Vec<(StageName, CapabilitySet)>> {
        self.inner
            .definition
            .stages()
            .iter()
            .map(|spec| Ok((spec.name, self.inner.scoper.scope(spec, job_id)?)))
            .collect()
    }

    /// Create the job and begin executing it in the background.
    ///
    /// Fails with [`Error::Conflict`] if the job id is already known.
    pub async fn start(&self, job_id: JobId, payload: serde_json::Value) -> Result<ExecutionHandle> {
        let execution_id = ExecutionId::new();

        match self.inner.active.entry(job_id.clone()) {
            Entry::Occupied(_) => {
                return Err(Error::Conflict(format!("job '{job_id}' is already running")));
            }
            Entry::Vacant(slot) => {
                slot.insert(execution_id);
            }
        }

        let job = match self.create_job(&job_id, payload).await {
            Ok(job) => job,
            Err(e) => {
                self.inner.active.remove(&job_id);
                return Err(e);
            }
        };

        let deadline = deadline_after(self.inner.settings.pipeline_timeout);
        let cancel = CancellationToken::new();
        let (tx, rx) = watch::channel(None);
        self.inner.executions.insert(
            execution_id,
            Execution {
                job_id: job_id.clone(),
                cancel: cancel.clone(),
                done: rx,
                expires_at: job.ttl,
            },
        );

        tracing::info!(job_id = %job_id, execution_id = %execution_id, "Job accepted");

        let span = tracing::info_span!("execution", job_id = %job_id, execution_id = %execution_id);
        let inner = self.inner.clone();
        tokio::spawn(
            async move {
                let job = inner
                    .clone()
                    .supervise(execution_id, job, deadline, cancel)
                    .await;
                inner.active.remove(&job.job_id);
                tx.send_replace(Some(job));
            }
            .instrument(span),
        );

        Ok(ExecutionHandle {
            execution_id,
            job_id,
        })
    }

    async fn create_job(&self, job_id: &JobId, payload: serde_json::Value) -> Result<Job> {
        if self.inner.ledger.get(job_id).await?.is_some() {
            return Err(Error::Conflict(format!(
                "job '{job_id}' already exists; submit under a new id"
            )));
        }
        let job = Job::new(job_id.clone(), payload, self.inner.settings.retention);
        self.inner.ledger.put(&job).await?;
        Ok(job)
    }

    /// Current state of the job behind `handle`. A finished execution
    /// reports the terminal job it ended with, even if the ledger write of
    /// that state failed.
    pub async fn status(&self, handle: &ExecutionHandle) -> Result<Job> {
        let finished = self
            .inner
            .executions
            .get(&handle.execution_id)
            .and_then(|e| e.finished_job());
        match finished {
            Some(job) => Ok(job),
            None => self.get_job(&handle.job_id).await,
        }
    }

    /// Resolve an execution id to its handle.
    pub fn execution(&self, execution_id: &ExecutionId) -> Result<ExecutionHandle> {
        self.inner
            .executions
            .get(execution_id)
            .map(|e| ExecutionHandle {
                execution_id: *execution_id,
                job_id: e.job_id.clone(),
            })
            .ok_or_else(|| Error::not_found("execution", execution_id))
    }

    /// Request cancellation. Returns `false` if the execution had already
    /// finished, in which case nothing changes.
    pub fn cancel(&self, handle: &ExecutionHandle) -> Result<bool> {
        let execution = self
            .inner
            .executions
            .get(&handle.execution_id)
            .ok_or_else(|| Error::not_found("execution", handle.execution_id))?;
        if execution.is_finished() {
            return Ok(false);
        }
        tracing::info!(job_id = %handle.job_id, execution_id = %handle.execution_id, "Cancellation requested");
        execution.cancel.cancel();
        Ok(true)
    }

    /// Wait for the execution to reach a terminal state.
    pub async fn wait(&self, handle: &ExecutionHandle) -> Result<Job> {
        let mut rx = self
            .inner
            .executions
            .get(&handle.execution_id)
            .map(|e| e.done.clone())
            .ok_or_else(|| Error::not_found("execution", handle.execution_id))?;
        let done = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::Internal(format!("execution {} vanished", handle.execution_id)))?;
        done.clone()
            .ok_or_else(|| Error::Internal("terminal job missing".into()))
    }

    pub async fn get_job(&self, job_id: &JobId) -> Result<Job> {
        self.inner
            .ledger
            .get(job_id)
            .await?
            .ok_or_else(|| Error::not_found("job", job_id))
    }

    pub async fn list_jobs(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>> {
        self.inner.ledger.list(status, limit).await
    }

    /// Number of executions still running.
    pub fn active_executions(&self) -> usize {
        self.inner.active.len()
    }

    /// Cancel every in-flight execution and wait for their terminal records
    /// to be written. Returns how many were still running when the wait gave
    /// up.
    pub async fn shutdown(&self) -> usize {
        let pending: Vec<watch::Receiver<Option<Job>>> = self
            .inner
            .executions
            .iter()
            .filter(|e| !e.is_finished())
            .map(|e| {
                e.cancel.cancel();
                e.done.clone()
            })
            .collect();
        if pending.is_empty() {
            return 0;
        }

        tracing::info!(executions = pending.len(), "Cancelling in-flight executions");
        let grace = self
            .inner
            .settings
            .cancel_grace
            .saturating_mul(2)
            .saturating_add(SHUTDOWN_SLACK);
        let drained = async {
            for mut rx in pending {
                let _ = rx.wait_for(Option::is_some).await;
            }
        };
        if tokio::time::timeout(grace, drained).await.is_err() {
            tracing::warn!("In-flight executions did not finish within {grace:?}");
        }
        self.active_executions()
    }

    /// Close out jobs a previous process left `PENDING` or `RUNNING`: with
    /// no execution behind them they end `FAILED` with code `cancelled`.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let mut recovered = 0;
        for status in [JobStatus::Pending, JobStatus::Running] {
            for mut job in self.inner.ledger.list(Some(status), usize::MAX).await? {
                if self.inner.active.contains_key(&job.job_id) {
                    continue;
                }
                let stage = interrupted_stage(&job);
                let failure = StageResult::failed(
                    stage,
                    Utc::now(),
                    ErrorCode::Cancelled,
                    "execution interrupted by shutdown",
                );
                if job.terminate(JobStatus::Failed, failure).is_err() {
                    continue;
                }
                self.inner.ledger.put(&job).await?;
                tracing::warn!(job_id = %job.job_id, stage = %stage, "Closed out interrupted job");
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    /// Reap expired jobs from the ledger and forget their finished
    /// executions.
    pub async fn reap_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let reaped = self.inner.ledger.reap_expired(now).await?;
        self.inner
            .executions
            .retain(|_, e| !(e.is_finished() && e.expires_at <= now));
        if reaped > 0 {
            tracing::info!(reaped, "Reaped expired jobs");
        }
        Ok(reaped)
    }
}

impl Inner {
    /// Run the execution on its own task. If that task panics the job is
    /// still closed out, so it never stays `RUNNING`.
    async fn supervise(
        self: Arc<Self>,
        execution_id: ExecutionId,
        job: Job,
        deadline: Instant,
        cancel: CancellationToken,
    ) -> Job {
        let last_known = job.clone();
        let worker = self.clone();
        let run = tokio::spawn(
            async move { worker.run(execution_id, job, deadline, cancel).await }.in_current_span(),
        );
        match run.await {
            Ok(job) => job,
            Err(e) => self.abandon(execution_id, last_known, e).await,
        }
    }

    async fn abandon(&self, execution_id: ExecutionId, last_known: Job, error: JoinError) -> Job {
        let reason = describe_join_error(error);
        tracing::error!("Execution task {reason}");

        let mut job = match self.ledger.get(&last_known.job_id).await {
            Ok(Some(job)) => job,
            _ => last_known,
        };
        if job.is_terminal() {
            return job;
        }

        let stage = interrupted_stage(&job);
        let message = format!("execution task {reason}");
        let failure = StageResult::failed(stage, Utc::now(), ErrorCode::StageExecutionError, &message);
        if let Err(e) = job.terminate(JobStatus::Failed, failure) {
            tracing::error!("Could not mark job failed: {e}");
        }
        self.events.broadcast(EventPayload::PipelineFailed {
            execution_id,
            job_id: job.job_id.clone(),
            stage,
            code: ErrorCode::StageExecutionError,
            message,
        });
        self.persist_terminal(&job).await;
        job
    }

    /// Write a terminal job, retrying failed ledger writes. A record left
    /// behind after the last attempt is closed out by
    /// [`Orchestrator::recover_interrupted`] on the next start.
    async fn persist_terminal(&self, job: &Job) {
        let mut backoff = Duration::from_millis(100);
        for attempt in 1..=TERMINAL_WRITE_ATTEMPTS {
            match self.ledger.put(job).await {
                Ok(()) => return,
                Err(e) if attempt < TERMINAL_WRITE_ATTEMPTS => {
                    tracing::warn!(attempt, "Failed to persist terminal job state, retrying: {e}");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => {
                    tracing::error!(attempts = attempt, "Giving up persisting terminal job state: {e}");
                }
            }
        }
    }

    async fn run(
        &self,
        execution_id: ExecutionId,
        mut job: Job,
        deadline: Instant,
        cancel: CancellationToken,
    ) -> Job {
        let started = Instant::now();
        self.events.broadcast(EventPayload::PipelineStarted {
            execution_id,
            job_id: job.job_id.clone(),
        });

        let outcome = self.drive(execution_id, &mut job, deadline, &cancel).await;

        let job_id = job.job_id.clone();
        match outcome {
            Outcome::Succeeded => {
                if let Err(e) = job.succeed() {
                    tracing::error!("Could not mark job succeeded: {e}");
                }
                let elapsed_ms = started.elapsed().as_millis() as u64;
                tracing::info!(elapsed_ms, "Pipeline succeeded");
                self.events.broadcast(EventPayload::PipelineSucceeded {
                    execution_id,
                    job_id,
                    elapsed_ms,
                });
            }
            Outcome::Ended { status, failure } => {
                let stage = failure.stage;
                let (code, message) = failure
                    .error
                    .as_ref()
                    .map(|e| (e.code, e.message.clone()))
                    .unwrap_or((ErrorCode::StageExecutionError, String::new()));
                if let Err(e) = job.terminate(status, failure) {
                    tracing::error!("Could not mark job {status}: {e}");
                }
                tracing::warn!(stage = %stage, code = %code, "Pipeline ended {status}: {message}");
                let payload = match code {
                    ErrorCode::PipelineTimeout => EventPayload::PipelineTimedOut {
                        execution_id,
                        job_id,
                        stage,
                    },
                    ErrorCode::Cancelled => EventPayload::PipelineCancelled {
                        execution_id,
                        job_id,
                        stage,
                    },
                    _ => EventPayload::PipelineFailed {
                        execution_id,
                        job_id,
                        stage,
                        code,
                        message,
                    },
                };
                self.events.broadcast(payload);
            }
        }

        self.persist_terminal(&job).await;
        job
    }

    async fn drive(
        &self,
        execution_id: ExecutionId,
        job: &mut Job,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Outcome {
        for (index, spec) in self.definition.stages().iter().enumerate() {
            let stage = spec.name;
            let started_at = Utc::now();

            if cancel.is_cancelled() {
                return Outcome::failed(stage, started_at, ErrorCode::Cancelled, "cancelled before stage start");
            }
            if Instant::now() >= deadline {
                return pipeline_timed_out(stage, started_at, self.settings.pipeline_timeout);
            }

            if let Err(e) = job.begin_stage(stage) {
                return Outcome::failed(stage, started_at, ErrorCode::StageExecutionError, e.to_string());
            }
            if let Err(e) = self.ledger.put(job).await {
                return Outcome::failed(
                    stage,
                    started_at,
                    ErrorCode::StageExecutionError,
                    format!("ledger write failed: {e}"),
                );
            }

            tracing::info!(stage = %stage, "Stage started");
            self.events.broadcast(EventPayload::StageStarted {
                execution_id,
                job_id: job.job_id.clone(),
                stage,
            });
            let stage_clock = Instant::now();

            let result = match self.scoper.scope(spec, &job.job_id) {
                Ok(capabilities) => {
                    let input = StageInput {
                        job_id: job.job_id.clone(),
                        document: job.document(),
                        bucket: self.scoper.context().bucket.clone(),
                        region: self.scoper.context().region.clone(),
                    };
                    self.invoke(spec, &input, Arc::new(capabilities), deadline, cancel)
                        .await
                        .and_then(|out| {
                            check_outputs(spec, &input, &out).map_err(Interrupt::Stage)?;
                            Ok(out)
                        })
                }
                Err(e) => Err(Interrupt::Stage(StageError::CapabilityDenied(e.to_string()))),
            };

            let output = match result {
                Ok(output) => output,
                Err(interrupt) => {
                    let outcome = match interrupt {
                        Interrupt::Stage(err) => {
                            Outcome::failed(stage, started_at, err.code(), err.to_string())
                        }
                        Interrupt::PipelineTimeout => {
                            pipeline_timed_out(stage, started_at, self.settings.pipeline_timeout)
                        }
                        Interrupt::Cancelled => {
                            Outcome::failed(stage, started_at, ErrorCode::Cancelled, "execution cancelled")
                        }
                    };
                    if let Outcome::Ended { failure, .. } = &outcome {
                        if let Some(err) = &failure.error {
                            tracing::warn!(stage = %stage, code = %err.code, "Stage failed: {}", err.message);
                            self.events.broadcast(EventPayload::StageFailed {
                                execution_id,
                                job_id: job.job_id.clone(),
                                stage,
                                code: err.code,
                                message: err.message.clone(),
                            });
                        }
                    }
                    return outcome;
                }
            };

            let outputs = output.output_refs.len();
            let result = StageResult::succeeded(stage, started_at, output.output_refs);
            if let Err(e) = job.complete_stage(result, &self.definition.predecessors(index)) {
                return Outcome::failed(stage, started_at, ErrorCode::StageExecutionError, e.to_string());
            }
            if let Err(e) = self.ledger.put(job).await {
                return Outcome::failed(
                    stage,
                    started_at,
                    ErrorCode::StageExecutionError,
                    format!("ledger write failed: {e}"),
                );
            }

            let elapsed_ms = stage_clock.elapsed().as_millis() as u64;
            tracing::info!(stage = %stage, elapsed_ms, outputs, "Stage completed");
            self.events.broadcast(EventPayload::StageCompleted {
                execution_id,
                job_id: job.job_id.clone(),
                stage,
                elapsed_ms,
                outputs,
            });
        }

        Outcome::Succeeded
    }

    /// Run one stage, bounded by cancellation, the pipeline deadline and the
    /// stage timeout. An interrupted container stage is told to stop and given
    /// the grace period to do so; an interrupted function call is dropped.
    async fn invoke(
        &self,
        spec: &StageSpec,
        input: &StageInput,
        capabilities: Arc<CapabilitySet>,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> std::result::Result<StageOutput, Interrupt> {
        let stage_deadline = deadline_after(spec.timeout);
        let stop = cancel.child_token();
        let mut call = self.spawn_call(spec, input, capabilities, stop.clone());

        let interrupt = tokio::select! {
            biased;
            _ = cancel.cancelled() => Interrupt::Cancelled,
            _ = tokio::time::sleep_until(deadline) => Interrupt::PipelineTimeout,
            _ = tokio::time::sleep_until(stage_deadline) => {
                Interrupt::Stage(StageError::Timeout(spec.timeout))
            }
            joined = &mut call => return stage_result(spec.name, joined).map_err(Interrupt::Stage),
        };

        if spec.model.is_container() {
            stop.cancel();
            let wind_down = self.settings.cancel_grace.saturating_mul(2);
            if tokio::time::timeout(wind_down, &mut call).await.is_err() {
                tracing::warn!(stage = %spec.name, "Container stage did not stop within {wind_down:?}");
            }
        }
        call.abort();

        Err(interrupt)
    }

    /// Start the invocation on its own task, so a panicking stage comes back
    /// as a join error instead of unwinding the execution.
    fn spawn_call(
        &self,
        spec: &StageSpec,
        input: &StageInput,
        capabilities: Arc<CapabilitySet>,
        stop: CancellationToken,
    ) -> JoinHandle<std::result::Result<StageOutput, StageError>> {
        let spec = spec.clone();
        let input = input.clone();
        let functions = self.functions.clone();
        let containers = self.containers.clone();
        tokio::spawn(
            async move {
                match &spec.model {
                    ExecutionModel::Function => functions.invoke(&spec, &input, capabilities).await,
                    ExecutionModel::Container(footprint) => {
                        containers
                            .run(&spec, &input, capabilities, footprint, stop)
                            .await
                    }
                }
            }
            .in_current_span(),
        )
    }
}

fn stage_result(
    stage: StageName,
    joined: std::result::Result<std::result::Result<StageOutput, StageError>, JoinError>,
) -> std::result::Result<StageOutput, StageError> {
    joined.unwrap_or_else(|e| {
        let reason = describe_join_error(e);
        tracing::error!(stage = %stage, "Stage {reason}");
        Err(StageError::execution(format!("stage {stage} {reason}")))
    })
}

fn describe_join_error(error: JoinError) -> String {
    if !error.is_panic() {
        return "was aborted".into();
    }
    let payload = error.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string payload".into());
    format!("panicked: {message}")
}

/// The stage a job was in, or about to enter, when its execution stopped.
fn interrupted_stage(job: &Job) -> StageName {
    job.current_stage
        .or_else(|| StageName::ALL.iter().copied().find(|s| job.stages.get(*s).is_none()))
        .unwrap_or(StageName::Upload)
}

/// `Instant::now() + after`, or a deadline that never fires if that
/// overflows.
fn deadline_after(after: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(after).unwrap_or(now + FAR_FUTURE)
}

fn pipeline_timed_out(stage: StageName, started_at: DateTime<Utc>, limit: Duration) -> Outcome {
    Outcome::Ended {
        status: JobStatus::TimedOut,
        failure: StageResult::failed(
            stage,
            started_at,
            ErrorCode::PipelineTimeout,
            format!("pipeline exceeded {}s", limit.as_secs()),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::ResourceContext;
    use crate::stage::{CapabilityTemplate, ResourceFootprint};
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use rf_core::config::PipelineConfig;
    use rf_core::{Action, ObjectRef, ResourceKind};
    use rf_store::MemoryLedger;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Every stage reports its required outputs immediately.
    struct Immediate;

    #[async_trait]
    impl FunctionInvoker for Immediate {
        async fn invoke(
            &self,
            spec: &StageSpec,
            input: &StageInput,
            _caps: Arc<CapabilitySet>,
        ) -> std::result::Result<StageOutput, StageError> {
            Ok(StageOutput {
                output_refs: spec.required_outputs.iter().map(|n| input.object(n)).collect(),
            })
        }
    }

    #[async_trait]
    impl ContainerRunner for Immediate {
        async fn run(
            &self,
            spec: &StageSpec,
            input: &StageInput,
            caps: Arc<CapabilitySet>,
            footprint: &ResourceFootprint,
            _cancel: CancellationToken,
        ) -> std::result::Result<StageOutput, StageError> {
            assert_eq!(footprint.cpu_units, 2048);
            FunctionInvoker::invoke(self, spec, input, caps).await
        }
    }

    /// Panics when asked to run `0`; every other stage behaves like
    /// [`Immediate`].
    struct PanicsOn(StageName);

    #[async_trait]
    impl FunctionInvoker for PanicsOn {
        async fn invoke(
            &self,
            spec: &StageSpec,
            input: &StageInput,
            caps: Arc<CapabilitySet>,
        ) -> std::result::Result<StageOutput, StageError> {
            if spec.name == self.0 {
                panic!("boom in {}", spec.name);
            }
            FunctionInvoker::invoke(&Immediate, spec, input, caps).await
        }
    }

    /// Container that runs until told to stop.
    struct UntilStopped;

    #[async_trait]
    impl ContainerRunner for UntilStopped {
        async fn run(
            &self,
            _spec: &StageSpec,
            _input: &StageInput,
            _caps: Arc<CapabilitySet>,
            _footprint: &ResourceFootprint,
            cancel: CancellationToken,
        ) -> std::result::Result<StageOutput, StageError> {
            cancel.cancelled().await;
            Err(StageError::execution("container task stopped"))
        }
    }

    /// Memory ledger with injectable faults.
    #[derive(Default)]
    struct Faulty {
        inner: MemoryLedger,
        panic_on_running: AtomicBool,
        failing_terminal_writes: AtomicUsize,
    }

    #[async_trait]
    impl JobLedger for Faulty {
        async fn get(&self, job_id: &JobId) -> Result<Option<Job>> {
            self.inner.get(job_id).await
        }

        async fn put(&self, job: &Job) -> Result<()> {
            if job.status == JobStatus::Running && self.panic_on_running.swap(false, Ordering::SeqCst) {
                panic!("ledger driver crashed");
            }
            if job.is_terminal()
                && self
                    .failing_terminal_writes
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
            {
                return Err(Error::database("disk full"));
            }
            self.inner.put(job).await
        }

        async fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>> {
            self.inner.list(status, limit).await
        }

        async fn reap_expired(&self, now: DateTime<Utc>) -> Result<usize> {
            self.inner.reap_expired(now).await
        }
    }

    fn definition() -> PipelineDefinition {
        PipelineDefinition::standard(&Default::default()).unwrap()
    }

    fn build(
        definition: PipelineDefinition,
        ledger: Arc<dyn JobLedger>,
        functions: Arc<dyn FunctionInvoker>,
        containers: Arc<dyn ContainerRunner>,
        settings: OrchestratorSettings,
    ) -> Orchestrator {
        Orchestrator::new(
            definition,
            CapabilityScoper::new(ResourceContext::new("media", "local")),
            ledger,
            functions,
            containers,
            Arc::new(EventBus::default()),
            settings,
        )
        .unwrap()
    }

    fn orchestrator(definition: PipelineDefinition) -> Orchestrator {
        build(
            definition,
            Arc::new(MemoryLedger::new()),
            Arc::new(Immediate),
            Arc::new(Immediate),
            OrchestratorSettings::default(),
        )
    }

    fn id(s: &str) -> JobId {
        JobId::parse(s).unwrap()
    }

    #[tokio::test]
    async fn runs_all_stages_to_success() {
        let orch = orchestrator(definition());
        let handle = orch.start(id("job-001"), serde_json::json!({})).await.unwrap();
        let job = orch.wait(&handle).await.unwrap();

        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.stages.keys(), StageName::ALL);
        assert_eq!(
            job.stages.render.as_ref().unwrap().output_refs,
            vec![ObjectRef::new("media", "job-001/out.mp4")]
        );
        assert_eq!(orch.status(&handle).await.unwrap(), job);
        assert_eq!(orch.active_executions(), 0);
    }

    #[tokio::test]
    async fn duplicate_job_id_conflicts() {
        let orch = orchestrator(definition());
        let handle = orch.start(id("job-001"), serde_json::json!({})).await.unwrap();
        assert_matches!(
            orch.start(id("job-001"), serde_json::json!({})).await,
            Err(Error::Conflict(_))
        );
        orch.wait(&handle).await.unwrap();
        assert_matches!(
            orch.start(id("job-001"), serde_json::json!({})).await,
            Err(Error::Conflict(_))
        );
    }

    #[tokio::test]
    async fn cancel_after_finish_is_noop() {
        let orch = orchestrator(definition());
        let handle = orch.start(id("job-001"), serde_json::json!({})).await.unwrap();
        orch.wait(&handle).await.unwrap();
        assert!(!orch.cancel(&handle).unwrap());
        assert_eq!(orch.status(&handle).await.unwrap().status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn unknown_execution_is_not_found() {
        let orch = orchestrator(definition());
        assert_matches!(orch.execution(&ExecutionId::new()), Err(Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn over_granting_definition_is_refused() {
        let bad = PipelineDefinition::new(vec![StageSpec::container(
            StageName::Render,
            Duration::from_secs(1),
            ResourceFootprint::default(),
        )
        .grant(CapabilityTemplate::new(
            ResourceKind::ObjectStore,
            "{bucket}/*",
            [Action::Read],
        ))])
        .unwrap();
        let result = Orchestrator::new(
            bad,
            CapabilityScoper::new(ResourceContext::new("media", "local")),
            Arc::new(MemoryLedger::new()),
            Arc::new(Immediate),
            Arc::new(Immediate),
            Arc::new(EventBus::default()),
            OrchestratorSettings::default(),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn plan_lists_every_stage() {
        let orch = orchestrator(definition());
        let plan = orch.plan(&id("job-001")).unwrap();
        assert_eq!(plan.len(), 5);
        assert!(plan[4].1.permits(ResourceKind::Secret, "youtube/oauth", Action::Read));
        assert!(!plan[0].1.permits(ResourceKind::Secret, "youtube/oauth", Action::Read));
    }

    #[tokio::test]
    async fn events_trace_the_execution() {
        let orch = orchestrator(definition());
        let handle = orch.start(id("job-001"), serde_json::json!({})).await.unwrap();
        orch.wait(&handle).await.unwrap();

        let events = orch.events().recent_events(100);
        // started + 5 x (stage started, stage completed) + succeeded
        assert_eq!(events.len(), 12);
        assert!(matches!(events[0].payload, EventPayload::PipelineSucceeded { .. }));
        assert!(matches!(events[11].payload, EventPayload::PipelineStarted { .. }));
    }

    #[tokio::test]
    async fn reap_forgets_expired_executions() {
        let orch = orchestrator(definition());
        let handle = orch.start(id("job-001"), serde_json::json!({})).await.unwrap();
        orch.wait(&handle).await.unwrap();

        assert_eq!(orch.reap_expired(Utc::now()).await.unwrap(), 0);
        assert!(orch.execution(&handle.execution_id).is_ok());

        let later = Utc::now() + chrono::Duration::days(8);
        assert_eq!(orch.reap_expired(later).await.unwrap(), 1);
        assert_matches!(orch.execution(&handle.execution_id), Err(Error::NotFound { .. }));
        assert_matches!(orch.status(&handle).await, Err(Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn panicking_stage_fails_the_job() {
        let ledger = Arc::new(MemoryLedger::new());
        let orch = build(
            definition(),
            ledger.clone(),
            Arc::new(PanicsOn(StageName::Tts)),
            Arc::new(Immediate),
            OrchestratorSettings::default(),
        );
        let handle = orch.start(id("job-001"), serde_json::json!({})).await.unwrap();
        let job = orch.wait(&handle).await.unwrap();

        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.stages.script.is_some());
        let error = job.error().unwrap();
        assert_eq!(error.stage, StageName::Tts);
        assert_eq!(error.code, ErrorCode::StageExecutionError);
        assert!(error.message.contains("boom in tts"), "{}", error.message);

        let stored = ledger.get(&handle.job_id).await.unwrap().unwrap();
        assert_eq!(stored, job);
        assert_eq!(stored.current_stage, None);
        assert_eq!(orch.active_executions(), 0);
        assert!(orch.start(id("job-002"), serde_json::json!({})).await.is_ok());
    }

    #[tokio::test]
    async fn panicking_execution_task_still_closes_out_the_job() {
        let ledger = Arc::new(Faulty::default());
        ledger.panic_on_running.store(true, Ordering::SeqCst);
        let orch = build(
            definition(),
            ledger.clone(),
            Arc::new(Immediate),
            Arc::new(Immediate),
            OrchestratorSettings::default(),
        );
        let handle = orch.start(id("job-001"), serde_json::json!({})).await.unwrap();
        let job = orch.wait(&handle).await.unwrap();

        assert_eq!(job.status, JobStatus::Failed);
        let error = job.error().unwrap();
        assert_eq!(error.stage, StageName::Script);
        assert!(error.message.contains("panicked"), "{}", error.message);
        assert_eq!(
            ledger.get(&handle.job_id).await.unwrap().unwrap().status,
            JobStatus::Failed
        );
        assert_eq!(orch.active_executions(), 0);
        assert!(orch
            .events()
            .recent_events(1)
            .iter()
            .any(|e| matches!(e.payload, EventPayload::PipelineFailed { .. })));
    }

    #[tokio::test]
    async fn oversized_timeouts_saturate() {
        let pipeline = PipelineConfig {
            function_timeout_secs: u64::MAX,
            upload_timeout_secs: u64::MAX,
            render_timeout_secs: u64::MAX,
            ..Default::default()
        };
        let orch = build(
            PipelineDefinition::standard(&pipeline).unwrap(),
            Arc::new(MemoryLedger::new()),
            Arc::new(Immediate),
            Arc::new(Immediate),
            OrchestratorSettings {
                pipeline_timeout: Duration::MAX,
                cancel_grace: Duration::MAX,
                retention: chrono::Duration::days(i64::from(u32::MAX)),
            },
        );
        let handle = orch.start(id("job-001"), serde_json::json!({})).await.unwrap();
        let job = orch.wait(&handle).await.unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert!(job.ttl > Utc::now() + chrono::Duration::days(365 * 1000));
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_write_is_retried() {
        let ledger = Arc::new(Faulty::default());
        ledger.failing_terminal_writes.store(1, Ordering::SeqCst);
        let orch = build(
            definition(),
            ledger.clone(),
            Arc::new(Immediate),
            Arc::new(Immediate),
            OrchestratorSettings::default(),
        );
        let handle = orch.start(id("job-001"), serde_json::json!({})).await.unwrap();
        orch.wait(&handle).await.unwrap();
        assert_eq!(
            ledger.get(&handle.job_id).await.unwrap().unwrap().status,
            JobStatus::Succeeded
        );
    }

    #[tokio::test(start_paused = true)]
    async fn lost_terminal_write_is_reported_and_recovered() {
        let ledger = Arc::new(Faulty::default());
        ledger.failing_terminal_writes.store(usize::MAX, Ordering::SeqCst);
        let orch = build(
            definition(),
            ledger.clone(),
            Arc::new(Immediate),
            Arc::new(Immediate),
            OrchestratorSettings::default(),
        );
        let handle = orch.start(id("job-001"), serde_json::json!({})).await.unwrap();
        orch.wait(&handle).await.unwrap();

        assert_eq!(orch.status(&handle).await.unwrap().status, JobStatus::Succeeded);
        assert_eq!(
            ledger.get(&handle.job_id).await.unwrap().unwrap().status,
            JobStatus::Running
        );

        ledger.failing_terminal_writes.store(0, Ordering::SeqCst);
        let restarted = build(
            definition(),
            ledger.clone(),
            Arc::new(Immediate),
            Arc::new(Immediate),
            OrchestratorSettings::default(),
        );
        assert_eq!(restarted.recover_interrupted().await.unwrap(), 1);
        let job = restarted.get_job(&handle.job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error().unwrap().code, ErrorCode::Cancelled);
    }

    #[tokio::test]
    async fn shutdown_cancels_in_flight_executions() {
        let ledger = Arc::new(MemoryLedger::new());
        let orch = build(
            definition(),
            ledger.clone(),
            Arc::new(Immediate),
            Arc::new(UntilStopped),
            OrchestratorSettings::default(),
        );
        let handle = orch.start(id("job-001"), serde_json::json!({})).await.unwrap();
        while orch.status(&handle).await.unwrap().current_stage != Some(StageName::Render) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(orch.shutdown().await, 0);
        let job = ledger.get(&handle.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        let error = job.error().unwrap();
        assert_eq!(error.code, ErrorCode::Cancelled);
        assert_eq!(error.stage, StageName::Render);
        assert_eq!(orch.shutdown().await, 0);
    }

    #[tokio::test]
    async fn recovery_skips_finished_and_running_jobs() {
        let ledger = Arc::new(MemoryLedger::new());
        let mut orphan = Job::new(id("job-001"), serde_json::json!({}), chrono::Duration::days(7));
        orphan.begin_stage(StageName::Broll).unwrap();
        ledger.put(&orphan).await.unwrap();

        let orch = build(
            definition(),
            ledger.clone(),
            Arc::new(Immediate),
            Arc::new(UntilStopped),
            OrchestratorSettings::default(),
        );
        let running = orch.start(id("job-002"), serde_json::json!({})).await.unwrap();
        let mut finished = Job::new(id("job-003"), serde_json::json!({}), chrono::Duration::days(7));
        finished.succeed().unwrap();
        ledger.put(&finished).await.unwrap();

        assert_eq!(orch.recover_interrupted().await.unwrap(), 1);
        let orphan = orch.get_job(&orphan.job_id).await.unwrap();
        assert_eq!(orphan.status, JobStatus::Failed);
        assert_eq!(orphan.error().unwrap().stage, StageName::Broll);
        assert_eq!(orch.get_job(&finished.job_id).await.unwrap().status, JobStatus::Succeeded);
        assert!(!orch.get_job(&running.job_id).await.unwrap().is_terminal());
        assert_eq!(orch.recover_interrupted().await.unwrap(), 0);

        assert!(orch.cancel(&running).unwrap());
        orch.wait(&running).await.unwrap();
    }
}
