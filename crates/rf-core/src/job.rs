//! Job document model.
//!
//! A [`Job`] is the durable record of one media-production request. Each
//! completed stage contributes exactly one [`StageResult`] under its fixed key
//! in [`StageResults`]; slots are write-once and a stage may only be merged
//! after every stage it is declared to follow. Once a job reaches a terminal
//! status every mutator refuses to touch it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;
use crate::ids::JobId;

/// Latest expiry a job can carry: 9999-12-31T23:59:59Z, the last instant
/// with a four-digit year.
const LATEST_TTL_SECS: i64 = 253_402_300_799;

// ---------------------------------------------------------------------------
// StageName
// ---------------------------------------------------------------------------

/// One of the five pipeline stages. The variant order is the pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageName {
    Script,
    Tts,
    Broll,
    Render,
    Upload,
}

impl StageName {
    /// All stages in pipeline order.
    pub const ALL: [StageName; 5] = [
        StageName::Script,
        StageName::Tts,
        StageName::Broll,
        StageName::Render,
        StageName::Upload,
    ];

    /// Key under which this stage's result is stored in the job document.
    pub fn key(&self) -> &'static str {
        match self {
            StageName::Script => "script",
            StageName::Tts => "tts",
            StageName::Broll => "broll",
            StageName::Render => "render",
            StageName::Upload => "upload",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for StageName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StageName::ALL
            .into_iter()
            .find(|stage| stage.key() == s)
            .ok_or_else(|| Error::Validation(format!("unknown stage '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
            JobStatus::TimedOut => "TIMED_OUT",
        }
    }

    /// Whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::TimedOut
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(JobStatus::Pending),
            "RUNNING" => Ok(JobStatus::Running),
            "SUCCEEDED" => Ok(JobStatus::Succeeded),
            "FAILED" => Ok(JobStatus::Failed),
            "TIMED_OUT" => Ok(JobStatus::TimedOut),
            other => Err(Error::Validation(format!("unknown job status '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// ObjectRef / ErrorInfo / StageResult
// ---------------------------------------------------------------------------

/// Reference to an object in the media store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
}

impl ObjectRef {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Resource identifier used for capability checks: `{bucket}/{key}`.
    pub fn resource_id(&self) -> String {
        format!("{}/{}", self.bucket, self.key)
    }

    /// File name component of the key.
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "store://{}/{}", self.bucket, self.key)
    }
}

/// Machine-readable failure classification recorded in the job document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    StageTimeout,
    StageExecutionError,
    StageOutputInvalid,
    PipelineTimeout,
    CapabilityDenied,
    Cancelled,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::StageTimeout => "stage_timeout",
            ErrorCode::StageExecutionError => "stage_execution_error",
            ErrorCode::StageOutputInvalid => "stage_output_invalid",
            ErrorCode::PipelineTimeout => "pipeline_timeout",
            ErrorCode::CapabilityDenied => "capability_denied",
            ErrorCode::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Failure details attached to the stage that ended an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub stage: StageName,
    pub code: ErrorCode,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Outcome of one stage invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: StageName,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(default)]
    pub output_refs: Vec<ObjectRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl StageResult {
    /// A successful result.
    pub fn succeeded(
        stage: StageName,
        started_at: DateTime<Utc>,
        output_refs: Vec<ObjectRef>,
    ) -> Self {
        Self {
            stage,
            started_at,
            finished_at: Utc::now(),
            output_refs,
            error: None,
        }
    }

    /// A failed attempt carrying its error.
    pub fn failed(
        stage: StageName,
        started_at: DateTime<Utc>,
        code: ErrorCode,
        message: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            stage,
            started_at,
            finished_at: now,
            output_refs: Vec::new(),
            error: Some(ErrorInfo {
                stage,
                code,
                message: message.into(),
                at: now,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// StageResults
// ---------------------------------------------------------------------------

/// Why a merge into the job document was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MergeError {
    #[error("stage '{0}' already has a result")]
    AlreadyWritten(StageName),
    #[error("stage '{stage}' merged before predecessor '{missing}'")]
    MissingPredecessor {
        stage: StageName,
        missing: StageName,
    },
    #[error("stage '{0}' result carries an error and cannot be merged")]
    FailedResult(StageName),
    #[error("job is terminal ({0})")]
    Terminal(JobStatus),
}

/// Per-stage results, one named slot per stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<StageResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tts: Option<StageResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broll: Option<StageResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub render: Option<StageResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload: Option<StageResult>,
}

impl StageResults {
    pub fn get(&self, stage: StageName) -> Option<&StageResult> {
        match stage {
            StageName::Script => self.script.as_ref(),
            StageName::Tts => self.tts.as_ref(),
            StageName::Broll => self.broll.as_ref(),
            StageName::Render => self.render.as_ref(),
            StageName::Upload => self.upload.as_ref(),
        }
    }

    fn slot_mut(&mut self, stage: StageName) -> &mut Option<StageResult> {
        match stage {
            StageName::Script => &mut self.script,
            StageName::Tts => &mut self.tts,
            StageName::Broll => &mut self.broll,
            StageName::Render => &mut self.render,
            StageName::Upload => &mut self.upload,
        }
    }

    /// Stages that have a result, in pipeline order.
    pub fn keys(&self) -> Vec<StageName> {
        StageName::ALL
            .into_iter()
            .filter(|s| self.get(*s).is_some())
            .collect()
    }

    /// Write `result` into its slot.
    ///
    /// `predecessors` are the stages that must already be present. The slot
    /// must be empty and the result must not carry an error.
    pub fn merge(
        &mut self,
        result: StageResult,
        predecessors: &[StageName],
    ) -> Result<(), MergeError> {
        let stage = result.stage;
        if result.error.is_some() {
            return Err(MergeError::FailedResult(stage));
        }
        if self.get(stage).is_some() {
            return Err(MergeError::AlreadyWritten(stage));
        }
        if let Some(missing) = predecessors.iter().find(|p| self.get(**p).is_none()) {
            return Err(MergeError::MissingPredecessor {
                stage,
                missing: *missing,
            });
        }
        *self.slot_mut(stage) = Some(result);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// Durable record of one media-production request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub status: JobStatus,
    /// Submission parameters (e.g. `{"topic": "..."}`).
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub stages: StageResults,
    /// Stage currently executing while `Running`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<StageName>,
    /// The attempt that ended the execution, when it did not succeed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<StageResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Expiry instant; the ledger reaps the record after it passes.
    pub ttl: DateTime<Utc>,
}

impl Job {
    /// A new `Pending` job expiring `retention` from now, or at the latest
    /// representable expiry if that lies further out.
    pub fn new(job_id: JobId, payload: serde_json::Value, retention: Duration) -> Self {
        let now = Utc::now();
        let latest = DateTime::from_timestamp(LATEST_TTL_SECS, 0).unwrap_or(now);
        let ttl = now
            .checked_add_signed(retention)
            .map_or(latest, |ttl| ttl.min(latest));
        Self {
            job_id,
            status: JobStatus::Pending,
            payload,
            stages: StageResults::default(),
            current_stage: None,
            failure: None,
            created_at: now,
            updated_at: now,
            ttl,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Error of the stage that ended the execution, if any.
    pub fn error(&self) -> Option<&ErrorInfo> {
        self.failure.as_ref().and_then(|f| f.error.as_ref())
    }

    /// Accumulated document handed to each stage as input.
    pub fn document(&self) -> serde_json::Value {
        serde_json::json!({
            "jobId": self.job_id,
            "payload": self.payload,
            "stages": self.stages,
        })
    }

    fn ensure_open(&self) -> Result<(), MergeError> {
        if self.is_terminal() {
            Err(MergeError::Terminal(self.status))
        } else {
            Ok(())
        }
    }

    /// Enter `Running` on `stage`.
    pub fn begin_stage(&mut self, stage: StageName) -> Result<(), MergeError> {
        self.ensure_open()?;
        self.status = JobStatus::Running;
        self.current_stage = Some(stage);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Merge a successful stage result.
    pub fn complete_stage(
        &mut self,
        result: StageResult,
        predecessors: &[StageName],
    ) -> Result<(), MergeError> {
        self.ensure_open()?;
        self.stages.merge(result, predecessors)?;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Move to `Succeeded`.
    pub fn succeed(&mut self) -> Result<(), MergeError> {
        self.ensure_open()?;
        self.status = JobStatus::Succeeded;
        self.current_stage = None;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Move to `Failed` or `TimedOut`, recording the failing attempt.
    pub fn terminate(&mut self, status: JobStatus, failure: StageResult) -> Result<(), MergeError> {
        self.ensure_open()?;
        debug_assert!(matches!(status, JobStatus::Failed | JobStatus::TimedOut));
        self.status = status;
        self.current_stage = None;
        self.failure = Some(failure);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Whether the record has passed its expiry at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.ttl <= now
    }
}
