//! Unified error type for reelforge.
//!
//! Infrastructure failures (ledger, storage, validation) funnel into
//! [`Error`], which carries enough context for API handlers to derive an HTTP
//! status code via [`Error::http_status`]. Failures of a single stage
//! invocation use the narrower [`StageError`], whose [`code`](StageError::code)
//! is what ends up recorded in the job document.

use std::fmt;
use std::time::Duration;

use crate::capability::{Action, ResourceKind};
use crate::job::ErrorCode;

/// Unified error type covering infrastructure failure modes.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested entity could not be found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of entity (e.g. "job", "execution").
        entity: String,
        /// The identifier that was looked up.
        id: String,
    },

    /// Request data failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A conflicting resource already exists.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A resource refused an action outside the caller's granted capabilities.
    #[error("Capability denied: {action} on {kind} '{resource}'")]
    CapabilityDenied {
        /// Kind of resource that was accessed.
        kind: ResourceKind,
        /// Concrete resource identifier.
        resource: String,
        /// The action that was attempted.
        action: Action,
    },

    /// A database operation failed.
    #[error("Database error: {source}")]
    Database {
        /// The underlying database error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// An I/O operation failed.
    #[error("IO error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// The object store or secret vault failed for reasons other than access.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A stage invocation failed outside the orchestrator (e.g. a dry run).
    #[error("Stage error: {0}")]
    Stage(#[from] StageError),

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Map this error to an appropriate HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::NotFound { .. } => 404,
            Error::Validation(_) => 400,
            Error::Conflict(_) => 409,
            Error::CapabilityDenied { .. } => 403,
            Error::Database { .. } => 500,
            Error::Io { .. } => 500,
            Error::Storage(_) => 502,
            Error::Stage(_) => 502,
            Error::Internal(_) => 500,
        }
    }

    /// Convenience constructor for [`Error::NotFound`].
    pub fn not_found(entity: impl Into<String>, id: impl fmt::Display) -> Self {
        Error::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Convenience constructor for [`Error::Database`].
    pub fn database(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Error::Database {
            source: source.into(),
        }
    }

    /// Convenience constructor for [`Error::CapabilityDenied`].
    pub fn denied(kind: ResourceKind, resource: impl Into<String>, action: Action) -> Self {
        Error::CapabilityDenied {
            kind,
            resource: resource.into(),
            action,
        }
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Failure of one stage invocation.
///
/// Every variant terminates the current execution; there is no retryable vs.
/// fatal distinction at this level.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StageError {
    /// The stage did not finish within its declared timeout.
    #[error("stage timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// The stage logic reported an error (error response, non-zero exit).
    #[error("stage execution failed: {0}")]
    Execution(String),

    /// The stage returned, but its output is missing or malformed.
    #[error("stage output invalid: {0}")]
    OutputInvalid(String),

    /// A resource rejected an action outside the stage's capability set.
    #[error("capability denied: {0}")]
    CapabilityDenied(String),
}

impl StageError {
    /// Error code recorded in the job document for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            StageError::Timeout(_) => ErrorCode::StageTimeout,
            StageError::Execution(_) => ErrorCode::StageExecutionError,
            StageError::OutputInvalid(_) => ErrorCode::StageOutputInvalid,
            StageError::CapabilityDenied(_) => ErrorCode::CapabilityDenied,
        }
    }

    /// Convenience constructor for [`StageError::Execution`].
    pub fn execution(message: impl fmt::Display) -> Self {
        StageError::Execution(message.to_string())
    }

    /// Convenience constructor for [`StageError::OutputInvalid`].
    pub fn output_invalid(message: impl fmt::Display) -> Self {
        StageError::OutputInvalid(message.to_string())
    }
}

impl From<Error> for StageError {
    fn from(err: Error) -> Self {
        match err {
            Error::CapabilityDenied { .. } => StageError::CapabilityDenied(err.to_string()),
            Error::Stage(inner) => inner,
            other => StageError::Execution(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_display() {
        let err = Error::not_found("job", "job-001");
        assert_eq!(err.to_string(), "job not found: job-001");
        assert_eq!(err.http_status(), 404);
    }

    #[test]
    fn validation_display() {
        let err = Error::Validation("job_id is required".into());
        assert_eq!(err.to_string(), "Validation error: job_id is required");
        assert_eq!(err.http_status(), 400);
    }

    #[test]
    fn conflict_display() {
        let err = Error::Conflict("job already exists".into());
        assert_eq!(err.http_status(), 409);
    }

    #[test]
    fn denied_display() {
        let err = Error::denied(ResourceKind::Secret, "youtube/oauth", Action::Write);
        assert_eq!(
            err.to_string(),
            "Capability denied: write on secret 'youtube/oauth'"
        );
        assert_eq!(err.http_status(), 403);
    }

    #[test]
    fn io_from_std() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let err = Error::from(io_err);
        assert!(matches!(err, Error::Io { .. }));
        assert_eq!(err.http_status(), 500);
    }

    #[test]
    fn database_display() {
        let err = Error::database("connection refused");
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn stage_error_codes() {
        assert_eq!(
            StageError::Timeout(Duration::from_secs(60)).code(),
            ErrorCode::StageTimeout
        );
        assert_eq!(
            StageError::execution("boom").code(),
            ErrorCode::StageExecutionError
        );
        assert_eq!(
            StageError::output_invalid("missing out.mp4").code(),
            ErrorCode::StageOutputInvalid
        );
    }

    #[test]
    fn stage_timeout_display() {
        let err = StageError::Timeout(Duration::from_secs(60));
        assert_eq!(err.to_string(), "stage timed out after 60s");
    }

    #[test]
    fn capability_denied_converts_to_stage_error() {
        let err = Error::denied(ResourceKind::ObjectStore, "media/job-002/voice.wav", Action::Read);
        let stage_err = StageError::from(err);
        assert_eq!(stage_err.code(), ErrorCode::CapabilityDenied);
    }

    #[test]
    fn other_errors_convert_to_execution() {
        let stage_err = StageError::from(Error::Storage("bucket unavailable".into()));
        assert_eq!(stage_err.code(), ErrorCode::StageExecutionError);
    }
}
