//! Typed identifier wrappers.
//!
//! [`JobId`] wraps the caller-supplied job identifier and validates it, since
//! it becomes the object-store prefix that isolates one job's artifacts from
//! another's. [`ExecutionId`] is a generated UUID naming one run of the
//! pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Maximum length of a job identifier.
pub const MAX_JOB_ID_LEN: usize = 128;

/// Caller-supplied, opaque job identifier.
///
/// Only ASCII alphanumerics, `-`, `_` and `.` are accepted. In particular `/`
/// is rejected: the id is used verbatim as a path prefix, and `a` must never
/// be a prefix of the keys belonging to `a/b`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

impl JobId {
    /// Validate and wrap a job identifier.
    pub fn parse(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(Error::Validation("job id must not be empty".into()));
        }
        if raw.len() > MAX_JOB_ID_LEN {
            return Err(Error::Validation(format!(
                "job id exceeds {MAX_JOB_ID_LEN} characters"
            )));
        }
        if raw == "." || raw == ".." {
            return Err(Error::Validation(format!("job id '{raw}' is reserved")));
        }
        if let Some(bad) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(Error::Validation(format!(
                "job id contains invalid character '{bad}'"
            )));
        }
        Ok(Self(raw))
    }

    /// Borrow the raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Object-store key prefix owned by this job (always ends with `/`).
    pub fn prefix(&self) -> String {
        format!("{}/", self.0)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for JobId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for JobId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<JobId> for String {
    fn from(id: JobId) -> Self {
        id.0
    }
}

/// Unique identifier for one pipeline execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(Uuid);

impl ExecutionId {
    /// Create a new random ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return the inner UUID value.
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ExecutionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for ExecutionId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}
