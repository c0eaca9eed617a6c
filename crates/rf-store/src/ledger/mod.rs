//! The durable job record.
//!
//! A [`JobLedger`] stores whole [`Job`] documents keyed by job id. `put` is an
//! atomic, last-writer-wins replacement of one job; there are no partial
//! updates. Records whose `ttl` has passed are removed by
//! [`reap_expired`](JobLedger::reap_expired).

mod memory;
mod sqlite;

pub use memory::MemoryLedger;
pub use sqlite::SqliteLedger;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rf_core::{Job, JobId, JobStatus, Result};

/// Durable job store.
#[async_trait]
pub trait JobLedger: Send + Sync {
    /// Fetch a job by id.
    async fn get(&self, job_id: &JobId) -> Result<Option<Job>>;

    /// Insert or replace a job.
    async fn put(&self, job: &Job) -> Result<()>;

    /// List jobs, newest first, optionally filtered by status.
    async fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>>;

    /// Delete every job whose `ttl` is at or before `now`; returns the count.
    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<usize>;
}
