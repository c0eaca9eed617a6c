//! In-memory ledger for tests and ephemeral runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rf_core::{Job, JobId, JobStatus, Result};

use super::JobLedger;

/// Ledger backed by a concurrent map. Contents are lost on drop.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    jobs: DashMap<JobId, Job>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[async_trait]
impl JobLedger for MemoryLedger {
    async fn get(&self, job_id: &JobId) -> Result<Option<Job>> {
        Ok(self.jobs.get(job_id).map(|j| j.value().clone()))
    }

    async fn put(&self, job: &Job) -> Result<()> {
        self.jobs.insert(job.job_id.clone(), job.clone());
        Ok(())
    }

    async fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs
            .iter()
            .filter(|j| status.map_or(true, |s| j.status == s))
            .map(|j| j.value().clone())
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let before = self.jobs.len();
        self.jobs.retain(|_, job| !job.is_expired(now));
        Ok(before - self.jobs.len())
    }
}
