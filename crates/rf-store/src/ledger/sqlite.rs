//! SQLite-backed ledger.
//!
//! Queries run on the blocking pool; each `put` is a single upsert statement
//! so a job document is replaced atomically.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rf_core::{Error, Job, JobId, JobStatus, Result};
use rusqlite::{params, Connection, OptionalExtension};

use super::JobLedger;
use crate::pool::{get_conn, DbPool};

/// Ledger persisted in a SQLite database.
#[derive(Clone)]
pub struct SqliteLedger {
    pool: DbPool,
}

impl SqliteLedger {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = get_conn(&pool)?;
            f(&conn)
        })
        .await
        .map_err(|e| Error::Internal(format!("spawn_blocking join error: {e}")))?
    }
}

fn decode(document: String) -> Result<Job> {
    serde_json::from_str(&document)
        .map_err(|e| Error::database(format!("corrupt job document: {e}")))
}

#[async_trait]
impl JobLedger for SqliteLedger {
    async fn get(&self, job_id: &JobId) -> Result<Option<Job>> {
        let id = job_id.to_string();
        self.with_conn(move |conn| {
            let doc: Option<String> = conn
                .query_row("SELECT document FROM jobs WHERE job_id = ?1", [&id], |row| {
                    row.get(0)
                })
                .optional()
                .map_err(|e| Error::database(e.to_string()))?;
            doc.map(decode).transpose()
        })
        .await
    }

    async fn put(&self, job: &Job) -> Result<()> {
        let document = serde_json::to_string(job)
            .map_err(|e| Error::Internal(format!("job serialization failed: {e}")))?;
        let id = job.job_id.to_string();
        let status = job.status.as_str();
        let created = job.created_at.timestamp_millis();
        let updated = job.updated_at.timestamp_millis();
        let ttl = job.ttl.timestamp();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO jobs (job_id, status, document, created_at, updated_at, ttl)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(job_id) DO UPDATE SET
                    status = excluded.status,
                    document = excluded.document,
                    updated_at = excluded.updated_at,
                    ttl = excluded.ttl",
                params![id, status, document, created, updated, ttl],
            )
            .map_err(|e| Error::database(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT document FROM jobs
                     WHERE (?1 IS NULL OR status = ?1)
                     ORDER BY created_at DESC LIMIT ?2",
                )
                .map_err(|e| Error::database(e.to_string()))?;
            let docs = stmt
                .query_map(params![status.map(|s| s.as_str()), limit], |row| {
                    row.get::<_, String>(0)
                })
                .map_err(|e| Error::database(e.to_string()))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| Error::database(e.to_string()))?;
            docs.into_iter().map(decode).collect()
        })
        .await
    }

    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now.timestamp();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM jobs WHERE ttl <= ?1", [cutoff])
                .map_err(|e| Error::database(e.to_string()))
        })
        .await
    }
}
