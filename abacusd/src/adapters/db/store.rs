// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use sqlx::{
    Row, SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{collections::HashMap, path::Path, str::FromStr, time::Duration};
use thiserror::Error;

use crate::app::services::history::OwnerJobHistory;
use crate::app::types::{JobId, JobStatus, SchedulerId, TrackedJob};

#[derive(Debug, Error)]
pub enum JobStateStoreError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("empty owner")]
    EmptyOwner,
    #[error("scheduler id {0} does not fit in a sqlite integer")]
    SchedulerIdOutOfRange(SchedulerId),
    #[error("unknown job status '{status}' stored for job {job_id}")]
    CorruptStatus { job_id: String, status: String },
}

pub type Result<T> = std::result::Result<T, JobStateStoreError>;

/// Rows loaded by [`JobStateStore::load_all`].
#[derive(Debug, Default)]
pub struct JobStateRows {
    pub owners: HashMap<JobId, String>,
    pub correlations: HashMap<SchedulerId, JobId>,
    pub statuses: HashMap<JobId, JobStatus>,
    pub histories: HashMap<String, OwnerJobHistory>,
}

fn scheduler_key(scheduler_id: SchedulerId) -> Result<i64> {
    i64::try_from(scheduler_id).map_err(|_| JobStateStoreError::SchedulerIdOutOfRange(scheduler_id))
}

/// SQLite tables behind the job state aggregator and the job tracker.
#[derive(Clone)]
pub struct JobStateStore {
    pool: SqlitePool,
}

impl JobStateStore {
    /// Open (or create) a file-backed SQLite DB.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let url = format!("sqlite://{}", path.as_ref().to_string_lossy());
        let opts = SqliteConnectOptions::from_str(&url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        store.bootstrap().await?;
        Ok(store)
    }

    /// Open an in-memory store (handy for tests).
    pub async fn open_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        store.bootstrap().await?;
        Ok(store)
    }

    async fn bootstrap(&self) -> Result<()> {
        // Improve concurrency for file DBs.
        let _ = sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS job_owners (
              job_id TEXT PRIMARY KEY,
              owner TEXT NOT NULL,
              authenticated INTEGER NOT NULL DEFAULT 0,
              created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
            );
            CREATE TABLE IF NOT EXISTS job_correlations (
              scheduler_id INTEGER PRIMARY KEY,
              job_id TEXT NOT NULL,
              created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
            );
            CREATE TABLE IF NOT EXISTS job_statuses (
              job_id TEXT PRIMARY KEY,
              status TEXT NOT NULL,
              updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
            );
            CREATE TABLE IF NOT EXISTS job_histories (
              owner TEXT PRIMARY KEY,
              history TEXT NOT NULL,
              updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
            );
            CREATE TABLE IF NOT EXISTS job_tracking (
              scheduler_id INTEGER PRIMARY KEY,
              job TEXT NOT NULL,
              created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
            );
            CREATE INDEX IF NOT EXISTS idx_job_owners_owner ON job_owners(owner);
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The first owner recorded for a job sticks; `authenticated` only ever goes up.
    pub async fn put_owner(&self, job_id: &JobId, owner: &str, authenticated: bool) -> Result<()> {
        if owner.trim().is_empty() {
            return Err(JobStateStoreError::EmptyOwner);
        }
        sqlx::query(
            r#"
            insert into job_owners (job_id, owner, authenticated)
            values (?1, ?2, ?3)
            on conflict(job_id) do update set
              authenticated = max(job_owners.authenticated, excluded.authenticated)
            "#,
        )
        .bind(job_id.as_str())
        .bind(owner)
        .bind(authenticated)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Keyed on the scheduler id alone; the first job recorded for an id sticks.
    /// Returns `false` when the id was already correlated.
    pub async fn put_correlation(&self, scheduler_id: SchedulerId, job_id: &JobId) -> Result<bool> {
        let id = scheduler_key(scheduler_id)?;
        let result = sqlx::query(
            r#"
            insert or ignore into job_correlations (scheduler_id, job_id)
            values (?1, ?2)
            "#,
        )
        .bind(id)
        .bind(job_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn put_status(&self, job_id: &JobId, status: JobStatus) -> Result<()> {
        sqlx::query(
            r#"
            insert into job_statuses (job_id, status)
            values (?1, ?2)
            on conflict(job_id) do update set
              status = excluded.status,
              updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
            "#,
        )
        .bind(job_id.as_str())
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn put_history(&self, owner: &str, history: &OwnerJobHistory) -> Result<()> {
        if owner.trim().is_empty() {
            return Err(JobStateStoreError::EmptyOwner);
        }
        let text = serde_json::to_string(history)?;
        sqlx::query(
            r#"
            insert into job_histories (owner, history)
            values (?1, ?2)
            on conflict(owner) do update set
              history = excluded.history,
              updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
            "#,
        )
        .bind(owner)
        .bind(text)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_history(&self, owner: &str) -> Result<Option<OwnerJobHistory>> {
        let row = sqlx::query("select history from job_histories where owner = ?1")
            .bind(owner)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let text: String = row.try_get("history")?;
                Ok(Some(serde_json::from_str(&text)?))
            }
            None => Ok(None),
        }
    }

    pub async fn list_history_owners(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("select owner from job_histories order by owner asc")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| row.try_get::<String, _>("owner").map_err(Into::into))
            .collect()
    }

    pub async fn put_tracked(&self, job: &TrackedJob) -> Result<bool> {
        let id = scheduler_key(job.scheduler_id)?;
        let text = serde_json::to_string(job)?;
        let result = sqlx::query(
            r#"
            insert or ignore into job_tracking (scheduler_id, job)
            values (?1, ?2)
            "#,
        )
        .bind(id)
        .bind(text)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn remove_tracked(&self, scheduler_id: SchedulerId) -> Result<()> {
        sqlx::query("delete from job_tracking where scheduler_id = ?1")
            .bind(scheduler_key(scheduler_id)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn load_tracked(&self) -> Result<Vec<TrackedJob>> {
        let rows = sqlx::query("select job from job_tracking order by scheduler_id asc")
            .fetch_all(&self.pool)
            .await?;
        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let text: String = row.try_get("job")?;
            jobs.push(serde_json::from_str(&text)?);
        }
        Ok(jobs)
    }

    pub async fn load_all(&self) -> Result<JobStateRows> {
        let mut rows = JobStateRows::default();

        for row in sqlx::query("select job_id, owner from job_owners")
            .fetch_all(&self.pool)
            .await?
        {
            let job_id: String = row.try_get("job_id")?;
            rows.owners.insert(JobId::new(job_id), row.try_get("owner")?);
        }

        for row in sqlx::query("select scheduler_id, job_id from job_correlations")
            .fetch_all(&self.pool)
            .await?
        {
            let scheduler_id: i64 = row.try_get("scheduler_id")?;
            let job_id: String = row.try_get("job_id")?;
            if let Ok(scheduler_id) = SchedulerId::try_from(scheduler_id) {
                rows.correlations.insert(scheduler_id, JobId::new(job_id));
            }
        }

        for row in sqlx::query("select job_id, status from job_statuses")
            .fetch_all(&self.pool)
            .await?
        {
            let job_id: String = row.try_get("job_id")?;
            let status: String = row.try_get("status")?;
            let parsed = status
                .parse::<JobStatus>()
                .map_err(|_| JobStateStoreError::CorruptStatus {
                    job_id: job_id.clone(),
                    status,
                })?;
            rows.statuses.insert(JobId::new(job_id), parsed);
        }

        for row in sqlx::query("select owner, history from job_histories")
            .fetch_all(&self.pool)
            .await?
        {
            let owner: String = row.try_get("owner")?;
            let text: String = row.try_get("history")?;
            rows.histories.insert(owner, serde_json::from_str(&text)?);
        }

        Ok(rows)
    }
}
