// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;

use async_trait::async_trait;

use crate::adapters::db::{JobStateStore, JobStateStoreError};
use crate::app::errors::{AppError, AppResult, codes};
use crate::app::ports::{JobStateStorePort, PersistedJobState};
use crate::app::services::history::OwnerJobHistory;
use crate::app::types::{JobId, JobStatus, SchedulerId, TrackedJob};

#[derive(Clone)]
pub struct SqliteStoreAdapter {
    store: Arc<JobStateStore>,
}

impl SqliteStoreAdapter {
    pub fn new(store: JobStateStore) -> Self {
        Self {
            store: Arc::new(store),
        }
    }
}

fn map_store_error(err: JobStateStoreError) -> AppError {
    match err {
        JobStateStoreError::EmptyOwner => AppError::invalid_argument("job owner must not be empty"),
        JobStateStoreError::SchedulerIdOutOfRange(_) => AppError::invalid_argument(err.to_string()),
        JobStateStoreError::Sqlx(_)
        | JobStateStoreError::Serde(_)
        | JobStateStoreError::CorruptStatus { .. } => {
            AppError::internal(codes::STORAGE_ERROR, err.to_string())
        }
    }
}

#[async_trait]
impl JobStateStorePort for SqliteStoreAdapter {
    async fn put_owner(&self, job_id: &JobId, owner: &str, authenticated: bool) -> AppResult<()> {
        self.store
            .put_owner(job_id, owner, authenticated)
            .await
            .map_err(map_store_error)
    }

    async fn put_correlation(&self, scheduler_id: SchedulerId, job_id: &JobId) -> AppResult<()> {
        let inserted = self
            .store
            .put_correlation(scheduler_id, job_id)
            .await
            .map_err(map_store_error)?;
        if !inserted {
            tracing::debug!(scheduler_id, %job_id, "correlation already stored");
        }
        Ok(())
    }

    async fn put_status(&self, job_id: &JobId, status: JobStatus) -> AppResult<()> {
        self.store
            .put_status(job_id, status)
            .await
            .map_err(map_store_error)
    }

    async fn put_history(&self, owner: &str, history: &OwnerJobHistory) -> AppResult<()> {
        self.store
            .put_history(owner, history)
            .await
            .map_err(map_store_error)
    }

    async fn load_all(&self) -> AppResult<PersistedJobState> {
        let rows = self.store.load_all().await.map_err(map_store_error)?;
        Ok(PersistedJobState {
            owners: rows.owners,
            correlations: rows.correlations,
            statuses: rows.statuses,
            histories: rows.histories,
        })
    }

    async fn put_tracked(&self, job: &TrackedJob) -> AppResult<()> {
        let inserted = self.store.put_tracked(job).await.map_err(map_store_error)?;
        if !inserted {
            tracing::debug!(scheduler_id = job.scheduler_id, "job already tracked");
        }
        Ok(())
    }

    async fn remove_tracked(&self, scheduler_id: SchedulerId) -> AppResult<()> {
        self.store
            .remove_tracked(scheduler_id)
            .await
            .map_err(map_store_error)
    }

    async fn load_tracked(&self) -> AppResult<Vec<TrackedJob>> {
        self.store.load_tracked().await.map_err(map_store_error)
    }
}
