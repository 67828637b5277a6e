// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::HashMap;

use async_trait::async_trait;

use crate::app::errors::AppResult;
use crate::app::types::{JobId, JobStatus, SchedulerId, TrackedJob};
use crate::app::services::history::OwnerJobHistory;

/// Everything the aggregator needs to resume after a restart.
#[derive(Debug, Default, Clone)]
pub struct PersistedJobState {
    pub owners: HashMap<JobId, String>,
    pub correlations: HashMap<SchedulerId, JobId>,
    pub statuses: HashMap<JobId, JobStatus>,
    pub histories: HashMap<String, OwnerJobHistory>,
}

/// Durable backing for the job state aggregator tables.
#[async_trait]
pub trait JobStateStorePort: Send + Sync {
    async fn put_owner(&self, job_id: &JobId, owner: &str, authenticated: bool) -> AppResult<()>;
    async fn put_correlation(&self, scheduler_id: SchedulerId, job_id: &JobId) -> AppResult<()>;
    async fn put_status(&self, job_id: &JobId, status: JobStatus) -> AppResult<()>;
    async fn put_history(&self, owner: &str, history: &OwnerJobHistory) -> AppResult<()>;
    async fn load_all(&self) -> AppResult<PersistedJobState>;

    /// First write for a scheduler id wins.
    async fn put_tracked(&self, job: &TrackedJob) -> AppResult<()>;
    async fn remove_tracked(&self, scheduler_id: SchedulerId) -> AppResult<()>;
    async fn load_tracked(&self) -> AppResult<Vec<TrackedJob>>;
}
