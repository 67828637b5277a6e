// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

use crate::app::errors::{AppError, AppResult, codes};
use crate::app::ports::JobStateStorePort;
use crate::app::services::history::OwnerJobHistory;
use crate::app::types::{JobEvent, JobId, JobStatus, JobStatusWithId, SchedulerEvent, SchedulerId};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct Tables {
    owners: HashMap<JobId, String>,
    correlations: HashMap<SchedulerId, JobId>,
    statuses: HashMap<JobId, JobStatus>,
}

/// Folds the job event stream into durable per-owner histories.
///
/// Keeps three joined facts per job: its owner, its scheduler id and its
/// latest status. Once both owner and status are known, every status change
/// is applied to the owner's [`OwnerJobHistory`].
pub struct JobStateAggregator {
    store: Arc<dyn JobStateStorePort>,
    tables: Mutex<Tables>,
    histories: Mutex<HashMap<String, Arc<Mutex<OwnerJobHistory>>>>,
}

enum OwnerChange {
    Unchanged,
    Recorded(Option<JobStatus>),
}

impl JobStateAggregator {
    pub fn new(store: Arc<dyn JobStateStorePort>) -> Self {
        Self {
            store,
            tables: Mutex::new(Tables::default()),
            histories: Mutex::new(HashMap::new()),
        }
    }

    /// Rebuilds in-memory state from whatever the store persisted earlier.
    pub async fn restore(store: Arc<dyn JobStateStorePort>) -> AppResult<Self> {
        let persisted = store.load_all().await?;
        let aggregator = Self::new(store);
        {
            let mut tables = lock(&aggregator.tables);
            tables.owners = persisted.owners;
            tables.correlations = persisted.correlations;
            tables.statuses = persisted.statuses;
        }
        {
            let mut histories = lock(&aggregator.histories);
            for (owner, history) in persisted.histories {
                histories.insert(owner, Arc::new(Mutex::new(history)));
            }
        }
        tracing::info!(
            owners = lock(&aggregator.histories).len(),
            correlations = lock(&aggregator.tables).correlations.len(),
            "restored job state"
        );
        Ok(aggregator)
    }

    #[tracing::instrument(level = "debug", skip(self, event), fields(job_id = ?event.job_id()))]
    pub async fn handle(&self, event: &JobEvent) -> AppResult<()> {
        match event {
            JobEvent::StartRequested {
                request,
                authenticated,
            } => {
                self.record_owner(&request.job_id, &request.owner, *authenticated)
                    .await
            }
            JobEvent::CancelRequested { job_id, .. } => {
                tracing::debug!(%job_id, "cancel request does not change job state");
                Ok(())
            }
            JobEvent::Pending {
                scheduler_id,
                request,
                ..
            } => {
                self.record_correlation(*scheduler_id, &request.job_id).await?;
                self.record_owner(&request.job_id, &request.owner, true)
                    .await?;
                self.record_status(&request.job_id, JobStatus::Pending).await
            }
            JobEvent::UnsuccessfullyCompleted { job_id, owner, .. } => {
                self.record_owner(job_id, owner, true).await?;
                self.record_status(job_id, JobStatus::Failure).await
            }
            JobEvent::Scheduler(scheduler_event) => self.handle_scheduler_event(*scheduler_event).await,
        }
    }

    async fn handle_scheduler_event(&self, event: SchedulerEvent) -> AppResult<()> {
        let status = match event {
            SchedulerEvent::Running(_) => JobStatus::Running,
            SchedulerEvent::Ended(_) => JobStatus::Complete,
            SchedulerEvent::Failed(_) => JobStatus::Failure,
            SchedulerEvent::Timeout(id) => {
                tracing::warn!(scheduler_id = id, ?event, "unhandled scheduler event");
                return Ok(());
            }
        };
        let scheduler_id = event.scheduler_id();
        let job_id = lock(&self.tables).correlations.get(&scheduler_id).cloned();
        let Some(job_id) = job_id else {
            tracing::debug!(scheduler_id, "dropping event for a job we did not submit");
            return Ok(());
        };
        self.record_status(&job_id, status).await
    }

    // Each record_* checks memory, writes the store, and only then updates memory,
    // so a failed write leaves both sides as they were.
    async fn record_correlation(&self, scheduler_id: SchedulerId, job_id: &JobId) -> AppResult<()> {
        let existing = lock(&self.tables).correlations.get(&scheduler_id).cloned();
        if let Some(existing) = existing {
            if &existing != job_id {
                tracing::warn!(
                    scheduler_id,
                    %existing,
                    incoming = %job_id,
                    "scheduler id already correlated with another job"
                );
            }
            return Ok(());
        }
        self.store.put_correlation(scheduler_id, job_id).await?;
        lock(&self.tables)
            .correlations
            .entry(scheduler_id)
            .or_insert_with(|| job_id.clone());
        Ok(())
    }

    async fn record_owner(&self, job_id: &JobId, owner: &str, authenticated: bool) -> AppResult<()> {
        if lock(&self.tables).owners.contains_key(job_id) {
            return Ok(());
        }
        self.store.put_owner(job_id, owner, authenticated).await?;
        let change = {
            let mut tables = lock(&self.tables);
            match tables.owners.entry(job_id.clone()) {
                Entry::Occupied(_) => OwnerChange::Unchanged,
                Entry::Vacant(slot) => {
                    slot.insert(owner.to_string());
                    OwnerChange::Recorded(tables.statuses.get(job_id).copied())
                }
            }
        };
        if let OwnerChange::Recorded(Some(status)) = change {
            self.apply_to_history(owner, job_id, status).await?;
        }
        Ok(())
    }

    async fn record_status(&self, job_id: &JobId, status: JobStatus) -> AppResult<()> {
        if let Some(current) = self.status(job_id) {
            if current.is_terminal() && !status.is_terminal() {
                tracing::debug!(
                    %job_id,
                    current = current.as_str(),
                    incoming = status.as_str(),
                    "ignoring stale status for a finished job"
                );
                return Ok(());
            }
        }
        self.store.put_status(job_id, status).await?;
        let owner = {
            let mut tables = lock(&self.tables);
            tables.statuses.insert(job_id.clone(), status);
            tables.owners.get(job_id).cloned()
        };
        if let Some(owner) = owner {
            self.apply_to_history(&owner, job_id, status).await?;
        }
        Ok(())
    }

    fn history_handle(&self, owner: &str) -> Arc<Mutex<OwnerJobHistory>> {
        lock(&self.histories)
            .entry(owner.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(OwnerJobHistory::new())))
            .clone()
    }

    async fn apply_to_history(&self, owner: &str, job_id: &JobId, status: JobStatus) -> AppResult<()> {
        let handle = self.history_handle(owner);
        let update = JobStatusWithId {
            job_id: job_id.clone(),
            status,
        };
        let mut updated = lock(&handle).clone();
        updated.apply(update.clone());
        self.store.put_history(owner, &updated).await?;
        lock(&handle).apply(update);
        tracing::debug!(owner, %job_id, status = status.as_str(), "applied status to history");
        Ok(())
    }

    pub fn history(&self, owner: &str) -> Option<OwnerJobHistory> {
        let handle = lock(&self.histories).get(owner).cloned()?;
        let snapshot = lock(&handle).clone();
        Some(snapshot)
    }

    /// JSON form of the owner's history, completed jobs oldest first.
    pub fn serialized_history(&self, owner: &str) -> AppResult<Option<String>> {
        let Some(handle) = lock(&self.histories).get(owner).cloned() else {
            return Ok(None);
        };
        let history = lock(&handle);
        serde_json::to_string(&*history).map(Some).map_err(|err| {
            AppError::internal(
                codes::INTERNAL_ERROR,
                format!("failed to serialize history for {owner}: {err}"),
            )
        })
    }

    pub fn job_for_scheduler_id(&self, scheduler_id: SchedulerId) -> Option<JobId> {
        lock(&self.tables).correlations.get(&scheduler_id).cloned()
    }

    pub fn status(&self, job_id: &JobId) -> Option<JobStatus> {
        lock(&self.tables).statuses.get(job_id).copied()
    }

    pub fn owner(&self, job_id: &JobId) -> Option<String> {
        lock(&self.tables).owners.get(job_id).cloned()
    }

    /// Consumes events until every sender is gone.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<JobEvent>) {
        while let Some(event) = events.recv().await {
            if let Err(err) = self.handle(&event).await {
                tracing::warn!(code = err.code(), "failed to aggregate job event: {err}");
            }
        }
        tracing::info!("job state aggregator stopping");
    }
}
