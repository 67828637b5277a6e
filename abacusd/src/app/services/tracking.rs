// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::app::errors::AppResult;
use crate::app::ports::JobStateStorePort;
use crate::app::types::{SchedulerEvent, SchedulerId, TrackedJob};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Entry {
    job: TrackedJob,
    last: Option<SchedulerEvent>,
}

/// Jobs this daemon submitted and still expects scheduler events for.
///
/// The accounting query reports every job of the day on every cycle. The
/// tracker turns that into a change feed: an event passes only for a tracked
/// job and only when it differs from the last one that passed. Nothing passes
/// after a terminal event. Entries are persisted so tracking survives restarts;
/// the "last event" is not, so a restart may repeat one event per job.
pub struct JobTracker {
    store: Arc<dyn JobStateStorePort>,
    jobs: Mutex<HashMap<SchedulerId, Entry>>,
}

impl JobTracker {
    pub fn new(store: Arc<dyn JobStateStorePort>) -> Self {
        Self {
            store,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub async fn restore(store: Arc<dyn JobStateStorePort>) -> AppResult<Self> {
        let persisted = store.load_tracked().await?;
        let tracker = Self::new(store);
        {
            let mut jobs = lock(&tracker.jobs);
            for job in persisted {
                jobs.insert(job.scheduler_id, Entry { job, last: None });
            }
        }
        tracing::info!(tracked = tracker.count(), "restored tracked jobs");
        Ok(tracker)
    }

    /// Starts tracking. A scheduler id that is already tracked keeps its first job.
    pub async fn track(&self, job: TrackedJob) -> AppResult<()> {
        if lock(&self.jobs).contains_key(&job.scheduler_id) {
            return Ok(());
        }
        self.store.put_tracked(&job).await?;
        tracing::debug!(scheduler_id = job.scheduler_id, job_id = %job.job_id, "tracking job");
        lock(&self.jobs)
            .entry(job.scheduler_id)
            .or_insert(Entry { job, last: None });
        Ok(())
    }

    /// Keeps the events that are news for a tracked job, in order.
    pub fn admit(&self, events: Vec<SchedulerEvent>) -> Vec<SchedulerEvent> {
        let mut jobs = lock(&self.jobs);
        events
            .into_iter()
            .filter(|event| {
                let Some(entry) = jobs.get_mut(&event.scheduler_id()) else {
                    tracing::trace!(?event, "dropping event for an untracked job");
                    return false;
                };
                if entry
                    .last
                    .is_some_and(|last| last.is_terminal() || last == *event)
                {
                    return false;
                }
                entry.last = Some(*event);
                true
            })
            .collect()
    }

    pub fn get(&self, scheduler_id: SchedulerId) -> Option<TrackedJob> {
        lock(&self.jobs).get(&scheduler_id).map(|entry| entry.job.clone())
    }

    /// Stops tracking for good.
    pub async fn untrack(&self, scheduler_id: SchedulerId) -> AppResult<Option<TrackedJob>> {
        if !lock(&self.jobs).contains_key(&scheduler_id) {
            return Ok(None);
        }
        self.store.remove_tracked(scheduler_id).await?;
        Ok(lock(&self.jobs).remove(&scheduler_id).map(|entry| entry.job))
    }

    pub fn count(&self) -> usize {
        lock(&self.jobs).len()
    }
}
