// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::app::errors::AppResult;
use crate::app::ports::EventPublisherPort;
use crate::app::services::tracking::JobTracker;
use crate::app::services::{map_pool_error, map_remote_error};
use crate::app::types::{JobEvent, SchedulerEvent, SchedulerId};
use crate::remote::ConnectionPool;
use crate::remote::slurm::accounting_snapshot;

/// Why a single accounting line produced no event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOutcome {
    Event(SchedulerEvent),
    Blank,
    /// Wrong field count or unparsable exit code.
    Malformed(String),
    /// Job steps such as `123.batch` or `123.0`.
    JobStep,
    UntrackedState,
}

fn leading_exit_code(status: &str) -> Option<i32> {
    status.split(':').next()?.trim().parse().ok()
}

pub fn classify_line(line: &str) -> LineOutcome {
    let line = line.trim();
    if line.is_empty() {
        return LineOutcome::Blank;
    }
    let fields: Vec<&str> = line.split('|').collect();
    let [id, state, status] = fields.as_slice() else {
        return LineOutcome::Malformed(format!("expected 3 fields, got {}", fields.len()));
    };
    if leading_exit_code(status).is_none() {
        return LineOutcome::Malformed(format!("unparsable exit code '{status}'"));
    }
    let Ok(scheduler_id) = id.trim().parse::<SchedulerId>() else {
        return LineOutcome::JobStep;
    };
    // sacct may append a reason, e.g. "CANCELLED by 1000"
    let state = state.split_whitespace().next().unwrap_or_default();
    let event = match state {
        "RUNNING" => SchedulerEvent::Running(scheduler_id),
        "TIMEOUT" => SchedulerEvent::Timeout(scheduler_id),
        "COMPLETED" => SchedulerEvent::Ended(scheduler_id),
        "FAILED" => SchedulerEvent::Failed(scheduler_id),
        _ => return LineOutcome::UntrackedState,
    };
    LineOutcome::Event(event)
}

/// Turns one `sacct -b -P -n` listing into scheduler events. Bad lines are
/// logged and skipped; they never fail the cycle.
pub fn classify_accounting_output(output: &str) -> Vec<SchedulerEvent> {
    let mut events = Vec::new();
    for line in output.lines() {
        match classify_line(line) {
            LineOutcome::Event(event) => events.push(event),
            LineOutcome::Malformed(reason) => {
                tracing::warn!(line, "dropping malformed accounting line: {reason}");
            }
            LineOutcome::JobStep => tracing::trace!(line, "skipping job step"),
            LineOutcome::Blank | LineOutcome::UntrackedState => {}
        }
    }
    events
}

pub struct StatusPoller {
    pool: Arc<ConnectionPool>,
    tracker: Arc<JobTracker>,
    publisher: Arc<dyn EventPublisherPort>,
    interval: Duration,
}

impl StatusPoller {
    pub fn new(
        pool: Arc<ConnectionPool>,
        tracker: Arc<JobTracker>,
        publisher: Arc<dyn EventPublisherPort>,
        interval: Duration,
    ) -> Self {
        Self {
            pool,
            tracker,
            publisher,
            interval,
        }
    }

    /// Runs the accounting query once and returns the classified events.
    pub async fn poll_once(&self) -> AppResult<Vec<SchedulerEvent>> {
        let lease = self.pool.lease().await.map_err(map_pool_error)?;
        let out = accounting_snapshot(lease.session())
            .await
            .map_err(|err| map_remote_error("sacct", format!("{err:#}")))?;
        drop(lease);
        if out.exit_code != 0 {
            tracing::warn!(code = out.exit_code, "sacct exited with a non-zero status");
        }
        Ok(classify_accounting_output(&out.stdout_lossy()))
    }

    /// One cycle: query, classify, keep what is news for a tracked job, publish.
    pub async fn cycle(&self) -> AppResult<usize> {
        let events = self.tracker.admit(self.poll_once().await?);
        let count = events.len();
        for event in events {
            self.publisher.publish(JobEvent::Scheduler(event)).await?;
        }
        Ok(count)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.cycle().await {
                        Ok(count) => tracing::debug!(count, "published scheduler events"),
                        Err(err) => tracing::warn!(code = err.code(), "status poll failed: {err}"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("status poller stopping");
                        return;
                    }
                }
            }
        }
    }
}
