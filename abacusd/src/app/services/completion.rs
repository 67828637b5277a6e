// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::app::errors::{AppError, AppResult, codes};
use crate::app::ports::{ApplicationCatalogPort, EventPublisherPort, ObjectStorePort};
use crate::app::services::tracking::JobTracker;
use crate::app::services::{map_pool_error, map_remote_error};
use crate::app::types::{JobEvent, JobFailure, JobId, SchedulerEvent, TrackedJob};
use crate::remote::archive::{self, ArchiveStatus};
use crate::remote::scp::scp_download;
use crate::remote::{ConnectionPool, RemoteSession, files};

/// Object store folder that receives a job's outputs.
pub fn output_folder(owner: &str, job_id: &JobId) -> String {
    format!("{owner}/Jobs/{job_id}")
}

/// Finishes jobs once the scheduler is done with them.
///
/// Starts tracking on `Pending`. On `Ended` the application's output globs are
/// shipped to the object store, directories as zip archives. Every terminal
/// event then removes the job directory from the cluster and ends tracking.
/// A shipping failure is reported as `UnsuccessfullyCompleted`.
pub struct JobCompletionService {
    pool: Arc<ConnectionPool>,
    catalog: Arc<dyn ApplicationCatalogPort>,
    storage: Arc<dyn ObjectStorePort>,
    tracker: Arc<JobTracker>,
    publisher: Arc<dyn EventPublisherPort>,
}

impl JobCompletionService {
    pub fn new(
        pool: Arc<ConnectionPool>,
        catalog: Arc<dyn ApplicationCatalogPort>,
        storage: Arc<dyn ObjectStorePort>,
        tracker: Arc<JobTracker>,
        publisher: Arc<dyn EventPublisherPort>,
    ) -> Self {
        Self {
            pool,
            catalog,
            storage,
            tracker,
            publisher,
        }
    }

    async fn track(&self, event: &JobEvent) -> AppResult<()> {
        let JobEvent::Pending {
            scheduler_id,
            job_dir,
            work_dir,
            request,
        } = event
        else {
            return Ok(());
        };
        self.tracker
            .track(TrackedJob {
                scheduler_id: *scheduler_id,
                job_id: request.job_id.clone(),
                owner: request.owner.clone(),
                application: request.application.clone(),
                job_dir: job_dir.clone(),
                work_dir: work_dir.clone(),
            })
            .await
    }

    /// Ships (on `Ended`), cleans up and stops tracking. Returns the number of
    /// files shipped.
    #[tracing::instrument(name = "job_finish", skip(self), fields(scheduler_id = event.scheduler_id()))]
    pub async fn finish(&self, event: SchedulerEvent) -> AppResult<usize> {
        let Some(job) = self.tracker.get(event.scheduler_id()) else {
            tracing::debug!("no tracked job for scheduler event");
            return Ok(0);
        };
        let lease = self.pool.lease().await.map_err(map_pool_error)?;
        let session = lease.session();

        let shipped = match event {
            SchedulerEvent::Ended(_) => self.ship_results(session, &job).await,
            _ => Ok(0),
        };
        self.clean_up(session, &job).await;
        drop(lease);
        self.tracker.untrack(job.scheduler_id).await?;

        match shipped {
            Ok(count) => {
                tracing::info!(job_id = %job.job_id, shipped = count, "job finished");
                Ok(count)
            }
            Err(err) => {
                let err = err.with_context(format!("shipping results of {}", job.job_id));
                tracing::warn!(job_id = %job.job_id, code = err.code(), "{err}");
                self.publisher
                    .publish(JobEvent::UnsuccessfullyCompleted {
                        job_id: job.job_id.clone(),
                        owner: job.owner.clone(),
                        failure: JobFailure::from(&err),
                    })
                    .await?;
                Err(err)
            }
        }
    }

    async fn ship_results(&self, session: &dyn RemoteSession, job: &TrackedJob) -> AppResult<usize> {
        let descriptor = self.catalog.find(&job.application).await?.ok_or_else(|| {
            AppError::not_found(format!("application not found: {}", job.application))
        })?;
        let folder = output_folder(&job.owner, &job.job_id);
        let mut seen = BTreeSet::new();
        for glob in &descriptor.outputs {
            let matches = files::ls_with_glob(session, &job.work_dir, glob)
                .await
                .map_err(|err| map_remote_error("output listing", format!("{err:#}")))?;
            for found in matches {
                if !files::is_within(&job.work_dir, &found.path) {
                    tracing::warn!(path = %found.path, "output outside the working directory, skipping");
                    continue;
                }
                if seen.insert(found.path.clone()) {
                    self.ship_one(session, &found.path, &folder).await?;
                }
            }
        }
        Ok(seen.len())
    }

    async fn ship_one(&self, session: &dyn RemoteSession, path: &str, folder: &str) -> AppResult<()> {
        let Some(stat) = files::stat(session, path)
            .await
            .map_err(|err| map_remote_error("stat", format!("{err:#}")))?
        else {
            tracing::info!(path, "output vanished before shipping, skipping");
            return Ok(());
        };

        let source = if stat.is_dir {
            let zip_path = format!("{}.zip", path.trim_end_matches('/'));
            let status = archive::zip(session, path, &zip_path)
                .await
                .map_err(|err| map_remote_error("zip", format!("{err:#}")))?;
            if status != ArchiveStatus::Success {
                return Err(AppError::internal(
                    codes::REMOTE_ERROR,
                    format!("unable to create output zip of {path}: {status:?}"),
                ));
            }
            if files::stat(session, &zip_path)
                .await
                .map_err(|err| map_remote_error("stat", format!("{err:#}")))?
                .is_none()
            {
                return Err(AppError::internal(
                    codes::INTERNAL_ERROR,
                    format!("zip archive missing after creation: {zip_path}"),
                ));
            }
            zip_path
        } else {
            path.to_string()
        };

        let file_name = Path::new(&source)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| AppError::invalid_argument(format!("output {source} has no file name")))?;
        let location = format!("{folder}/{file_name}");
        let mut sink = self.storage.create(&location).await?;
        let code = scp_download(session, &source, &mut sink)
            .await
            .map_err(|err| map_remote_error("download", err))?;
        sink.shutdown().await.map_err(|err| {
            AppError::internal(codes::STORAGE_ERROR, format!("failed to finish {location}: {err}"))
        })?;
        if code != 0 {
            return Err(map_remote_error(
                "download",
                format!("scp returned status {code} for {source}"),
            ));
        }
        tracing::debug!(source = %source, location = %location, "shipped output");
        Ok(())
    }

    async fn clean_up(&self, session: &dyn RemoteSession, job: &TrackedJob) {
        match files::rm(session, &job.job_dir, true, true).await {
            Ok(0) => tracing::debug!(job_dir = %job.job_dir, "removed job directory"),
            Ok(code) => tracing::warn!(job_dir = %job.job_dir, code, "could not remove job directory"),
            Err(err) => tracing::warn!(job_dir = %job.job_dir, "could not remove job directory: {err:#}"),
        }
    }

    /// Tracking happens inline so a job is known before any of its terminal
    /// events is handled; finishing runs in its own task.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<JobEvent>) {
        let mut tasks = tokio::task::JoinSet::new();
        while let Some(event) = events.recv().await {
            match event {
                JobEvent::Pending { .. } => {
                    if let Err(err) = self.track(&event).await {
                        tracing::error!(job_id = ?event.job_id(), code = err.code(), "failed to track job: {err}");
                    }
                }
                JobEvent::Scheduler(scheduler_event) if scheduler_event.is_terminal() => {
                    let service = self.clone();
                    tasks.spawn(async move {
                        if let Err(err) = service.finish(scheduler_event).await {
                            tracing::debug!(code = err.code(), "finishing job failed: {err}");
                        }
                    });
                }
                _ => {}
            }
            while let Some(done) = tasks.try_join_next() {
                if let Err(err) = done {
                    tracing::error!("completion task failed: {err}");
                }
            }
        }
        while let Some(done) = tasks.join_next().await {
            if let Err(err) = done {
                tracing::error!("completion task failed: {err}");
            }
        }
        tracing::info!("completion worker stopping");
    }
}
