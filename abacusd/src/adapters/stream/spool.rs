// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::EventPublisherPort;
use crate::app::types::{JobEvent, JobId, JobStartRequest};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelRequest {
    pub job_id: JobId,
    pub owner: String,
}

/// One spooled request file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InboundRequest {
    Start {
        start: JobStartRequest,
        #[serde(default)]
        authenticated: bool,
    },
    Cancel {
        cancel: CancelRequest,
    },
}

impl InboundRequest {
    pub fn into_event(self) -> JobEvent {
        match self {
            InboundRequest::Start {
                start,
                authenticated,
            } => JobEvent::StartRequested {
                request: start,
                authenticated,
            },
            InboundRequest::Cancel { cancel } => JobEvent::CancelRequested {
                job_id: cancel.job_id,
                owner: cancel.owner,
            },
        }
    }
}

fn local_error(message: String) -> AppError {
    AppError::with_message(AppErrorKind::Internal, codes::LOCAL_ERROR, message)
}

/// Picks up `*.json` request files from a directory and publishes them.
pub struct RequestSpool {
    dir: PathBuf,
    publisher: Arc<dyn EventPublisherPort>,
    interval: Duration,
}

impl RequestSpool {
    pub fn new(dir: PathBuf, publisher: Arc<dyn EventPublisherPort>, interval: Duration) -> Self {
        Self {
            dir,
            publisher,
            interval,
        }
    }

    async fn pending_files(&self) -> AppResult<Vec<PathBuf>> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|err| local_error(format!("failed to create {}: {err}", self.dir.display())))?;
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|err| local_error(format!("failed to list {}: {err}", self.dir.display())))?;
        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| local_error(format!("failed to list {}: {err}", self.dir.display())))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") && path.is_file() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    async fn quarantine(&self, path: &Path, reason: &str) {
        let mut target = path.as_os_str().to_owned();
        target.push(".invalid");
        tracing::warn!(path = %path.display(), "rejecting spooled request: {reason}");
        if let Err(err) = tokio::fs::rename(path, &target).await {
            tracing::error!(path = %path.display(), "failed to quarantine request file: {err}");
        }
    }

    /// Publishes every pending request, in file name order. A file is removed
    /// only after its event was published.
    pub async fn scan_once(&self) -> AppResult<usize> {
        let mut published = 0;
        for path in self.pending_files().await? {
            let text = match tokio::fs::read_to_string(&path).await {
                Ok(text) => text,
                Err(err) => {
                    self.quarantine(&path, &err.to_string()).await;
                    continue;
                }
            };
            let request: InboundRequest = match serde_json::from_str(&text) {
                Ok(request) => request,
                Err(err) => {
                    self.quarantine(&path, &err.to_string()).await;
                    continue;
                }
            };
            let event = request.into_event();
            tracing::info!(
                path = %path.display(),
                job_id = ?event.job_id(),
                "picked up spooled request"
            );
            self.publisher.publish(event).await?;
            published += 1;
            if let Err(err) = tokio::fs::remove_file(&path).await {
                tracing::error!(path = %path.display(), "failed to remove processed request: {err}");
            }
        }
        Ok(published)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.scan_once().await {
                        Ok(0) => {}
                        Ok(count) => tracing::debug!(count, "published spooled requests"),
                        Err(err) => tracing::warn!(code = err.code(), "request spool scan failed: {err}"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("request spool stopping");
                        return;
                    }
                }
            }
        }
    }
}
