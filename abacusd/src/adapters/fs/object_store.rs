// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::{ObjectReader, ObjectStorePort, ObjectWriter};
use crate::app::types::FileMeta;
use crate::util::remote_path::{normalize_path, resolve_within};

/// Object store backed by a local directory. Object paths are relative to
/// `root`; anything that resolves outside of it is refused.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

fn storage_error(message: String) -> AppError {
    AppError::with_message(AppErrorKind::Internal, codes::STORAGE_ERROR, message)
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn resolve(&self, location: &str) -> AppResult<PathBuf> {
        let path = resolve_within(&self.root, location).ok_or_else(|| {
            AppError::invalid_argument(format!("object path '{location}' leaves the storage root"))
        })?;
        // Symlinks may still point elsewhere once the file exists.
        if let (Ok(real), Ok(root)) = (
            tokio::fs::canonicalize(&path).await,
            tokio::fs::canonicalize(&self.root).await,
        ) {
            if !real.starts_with(&root) {
                return Err(AppError::invalid_argument(format!(
                    "object path '{location}' leaves the storage root"
                )));
            }
        }
        Ok(path)
    }
}

#[async_trait]
impl ObjectStorePort for LocalObjectStore {
    #[tracing::instrument(name = "fs", level = "debug", skip(self), fields(op = "stat"))]
    async fn stat(&self, location: &str) -> AppResult<Option<FileMeta>> {
        let path = self.resolve(location).await?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(FileMeta {
                path: location.to_string(),
                size_in_bytes: meta.len(),
            })),
            Ok(_) => Ok(None),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(storage_error(format!(
                "failed to stat {}: {err}",
                path.display()
            ))),
        }
    }

    #[tracing::instrument(name = "fs", level = "debug", skip(self), fields(op = "read"))]
    async fn read(&self, location: &str) -> AppResult<ObjectReader> {
        let path = self.resolve(location).await?;
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|err| storage_error(format!("failed to open {}: {err}", path.display())))?;
        Ok(Box::new(file))
    }

    #[tracing::instrument(name = "fs", level = "debug", skip(self), fields(op = "create"))]
    async fn create(&self, location: &str) -> AppResult<ObjectWriter> {
        let path = self.resolve(location).await?;
        if path == normalize_path(&self.root) {
            return Err(AppError::invalid_argument("object path must name a file"));
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|err| {
                storage_error(format!("failed to create {}: {err}", parent.display()))
            })?;
        }
        // The folder may have been a symlink out of the root.
        let path = self.resolve(location).await?;
        let file = tokio::fs::File::create(&path)
            .await
            .map_err(|err| storage_error(format!("failed to create {}: {err}", path.display())))?;
        Ok(Box::new(file))
    }
}
