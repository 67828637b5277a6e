// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::app::errors::AppResult;
use crate::app::types::FileMeta;

pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;
pub type ObjectWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// User files: job inputs are read from here, job outputs written back.
#[async_trait]
pub trait ObjectStorePort: Send + Sync {
    /// Returns `None` when the location does not resolve to a readable file.
    async fn stat(&self, location: &str) -> AppResult<Option<FileMeta>>;

    async fn read(&self, location: &str) -> AppResult<ObjectReader>;

    /// Creates or truncates the object, making parent folders as needed.
    async fn create(&self, location: &str) -> AppResult<ObjectWriter>;
}
