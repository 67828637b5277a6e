// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;

use crate::app::errors::AppResult;
use crate::app::types::{ApplicationDescriptor, NameAndVersion};

/// Lookup of runnable application descriptors.
#[async_trait]
pub trait ApplicationCatalogPort: Send + Sync {
    async fn find(&self, application: &NameAndVersion) -> AppResult<Option<ApplicationDescriptor>>;
}
