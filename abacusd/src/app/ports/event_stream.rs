// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;

use crate::app::errors::AppResult;
use crate::app::types::JobEvent;

/// Outbound side of the job event stream.
/// Publishing is fire-and-forget from the caller's point of view; a failure means
/// the bus is gone, not that a consumer rejected the event.
#[async_trait]
pub trait EventPublisherPort: Send + Sync {
    async fn publish(&self, event: JobEvent) -> AppResult<()>;
}
