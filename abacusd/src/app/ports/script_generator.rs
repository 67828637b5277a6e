// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::BTreeMap;

use crate::app::errors::AppResult;
use crate::app::types::{ApplicationDescriptor, JobLayout, JobStartRequest};

/// Produces the batch script text for one job.
pub trait ScriptGeneratorPort: Send + Sync {
    /// `inputs` maps each staged input parameter to its absolute remote destination.
    fn generate(
        &self,
        descriptor: &ApplicationDescriptor,
        request: &JobStartRequest,
        layout: &JobLayout,
        inputs: &BTreeMap<String, String>,
    ) -> AppResult<String>;
}
