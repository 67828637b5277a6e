// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::BTreeMap;

use tera::Context;

use crate::app::errors::{AppError, AppResult};
use crate::app::ports::ScriptGeneratorPort;
use crate::app::types::{ApplicationDescriptor, JobLayout, JobStartRequest};

/// Renders the descriptor's `script_template` with tera.
///
/// Available variables: `job_id`, `owner`, `application` (`name`, `version`),
/// `parameters`, `job_dir`, `work_dir` and `inputs` (parameter name to remote path).
#[derive(Debug, Default, Clone)]
pub struct TeraScriptGenerator;

impl TeraScriptGenerator {
    pub fn new() -> Self {
        Self
    }
}

fn build_context(
    request: &JobStartRequest,
    layout: &JobLayout,
    inputs: &BTreeMap<String, String>,
) -> Context {
    let mut context = Context::new();
    context.insert("job_id", request.job_id.as_str());
    context.insert("owner", &request.owner);
    context.insert("application", &request.application);
    context.insert("parameters", &request.parameters);
    context.insert("job_dir", &layout.job_dir);
    context.insert("work_dir", &layout.work_dir);
    context.insert("inputs", inputs);
    context
}

impl ScriptGeneratorPort for TeraScriptGenerator {
    fn generate(
        &self,
        descriptor: &ApplicationDescriptor,
        request: &JobStartRequest,
        layout: &JobLayout,
        inputs: &BTreeMap<String, String>,
    ) -> AppResult<String> {
        let context = build_context(request, layout, inputs);
        let rendered = tera::Tera::one_off(&descriptor.script_template, &context, false).map_err(
            |err| {
                let mut message = format!(
                    "script template render failed for {}@{}: {err}",
                    descriptor.name, descriptor.version
                );
                let mut source = std::error::Error::source(&err);
                while let Some(cause) = source {
                    message.push_str(&format!(": {cause}"));
                    source = cause.source();
                }
                AppError::invalid_argument(message)
            },
        )?;
        if rendered.starts_with("#!") {
            Ok(rendered)
        } else {
            Ok(format!("#!/bin/bash\n{rendered}"))
        }
    }
}
