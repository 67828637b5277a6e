// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use anyhow::Result;

use super::{ExecOutput, RemoteSession, exec_capture, sh_escape};
use crate::app::types::SchedulerId;

/// Brief, parsable, header-less accounting listing: `id|state|exit:signal` per line.
pub const ACCOUNTING_QUERY: &str = "sacct -b -P -n";

const SUBMITTED_MARKER: &str = "Submitted batch job ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SbatchSubmission {
    pub exit_code: i32,
    pub output: String,
    pub scheduler_id: Option<SchedulerId>,
}

pub fn sbatch_command(script_path: &str, reservation: Option<&str>, extra_args: &[String]) -> String {
    let mut command = String::from("sbatch");
    if let Some(reservation) = reservation {
        command.push(' ');
        command.push_str(&sh_escape(&format!("--reservation={reservation}")));
    }
    command.push(' ');
    command.push_str(&sh_escape(script_path));
    for arg in extra_args {
        command.push(' ');
        command.push_str(&sh_escape(arg));
    }
    command
}

/// Finds "Submitted batch job N" anywhere in the reply and returns N.
pub fn parse_submitted_job_id(output: &str) -> Option<SchedulerId> {
    let idx = output.find(SUBMITTED_MARKER)?;
    let digits: String = output[idx + SUBMITTED_MARKER.len()..]
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

#[tracing::instrument(name = "ssh", level = "debug", skip(session, extra_args), fields(op = "sbatch"))]
pub async fn sbatch(
    session: &dyn RemoteSession,
    script_path: &str,
    reservation: Option<&str>,
    extra_args: &[String],
) -> Result<SbatchSubmission> {
    let command = sbatch_command(script_path, reservation, extra_args);
    let out = exec_capture(session, &command).await?;
    let output = out.stdout_lossy();
    Ok(SbatchSubmission {
        exit_code: out.exit_code,
        scheduler_id: parse_submitted_job_id(&output),
        output,
    })
}

#[tracing::instrument(name = "ssh", level = "debug", skip(session), fields(op = "sacct"))]
pub async fn accounting_snapshot(session: &dyn RemoteSession) -> Result<ExecOutput> {
    exec_capture(session, ACCOUNTING_QUERY).await
}
