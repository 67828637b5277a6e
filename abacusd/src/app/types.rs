// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::app::errors::{AppError, AppErrorKind};

/// Job identifier assigned by the remote batch scheduler.
pub type SchedulerId = u64;

/// Our own opaque job identifier, stable across the whole job lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Random v4 UUID.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Complete,
    Failure,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Failure)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Complete => "COMPLETE",
            JobStatus::Failure => "FAILURE",
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseJobStatusError(pub String);

impl fmt::Display for ParseJobStatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown job status '{}'", self.0)
    }
}

impl std::error::Error for ParseJobStatusError {}

impl FromStr for JobStatus {
    type Err = ParseJobStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "RUNNING" => Ok(JobStatus::Running),
            "COMPLETE" => Ok(JobStatus::Complete),
            "FAILURE" => Ok(JobStatus::Failure),
            other => Err(ParseJobStatusError(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusWithId {
    pub job_id: JobId,
    pub status: JobStatus,
}

/// Lifecycle event classified from one line of scheduler accounting output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "schedulerId", rename_all = "snake_case")]
pub enum SchedulerEvent {
    Running(SchedulerId),
    Timeout(SchedulerId),
    Ended(SchedulerId),
    Failed(SchedulerId),
}

impl SchedulerEvent {
    /// The scheduler stops reporting on a job after any of these.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SchedulerEvent::Running(_))
    }

    pub fn scheduler_id(&self) -> SchedulerId {
        match *self {
            SchedulerEvent::Running(id)
            | SchedulerEvent::Timeout(id)
            | SchedulerEvent::Ended(id)
            | SchedulerEvent::Failed(id) => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NameAndVersion {
    pub name: String,
    pub version: String,
}

impl fmt::Display for NameAndVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApplicationParameter {
    InputFile {
        name: String,
        #[serde(default)]
        optional: bool,
    },
    Value {
        name: String,
        #[serde(default)]
        optional: bool,
    },
}

impl ApplicationParameter {
    pub fn name(&self) -> &str {
        match self {
            ApplicationParameter::InputFile { name, .. } | ApplicationParameter::Value { name, .. } => {
                name
            }
        }
    }
}

/// Declares how a runnable application is invoked. Owned by the external application registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationDescriptor {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub parameters: Vec<ApplicationParameter>,
    pub script_template: String,
    /// Globs relative to the working directory; matches are shipped back to
    /// the object store once the job ends.
    #[serde(default)]
    pub outputs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStartRequest {
    /// Requests that arrive without an id get a fresh one.
    #[serde(default = "JobId::generate")]
    pub job_id: JobId,
    pub owner: String,
    pub application: NameAndVersion,
    #[serde(default)]
    pub parameters: BTreeMap<String, JsonValue>,
    #[serde(default)]
    pub reservation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub path: String,
    pub size_in_bytes: u64,
}

/// One input file on its way from the object store to the job's working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingFile {
    pub parameter: String,
    pub source_location: String,
    pub destination_path: String,
    pub destination_file_name: String,
    pub size_in_bytes: u64,
    pub permissions: String,
    /// Unpack the uploaded archive next to itself.
    pub extract: bool,
}

/// A submitted job whose scheduler events are still of interest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedJob {
    pub scheduler_id: SchedulerId,
    pub job_id: JobId,
    pub owner: String,
    pub application: NameAndVersion,
    pub job_dir: String,
    pub work_dir: String,
}

/// Remote directories of one job. `work_dir` always lives inside `job_dir`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobLayout {
    pub job_dir: String,
    pub work_dir: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: AppErrorKind,
    pub code: String,
    pub message: String,
}

impl From<&AppError> for JobFailure {
    fn from(err: &AppError) -> Self {
        Self {
            kind: err.kind(),
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    StartRequested {
        request: JobStartRequest,
        authenticated: bool,
    },
    CancelRequested {
        job_id: JobId,
        owner: String,
    },
    Pending {
        scheduler_id: SchedulerId,
        job_dir: String,
        work_dir: String,
        request: JobStartRequest,
    },
    UnsuccessfullyCompleted {
        job_id: JobId,
        owner: String,
        failure: JobFailure,
    },
    Scheduler(SchedulerEvent),
}

impl JobEvent {
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            JobEvent::StartRequested { request, .. } | JobEvent::Pending { request, .. } => {
                Some(&request.job_id)
            }
            JobEvent::CancelRequested { job_id, .. }
            | JobEvent::UnsuccessfullyCompleted { job_id, .. } => Some(job_id),
            JobEvent::Scheduler(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_round_trips_through_str() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Complete,
            JobStatus::Failure,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("DONE".parse::<JobStatus>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Complete.is_terminal());
        assert!(JobStatus::Failure.is_terminal());
    }

    #[test]
    fn descriptor_parses_tagged_parameters() {
        let raw = r#"{
            "name": "blast",
            "version": "2.1",
            "parameters": [
                {"type": "input_file", "name": "query"},
                {"type": "value", "name": "threads", "optional": true}
            ],
            "script_template": "echo hi"
        }"#;
        let descriptor: ApplicationDescriptor = serde_json::from_str(raw).unwrap();
        assert_eq!(descriptor.parameters.len(), 2);
        assert_eq!(
            descriptor.parameters[0],
            ApplicationParameter::InputFile {
                name: "query".into(),
                optional: false
            }
        );
        assert_eq!(descriptor.parameters[1].name(), "threads");
        assert!(descriptor.outputs.is_empty());
    }

    #[test]
    fn descriptor_reads_output_globs() {
        let raw = r#"{"name": "a", "version": "1", "script_template": "", "outputs": ["*.out", "results/"]}"#;
        let descriptor: ApplicationDescriptor = serde_json::from_str(raw).unwrap();
        assert_eq!(descriptor.outputs, vec!["*.out", "results/"]);
    }

    #[test]
    fn only_running_keeps_a_job_alive() {
        assert!(!SchedulerEvent::Running(1).is_terminal());
        assert!(SchedulerEvent::Ended(1).is_terminal());
        assert!(SchedulerEvent::Failed(1).is_terminal());
        assert!(SchedulerEvent::Timeout(1).is_terminal());
    }

    #[test]
    fn scheduler_event_exposes_id() {
        assert_eq!(SchedulerEvent::Timeout(9).scheduler_id(), 9);
        assert_eq!(SchedulerEvent::Ended(124).scheduler_id(), 124);
    }
}
