// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tokio::sync::mpsc;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::{
    ApplicationCatalogPort, EventPublisherPort, ObjectStorePort, ScriptGeneratorPort,
};
use crate::app::services::{map_pool_error, map_remote_error};
use crate::app::types::{
    ApplicationDescriptor, ApplicationParameter, JobEvent, JobFailure, JobId, JobLayout,
    JobStartRequest, StagingFile,
};
use crate::remote::archive::{self, ArchiveStatus};
use crate::remote::scp::{ScpError, scp_upload};
use crate::remote::slurm::sbatch;
use crate::remote::{ConnectionPool, RemoteSession, files};
use crate::util::remote_path::{dir_string, resolve_within};

pub const JOB_SCRIPT_NAME: &str = "job.sh";
const STAGED_FILE_PERMISSIONS: &str = "0600";

#[derive(Debug, Clone)]
pub struct SubmissionSettings {
    /// Cluster-side root; jobs live under `<home_directory>/projects/<job id>/`.
    pub home_directory: String,
    pub default_reservation: Option<String>,
}

pub fn job_layout(home_directory: &str, job_id: &JobId) -> JobLayout {
    let job_dir = format!(
        "{}/projects/{}/",
        home_directory.trim_end_matches('/'),
        job_id
    );
    let work_dir = format!("{job_dir}files/");
    JobLayout { job_dir, work_dir }
}

fn validate_job_id(job_id: &JobId) -> AppResult<()> {
    let id = job_id.as_str();
    if id.is_empty() || id == "." || id == ".." || id.contains('/') || id.contains('\0') {
        return Err(AppError::invalid_argument(format!(
            "job id '{id}' cannot be used as a directory name"
        )));
    }
    Ok(())
}

struct InputFileSpec {
    source: String,
    destination: String,
    extract: bool,
}

/// Source, relative destination and extract flag of one input-file parameter.
fn input_file_spec(name: &str, value: &JsonValue) -> AppResult<InputFileSpec> {
    let (source, destination, extract) = match value {
        JsonValue::String(source) => (source.clone(), None, false),
        JsonValue::Object(fields) => {
            let source = fields
                .get("source")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| {
                    AppError::invalid_argument(format!("input '{name}' is missing its source"))
                })?
                .to_string();
            let destination = match fields.get("destination") {
                None | Some(JsonValue::Null) => None,
                Some(JsonValue::String(dest)) => Some(dest.clone()),
                Some(_) => {
                    return Err(AppError::invalid_argument(format!(
                        "destination of input '{name}' must be a string"
                    )));
                }
            };
            let extract = match fields.get("extract") {
                None | Some(JsonValue::Null) => false,
                Some(JsonValue::Bool(flag)) => *flag,
                Some(_) => {
                    return Err(AppError::invalid_argument(format!(
                        "extract flag of input '{name}' must be a boolean"
                    )));
                }
            };
            (source, destination, extract)
        }
        _ => {
            return Err(AppError::invalid_argument(format!(
                "input '{name}' must be a path or an object with a source"
            )));
        }
    };
    if source.trim().is_empty() {
        return Err(AppError::invalid_argument(format!(
            "input '{name}' has an empty source"
        )));
    }
    let destination = match destination {
        Some(dest) => dest,
        None => Path::new(&source)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                AppError::invalid_argument(format!(
                    "cannot derive a file name for input '{name}' from '{source}'"
                ))
            })?,
    };
    Ok(InputFileSpec {
        source,
        destination,
        extract,
    })
}

/// Stages a job on the cluster and hands it to the batch scheduler.
///
/// Each request runs validate, stage directory, generate script, stage inputs,
/// stage script and submit in order over a single pooled session. Any failure
/// ends the request; nothing is retried or resumed.
pub struct JobSubmissionOrchestrator {
    pool: Arc<ConnectionPool>,
    catalog: Arc<dyn ApplicationCatalogPort>,
    storage: Arc<dyn ObjectStorePort>,
    scripts: Arc<dyn ScriptGeneratorPort>,
    publisher: Arc<dyn EventPublisherPort>,
    settings: SubmissionSettings,
}

impl JobSubmissionOrchestrator {
    pub fn new(
        pool: Arc<ConnectionPool>,
        catalog: Arc<dyn ApplicationCatalogPort>,
        storage: Arc<dyn ObjectStorePort>,
        scripts: Arc<dyn ScriptGeneratorPort>,
        publisher: Arc<dyn EventPublisherPort>,
        settings: SubmissionSettings,
    ) -> Self {
        Self {
            pool,
            catalog,
            storage,
            scripts,
            publisher,
            settings,
        }
    }

    /// Runs the whole flow and returns the event that describes its outcome.
    pub async fn start(&self, request: &JobStartRequest) -> JobEvent {
        match self.submit(request).await {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(
                    job_id = %request.job_id,
                    owner = %request.owner,
                    code = err.code(),
                    "job submission failed: {err}"
                );
                JobEvent::UnsuccessfullyCompleted {
                    job_id: request.job_id.clone(),
                    owner: request.owner.clone(),
                    failure: JobFailure::from(&err),
                }
            }
        }
    }

    /// Cancellation is accepted but never carried out.
    pub fn cancel(&self, job_id: &JobId, owner: &str) -> JobEvent {
        tracing::info!(%job_id, owner, "rejecting cancel request");
        let err = AppError::internal(codes::NOT_SUPPORTED, "cancellation is not supported");
        JobEvent::UnsuccessfullyCompleted {
            job_id: job_id.clone(),
            owner: owner.to_string(),
            failure: JobFailure::from(&err),
        }
    }

    #[tracing::instrument(
        name = "job_submit",
        skip(self, request),
        fields(job_id = %request.job_id, application = %request.application)
    )]
    pub async fn submit(&self, request: &JobStartRequest) -> AppResult<JobEvent> {
        validate_job_id(&request.job_id)?;
        let descriptor = self
            .catalog
            .find(&request.application)
            .await?
            .ok_or_else(|| {
                AppError::not_found(format!("application not found: {}", request.application))
            })?;
        let layout = job_layout(&self.settings.home_directory, &request.job_id);
        let staging = self.plan_inputs(&descriptor, request, &layout).await?;

        let lease = self.pool.lease().await.map_err(map_pool_error)?;
        let session = lease.session();

        self.stage_directory(session, &layout, &staging).await?;

        let inputs: BTreeMap<String, String> = staging
            .iter()
            .map(|file| (file.parameter.clone(), file.destination_path.clone()))
            .collect();
        let script = self
            .scripts
            .generate(&descriptor, request, &layout, &inputs)?;

        for file in &staging {
            self.stage_input(session, file).await?;
        }

        let script_path = format!("{}{JOB_SCRIPT_NAME}", layout.job_dir);
        let mut script_bytes = script.as_bytes();
        let code = scp_upload(
            session,
            script_bytes.len() as u64,
            JOB_SCRIPT_NAME,
            &script_path,
            STAGED_FILE_PERMISSIONS,
            &mut script_bytes,
        )
        .await
        .map_err(|err| map_remote_error("job script upload", err))?;
        if code != 0 {
            return Err(map_remote_error(
                "job script upload",
                format!("scp returned status {code}"),
            ));
        }

        let reservation = request
            .reservation
            .as_deref()
            .or(self.settings.default_reservation.as_deref());
        let submission = sbatch(session, &script_path, reservation, &[])
            .await
            .map_err(|err| map_remote_error("sbatch", format!("{err:#}")))?;
        drop(lease);

        // A crash between here and publishing the event leaves a submitted job
        // with no record of it; a retried request would submit it again.
        let Some(scheduler_id) = submission.scheduler_id else {
            tracing::error!(
                exit_code = submission.exit_code,
                script = %script,
                output = %submission.output,
                "unable to parse a scheduler id from sbatch output"
            );
            return Err(AppError::internal(
                codes::SUBMISSION_FAILED,
                "Unable to schedule slurm job",
            ));
        };
        tracing::info!(scheduler_id, "job submitted");

        Ok(JobEvent::Pending {
            scheduler_id,
            job_dir: layout.job_dir,
            work_dir: layout.work_dir,
            request: request.clone(),
        })
    }

    /// Resolves every input against the object store and the working directory.
    /// Runs before anything touches the cluster.
    async fn plan_inputs(
        &self,
        descriptor: &ApplicationDescriptor,
        request: &JobStartRequest,
        layout: &JobLayout,
    ) -> AppResult<Vec<StagingFile>> {
        let mut staging = Vec::new();
        for parameter in &descriptor.parameters {
            let value = request
                .parameters
                .get(parameter.name())
                .filter(|v| !v.is_null());
            let (name, optional, is_file) = match parameter {
                ApplicationParameter::InputFile { name, optional } => (name, *optional, true),
                ApplicationParameter::Value { name, optional } => (name, *optional, false),
            };
            let Some(value) = value else {
                if optional {
                    continue;
                }
                return Err(AppError::invalid_argument(format!(
                    "missing required parameter '{name}'"
                )));
            };
            if !is_file {
                continue;
            }

            let InputFileSpec {
                source,
                destination,
                extract,
            } = input_file_spec(name, value)?;
            let meta = self.storage.stat(&source).await?.ok_or_else(|| {
                AppError::not_found(format!("missing file in storage: {source}"))
            })?;
            if Path::new(&destination).has_root() {
                return Err(AppError::invalid_argument(format!(
                    "destination '{destination}' of input '{name}' must be relative to the job's working directory"
                )));
            }
            let resolved = resolve_within(&layout.work_dir, &destination).ok_or_else(|| {
                AppError::invalid_argument(format!(
                    "destination '{destination}' of input '{name}' leaves the job's working directory; avoid '..' in paths"
                ))
            })?;
            let destination_file_name = resolved
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| {
                    AppError::invalid_argument(format!(
                        "destination '{destination}' of input '{name}' is not a file path"
                    ))
                })?;
            staging.push(StagingFile {
                parameter: name.clone(),
                source_location: source,
                destination_path: resolved.to_string_lossy().into_owned(),
                destination_file_name,
                size_in_bytes: meta.size_in_bytes,
                permissions: STAGED_FILE_PERMISSIONS.to_string(),
                extract,
            });
        }
        Ok(staging)
    }

    async fn stage_directory(
        &self,
        session: &dyn RemoteSession,
        layout: &JobLayout,
        staging: &[StagingFile],
    ) -> AppResult<()> {
        let mut dirs = vec![layout.work_dir.clone()];
        for file in staging {
            if let Some(parent) = Path::new(&file.destination_path).parent() {
                let parent = dir_string(parent);
                if !dirs.contains(&parent) {
                    dirs.push(parent);
                }
            }
        }
        for dir in dirs {
            let code = files::mkdir(session, &dir, true)
                .await
                .map_err(|err| map_remote_error("mkdir", format!("{err:#}")))?;
            // -1 means no exit status came back, which some servers do for mkdir -p.
            if code != 0 && code != -1 {
                return Err(AppError::internal(
                    codes::INTERNAL_ERROR,
                    format!("unable to create directory {dir} (exit status {code})"),
                ));
            }
        }
        Ok(())
    }

    async fn stage_input(&self, session: &dyn RemoteSession, file: &StagingFile) -> AppResult<()> {
        let mut reader = self
            .storage
            .read(&file.source_location)
            .await
            .map_err(|err| {
                AppError::permission_denied(format!(
                    "cannot read {} from storage: {}",
                    file.source_location,
                    err.message()
                ))
            })?;
        let code = scp_upload(
            session,
            file.size_in_bytes,
            &file.destination_file_name,
            &file.destination_path,
            &file.permissions,
            &mut reader,
        )
        .await
        .map_err(|err| match err {
            ScpError::Source(io) => AppError::permission_denied(format!(
                "cannot read {} from storage: {io}",
                file.source_location
            )),
            other => map_remote_error("upload", other),
        })?;
        if code != 0 {
            return Err(AppError::with_message(
                AppErrorKind::Internal,
                codes::REMOTE_ERROR,
                format!(
                    "upload of {} to {} failed with status {code}",
                    file.source_location, file.destination_path
                ),
            ));
        }
        tracing::debug!(
            source = %file.source_location,
            destination = %file.destination_path,
            size = file.size_in_bytes,
            "staged input file"
        );
        if file.extract {
            self.extract_input(session, file).await?;
        }
        Ok(())
    }

    /// Unpacks a staged archive into the directory it was uploaded to.
    async fn extract_input(&self, session: &dyn RemoteSession, file: &StagingFile) -> AppResult<()> {
        let target = Path::new(&file.destination_path)
            .parent()
            .map(dir_string)
            .ok_or_else(|| {
                AppError::invalid_argument(format!("{} has no parent directory", file.destination_path))
            })?;
        let status = archive::unzip(session, &file.destination_path, &target)
            .await
            .map_err(|err| map_remote_error("unzip", format!("{err:#}")))?;
        if !status.is_usable() {
            return Err(AppError::internal(
                codes::REMOTE_ERROR,
                format!("unable to extract {}: {status:?}", file.destination_path),
            ));
        }
        if let ArchiveStatus::Warning(code) = status {
            tracing::warn!(archive = %file.destination_path, code, "archive extracted with warnings");
        }
        Ok(())
    }

    async fn dispatch(self: Arc<Self>, event: JobEvent) {
        let outcome = match event {
            JobEvent::StartRequested {
                request,
                authenticated: true,
            } => self.start(&request).await,
            JobEvent::StartRequested {
                request,
                authenticated: false,
            } => {
                tracing::debug!(job_id = %request.job_id, "ignoring unauthenticated start request");
                return;
            }
            JobEvent::CancelRequested { job_id, owner } => self.cancel(&job_id, &owner),
            _ => return,
        };
        if let Err(err) = self.publisher.publish(outcome).await {
            tracing::error!(code = err.code(), "failed to publish submission outcome: {err}");
        }
    }

    /// Worker loop: every request gets its own task, the pool bounds how many
    /// talk to the cluster at once.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<JobEvent>) {
        let mut tasks = tokio::task::JoinSet::new();
        while let Some(event) = events.recv().await {
            if matches!(
                event,
                JobEvent::StartRequested { .. } | JobEvent::CancelRequested { .. }
            ) {
                tasks.spawn(self.clone().dispatch(event));
            }
            while let Some(done) = tasks.try_join_next() {
                if let Err(err) = done {
                    tracing::error!("submission task failed: {err}");
                }
            }
        }
        while let Some(done) = tasks.join_next().await {
            if let Err(err) = done {
                tracing::error!("submission task failed: {err}");
            }
        }
        tracing::info!("submission worker stopping");
    }
}
