// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::ApplicationCatalogPort;
use crate::app::types::{ApplicationDescriptor, NameAndVersion};

/// Reads descriptors from `<dir>/<name>/<version>.json`.
#[derive(Debug, Clone)]
pub struct FileApplicationCatalog {
    dir: PathBuf,
}

fn is_plain_segment(value: &str) -> bool {
    let mut components = Path::new(value).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !value.contains('/')
}

impl FileApplicationCatalog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn descriptor_path(&self, application: &NameAndVersion) -> AppResult<PathBuf> {
        if !is_plain_segment(&application.name) || !is_plain_segment(&application.version) {
            return Err(AppError::invalid_argument(format!(
                "invalid application reference: {application}"
            )));
        }
        Ok(self
            .dir
            .join(&application.name)
            .join(format!("{}.json", application.version)))
    }
}

#[async_trait]
impl ApplicationCatalogPort for FileApplicationCatalog {
    #[tracing::instrument(name = "fs", level = "debug", skip(self), fields(op = "find_application", application = %application))]
    async fn find(&self, application: &NameAndVersion) -> AppResult<Option<ApplicationDescriptor>> {
        let path = self.descriptor_path(application)?;
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(AppError::with_message(
                    AppErrorKind::Internal,
                    codes::LOCAL_ERROR,
                    format!("failed to read {}: {err}", path.display()),
                ));
            }
        };
        let descriptor: ApplicationDescriptor = serde_json::from_str(&text).map_err(|err| {
            AppError::internal(
                codes::LOCAL_ERROR,
                format!("invalid application descriptor {}: {err}", path.display()),
            )
        })?;
        if descriptor.name != application.name || descriptor.version != application.version {
            return Err(AppError::internal(
                codes::LOCAL_ERROR,
                format!(
                    "{} describes {}@{}, expected {application}",
                    path.display(),
                    descriptor.name,
                    descriptor.version
                ),
            ));
        }
        Ok(Some(descriptor))
    }
}
