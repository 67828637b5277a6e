// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use anyhow::{Context, Result};
use async_trait::async_trait;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{FileAttributes, StatusCode};

use crate::remote::{RemoteFileStat, SftpChannel};

pub struct RusshSftp {
    sftp: SftpSession,
}

impl RusshSftp {
    pub fn new(sftp: SftpSession) -> Self {
        Self { sftp }
    }
}

fn is_missing(err: &russh_sftp::client::error::Error) -> bool {
    matches!(
        err,
        russh_sftp::client::error::Error::Status(status)
            if status.status_code == StatusCode::NoSuchFile
    )
}

fn child_path(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

fn to_stat(path: String, attrs: &FileAttributes) -> RemoteFileStat {
    RemoteFileStat {
        path,
        size: attrs.size.unwrap_or(0),
        is_dir: attrs.is_dir(),
        permissions: attrs.permissions,
        modified_at: attrs.mtime,
    }
}

#[async_trait]
impl SftpChannel for RusshSftp {
    async fn stat(&self, path: &str) -> Result<Option<RemoteFileStat>> {
        match self.sftp.metadata(path).await {
            Ok(attrs) => Ok(Some(to_stat(path.to_string(), &attrs))),
            Err(err) if is_missing(&err) => Ok(None),
            Err(err) => Err(err).with_context(|| format!("sftp stat {path}")),
        }
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteFileStat>> {
        let entries = self
            .sftp
            .read_dir(path)
            .await
            .with_context(|| format!("sftp read_dir {path}"))?;
        Ok(entries
            .filter(|entry| !matches!(entry.file_name().as_str(), "." | ".."))
            .map(|entry| to_stat(child_path(path, &entry.file_name()), &entry.metadata()))
            .collect())
    }
}
