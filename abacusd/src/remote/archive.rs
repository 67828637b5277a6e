// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use anyhow::Result;

use super::{RemoteSession, exec_capture, sh_escape};

/// Exit status bands shared by `zip` and `unzip`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveStatus {
    Success,
    /// 1 or 2: something was skipped or looked odd, the archive is still usable.
    Warning(i32),
    Severe(i32),
}

impl ArchiveStatus {
    pub fn from_exit_code(code: i32) -> Self {
        match code {
            0 => ArchiveStatus::Success,
            1 | 2 => ArchiveStatus::Warning(code),
            other => ArchiveStatus::Severe(other),
        }
    }

    pub fn is_usable(self) -> bool {
        !matches!(self, ArchiveStatus::Severe(_))
    }
}

/// Packs the contents of `source_dir` into `zip_path`, entries relative to `source_dir`.
#[tracing::instrument(name = "ssh", level = "debug", skip(session), fields(op = "zip"))]
pub async fn zip(session: &dyn RemoteSession, source_dir: &str, zip_path: &str) -> Result<ArchiveStatus> {
    let command = format!("cd {} && zip -r {} .", sh_escape(source_dir), sh_escape(zip_path));
    let out = exec_capture(session, &command).await?;
    let status = ArchiveStatus::from_exit_code(out.exit_code);
    if !status.is_usable() {
        tracing::warn!(code = out.exit_code, "zip failed: {}", out.stdout_lossy().trim_end());
    }
    Ok(status)
}

#[tracing::instrument(name = "ssh", level = "debug", skip(session), fields(op = "unzip"))]
pub async fn unzip(session: &dyn RemoteSession, zip_path: &str, dest_dir: &str) -> Result<ArchiveStatus> {
    let command = format!("unzip -o {} -d {}", sh_escape(zip_path), sh_escape(dest_dir));
    let out = exec_capture(session, &command).await?;
    let status = ArchiveStatus::from_exit_code(out.exit_code);
    if !status.is_usable() {
        tracing::warn!(code = out.exit_code, "unzip failed: {}", out.stdout_lossy().trim_end());
    }
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::testing::FakeRemote;

    #[test]
    fn exit_code_bands() {
        assert_eq!(ArchiveStatus::from_exit_code(0), ArchiveStatus::Success);
        assert_eq!(ArchiveStatus::from_exit_code(1), ArchiveStatus::Warning(1));
        assert_eq!(ArchiveStatus::from_exit_code(2), ArchiveStatus::Warning(2));
        assert_eq!(ArchiveStatus::from_exit_code(3), ArchiveStatus::Severe(3));
        assert_eq!(ArchiveStatus::from_exit_code(-1), ArchiveStatus::Severe(-1));
        assert!(ArchiveStatus::Warning(2).is_usable());
        assert!(!ArchiveStatus::Severe(9).is_usable());
    }

    #[tokio::test]
    async fn zip_runs_from_source_dir() {
        let remote = FakeRemote::new();
        remote.respond("cd ", 0, "  adding: out.txt (stored 0%)\n");
        let status = zip(&remote, "/w/files", "/w/out.zip").await.unwrap();
        assert_eq!(status, ArchiveStatus::Success);
        assert_eq!(remote.commands(), vec!["cd '/w/files' && zip -r '/w/out.zip' .".to_string()]);
    }

    #[tokio::test]
    async fn unzip_reports_severe_errors() {
        let remote = FakeRemote::new();
        remote.respond("unzip", 9, "unzip: cannot find zipfile\n");
        let status = unzip(&remote, "/w/in.zip", "/w/files").await.unwrap();
        assert_eq!(status, ArchiveStatus::Severe(9));
        assert_eq!(remote.commands(), vec!["unzip -o '/w/in.zip' -d '/w/files'".to_string()]);
    }
}
