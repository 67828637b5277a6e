// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::VecDeque;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use globset::GlobBuilder;

use super::{RemoteFileStat, RemoteSession, exec_capture, sh_escape};
use crate::util::remote_path::{normalize_path, resolve_relative};

fn has_glob_meta(segment: &str) -> bool {
    segment.contains(['*', '?', '[', '{'])
}

#[tracing::instrument(name = "ssh", level = "debug", skip(session), fields(op = "ls"))]
pub async fn ls(session: &dyn RemoteSession, path: &str) -> Result<Vec<RemoteFileStat>> {
    let sftp = session.open_sftp().await?;
    let mut entries = sftp
        .read_dir(path)
        .await
        .with_context(|| format!("listing {path}"))?;
    entries.retain(|e| !(e.path.ends_with("/.") || e.path.ends_with("/..")));
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}

/// `None` when nothing exists at `path`.
#[tracing::instrument(name = "ssh", level = "debug", skip(session), fields(op = "stat"))]
pub async fn stat(session: &dyn RemoteSession, path: &str) -> Result<Option<RemoteFileStat>> {
    let sftp = session.open_sftp().await?;
    sftp.stat(path).await.with_context(|| format!("stat {path}"))
}

/// Returns the exit status of `mkdir`.
#[tracing::instrument(name = "ssh", level = "debug", skip(session), fields(op = "mkdir"))]
pub async fn mkdir(session: &dyn RemoteSession, path: &str, parents: bool) -> Result<i32> {
    let flag = if parents { "-p " } else { "" };
    let out = exec_capture(session, &format!("mkdir {flag}{}", sh_escape(path))).await?;
    Ok(out.exit_code)
}

/// Returns the exit status of `rm`.
#[tracing::instrument(name = "ssh", level = "debug", skip(session), fields(op = "rm"))]
pub async fn rm(session: &dyn RemoteSession, path: &str, recurse: bool, force: bool) -> Result<i32> {
    let mut command = String::from("rm ");
    if recurse {
        command.push_str("-r ");
    }
    if force {
        command.push_str("-f ");
    }
    command.push_str(&sh_escape(path));
    let out = exec_capture(session, &command).await?;
    Ok(out.exit_code)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobMatch {
    pub path: String,
    pub size: u64,
    pub is_dir: bool,
}

impl From<RemoteFileStat> for GlobMatch {
    fn from(stat: RemoteFileStat) -> Self {
        Self {
            path: stat.path,
            size: stat.size,
            is_dir: stat.is_dir,
        }
    }
}

/// Lists everything under `base` matching the relative `glob`.
///
/// `*` and `?` never cross a `/`; use `**` for recursive matches. Anything that
/// resolves outside `base` is dropped, so `../` tricks yield an empty listing.
#[tracing::instrument(name = "ssh", level = "debug", skip(session), fields(op = "ls_with_glob"))]
pub async fn ls_with_glob(session: &dyn RemoteSession, base: &str, glob: &str) -> Result<Vec<GlobMatch>> {
    let base = normalize_path(base);
    let target = resolve_relative(&base, glob);
    if !target.starts_with(&base) {
        tracing::warn!(base = %base.display(), glob, "glob escapes its base directory");
        return Ok(Vec::new());
    }

    let mut root = PathBuf::new();
    let mut pattern_parts: Vec<String> = Vec::new();
    for comp in target.components() {
        let text = comp.as_os_str().to_string_lossy();
        if pattern_parts.is_empty() && !has_glob_meta(&text) {
            root.push(comp.as_os_str());
        } else if let Component::Normal(_) = comp {
            pattern_parts.push(text.into_owned());
        }
    }

    let sftp = session.open_sftp().await?;
    if pattern_parts.is_empty() {
        let found = sftp
            .stat(&target.to_string_lossy())
            .await
            .with_context(|| format!("stat {}", target.display()))?;
        return Ok(found.map(GlobMatch::from).into_iter().collect());
    }

    let pattern = pattern_parts.join("/");
    let matcher = GlobBuilder::new(&pattern)
        .literal_separator(true)
        .build()
        .with_context(|| format!("invalid glob pattern '{glob}'"))?
        .compile_matcher();
    let max_depth = if pattern.contains("**") {
        usize::MAX
    } else {
        pattern_parts.len()
    };

    let mut matches = Vec::new();
    let mut queue = VecDeque::from([(root.clone(), 0usize)]);
    while let Some((dir, depth)) = queue.pop_front() {
        let entries = match sftp.read_dir(&dir.to_string_lossy()).await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::debug!(dir = %dir.display(), "skipping unreadable directory: {err:#}");
                continue;
            }
        };
        for entry in entries {
            let path = PathBuf::from(&entry.path);
            let Ok(relative) = path.strip_prefix(&root) else {
                continue;
            };
            if matches!(
                relative.file_name().and_then(|n| n.to_str()),
                Some(".") | Some("..")
            ) {
                continue;
            }
            if matcher.is_match(relative) && path.starts_with(&base) {
                if entry.is_dir && depth + 1 < max_depth {
                    queue.push_back((path.clone(), depth + 1));
                }
                matches.push(GlobMatch::from(entry));
                continue;
            }
            if entry.is_dir && depth + 1 < max_depth {
                queue.push_back((path, depth + 1));
            }
        }
    }
    matches.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(matches)
}

/// `true` when `path` is `base` itself or lies beneath it.
pub fn is_within(base: &str, path: &str) -> bool {
    Path::new(path).starts_with(normalize_path(base))
}
