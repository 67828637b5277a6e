// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::{Component, Path, PathBuf};

/// Joins `relative_path` onto `remote_base` and normalizes the result without
/// touching any filesystem. An absolute `relative_path` is re-rooted under the base.
pub fn resolve_relative(remote_base: impl AsRef<Path>, relative_path: impl AsRef<Path>) -> PathBuf {
    let base = remote_base.as_ref();
    let rel: PathBuf = relative_path
        .as_ref()
        .components()
        .filter(|c| !matches!(c, Component::RootDir | Component::Prefix(_)))
        .collect();
    normalize_path(base.join(rel))
}

/// Like [`resolve_relative`], but `None` when the result leaves `remote_base`.
pub fn resolve_within(remote_base: impl AsRef<Path>, relative_path: impl AsRef<Path>) -> Option<PathBuf> {
    let base = normalize_path(remote_base.as_ref());
    let resolved = resolve_relative(&base, relative_path);
    resolved.starts_with(&base).then_some(resolved)
}

/// Normalize a path syntactically
/// - remove `.`
/// - resolve `..` where possible
/// - keep the root if present
pub fn normalize_path(p: impl AsRef<Path>) -> PathBuf {
    let mut out = PathBuf::new();
    let mut comps = p.as_ref().components().peekable();
    while let Some(c) = comps.peek() {
        match c {
            Component::Prefix(prefix) => {
                out.push(Path::new(prefix.as_os_str()));
                comps.next();
            }
            Component::RootDir => {
                out.push(Path::new(std::path::MAIN_SEPARATOR_STR));
                comps.next();
            }
            _ => break,
        }
    }

    for comp in comps {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                // Only a named segment can be popped; otherwise keep the `..` visible.
                if matches!(out.components().next_back(), Some(Component::Normal(_))) {
                    out.pop();
                } else {
                    out.push("..");
                }
            }
            Component::Normal(seg) => out.push(seg),
            Component::Prefix(_) | Component::RootDir => {}
        }
    }

    out
}

/// Remote paths are always POSIX; keep a trailing slash for directories.
pub fn dir_string(path: impl AsRef<Path>) -> String {
    let mut s = path.as_ref().to_string_lossy().into_owned();
    if !s.ends_with('/') {
        s.push('/');
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};

    fn pb(s: &str) -> PathBuf {
        PathBuf::from(s)
    }

    #[test]
    fn joins_with_dot_slash() {
        let base = pb("/scratch/abacus/projects");
        let got = resolve_relative(&base, "./foo/bar.txt");
        assert_eq!(got, base.join("foo/bar.txt"));
    }

    #[test]
    fn normalizes_dot_and_dotdot() {
        let got = resolve_relative("/w", "sub/./module/../file.txt");
        assert_eq!(got, pb("/w/sub/file.txt"));
    }

    #[test]
    fn handles_trailing_slash_on_base() {
        let got = resolve_relative("/srv/data/projects/", "x/y/../z");
        assert_eq!(got, pb("/srv/data/projects/x/z"));
    }

    #[test]
    fn absolute_relative_is_rerooted_under_base() {
        let got = resolve_relative(Path::new("/srv/data"), "/logs/app.log");
        assert_eq!(got, Path::new("/srv/data/logs/app.log"));
    }

    #[test]
    fn preserves_root_when_normalizing() {
        assert_eq!(normalize_path("/a/./b/../c"), Path::new("/a/c"));
    }

    #[test]
    fn parent_past_root_keeps_dotdot() {
        assert_eq!(normalize_path("/.."), Path::new("/.."));
    }

    #[test]
    fn relative_parents_accumulate() {
        assert_eq!(normalize_path("../../a"), Path::new("../../a"));
    }

    #[test]
    fn resolve_within_rejects_escapes() {
        let base = "/scratch/abacus/projects/j1/files/";
        assert_eq!(
            resolve_within(base, "inputs/a.txt"),
            Some(pb("/scratch/abacus/projects/j1/files/inputs/a.txt"))
        );
        assert_eq!(resolve_within(base, "../job.sh"), None);
        assert_eq!(resolve_within(base, "a/../../../../etc/passwd"), None);
        assert_eq!(
            resolve_within(base, "a/../b.txt"),
            Some(pb("/scratch/abacus/projects/j1/files/b.txt"))
        );
    }

    #[test]
    fn sibling_with_common_prefix_is_not_inside() {
        assert_eq!(resolve_within("/w/files", "../files2/x"), None);
    }

    #[test]
    fn dir_string_appends_slash_once() {
        assert_eq!(dir_string("/a/b"), "/a/b/");
        assert_eq!(dir_string("/a/b/"), "/a/b/");
    }
}
