// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use anyhow::Result;

use super::{RemoteSession, exec_capture, sh_escape};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineWindow {
    pub exit_code: i32,
    pub lines: Vec<String>,
}

/// `start` is 1-based, matching `tail -n +K`.
pub fn line_window_command(path: &str, start: u64, count: u64) -> String {
    format!("tail -n +{} {} | head -n {}", start.max(1), sh_escape(path), count)
}

/// Reads at most `count` lines of a remote text file beginning at line `start`.
#[tracing::instrument(name = "ssh", level = "debug", skip(session), fields(op = "read_lines"))]
pub async fn read_lines(
    session: &dyn RemoteSession,
    path: &str,
    start: u64,
    count: u64,
) -> Result<LineWindow> {
    if count == 0 {
        return Ok(LineWindow {
            exit_code: 0,
            lines: Vec::new(),
        });
    }
    let out = exec_capture(session, &line_window_command(path, start, count)).await?;
    let lines = out
        .stdout_lossy()
        .lines()
        .take(count as usize)
        .map(str::to_string)
        .collect();
    Ok(LineWindow {
        exit_code: out.exit_code,
        lines,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::testing::FakeRemote;

    #[test]
    fn builds_pipeline() {
        assert_eq!(
            line_window_command("/w/out.log", 10, 5),
            "tail -n +10 '/w/out.log' | head -n 5"
        );
        assert_eq!(line_window_command("/w/out.log", 0, 1), "tail -n +1 '/w/out.log' | head -n 1");
    }

    #[tokio::test]
    async fn splits_output_into_lines() {
        let remote = FakeRemote::new();
        remote.respond("tail -n +3", 0, "three\nfour\n");
        let window = read_lines(&remote, "/w/out.log", 3, 2).await.unwrap();
        assert_eq!(window.exit_code, 0);
        assert_eq!(window.lines, vec!["three", "four"]);
    }

    #[tokio::test]
    async fn zero_count_skips_the_remote() {
        let remote = FakeRemote::new();
        let window = read_lines(&remote, "/w/out.log", 1, 0).await.unwrap();
        assert!(window.lines.is_empty());
        assert!(remote.commands().is_empty());
    }
}
