// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Remote capability traits plus the protocol adapters built on top of them.
//!
//! Nothing in here knows which SSH client library is in use. The pool and the
//! adapters only talk to [`RemoteSession`], [`ExecChannel`] and [`SftpChannel`].

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

pub mod archive;
pub mod files;
pub mod lines;
pub mod pool;
pub mod scp;
pub mod slurm;
mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use pool::{ConnectionPool, PoolError, PooledSession};
pub use utils::sh_escape;

/// A running remote command with a bidirectional byte stream.
#[async_trait]
pub trait ExecChannel: Send {
    async fn write_all(&mut self, data: &[u8]) -> Result<()>;

    /// Reads stdout bytes into `buf`. Returns 0 once the remote side signalled EOF.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Closes our side and waits for the command to exit.
    /// Returns -1 when the server never reported an exit status.
    async fn finish(self: Box<Self>) -> Result<i32>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFileStat {
    pub path: String,
    pub size: u64,
    pub is_dir: bool,
    pub permissions: Option<u32>,
    pub modified_at: Option<u32>,
}

#[async_trait]
pub trait SftpChannel: Send + Sync {
    /// `None` when the path does not exist.
    async fn stat(&self, path: &str) -> Result<Option<RemoteFileStat>>;

    /// Entries of `path` with absolute paths, without `.` and `..`.
    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteFileStat>>;
}

/// One authenticated connection to the login node.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    async fn exec(&self, command: &str) -> Result<Box<dyn ExecChannel>>;
    async fn open_sftp(&self) -> Result<Box<dyn SftpChannel>>;
    fn is_alive(&self) -> bool;
}

/// Opens fresh sessions for the pool.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn RemoteSession>>;
}

#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Runs `command` to completion, collecting stdout.
pub async fn exec_capture(session: &dyn RemoteSession, command: &str) -> Result<ExecOutput> {
    log::debug!("executing '{}'", command);
    let mut channel = session.exec(command).await?;
    let mut stdout = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = channel.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        stdout.extend_from_slice(&buf[..n]);
    }
    let exit_code = channel.finish().await?;
    Ok(ExecOutput { stdout, exit_code })
}
