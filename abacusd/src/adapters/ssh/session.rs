// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::anyhow;
use async_trait::async_trait;
use russh::client::Handle;

use super::ConnectionError;
use crate::remote::{ExecChannel, RemoteSession, SftpChannel};

mod auth;
mod exec;
mod sftp;

pub(super) use auth::authenticate;
pub use exec::RusshExecChannel;
pub use sftp::RusshSftp;

/// russh client handler that only accepts hosts already in known_hosts.
#[derive(Clone, Debug)]
pub(super) struct ClientHandler {
    host: String,
    addr: SocketAddr,
    known_hosts: PathBuf,
}

impl ClientHandler {
    pub(super) fn new(host: String, addr: SocketAddr, known_hosts: PathBuf) -> Self {
        Self {
            host,
            addr,
            known_hosts,
        }
    }
}

impl russh::client::Handler for ClientHandler {
    type Error = anyhow::Error;
    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        verify_server_key(&self.host, self.addr, server_public_key, &self.known_hosts)
    }
}

/// Looks the key up under the host name, then under the resolved IP.
/// Unknown keys are refused, never learned.
pub(super) fn verify_server_key(
    host: &str,
    addr: SocketAddr,
    key: &russh::keys::ssh_key::PublicKey,
    known_hosts: &Path,
) -> std::result::Result<bool, anyhow::Error> {
    let port = addr.port();
    let ip_host = addr.ip().to_string();
    let mut candidates = vec![host.to_string()];
    if ip_host != host {
        candidates.push(ip_host);
    }
    for candidate in &candidates {
        match russh::keys::check_known_hosts_path(candidate, port, key, known_hosts) {
            Ok(true) => return Ok(true),
            Ok(false) => {}
            Err(err) => {
                log::warn!("server key validation failed for {candidate}:{port}: {err}");
                return Err(anyhow!(
                    "server key validation failed for {candidate}:{port}: {err}"
                ));
            }
        }
    }
    log::warn!(
        "server key for {host}:{port} is not present in {} (tried {})",
        known_hosts.display(),
        candidates.join(", ")
    );
    Err(ConnectionError::UnknownHostKey {
        host: host.to_string(),
        port,
    }
    .into())
}

/// One authenticated russh connection.
pub struct RusshSession {
    handle: Handle<ClientHandler>,
    label: String,
}

impl RusshSession {
    pub(super) fn new(handle: Handle<ClientHandler>, label: String) -> Self {
        Self { handle, label }
    }
}

#[async_trait]
impl RemoteSession for RusshSession {
    async fn exec(&self, command: &str) -> anyhow::Result<Box<dyn ExecChannel>> {
        let channel = self.handle.channel_open_session().await?;
        log::debug!("[{}] executing '{}'", self.label, command);
        channel.exec(true, command).await?;
        Ok(Box::new(RusshExecChannel::new(channel)))
    }

    async fn open_sftp(&self) -> anyhow::Result<Box<dyn SftpChannel>> {
        let channel = self.handle.channel_open_session().await?;
        channel.request_subsystem(true, "sftp").await?;
        let sftp = russh_sftp::client::SftpSession::new(channel.into_stream()).await?;
        Ok(Box::new(RusshSftp::new(sftp)))
    }

    fn is_alive(&self) -> bool {
        !self.handle.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::keys::ssh_key::PublicKey;
    use std::io::Write;

    const KEY_A: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8g";
    const KEY_B: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAICgpKissLS4vMDEyMzQ1Njc4OTo7PD0+P0BBQkNERUZH";

    fn known_hosts(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file
    }

    fn addr() -> SocketAddr {
        "10.1.2.3:2222".parse().unwrap()
    }

    #[test]
    fn listed_key_is_accepted() {
        let file = known_hosts(&[&format!("[login.hpc.example]:2222 {KEY_A}")]);
        let key = PublicKey::from_openssh(KEY_A).unwrap();
        assert!(verify_server_key("login.hpc.example", addr(), &key, file.path()).unwrap());
    }

    #[test]
    fn ip_entry_is_consulted() {
        let file = known_hosts(&[&format!("[10.1.2.3]:2222 {KEY_A}")]);
        let key = PublicKey::from_openssh(KEY_A).unwrap();
        assert!(verify_server_key("login.hpc.example", addr(), &key, file.path()).unwrap());
    }

    #[test]
    fn unknown_host_is_refused_and_not_learned() {
        let file = known_hosts(&[]);
        let key = PublicKey::from_openssh(KEY_A).unwrap();
        let err = verify_server_key("login.hpc.example", addr(), &key, file.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConnectionError>(),
            Some(ConnectionError::UnknownHostKey { port: 2222, .. })
        ));
        assert_eq!(std::fs::read_to_string(file.path()).unwrap(), "");
    }

    #[test]
    fn changed_key_is_refused() {
        let file = known_hosts(&[&format!("[login.hpc.example]:2222 {KEY_A}")]);
        let key = PublicKey::from_openssh(KEY_B).unwrap();
        assert!(verify_server_key("login.hpc.example", addr(), &key, file.path()).is_err());
    }
}
