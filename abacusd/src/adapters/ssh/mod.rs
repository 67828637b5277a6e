// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use russh::client::Config;

use crate::remote::{ConnectionPool, PoolError, RemoteSession, SessionConnector};

mod error;
mod session;

pub use error::ConnectionError;
pub use session::{RusshExecChannel, RusshSession, RusshSftp};

use session::{ClientHandler, authenticate};

/// Where and as whom to log in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SshParams {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub identity_path: PathBuf,
    pub known_hosts_path: PathBuf,
    pub connect_timeout: Duration,
    pub keepalive_secs: u64,
}

/// Opens new authenticated russh sessions for the pool.
pub struct RusshConnector {
    params: SshParams,
    config: Arc<Config>,
}

impl RusshConnector {
    pub fn new(params: SshParams) -> Self {
        let cfg = Config {
            inactivity_timeout: None,
            keepalive_interval: (params.keepalive_secs > 0)
                .then(|| Duration::from_secs(params.keepalive_secs)),
            keepalive_max: 3,
            channel_buffer_size: 64,
            window_size: 1024 * 1024,
            ..Default::default()
        };
        Self {
            params,
            config: Arc::new(cfg),
        }
    }

    fn check_files(&self) -> Result<(), ConnectionError> {
        if !self.params.identity_path.is_file() {
            return Err(ConnectionError::MissingIdentity(
                self.params.identity_path.clone(),
            ));
        }
        if !self.params.known_hosts_path.is_file() {
            return Err(ConnectionError::MissingKnownHosts(
                self.params.known_hosts_path.clone(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl SessionConnector for RusshConnector {
    #[tracing::instrument(
        name = "ssh",
        level = "debug",
        skip(self),
        fields(op = "connect", host = %self.params.host, user = %self.params.username, port = self.params.port)
    )]
    async fn connect(&self) -> Result<Arc<dyn RemoteSession>> {
        self.check_files()?;
        let params = &self.params;
        let addr = tokio::net::lookup_host((params.host.as_str(), params.port))
            .await
            .with_context(|| format!("resolving {}", params.host))?
            .next()
            .ok_or_else(|| ConnectionError::Unresolvable(params.host.clone()))?;

        let handler = ClientHandler::new(params.host.clone(), addr, params.known_hosts_path.clone());
        let connect = russh::client::connect(self.config.clone(), addr, handler);
        let mut handle = tokio::time::timeout(params.connect_timeout, connect)
            .await
            .map_err(|_| ConnectionError::Timeout {
                host: params.host.clone(),
                timeout: params.connect_timeout,
            })?
            .context("SSH connect failed")?;
        log::info!(
            "established connection with {}@{}, proceeding with auth",
            params.username,
            addr
        );
        authenticate(&mut handle, &params.username, &params.identity_path).await?;

        let label = format!("{}@{}:{}", params.username, params.host, params.port);
        Ok(Arc::new(RusshSession::new(handle, label)))
    }
}

/// Logs in once through the pool before the daemon starts serving.
///
/// Settings that can never work (missing key, unknown host key, rejected
/// login) abort startup. Anything else, such as an unreachable host, is only
/// warned about because the pool reconnects on every borrow.
pub async fn check_login(pool: &Arc<ConnectionPool>) -> Result<()> {
    match pool.lease().await {
        Ok(lease) => {
            tracing::info!(slot = lease.slot(), "cluster login succeeded");
            Ok(())
        }
        Err(PoolError::Connect { source, .. }) => {
            if source
                .downcast_ref::<ConnectionError>()
                .is_some_and(ConnectionError::is_configuration)
            {
                return Err(source.context("ssh settings cannot work"));
            }
            tracing::warn!("cluster login failed, will retry on demand: {source:#}");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}
