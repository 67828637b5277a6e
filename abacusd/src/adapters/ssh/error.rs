// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum ConnectionError {
    #[error("identity file {0} does not exist")]
    MissingIdentity(PathBuf),
    #[error("known_hosts file {0} does not exist")]
    MissingKnownHosts(PathBuf),
    #[error("could not resolve {0}")]
    Unresolvable(String),
    #[error("connecting to {host} timed out after {timeout:?}")]
    Timeout { host: String, timeout: Duration },
    #[error("server key for {host}:{port} is not listed in known_hosts")]
    UnknownHostKey { host: String, port: u16 },
    #[error("public key authentication rejected for {username}")]
    Authentication { username: String },
}

impl ConnectionError {
    /// `true` when retrying with the same settings cannot succeed.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::MissingIdentity(_)
                | Self::MissingKnownHosts(_)
                | Self::UnknownHostKey { .. }
                | Self::Authentication { .. }
        )
    }
}
