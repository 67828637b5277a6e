// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use russh::client::{AuthResult, Handle};
use russh::keys::PrivateKeyWithHashAlg;

use super::ClientHandler;
use crate::adapters::ssh::ConnectionError;

/// Public key authentication only; there is no interactive fallback.
pub(in crate::adapters::ssh) async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    username: &str,
    identity: &Path,
) -> Result<()> {
    let key = russh::keys::load_secret_key(identity, None)
        .with_context(|| format!("failed to load secret key at {}", identity.display()))?;
    // Prefer SHA-256 for RSA if applicable (ignored for non-RSA keys)
    let key = PrivateKeyWithHashAlg::new(
        Arc::new(key),
        handle.best_supported_rsa_hash().await?.flatten(),
    );
    let result = handle
        .authenticate_publickey(username.to_string(), key)
        .await
        .context("publickey authentication")?;
    match result {
        AuthResult::Success => Ok(()),
        AuthResult::Failure { .. } => Err(ConnectionError::Authentication {
            username: username.to_string(),
        }
        .into()),
    }
}
