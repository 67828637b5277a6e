// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

pub mod aggregator;
pub mod completion;
pub mod history;
pub mod poller;
pub mod submission;
pub mod templates;
pub mod tracking;

use crate::app::errors::{AppError, codes};
use crate::remote::PoolError;

pub(crate) fn map_pool_error(err: PoolError) -> AppError {
    AppError::internal(codes::CONNECTION_FAILURE, format!("ssh connect failed: {err}"))
}

pub(crate) fn map_remote_error(op: &str, err: impl std::fmt::Display) -> AppError {
    AppError::internal(codes::REMOTE_ERROR, format!("{op} failed: {err}"))
}
