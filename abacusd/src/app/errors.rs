// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod codes {
    pub const CONNECTION_FAILURE: &str = "connection_failure";
    pub const INVALID_ARGUMENT: &str = "invalid_argument";
    pub const NOT_FOUND: &str = "not_found";
    pub const PERMISSION_DENIED: &str = "permission_denied";
    pub const INTERNAL_ERROR: &str = "internal_error";
    pub const REMOTE_ERROR: &str = "remote_error";
    pub const SUBMISSION_FAILED: &str = "submission_failed";
    pub const STORAGE_ERROR: &str = "storage_error";
    pub const LOCAL_ERROR: &str = "local_error";
    pub const NOT_SUPPORTED: &str = "not_supported";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppErrorKind {
    InvalidArgument,
    NotFound,
    PermissionDenied,
    Internal,
}

#[derive(Debug, Clone)]
pub struct AppError {
    kind: AppErrorKind,
    code: &'static str,
    message: String,
    context: Option<String>,
}

impl AppError {
    pub fn with_message(
        kind: AppErrorKind,
        code: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
            context: None,
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::with_message(AppErrorKind::InvalidArgument, codes::INVALID_ARGUMENT, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::with_message(AppErrorKind::NotFound, codes::NOT_FOUND, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::with_message(AppErrorKind::PermissionDenied, codes::PERMISSION_DENIED, message)
    }

    pub fn internal(code: &'static str, message: impl Into<String>) -> Self {
        Self::with_message(AppErrorKind::Internal, code, message)
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn kind(&self) -> AppErrorKind {
        self.kind
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ctx) = &self.context {
            write!(f, "{} ({})", self.message, ctx)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;
