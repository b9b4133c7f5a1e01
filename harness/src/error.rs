//! Harness-specific error types

use shared::{Role, SharedError};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Whether a per-case request failure is worth retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestErrorKind {
    /// Network fault, 5xx/429 status, or malformed body - retried with backoff
    Transient,
    /// A request we constructed was rejected outright - short-circuits retries
    Permanent,
}

impl fmt::Display for RequestErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestErrorKind::Transient => write!(f, "transient"),
            RequestErrorKind::Permanent => write!(f, "permanent"),
        }
    }
}

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("No free port found scanning {scanned} ports from {start}")]
    NoFreePort { start: u16, scanned: u16 },

    #[error("Cannot reclaim port {port}: {reason}")]
    PortReclaim { port: u16, reason: String },

    #[error("Role {role} did not become ready within {waited:?}")]
    StartupTimeout { role: Role, waited: Duration },

    #[error("Failed to launch {role}: {message}")]
    Launch { role: Role, message: String },

    #[error("{kind} request failure: {message}")]
    Request {
        kind: RequestErrorKind,
        message: String,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {field}")]
    Config { field: String },

    #[error("Shared component error")]
    Shared(#[from] SharedError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl HarnessError {
    pub fn transient(message: impl Into<String>) -> Self {
        HarnessError::Request {
            kind: RequestErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        HarnessError::Request {
            kind: RequestErrorKind::Permanent,
            message: message.into(),
        }
    }

    /// True only for request failures that should go through the backoff cycle
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HarnessError::Request {
                kind: RequestErrorKind::Transient,
                ..
            }
        )
    }
}

pub type HarnessResult<T> = Result<T, HarnessError>;
