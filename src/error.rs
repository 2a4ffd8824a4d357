//! Error types for evalforge operations.
//!
//! Defines the error taxonomy shared by all subsystems:
//! - Preset resolution (`ConfigurationError`, never retried)
//! - Provider calls (`ProviderError`, whose `ErrorKind` decides retry eligibility)
//! - Stage execution (`StageError`, adds parse and subprocess failures)
//! - Run lifecycle (`RunError`)

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::RunStatus;

/// A single violated constraint found while resolving a preset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigViolation {
    /// Dotted path of the offending field (e.g. `evaluation.judge_models`).
    pub field: String,
    /// Human-readable description of the problem.
    pub message: String,
}

impl ConfigViolation {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// A preset could not be resolved into a `PipelineConfig`.
///
/// Carries every violated constraint, not just the first one, so the caller
/// can fix all issues in one pass.
#[derive(Debug, Clone, Error)]
#[error("Invalid configuration ({} violation(s)): {}", .violations.len(), join_violations(.violations))]
pub struct ConfigurationError {
    pub violations: Vec<ConfigViolation>,
}

impl ConfigurationError {
    pub fn new(violations: Vec<ConfigViolation>) -> Self {
        Self { violations }
    }

    /// Returns true if any violation concerns the given field.
    pub fn has_field(&self, field: &str) -> bool {
        self.violations.iter().any(|v| v.field == field)
    }
}

fn join_violations(violations: &[ConfigViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Retry-relevant classification of a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 429, 5xx, dropped connections. Retried.
    Transient,
    /// Authentication, bad request. Never retried.
    Permanent,
    /// The call exceeded its per-call timeout. Retried.
    Timeout,
    /// The run's cancellation token fired mid-call. Never retried.
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Transient => write!(f, "transient"),
            ErrorKind::Permanent => write!(f, "permanent"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Error returned by a provider adapter's `invoke`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} provider error: {message}")]
pub struct ProviderError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Timeout,
            message: message.into(),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Cancelled,
            message: message.into(),
        }
    }

    /// Classifies an HTTP status code returned by an upstream API.
    pub fn from_status(code: u16, message: impl Into<String>) -> Self {
        let kind = match code {
            408 => ErrorKind::Timeout,
            429 => ErrorKind::Transient,
            c if c >= 500 => ErrorKind::Transient,
            _ => ErrorKind::Permanent,
        };
        Self {
            kind,
            message: format!("HTTP {}: {}", code, message.into()),
        }
    }

    /// Whether the call-level retry policy may try again.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, ErrorKind::Transient | ErrorKind::Timeout)
    }
}

/// Kind recorded on a terminal task or stage unit so the user can see why
/// it ended without reading logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transient,
    Permanent,
    Timeout,
    Parse,
    SubprocessTimeout,
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Transient => "transient",
            FailureKind::Permanent => "permanent",
            FailureKind::Timeout => "timeout",
            FailureKind::Parse => "parse",
            FailureKind::SubprocessTimeout => "subprocess_timeout",
            FailureKind::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

impl From<ErrorKind> for FailureKind {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Transient => FailureKind::Transient,
            ErrorKind::Permanent => FailureKind::Permanent,
            ErrorKind::Timeout => FailureKind::Timeout,
            ErrorKind::Cancelled => FailureKind::Cancelled,
        }
    }
}

/// Errors produced while executing a unit of stage work.
#[derive(Debug, Clone, Error)]
pub enum StageError {
    /// The provider call failed (after call-level retries where eligible).
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Judge output could not be parsed after the eval retry budget.
    #[error("Malformed structured output from '{model}': {message}")]
    Parse { model: String, message: String },

    /// A subprocess-backed generator exceeded its wall-clock timeout on every
    /// outer attempt.
    #[error("Subprocess exceeded wall-clock timeout of {timeout:?}")]
    SubprocessTimeout { timeout: Duration },

    /// No adapter is registered for the model's provider.
    #[error("No provider adapter registered for model '{0}'")]
    UnknownProvider(String),

    /// The run was cancelled before or during the call.
    #[error("Cancelled")]
    Cancelled,
}

impl StageError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            StageError::Provider(e) => e.kind.into(),
            StageError::Parse { .. } => FailureKind::Parse,
            StageError::SubprocessTimeout { .. } => FailureKind::SubprocessTimeout,
            StageError::UnknownProvider(_) => FailureKind::Permanent,
            StageError::Cancelled => FailureKind::Cancelled,
        }
    }
}

/// Errors from run submission and lifecycle operations.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Run '{0}' not found")]
    NotFound(String),

    #[error("Invalid run transition from '{from}' to '{to}'")]
    InvalidTransition { from: RunStatus, to: RunStatus },

    #[error("Run '{0}' is still active and cannot be deleted")]
    StillActive(String),

    #[error("No content supplied for document '{0}'")]
    MissingDocument(String),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}
