use std::path::PathBuf;

use thiserror::Error;

/// Recoverable failures of a monitoring run.
///
/// None of these abort a run; each is handled per source or per metric and
/// surfaced as a [`Diagnostic`].
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("source unavailable: {path}: {reason}")]
    SourceUnavailable { path: PathBuf, reason: String },

    #[error("state corrupt: {path}: {reason}")]
    StateCorrupt { path: PathBuf, reason: String },

    #[error("config invalid: {key}: {reason}")]
    ConfigInvalid { key: String, reason: String },

    #[error("dispatch failed: {0}")]
    DispatchFailed(String),

    #[error("sampling failed: {0}")]
    SamplingFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MonitorError {
    pub fn source_unavailable(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        MonitorError::SourceUnavailable { path: path.into(), reason: reason.to_string() }
    }

    /// Short label used in diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            MonitorError::SourceUnavailable { .. } => "SourceUnavailable",
            MonitorError::StateCorrupt { .. } => "StateCorrupt",
            MonitorError::ConfigInvalid { .. } => "ConfigInvalid",
            MonitorError::DispatchFailed(_) => "DispatchFailed",
            MonitorError::SamplingFailed(_) => "SamplingFailed",
            MonitorError::Io(_) => "Io",
        }
    }
}

/// One line of "couldn't check" output: which subject, what went wrong.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub subject: String,
    pub kind: &'static str,
    pub detail: String,
}

impl Diagnostic {
    pub fn new(subject: impl Into<String>, err: &MonitorError) -> Self {
        Self {
            subject: subject.into(),
            kind: err.kind(),
            detail: err.to_string(),
        }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.subject, self.kind, self.detail)
    }
}
