//! Error taxonomy shared by the secpipe crates.

use std::path::PathBuf;

/// Errors produced while configuring or driving a pipeline run.
///
/// Stage outcomes are not errors: a failing tool is reported through
/// [`crate::StageOutcome`]. These variants cover the cases where the
/// orchestration itself could not do its job.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid stage plan: {0}")]
    InvalidPlan(String),

    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' timed out after {timeout_secs} seconds")]
    Timeout { program: String, timeout_secs: u64 },

    #[error("cannot parse report {path}: {reason}")]
    ReportParse { path: PathBuf, reason: String },

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for secpipe operations.
pub type Result<T> = std::result::Result<T, PipelineError>;
