//! Stage outcomes and run terminal status.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Outcome of a single stage.
///
/// `Unstable` degrades the run but lets the sequence continue; `Failed`
/// halts it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum StageOutcome {
    Success,
    Unstable(String),
    Failed(String),
}

impl StageOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, StageOutcome::Success)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, StageOutcome::Failed(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            StageOutcome::Success => "success",
            StageOutcome::Unstable(_) => "unstable",
            StageOutcome::Failed(_) => "failed",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            StageOutcome::Success => None,
            StageOutcome::Unstable(reason) | StageOutcome::Failed(reason) => Some(reason),
        }
    }
}

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    /// Every stage succeeded.
    Completed,

    /// All stages ran but at least one was degraded.
    Unstable,

    /// A hard failure halted the sequence.
    Failed,

    /// The run was cancelled by the user.
    Aborted,
}

impl RunStatus {
    /// Fold the outcomes of the executed stages into a terminal status.
    pub fn from_outcomes<'a>(outcomes: impl IntoIterator<Item = &'a StageOutcome>) -> Self {
        let mut status = RunStatus::Completed;
        for outcome in outcomes {
            match outcome {
                StageOutcome::Success => {}
                StageOutcome::Unstable(_) => status = RunStatus::Unstable,
                StageOutcome::Failed(_) => return RunStatus::Failed,
            }
        }
        status
    }

    pub fn label(&self) -> &'static str {
        match self {
            RunStatus::Completed => "COMPLETED",
            RunStatus::Unstable => "UNSTABLE",
            RunStatus::Failed => "FAILED",
            RunStatus::Aborted => "ABORTED",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Result of a single stage execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageResult {
    /// Stage name (e.g. "unit_test", "image_scan").
    pub stage: String,

    /// Stage outcome.
    pub outcome: StageOutcome,

    /// Number of attempts made (more than one only for the retried stage).
    pub attempts: u32,

    /// Exit code of the last invocation, when one ran to completion.
    pub exit_code: Option<i32>,

    /// Execution duration in milliseconds.
    pub duration_ms: u64,

    /// Report files produced by this stage.
    pub reports: Vec<PathBuf>,
}

impl StageResult {
    pub fn new(stage: impl Into<String>, outcome: StageOutcome) -> Self {
        Self {
            stage: stage.into(),
            outcome,
            attempts: 1,
            exit_code: None,
            duration_ms: 0,
            reports: Vec::new(),
        }
    }

    pub fn passed(&self) -> bool {
        self.outcome.is_success()
    }
}
