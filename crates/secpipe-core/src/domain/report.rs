//! Run report: everything the notifier and the summary artifact need.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::context::RunContext;
use super::outcome::{RunStatus, StageResult};
use crate::error::Result;

/// File name of the JSON run summary written next to the other reports.
pub const SUMMARY_FILE: &str = "secpipe-summary.json";

/// Aggregate result of an entire pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunReport {
    /// Identity of the run.
    pub context: RunContext,

    /// Terminal status.
    pub status: RunStatus,

    /// Per-stage results in execution order.
    pub stages: Vec<StageResult>,

    /// SHA-256 digest of the ordered stage plan (deterministic).
    pub plan_digest: String,

    /// Total wall-clock duration in milliseconds.
    pub duration_ms: u64,

    /// When the run reached its terminal status.
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn new(
        context: RunContext,
        status: RunStatus,
        stages: Vec<StageResult>,
        plan: &[&str],
        duration_ms: u64,
    ) -> Self {
        Self {
            context,
            status,
            stages,
            plan_digest: compute_plan_digest(plan),
            duration_ms,
            finished_at: Utc::now(),
        }
    }

    /// Number of stages that succeeded.
    pub fn passed_count(&self) -> usize {
        self.stages.iter().filter(|s| s.passed()).count()
    }

    /// Report files produced by the run that still exist on disk, in stage order.
    pub fn artifacts(&self) -> Vec<PathBuf> {
        self.stages
            .iter()
            .flat_map(|s| s.reports.iter())
            .filter(|p| p.is_file())
            .cloned()
            .collect()
    }

    /// One-line headline used as chat message title and email subject.
    pub fn headline(&self) -> String {
        format!(
            "{} #{} {} ({})",
            self.context.image.name,
            self.context.build_number,
            self.status,
            short_commit(&self.context.commit)
        )
    }

    /// Plain-text body listing each executed stage.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{}", self.headline());
        let _ = writeln!(out, "Run: {}", self.context.run_id);
        let _ = writeln!(out, "Commit: {}", self.context.commit);
        let _ = writeln!(out, "Image: {}", self.context.image.reference());
        let _ = writeln!(out, "Scan variant: {}", self.context.variant);
        let _ = writeln!(out, "Duration: {}ms", self.duration_ms);
        let _ = writeln!(out);
        for stage in &self.stages {
            let _ = write!(
                out,
                "  [{}] {} ({}ms",
                stage.outcome.label(),
                stage.stage,
                stage.duration_ms
            );
            if stage.attempts > 1 {
                let _ = write!(out, ", {} attempts", stage.attempts);
            }
            let _ = write!(out, ")");
            if let Some(reason) = stage.outcome.reason() {
                let _ = write!(out, ": {reason}");
            }
            let _ = writeln!(out);
        }
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "Summary: {}/{} stages passed",
            self.passed_count(),
            self.stages.len()
        );
        out
    }

    /// Write the report as pretty JSON, creating parent directories.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Compute deterministic digest of ordered stage names.
pub fn compute_plan_digest(stages: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for stage in stages {
        hasher.update(stage.as_bytes());
        hasher.update(b"\0");
    }
    hex::encode(hasher.finalize())
}

fn short_commit(commit: &str) -> &str {
    commit.get(..12).unwrap_or(commit)
}
