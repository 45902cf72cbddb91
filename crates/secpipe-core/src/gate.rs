//! Threshold gate over scanner finding counts.
//!
//! Evaluates [`SeverityCounts`] against [`GateThresholds`] to produce a
//! [`GateVerdict`]. Each gated bucket (critical, high) has a failure limit and
//! an optional looser unstable limit:
//!
//! | count                       | bucket decision |
//! |-----------------------------|-----------------|
//! | `count <= fail`             | pass            |
//! | `fail < count <= unstable`  | unstable        |
//! | `count > unstable`          | fail            |
//!
//! Without unstable limits any count above the failure limit fails. The
//! verdict is the worst bucket decision.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::StageOutcome;
use crate::error::{PipelineError, Result};
use crate::severity::SeverityCounts;

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

/// Per-bucket limits. A count equal to the limit is within it.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SeverityLimits {
    pub critical: u32,
    pub high: u32,
}

impl SeverityLimits {
    pub fn new(critical: u32, high: u32) -> Self {
        Self { critical, high }
    }
}

/// Failure limits plus the optional looser unstable tolerance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct GateThresholds {
    pub fail: SeverityLimits,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unstable: Option<SeverityLimits>,
}

impl GateThresholds {
    /// Hard limits only: anything above `fail` fails.
    pub fn strict(fail: SeverityLimits) -> Self {
        Self {
            fail,
            unstable: None,
        }
    }

    /// Failure limits with an unstable tolerance band above them.
    pub fn with_unstable(fail: SeverityLimits, unstable: SeverityLimits) -> Self {
        Self {
            fail,
            unstable: Some(unstable),
        }
    }

    /// Unstable limits must be at least as loose as the failure limits.
    pub fn validate(&self) -> Result<()> {
        if let Some(unstable) = self.unstable {
            if unstable.critical < self.fail.critical || unstable.high < self.fail.high {
                return Err(PipelineError::Config(format!(
                    "unstable limits (critical={}, high={}) must not be stricter than fail limits (critical={}, high={})",
                    unstable.critical, unstable.high, self.fail.critical, self.fail.high
                )));
            }
        }
        Ok(())
    }
}

impl Default for GateThresholds {
    fn default() -> Self {
        Self::with_unstable(SeverityLimits::new(1, 5), SeverityLimits::new(2, 10))
    }
}

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

/// Gate decision, ordered from best to worst.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    Pass,
    Unstable,
    Fail,
}

impl GateDecision {
    pub fn label(&self) -> &'static str {
        match self {
            GateDecision::Pass => "pass",
            GateDecision::Unstable => "unstable",
            GateDecision::Fail => "fail",
        }
    }
}

impl fmt::Display for GateDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A bucket whose count exceeded a limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateViolation {
    /// Bucket name ("critical" or "high").
    pub bucket: &'static str,
    pub count: u32,
    /// The limit that was exceeded.
    pub limit: u32,
    pub decision: GateDecision,
}

impl fmt::Display for GateViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} findings {} exceed limit {} ({})",
            self.bucket, self.count, self.limit, self.decision
        )
    }
}

/// The outcome of evaluating counts against thresholds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateVerdict {
    pub decision: GateDecision,
    pub counts: SeverityCounts,
    /// Buckets over their failure limit (empty when passed).
    pub violations: Vec<GateViolation>,
}

impl GateVerdict {
    pub fn passed(&self) -> bool {
        self.decision == GateDecision::Pass
    }

    /// Human-readable summary of the violations.
    pub fn summary(&self) -> String {
        if self.violations.is_empty() {
            format!("within thresholds ({})", self.counts)
        } else {
            self.violations
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ")
        }
    }

    /// Map the verdict onto a stage outcome.
    pub fn to_outcome(&self) -> StageOutcome {
        match self.decision {
            GateDecision::Pass => StageOutcome::Success,
            GateDecision::Unstable => StageOutcome::Unstable(self.summary()),
            GateDecision::Fail => StageOutcome::Failed(self.summary()),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Evaluate finding counts against a threshold set.
pub fn evaluate_gate(counts: &SeverityCounts, thresholds: &GateThresholds) -> GateVerdict {
    let buckets = [
        (
            "critical",
            counts.critical,
            thresholds.fail.critical,
            thresholds.unstable.map(|u| u.critical),
        ),
        (
            "high",
            counts.high,
            thresholds.fail.high,
            thresholds.unstable.map(|u| u.high),
        ),
    ];

    let mut violations = Vec::new();
    for (bucket, count, fail, unstable) in buckets {
        if let Some(v) = check_bucket(bucket, count, fail, unstable) {
            violations.push(v);
        }
    }

    let decision = violations
        .iter()
        .map(|v| v.decision)
        .max()
        .unwrap_or(GateDecision::Pass);

    GateVerdict {
        decision,
        counts: *counts,
        violations,
    }
}

fn check_bucket(
    bucket: &'static str,
    count: u32,
    fail: u32,
    unstable: Option<u32>,
) -> Option<GateViolation> {
    if count <= fail {
        return None;
    }
    match unstable {
        Some(limit) if count <= limit => Some(GateViolation {
            bucket,
            count,
            limit: fail,
            decision: GateDecision::Unstable,
        }),
        Some(limit) => Some(GateViolation {
            bucket,
            count,
            limit,
            decision: GateDecision::Fail,
        }),
        None => Some(GateViolation {
            bucket,
            count,
            limit: fail,
            decision: GateDecision::Fail,
        }),
    }
}
