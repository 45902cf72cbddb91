//! Severity counting for scanner reports.
//!
//! Supports the JSON output of Trivy (`--format json`) and OWASP
//! Dependency-Check (`--format JSON`). Only the severity field of each finding
//! is read; everything else in the report is passed through untouched.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Finding counts by severity bucket.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SeverityCounts {
    pub critical: u32,
    pub high: u32,
    pub medium: u32,
    pub low: u32,
}

impl SeverityCounts {
    /// Counts with only the gated buckets set.
    pub fn new(critical: u32, high: u32) -> Self {
        Self {
            critical,
            high,
            ..Self::default()
        }
    }

    /// Add one finding of the given severity; unknown severities are ignored.
    pub fn record(&mut self, severity: &str) {
        match severity.trim().to_ascii_uppercase().as_str() {
            "CRITICAL" => self.critical += 1,
            "HIGH" => self.high += 1,
            "MEDIUM" | "MODERATE" => self.medium += 1,
            "LOW" => self.low += 1,
            _ => {}
        }
    }

    pub fn total(&self) -> u32 {
        self.critical + self.high + self.medium + self.low
    }
}

impl fmt::Display for SeverityCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "critical={} high={} medium={} low={}",
            self.critical, self.high, self.medium, self.low
        )
    }
}

/// Scanner report format understood by [`parse_report`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ReportFormat {
    Trivy,
    DependencyCheck,
}

impl FromStr for ReportFormat {
    type Err = PipelineError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trivy" => Ok(ReportFormat::Trivy),
            "dependency-check" | "dependency_check" | "owasp" => Ok(ReportFormat::DependencyCheck),
            other => Err(PipelineError::Config(format!(
                "unknown report format '{other}' (expected trivy or dependency-check)"
            ))),
        }
    }
}

impl fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportFormat::Trivy => f.write_str("trivy"),
            ReportFormat::DependencyCheck => f.write_str("dependency-check"),
        }
    }
}

#[derive(Deserialize)]
struct TrivyReport {
    #[serde(rename = "Results", default)]
    results: Option<Vec<TrivyTarget>>,
}

#[derive(Deserialize)]
struct TrivyTarget {
    #[serde(rename = "Vulnerabilities", default)]
    vulnerabilities: Option<Vec<TrivyVulnerability>>,
}

#[derive(Deserialize)]
struct TrivyVulnerability {
    #[serde(rename = "Severity", default)]
    severity: String,
}

#[derive(Deserialize)]
struct DependencyCheckReport {
    #[serde(default)]
    dependencies: Vec<DependencyEntry>,
}

#[derive(Deserialize)]
struct DependencyEntry {
    #[serde(default)]
    vulnerabilities: Vec<DependencyVulnerability>,
}

#[derive(Deserialize)]
struct DependencyVulnerability {
    #[serde(default)]
    severity: String,
}

/// Count findings in an in-memory report body.
pub fn count_findings(format: ReportFormat, body: &[u8]) -> serde_json::Result<SeverityCounts> {
    let mut counts = SeverityCounts::default();
    match format {
        ReportFormat::Trivy => {
            let report: TrivyReport = serde_json::from_slice(body)?;
            for vuln in report
                .results
                .unwrap_or_default()
                .into_iter()
                .flat_map(|t| t.vulnerabilities.unwrap_or_default())
            {
                counts.record(&vuln.severity);
            }
        }
        ReportFormat::DependencyCheck => {
            let report: DependencyCheckReport = serde_json::from_slice(body)?;
            for vuln in report
                .dependencies
                .into_iter()
                .flat_map(|d| d.vulnerabilities)
            {
                counts.record(&vuln.severity);
            }
        }
    }
    Ok(counts)
}

/// Read a report file and count its findings.
pub fn parse_report(format: ReportFormat, path: &Path) -> Result<SeverityCounts> {
    let body = std::fs::read(path).map_err(|e| PipelineError::ReportParse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    count_findings(format, &body).map_err(|e| PipelineError::ReportParse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}
