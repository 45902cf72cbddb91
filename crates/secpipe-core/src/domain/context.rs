//! Run context: the immutable identity of one pipeline execution.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PipelineError;

/// Directory, relative to the workspace, that collects every report.
pub const REPORTS_DIR: &str = "reports";

/// Dynamic scan variant selected by the user for a run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ScanVariant {
    /// Passive spider + passive rules against the running app.
    #[default]
    Baseline,

    /// Scan driven by an OpenAPI definition.
    Api,

    /// Spider + active attack scan.
    Full,
}

impl ScanVariant {
    pub const ALL: [ScanVariant; 3] = [ScanVariant::Baseline, ScanVariant::Api, ScanVariant::Full];

    /// Name used on the command line and in config.
    pub fn name(&self) -> &'static str {
        match self {
            ScanVariant::Baseline => "baseline",
            ScanVariant::Api => "api",
            ScanVariant::Full => "full",
        }
    }

    /// ZAP packaged scan script for this variant.
    pub fn zap_script(&self) -> &'static str {
        match self {
            ScanVariant::Baseline => "zap-baseline.py",
            ScanVariant::Api => "zap-api-scan.py",
            ScanVariant::Full => "zap-full-scan.py",
        }
    }

    /// HTML report file name written by the scan.
    pub fn report_file(&self) -> &'static str {
        match self {
            ScanVariant::Baseline => "zap_baseline_report.html",
            ScanVariant::Api => "zap_api_report.html",
            ScanVariant::Full => "zap_full_report.html",
        }
    }
}

impl fmt::Display for ScanVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ScanVariant {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "baseline" => Ok(ScanVariant::Baseline),
            "api" => Ok(ScanVariant::Api),
            "full" => Ok(ScanVariant::Full),
            other => Err(PipelineError::Config(format!(
                "unknown scan variant '{other}' (expected baseline, api or full)"
            ))),
        }
    }
}

/// Container image coordinates produced by the run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageRef {
    /// Local image name, e.g. `webapp`.
    pub name: String,

    /// Image tag, usually the build number.
    pub tag: String,
}

impl ImageRef {
    pub fn new(name: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tag: tag.into(),
        }
    }

    /// `name:tag` reference passed to docker and trivy.
    pub fn reference(&self) -> String {
        format!("{}:{}", self.name, self.tag)
    }
}

/// Identity of a single pipeline execution.
///
/// Built once when the run starts and shared by reference with every stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunContext {
    /// Unique identifier for this run.
    pub run_id: Uuid,

    /// Commit being built.
    pub commit: String,

    /// Monotonic build number supplied by the caller.
    pub build_number: u64,

    /// Dynamic scan variant for this run.
    pub variant: ScanVariant,

    /// Image built and published by this run.
    pub image: ImageRef,

    /// Checkout directory all stages run in.
    pub workspace: PathBuf,

    /// When the run started.
    pub started_at: DateTime<Utc>,
}

impl RunContext {
    pub fn new(
        commit: impl Into<String>,
        build_number: u64,
        variant: ScanVariant,
        image: ImageRef,
        workspace: impl Into<PathBuf>,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            commit: commit.into(),
            build_number,
            variant,
            image,
            workspace: workspace.into(),
            started_at: Utc::now(),
        }
    }

    /// Directory that receives every report of the run.
    pub fn reports_dir(&self) -> PathBuf {
        self.workspace.join(REPORTS_DIR)
    }

    /// Path of a named report inside [`RunContext::reports_dir`].
    pub fn report_path(&self, file_name: impl AsRef<Path>) -> PathBuf {
        self.reports_dir().join(file_name)
    }
}
