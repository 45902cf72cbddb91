//! secpipe Core Library
//!
//! Domain types, configuration, report parsing and threshold gating shared by
//! the secpipe pipeline runner and CLI. Nothing in this crate spawns processes.

pub mod config;
pub mod domain;
pub mod error;
pub mod gate;
pub mod obs;
pub mod severity;
pub mod telemetry;

pub use config::{
    DockerHubConfig, EcrConfig, EmailConfig, NotifyConfig, PipelineConfig, RetryConfig,
    SlackConfig, ToolsConfig, DEFAULT_CONFIG_FILE,
};
pub use domain::{
    compute_plan_digest, ImageRef, RunContext, RunReport, RunStatus, ScanVariant, StageOutcome,
    StageResult, REPORTS_DIR, SUMMARY_FILE,
};
pub use error::{PipelineError, Result};
pub use gate::{
    evaluate_gate, GateDecision, GateThresholds, GateVerdict, GateViolation, SeverityLimits,
};
pub use severity::{count_findings, parse_report, ReportFormat, SeverityCounts};
pub use telemetry::init_tracing;
