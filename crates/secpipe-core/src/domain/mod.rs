//! Domain models for secpipe runs.
//!
//! Canonical definitions for the ephemeral entities of one execution:
//! - `RunContext`: immutable identity of the run
//! - `StageResult` / `StageOutcome`: per-stage outcome, tagged soft or hard
//! - `RunReport`: ordered results plus terminal `RunStatus`

pub mod context;
pub mod outcome;
pub mod report;

pub use context::{ImageRef, RunContext, ScanVariant, REPORTS_DIR};
pub use outcome::{RunStatus, StageOutcome, StageResult};
pub use report::{compute_plan_digest, RunReport, SUMMARY_FILE};
