//! Structured observability hooks for pipeline run lifecycle events.
//!
//! This module provides:
//! - A run-scoped tracing span (`run_span`)
//! - Emission functions for key lifecycle events: run start, stage start and
//!   finish, retry scheduling, gate evaluation, run finish, notification errors
//!
//! Events are emitted at `info!` level unless they describe a problem.
//! Set `SECPIPE_LOG` (or `RUST_LOG`) to filter and pass `--json` to the CLI for JSON lines.

use tracing::{info, warn, Span};

/// Run-scoped span carrying the run id and build number.
///
/// The sequencer instruments its whole run future with this span, so every
/// event below is tagged with the run it belongs to.
///
/// # Example
///
/// ```ignore
/// use tracing::Instrument;
/// pipeline_future.instrument(run_span("3f1c...", 42)).await;
/// ```
pub fn run_span(run_id: &str, build_number: u64) -> Span {
    tracing::info_span!("secpipe.run", run_id = %run_id, build = build_number)
}

/// Emit event: run started for a commit with a given stage plan.
pub fn emit_run_started(run_id: &str, commit: &str, stages: usize) {
    info!(event = "run.started", run_id = %run_id, commit = %commit, stages = stages);
}

/// Emit event: a stage is about to execute.
pub fn emit_stage_started(stage: &str, attempt: u32) {
    info!(event = "stage.started", stage = %stage, attempt = attempt);
}

/// Emit event: a stage reached its outcome.
pub fn emit_stage_finished(stage: &str, outcome: &str, duration_ms: u64) {
    info!(
        event = "stage.finished",
        stage = %stage,
        outcome = %outcome,
        duration_ms = duration_ms,
    );
}

/// Emit event: a failed attempt will be retried after a delay.
pub fn emit_retry_scheduled(attempt: u32, max_attempts: u32, delay_secs: u64, error: &dyn std::fmt::Display) {
    warn!(
        event = "retry.scheduled",
        attempt = attempt,
        max_attempts = max_attempts,
        delay_secs = delay_secs,
        error = %error,
    );
}

/// Emit event: threshold gate evaluated against parsed severity counts.
pub fn emit_gate_evaluated(stage: &str, critical: u32, high: u32, decision: &str) {
    info!(
        event = "gate.evaluated",
        stage = %stage,
        critical = critical,
        high = high,
        decision = %decision,
    );
}

/// Emit event: run reached a terminal status.
pub fn emit_run_finished(run_id: &str, status: &str, duration_ms: u64, stages_run: usize) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        status = %status,
        duration_ms = duration_ms,
        stages_run = stages_run,
    );
}

/// Emit event: a notification channel failed (warning level, never retried).
pub fn emit_notify_failed(channel: &str, error: &dyn std::fmt::Display) {
    warn!(event = "notify.failed", channel = %channel, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_span_create() {
        let span = run_span("test-run-id", 7);
        let _guard = span.enter();
        emit_stage_started("unit_test", 1);
    }
}
