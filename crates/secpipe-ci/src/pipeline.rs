//! Stage sequencing.
//!
//! Stages run one at a time in canonical order. A hard failure halts the
//! sequence; a soft failure or an unstable gate degrades the run and lets it
//! continue. Cancellation kills the running tool and halts with `Aborted`.
//! The notifier is called exactly once, whatever the terminal status.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use secpipe_core::{
    evaluate_gate, obs, parse_report, PipelineConfig, PipelineError, Result, RunContext,
    RunReport, RunStatus, ScanVariant, StageOutcome, StageResult, SUMMARY_FILE,
};
use tokio::sync::watch;
use tracing::{debug, info, warn, Instrument};

use crate::notify::Notifier;
use crate::retry::{retry, RetryPolicy};
use crate::runner::{Invocation, Stdin, ToolInvoker, ToolOutput};
use crate::stage::{FailurePolicy, Secrets, Stage, StagePlan};

/// Reason recorded on the stage that was running when the run was cancelled.
pub const CANCELLED: &str = "cancelled";

/// Sending half of a cancellation signal.
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.0.send(true);
    }
}

/// Receiving half of a cancellation signal.
#[derive(Debug, Clone)]
pub struct CancelSignal(watch::Receiver<bool>);

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self(rx)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once cancellation is requested; pends forever if the handle
    /// is dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.0.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Create a connected cancellation handle and signal.
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle(tx), CancelSignal(rx))
}

/// Why a stage's commands did not all succeed.
#[derive(Debug, Clone)]
struct CommandFailure {
    reason: String,
    exit_code: Option<i32>,
}

impl fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

/// Pipeline orchestrator.
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    invoker: Arc<dyn ToolInvoker>,
    notifier: Arc<dyn Notifier>,
    secrets: Secrets,
}

impl Pipeline {
    pub fn new(
        config: Arc<PipelineConfig>,
        invoker: Arc<dyn ToolInvoker>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            invoker,
            notifier,
            secrets: Secrets::default(),
        }
    }

    pub fn with_secrets(mut self, secrets: Secrets) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Full plan minus `stages.skip` from config and `extra_skip`.
    pub fn plan(&self, extra_skip: &[String]) -> Result<StagePlan> {
        let skip: Vec<&str> = self
            .config
            .stages
            .skip
            .iter()
            .chain(extra_skip)
            .map(String::as_str)
            .collect();
        StagePlan::without_names(&skip)
    }

    /// Reject plans that cannot work before anything runs.
    pub fn check_plan(&self, ctx: &RunContext, plan: &StagePlan) -> Result<()> {
        if plan.contains(Stage::DynamicScan)
            && ctx.variant == ScanVariant::Api
            && self.config.targets.api_definition.is_none()
        {
            return Err(PipelineError::Config(
                "the api scan variant requires targets.api_definition".to_string(),
            ));
        }
        Ok(())
    }

    /// Commands each planned stage would run, without running them.
    pub fn describe(
        &self,
        ctx: &RunContext,
        plan: &StagePlan,
    ) -> Vec<(Stage, Result<Vec<Invocation>>)> {
        plan.stages()
            .iter()
            .map(|stage| (*stage, stage.invocations(ctx, &self.config, &self.secrets)))
            .collect()
    }

    /// Execute the plan, write the run summary and notify.
    pub async fn run(&self, ctx: RunContext, plan: &StagePlan, cancel: CancelSignal) -> RunReport {
        let span = obs::run_span(&ctx.run_id.to_string(), ctx.build_number);
        self.run_inner(ctx, plan, cancel).instrument(span).await
    }

    async fn run_inner(&self, ctx: RunContext, plan: &StagePlan, cancel: CancelSignal) -> RunReport {
        let start = Instant::now();
        let run_id = ctx.run_id.to_string();
        obs::emit_run_started(&run_id, &ctx.commit, plan.len());

        if let Err(e) = std::fs::create_dir_all(ctx.reports_dir()) {
            warn!(dir = %ctx.reports_dir().display(), error = %e, "cannot create reports directory");
        }
        clear_stale_reports(&ctx, plan);

        let mut results: Vec<StageResult> = Vec::new();
        let mut aborted = false;

        for &stage in plan.stages() {
            if cancel.is_cancelled() {
                aborted = true;
                break;
            }

            let stage_start = Instant::now();
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    aborted = true;
                    let mut r = StageResult::new(stage.name(), StageOutcome::Failed(CANCELLED.to_string()));
                    r.duration_ms = stage_start.elapsed().as_millis() as u64;
                    r
                }
                r = self.run_stage(stage, &ctx) => r,
            };
            if aborted {
                self.clean_up_cancelled(stage, &ctx).await;
            }

            obs::emit_stage_finished(stage.name(), result.outcome.label(), result.duration_ms);
            let halt = result.outcome.is_failed();
            if let Some(reason) = result.outcome.reason() {
                info!(stage = %stage, outcome = %result.outcome.label(), reason = %reason, "stage did not succeed");
            }
            results.push(result);
            if halt {
                break;
            }
        }

        let status = if aborted {
            RunStatus::Aborted
        } else {
            RunStatus::from_outcomes(results.iter().map(|r| &r.outcome))
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        let stages_run = results.len();
        let report = RunReport::new(ctx, status, results, &plan.names(), duration_ms);

        let summary = report.context.report_path(SUMMARY_FILE);
        if let Err(e) = report.write_json(&summary) {
            warn!(path = %summary.display(), error = %e, "cannot write run summary");
        }

        obs::emit_run_finished(&run_id, status.label(), duration_ms, stages_run);

        if let Err(e) = self.notifier.notify(&report).await {
            obs::emit_notify_failed(self.notifier.channel(), &e);
        }
        report
    }

    async fn run_stage(&self, stage: Stage, ctx: &RunContext) -> StageResult {
        let start = Instant::now();
        let invocations = match stage.invocations(ctx, &self.config, &self.secrets) {
            Ok(invocations) => invocations,
            Err(e) => {
                obs::emit_stage_started(stage.name(), 1);
                let mut result = StageResult::new(stage.name(), StageOutcome::Failed(e.to_string()));
                result.duration_ms = start.elapsed().as_millis() as u64;
                return result;
            }
        };

        let (commands, attempts) = if stage.is_retryable() {
            let policy = RetryPolicy::from(&self.config.retry);
            let invocations = &invocations;
            let outcome = retry(&policy, move |attempt| {
                obs::emit_stage_started(stage.name(), attempt);
                self.run_commands(invocations)
            })
            .await;
            (outcome.result, outcome.attempts)
        } else {
            obs::emit_stage_started(stage.name(), 1);
            (self.run_commands(&invocations).await, 1)
        };

        let (outcome, exit_code) = match commands {
            Ok(output) => (self.apply_gate(stage, ctx), Some(output.exit_code)),
            Err(failure) => {
                let outcome = match stage.failure_policy() {
                    FailurePolicy::Hard => StageOutcome::Failed(failure.reason),
                    FailurePolicy::Soft => StageOutcome::Unstable(failure.reason),
                };
                (outcome, failure.exit_code)
            }
        };

        StageResult {
            stage: stage.name().to_string(),
            outcome,
            attempts,
            exit_code,
            duration_ms: start.elapsed().as_millis() as u64,
            reports: stage
                .reports(ctx)
                .into_iter()
                .filter(|p| p.is_file())
                .collect(),
        }
    }

    /// Run the stage's commands in order, stopping at the first failure.
    async fn run_commands(
        &self,
        invocations: &[Invocation],
    ) -> std::result::Result<ToolOutput, CommandFailure> {
        let mut last = ToolOutput::default();
        for invocation in invocations {
            let invocation = match invocation.stdin {
                Some(Stdin::PreviousStdout) => Cow::Owned(
                    invocation
                        .clone()
                        .stdin(Stdin::Secret(last.stdout.trim().to_string())),
                ),
                _ => Cow::Borrowed(invocation),
            };
            debug!(command = %invocation.command_line(), "invoking");

            let output = self
                .invoker
                .invoke(&invocation)
                .await
                .map_err(|e| CommandFailure {
                    reason: e.to_string(),
                    exit_code: None,
                })?;
            if !output.success() {
                let detail = output
                    .last_error_line()
                    .map(|l| format!(": {l}"))
                    .unwrap_or_default();
                return Err(CommandFailure {
                    reason: format!(
                        "{} exited with code {}{}",
                        invocation.program, output.exit_code, detail
                    ),
                    exit_code: Some(output.exit_code),
                });
            }
            last = output;
        }
        Ok(last)
    }

    /// Tear down what a cancelled stage left running outside our process tree.
    async fn clean_up_cancelled(&self, stage: Stage, ctx: &RunContext) {
        let Some(cleanup) = stage.cancel_cleanup(ctx, &self.config) else {
            return;
        };
        debug!(stage = %stage, command = %cleanup.command_line(), "cleaning up cancelled stage");
        match self.invoker.invoke(&cleanup).await {
            Ok(output) if output.success() => {}
            Ok(output) => warn!(
                stage = %stage,
                exit_code = output.exit_code,
                "cleanup of cancelled stage failed"
            ),
            Err(e) => warn!(stage = %stage, error = %e, "cleanup of cancelled stage failed"),
        }
    }

    /// Outcome of a stage whose commands all succeeded.
    fn apply_gate(&self, stage: Stage, ctx: &RunContext) -> StageOutcome {
        let Some(gate) = stage.gate() else {
            return StageOutcome::Success;
        };
        let path = ctx.report_path(gate.report_file);
        let counts = match parse_report(gate.format, &path) {
            Ok(counts) => counts,
            Err(e) => return StageOutcome::Failed(e.to_string()),
        };
        let verdict = evaluate_gate(&counts, gate.thresholds(&self.config));
        obs::emit_gate_evaluated(
            stage.name(),
            counts.critical,
            counts.high,
            verdict.decision.label(),
        );
        verdict.to_outcome()
    }
}

/// Remove reports left by a previous run; gates and attachments only ever see
/// files written by this one.
fn clear_stale_reports(ctx: &RunContext, plan: &StagePlan) {
    let stale = plan
        .stages()
        .iter()
        .flat_map(|stage| stage.reports(ctx))
        .chain(std::iter::once(ctx.report_path(SUMMARY_FILE)));
    for path in stale {
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed stale report"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "cannot remove stale report"),
        }
    }
}
