//! Integration tests for the pipeline with scripted tools and a recording notifier.

use std::sync::Arc;
use std::time::Duration;

use secpipe_ci::fakes::{RecordingNotifier, Scripted, ScriptedInvoker};
use secpipe_ci::{cancel_pair, CancelSignal, Pipeline, Stage, StagePlan, CANCELLED};
use secpipe_core::{
    EcrConfig, ImageRef, PipelineConfig, RunContext, RunReport, RunStatus, ScanVariant,
    StageOutcome, SUMMARY_FILE,
};
use tempfile::TempDir;

const CLEAN_DEPENDENCIES: &str = r#"{"dependencies":[{"fileName":"app.jar","vulnerabilities":[]}]}"#;
const CLEAN_IMAGE: &str = r#"{"Results":[{"Target":"webapp:7"}]}"#;

fn trivy_report(critical: usize, high: usize) -> String {
    let vulns: Vec<String> = std::iter::repeat(r#"{"Severity":"CRITICAL"}"#)
        .take(critical)
        .chain(std::iter::repeat(r#"{"Severity":"HIGH"}"#).take(high))
        .map(str::to_string)
        .collect();
    format!(r#"{{"Results":[{{"Target":"webapp:7","Vulnerabilities":[{}]}}]}}"#, vulns.join(","))
}

fn dependency_report(critical: usize, high: usize) -> String {
    let vulns: Vec<String> = std::iter::repeat(r#"{"severity":"Critical"}"#)
        .take(critical)
        .chain(std::iter::repeat(r#"{"severity":"High"}"#).take(high))
        .map(str::to_string)
        .collect();
    format!(
        r#"{{"dependencies":[{{"fileName":"log4j-core.jar","vulnerabilities":[{}]}}]}}"#,
        vulns.join(",")
    )
}

/// Config with an ECR registry so every stage can build its commands.
fn config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.registry.ecr = Some(EcrConfig {
        account_id: "123456789012".to_string(),
        region: "us-east-1".to_string(),
        repository: "webapp".to_string(),
    });
    config.targets.api_definition = Some("http://app:8080/v3/api-docs".to_string());
    config
}

/// Invoker where every tool succeeds and the gated stages write clean reports.
fn clean_invoker() -> ScriptedInvoker {
    ScriptedInvoker::new()
        .on(
            "dependency-check",
            Scripted::ok().writes("dependency-check-report.json", CLEAN_DEPENDENCIES),
        )
        .on("trivy", Scripted::ok().writes("trivy-report.json", CLEAN_IMAGE))
}

struct Harness {
    _dir: TempDir,
    ctx: RunContext,
    invoker: Arc<ScriptedInvoker>,
    notifier: Arc<RecordingNotifier>,
    pipeline: Pipeline,
}

fn harness(invoker: ScriptedInvoker, variant: ScanVariant) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let ctx = RunContext::new("f00dfeed", 7, variant, ImageRef::new("webapp", "7"), dir.path());
    let invoker = Arc::new(invoker);
    let notifier = Arc::new(RecordingNotifier::new("recording"));
    let pipeline = Pipeline::new(Arc::new(config()), invoker.clone(), notifier.clone());
    Harness {
        _dir: dir,
        ctx,
        invoker,
        notifier,
        pipeline,
    }
}

impl Harness {
    async fn run(&self, plan: &StagePlan) -> RunReport {
        self.pipeline
            .run(self.ctx.clone(), plan, CancelSignal::never())
            .await
    }
}

fn stage_names(report: &RunReport) -> Vec<&str> {
    report.stages.iter().map(|s| s.stage.as_str()).collect()
}

/// Test: a clean run visits every stage in the fixed order and completes
#[tokio::test]
async fn test_stages_run_in_declared_order() {
    let h = harness(clean_invoker(), ScanVariant::Baseline);
    let report = h.run(&StagePlan::full()).await;

    assert_eq!(report.status, RunStatus::Completed);
    let expected: Vec<&str> = Stage::ALL.iter().map(Stage::name).collect();
    assert_eq!(stage_names(&report), expected);

    let programs = h.invoker.programs();
    let first = |p: &str| programs.iter().position(|x| x == p).unwrap();
    assert!(first("git") < first("mvn"));
    assert!(first("mvn") < first("dependency-check"));
    assert!(first("dependency-check") < first("hadolint"));
    assert!(first("hadolint") < first("trivy"));
    assert!(first("trivy") < first("aws"));
    assert_eq!(h.notifier.calls(), 1);
}

/// Test: a hard failure halts the sequence and nothing after it runs
#[tokio::test]
async fn test_hard_failure_halts_sequence() {
    let invoker = clean_invoker().on("-B test", Scripted::exit(1));
    let h = harness(invoker, ScanVariant::Baseline);
    let report = h.run(&StagePlan::full()).await;

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(stage_names(&report), vec!["checkout", "unit_test"]);
    let unit = &report.stages[1];
    assert!(unit.outcome.is_failed());
    assert_eq!(unit.exit_code, Some(1));
    assert_eq!(h.invoker.count_matching("sonar:sonar"), 0);
    assert_eq!(h.invoker.count_matching("docker"), 0);
    assert_eq!(h.notifier.calls(), 1);
    assert_eq!(h.notifier.last_status(), Some(RunStatus::Failed));
}

/// Test: a tool that cannot be started fails its stage instead of aborting the run
#[tokio::test]
async fn test_spawn_error_is_stage_failure() {
    let invoker = clean_invoker().on("hadolint", Scripted::spawn_error());
    let h = harness(invoker, ScanVariant::Baseline);
    let report = h.run(&StagePlan::full()).await;

    assert_eq!(report.status, RunStatus::Failed);
    let last = report.stages.last().unwrap();
    assert_eq!(last.stage, "image_lint");
    assert_eq!(last.exit_code, None);
    assert!(last.outcome.reason().unwrap().contains("hadolint"));
    assert_eq!(h.notifier.calls(), 1);
}

/// Test: image scan fails twice then succeeds after exactly three attempts
#[tokio::test(start_paused = true)]
async fn test_image_scan_retried_until_success() {
    let invoker = clean_invoker().on_sequence(
        "trivy",
        [
            Scripted::exit(1),
            Scripted::exit(1),
            Scripted::ok().writes("trivy-report.json", CLEAN_IMAGE),
        ],
    );
    let h = harness(invoker, ScanVariant::Baseline);
    let start = tokio::time::Instant::now();
    let report = h.run(&StagePlan::full()).await;

    assert_eq!(report.status, RunStatus::Completed);
    let scan = report.stages.iter().find(|s| s.stage == "image_scan").unwrap();
    assert_eq!(scan.attempts, 3);
    assert!(scan.passed());
    assert_eq!(h.invoker.count_matching("trivy image"), 3);
    assert!(start.elapsed() >= Duration::from_secs(20));
}

/// Test: retry gives up after three attempts and the run fails
#[tokio::test(start_paused = true)]
async fn test_image_scan_retry_exhausted() {
    let invoker = clean_invoker().on("trivy", Scripted::exit(1));
    let h = harness(invoker, ScanVariant::Baseline);
    let report = h.run(&StagePlan::full()).await;

    assert_eq!(report.status, RunStatus::Failed);
    let scan = report.stages.last().unwrap();
    assert_eq!(scan.stage, "image_scan");
    assert_eq!(scan.attempts, 3);
    assert_eq!(h.invoker.count_matching("trivy image"), 3);
    assert_eq!(h.invoker.count_matching("zap"), 0);
}

/// Test: only the image scan is retried
#[tokio::test(start_paused = true)]
async fn test_other_stages_not_retried() {
    let invoker = clean_invoker().on("package", Scripted::exit(1));
    let h = harness(invoker, ScanVariant::Baseline);
    let report = h.run(&StagePlan::full()).await;

    assert_eq!(report.stages.last().unwrap().attempts, 1);
    assert_eq!(h.invoker.count_matching("package"), 1);
}

/// Test: a failing dynamic scan degrades the run but publish still happens
#[tokio::test]
async fn test_dynamic_scan_failure_is_soft() {
    let invoker = clean_invoker().on("zap-baseline.py", Scripted::exit(2));
    let h = harness(invoker, ScanVariant::Baseline);
    let report = h.run(&StagePlan::full()).await;

    assert_eq!(report.status, RunStatus::Unstable);
    let zap = report.stages.iter().find(|s| s.stage == "dynamic_scan").unwrap();
    assert!(matches!(zap.outcome, StageOutcome::Unstable(_)));
    assert_eq!(report.stages.last().unwrap().stage, "publish");
    assert!(h.invoker.count_matching("docker push") > 0);
    assert_eq!(h.notifier.last_status(), Some(RunStatus::Unstable));
}

/// Test: dependency findings above the unstable band fail the gate and halt
#[tokio::test]
async fn test_dependency_gate_fail_halts() {
    let invoker = clean_invoker().on(
        "dependency-check",
        Scripted::ok().writes("dependency-check-report.json", dependency_report(3, 0)),
    );
    let h = harness(invoker, ScanVariant::Baseline);
    let report = h.run(&StagePlan::full()).await;

    assert_eq!(report.status, RunStatus::Failed);
    let audit = report.stages.last().unwrap();
    assert_eq!(audit.stage, "dependency_audit");
    assert!(audit.outcome.reason().unwrap().contains("critical"));
    assert_eq!(h.invoker.count_matching("package"), 0);
}

/// Test: image findings inside the unstable band degrade and the run continues
#[tokio::test]
async fn test_image_gate_unstable_continues() {
    let invoker = clean_invoker().on(
        "trivy",
        Scripted::ok().writes("trivy-report.json", trivy_report(0, 7)),
    );
    let h = harness(invoker, ScanVariant::Baseline);
    let report = h.run(&StagePlan::full()).await;

    assert_eq!(report.status, RunStatus::Unstable);
    let scan = report.stages.iter().find(|s| s.stage == "image_scan").unwrap();
    assert!(matches!(scan.outcome, StageOutcome::Unstable(_)));
    assert_eq!(scan.attempts, 1);
    assert_eq!(report.stages.len(), 10);
}

/// Test: a gated stage whose report is missing fails hard
#[tokio::test]
async fn test_missing_gate_report_fails() {
    let invoker = ScriptedInvoker::new();
    let h = harness(invoker, ScanVariant::Baseline);
    let report = h.run(&StagePlan::full()).await;

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.stages.last().unwrap().stage, "dependency_audit");
}

/// Test: a clean report left by an earlier build cannot pass the image gate
#[tokio::test]
async fn test_stale_image_report_does_not_pass_gate() {
    let invoker = ScriptedInvoker::new().on("trivy", Scripted::ok());
    let h = harness(invoker, ScanVariant::Baseline);
    std::fs::create_dir_all(h.ctx.reports_dir()).unwrap();
    std::fs::write(h.ctx.report_path("trivy-report.json"), r#"{"Results":[]}"#).unwrap();

    let report = h.run(&StagePlan::from_stages([Stage::ImageScan])).await;

    assert_eq!(report.status, RunStatus::Failed);
    let scan = &report.stages[0];
    assert!(scan.outcome.is_failed());
    assert!(scan.reports.is_empty());
    assert!(!h.ctx.report_path("trivy-report.json").exists());
}

/// Test: reports from an earlier build are not attached to this run
#[tokio::test]
async fn test_stale_reports_are_not_attached() {
    let h = harness(ScriptedInvoker::new(), ScanVariant::Baseline);
    let stale = h.ctx.report_path(ScanVariant::Baseline.report_file());
    std::fs::create_dir_all(h.ctx.reports_dir()).unwrap();
    std::fs::write(&stale, "<html>last week</html>").unwrap();

    let report = h.run(&StagePlan::from_stages([Stage::DynamicScan])).await;

    assert_eq!(report.status, RunStatus::Completed);
    assert!(report.stages[0].reports.is_empty());
    assert!(report.artifacts().is_empty());
    assert!(!stale.exists());
}

/// Test: the api variant runs the api scan and keeps its report
#[tokio::test]
async fn test_api_variant_uses_api_scan() {
    let invoker = clean_invoker().on(
        "zap-api-scan.py",
        Scripted::ok().writes("zap_api_report.html", "<html>api</html>"),
    );
    let h = harness(invoker, ScanVariant::Api);
    let report = h.run(&StagePlan::full()).await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(h.invoker.count_matching("zap-api-scan.py"), 1);
    assert_eq!(h.invoker.count_matching("zap-baseline.py"), 0);
    let zap = report.stages.iter().find(|s| s.stage == "dynamic_scan").unwrap();
    assert_eq!(zap.reports, vec![h.ctx.report_path("zap_api_report.html")]);
    assert!(report
        .artifacts()
        .iter()
        .any(|p| p.ends_with("zap_api_report.html")));
}

/// Test: cancelling mid-stage aborts the run and still notifies exactly once
#[tokio::test(start_paused = true)]
async fn test_cancellation_aborts_and_notifies_once() {
    let invoker = clean_invoker().on("docker build", Scripted::hang());
    let h = harness(invoker, ScanVariant::Baseline);
    let (handle, signal) = cancel_pair();
    let plan = StagePlan::full();

    let (report, ()) = tokio::join!(h.pipeline.run(h.ctx.clone(), &plan, signal), async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        handle.cancel();
    });

    assert_eq!(report.status, RunStatus::Aborted);
    let last = report.stages.last().unwrap();
    assert_eq!(last.stage, "image_build");
    assert_eq!(last.outcome, StageOutcome::Failed(CANCELLED.to_string()));
    assert_eq!(h.invoker.count_matching("hadolint"), 0);
    assert_eq!(h.notifier.calls(), 1);
    assert_eq!(h.notifier.last_status(), Some(RunStatus::Aborted));
}

/// Test: cancelling during the retry delay aborts without another attempt
#[tokio::test(start_paused = true)]
async fn test_cancellation_during_retry_delay() {
    let invoker = clean_invoker().on("trivy", Scripted::exit(1));
    let h = harness(invoker, ScanVariant::Baseline);
    let (handle, signal) = cancel_pair();
    let plan = StagePlan::from_stages([Stage::ImageScan, Stage::DynamicScan]);
    let start = tokio::time::Instant::now();

    // attempts run at 0s and 10s; 15s falls inside the second delay
    let (report, ()) = tokio::join!(h.pipeline.run(h.ctx.clone(), &plan, signal), async {
        tokio::time::sleep(Duration::from_secs(15)).await;
        handle.cancel();
    });

    assert_eq!(report.status, RunStatus::Aborted);
    assert_eq!(stage_names(&report), vec!["image_scan"]);
    assert_eq!(report.stages[0].outcome, StageOutcome::Failed(CANCELLED.to_string()));
    assert_eq!(h.invoker.count_matching("trivy image"), 2);
    assert_eq!(h.invoker.count_matching("zap"), 0);
    assert!(start.elapsed() < Duration::from_secs(20));
    assert_eq!(h.notifier.calls(), 1);
    assert_eq!(h.notifier.last_status(), Some(RunStatus::Aborted));
}

/// Test: cancelling the dynamic scan removes its container
#[tokio::test(start_paused = true)]
async fn test_cancelled_dynamic_scan_removes_container() {
    let invoker = clean_invoker().on("zap-baseline.py", Scripted::hang());
    let h = harness(invoker, ScanVariant::Baseline);
    let (handle, signal) = cancel_pair();
    let plan = StagePlan::from_stages([Stage::DynamicScan, Stage::Publish]);

    let (report, ()) = tokio::join!(h.pipeline.run(h.ctx.clone(), &plan, signal), async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        handle.cancel();
    });

    assert_eq!(report.status, RunStatus::Aborted);
    let name = secpipe_ci::zap_container_name(&h.ctx);
    assert_eq!(h.invoker.count_matching(&format!("--name {name}")), 1);
    assert_eq!(h.invoker.count_matching(&format!("docker rm -f {name}")), 1);
    assert_eq!(h.invoker.count_matching("docker push"), 0);
    assert_eq!(h.notifier.calls(), 1);
}

/// Test: a failing notifier never changes the run status
#[tokio::test]
async fn test_notifier_failure_does_not_change_status() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = RunContext::new("abc", 1, ScanVariant::Baseline, ImageRef::new("webapp", "1"), dir.path());
    let notifier = Arc::new(RecordingNotifier::failing("slack"));
    let pipeline = Pipeline::new(Arc::new(config()), Arc::new(clean_invoker()), notifier.clone());

    let report = pipeline
        .run(ctx, &StagePlan::full(), CancelSignal::never())
        .await;
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(notifier.calls(), 1);
}

/// Test: skipped stages are left out and the summary is written
#[tokio::test]
async fn test_skipped_stages_and_summary() {
    let h = harness(clean_invoker(), ScanVariant::Baseline);
    let plan = StagePlan::without_names(&["static_analysis", "publish"]).unwrap();
    let report = h.run(&plan).await;

    assert_eq!(report.stages.len(), 8);
    assert_eq!(h.invoker.count_matching("sonar"), 0);
    assert_eq!(h.invoker.count_matching("aws"), 0);

    let summary = h.ctx.report_path(SUMMARY_FILE);
    let parsed: RunReport = serde_json::from_slice(&std::fs::read(summary).unwrap()).unwrap();
    assert_eq!(parsed.status, RunStatus::Completed);
    assert_eq!(parsed.plan_digest, report.plan_digest);
}

/// Test: ECR login receives the password printed by the aws cli
#[tokio::test]
async fn test_ecr_login_uses_previous_stdout() {
    let invoker = clean_invoker().on("get-login-password", Scripted::ok().stdout("ecr-pass\n"));
    let h = harness(invoker, ScanVariant::Baseline);
    let plan = StagePlan::from_stages([Stage::Publish]);
    let report = h.run(&plan).await;

    assert_eq!(report.status, RunStatus::Completed);
    let login = h
        .invoker
        .calls()
        .into_iter()
        .find(|c| c.command_line().contains("docker login"))
        .unwrap();
    assert_eq!(login.stdin, Some(secpipe_ci::Stdin::Secret("ecr-pass".to_string())));
}
