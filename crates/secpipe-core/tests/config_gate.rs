//! Workspace config loading and gating of on-disk scanner reports.

use secpipe_core::{
    evaluate_gate, parse_report, GateDecision, PipelineConfig, PipelineError, ReportFormat,
    SeverityLimits, DEFAULT_CONFIG_FILE,
};

const CONFIG: &str = r#"
[project]
name = "petclinic"
image_name = "petclinic"

[thresholds.image]
fail = { critical = 0, high = 3 }
unstable = { critical = 1, high = 8 }

[thresholds.dependency]
fail = { critical = 1, high = 5 }

[retry]
max_attempts = 5
"#;

fn trivy(severities: &[&str]) -> String {
    let vulns: Vec<String> = severities
        .iter()
        .map(|s| format!(r#"{{"Severity":"{s}"}}"#))
        .collect();
    format!(r#"{{"Results":[{{"Target":"petclinic","Vulnerabilities":[{}]}}]}}"#, vulns.join(","))
}

/// Test: secpipe.toml in the workspace is picked up and merged with defaults
#[test]
fn test_workspace_config_is_loaded() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(DEFAULT_CONFIG_FILE), CONFIG).unwrap();

    let config = PipelineConfig::load(None, dir.path()).unwrap();
    assert_eq!(config.project.image_name, "petclinic");
    assert_eq!(config.retry.max_attempts, 5);
    assert_eq!(config.retry.delay_secs, 10);
    assert_eq!(config.thresholds.image.fail, SeverityLimits::new(0, 3));
    assert_eq!(config.thresholds.dependency.unstable, None);
    assert_eq!(config.sonar_project_key(), "petclinic");
}

/// Test: without a config file every default applies
#[test]
fn test_missing_config_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig::load(None, dir.path()).unwrap();
    assert_eq!(config.project.dockerfile, "Dockerfile");
    assert_eq!(config.tools.trivy, "trivy");
}

/// Test: an explicit config path that does not exist is a config error
#[test]
fn test_explicit_missing_config_fails() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope.toml");
    let err = PipelineConfig::load(Some(missing.as_path()), dir.path()).unwrap_err();
    assert!(matches!(err, PipelineError::Config(_)));
}

/// Test: unstable limits stricter than fail limits are rejected at load time
#[test]
fn test_inverted_limits_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("inverted.toml");
    std::fs::write(
        &path,
        "[thresholds.image]\nfail = { critical = 2, high = 10 }\nunstable = { critical = 1, high = 5 }\n",
    )
    .unwrap();
    assert!(PipelineConfig::load(Some(path.as_path()), dir.path()).is_err());
}

/// Test: configured image thresholds drive the verdict on a Trivy report
#[test]
fn test_report_on_disk_against_configured_thresholds() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(DEFAULT_CONFIG_FILE), CONFIG).unwrap();
    let config = PipelineConfig::load(None, dir.path()).unwrap();
    let report = dir.path().join("trivy-report.json");

    std::fs::write(&report, trivy(&["HIGH", "HIGH", "MEDIUM"])).unwrap();
    let counts = parse_report(ReportFormat::Trivy, &report).unwrap();
    assert_eq!(evaluate_gate(&counts, &config.thresholds.image).decision, GateDecision::Pass);

    std::fs::write(&report, trivy(&["CRITICAL", "HIGH", "HIGH", "HIGH", "HIGH"])).unwrap();
    let counts = parse_report(ReportFormat::Trivy, &report).unwrap();
    assert_eq!(
        evaluate_gate(&counts, &config.thresholds.image).decision,
        GateDecision::Unstable
    );

    std::fs::write(&report, trivy(&["CRITICAL", "CRITICAL"])).unwrap();
    let counts = parse_report(ReportFormat::Trivy, &report).unwrap();
    assert_eq!(evaluate_gate(&counts, &config.thresholds.image).decision, GateDecision::Fail);
}

/// Test: a truncated report is a parse error naming the file
#[test]
fn test_truncated_report_is_parse_error() {
    let dir = tempfile::tempdir().unwrap();
    let report = dir.path().join("dependency-check-report.json");
    std::fs::write(&report, r#"{"dependencies": ["#).unwrap();
    let err = parse_report(ReportFormat::DependencyCheck, &report).unwrap_err();
    assert!(err.to_string().contains("dependency-check-report.json"));
}
