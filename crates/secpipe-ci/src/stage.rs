//! Stage definitions and the commands each stage runs.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use secpipe_core::{
    GateThresholds, PipelineConfig, PipelineError, ReportFormat, Result, RunContext, ScanVariant,
    REPORTS_DIR,
};
use serde::{Deserialize, Serialize};

use crate::runner::{Invocation, Stdin};

/// Dependency-Check JSON report name.
pub const DEPENDENCY_REPORT_JSON: &str = "dependency-check-report.json";
/// Dependency-Check HTML report name.
pub const DEPENDENCY_REPORT_HTML: &str = "dependency-check-report.html";
/// Hadolint JSON report name.
pub const LINT_REPORT: &str = "hadolint-report.json";
/// Trivy JSON report name.
pub const IMAGE_SCAN_REPORT: &str = "trivy-report.json";

const CLEANUP_TIMEOUT_SECS: u64 = 60;

/// Pipeline stages, declared in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// git checkout --force <commit>
    Checkout,

    /// mvn -B test
    UnitTest,

    /// mvn -B sonar:sonar
    StaticAnalysis,

    /// dependency-check --scan . (gated)
    DependencyAudit,

    /// mvn -B package -DskipTests
    Package,

    /// docker build
    ImageBuild,

    /// hadolint Dockerfile
    ImageLint,

    /// trivy image (retried, gated)
    ImageScan,

    /// OWASP ZAP packaged scan (soft failure)
    DynamicScan,

    /// push to ECR and/or DockerHub
    Publish,
}

/// How a failing stage affects the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Halt the sequence.
    Hard,
    /// Degrade the run and continue.
    Soft,
}

/// Which configured thresholds a gate applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateKind {
    Dependency,
    Image,
}

/// Gate attached to a stage: which report to parse and how.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateSpec {
    pub kind: GateKind,
    pub format: ReportFormat,
    pub report_file: &'static str,
}

impl GateSpec {
    pub fn thresholds<'a>(&self, config: &'a PipelineConfig) -> &'a GateThresholds {
        match self.kind {
            GateKind::Dependency => &config.thresholds.dependency,
            GateKind::Image => &config.thresholds.image,
        }
    }
}

impl Stage {
    pub const ALL: [Stage; 10] = [
        Stage::Checkout,
        Stage::UnitTest,
        Stage::StaticAnalysis,
        Stage::DependencyAudit,
        Stage::Package,
        Stage::ImageBuild,
        Stage::ImageLint,
        Stage::ImageScan,
        Stage::DynamicScan,
        Stage::Publish,
    ];

    /// Get the stage name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Checkout => "checkout",
            Stage::UnitTest => "unit_test",
            Stage::StaticAnalysis => "static_analysis",
            Stage::DependencyAudit => "dependency_audit",
            Stage::Package => "package",
            Stage::ImageBuild => "image_build",
            Stage::ImageLint => "image_lint",
            Stage::ImageScan => "image_scan",
            Stage::DynamicScan => "dynamic_scan",
            Stage::Publish => "publish",
        }
    }

    /// Only the dynamic scan degrades instead of halting, for every variant.
    pub fn failure_policy(&self) -> FailurePolicy {
        match self {
            Stage::DynamicScan => FailurePolicy::Soft,
            _ => FailurePolicy::Hard,
        }
    }

    /// Only the image scan is retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Stage::ImageScan)
    }

    pub fn gate(&self) -> Option<GateSpec> {
        match self {
            Stage::DependencyAudit => Some(GateSpec {
                kind: GateKind::Dependency,
                format: ReportFormat::DependencyCheck,
                report_file: DEPENDENCY_REPORT_JSON,
            }),
            Stage::ImageScan => Some(GateSpec {
                kind: GateKind::Image,
                format: ReportFormat::Trivy,
                report_file: IMAGE_SCAN_REPORT,
            }),
            _ => None,
        }
    }

    /// Report files the stage is expected to leave in the reports directory.
    pub fn reports(&self, ctx: &RunContext) -> Vec<PathBuf> {
        match self {
            Stage::DependencyAudit => vec![
                ctx.report_path(DEPENDENCY_REPORT_JSON),
                ctx.report_path(DEPENDENCY_REPORT_HTML),
            ],
            Stage::ImageLint => vec![ctx.report_path(LINT_REPORT)],
            Stage::ImageScan => vec![ctx.report_path(IMAGE_SCAN_REPORT)],
            Stage::DynamicScan => vec![ctx.report_path(ctx.variant.report_file())],
            _ => Vec::new(),
        }
    }

    /// Command that tears down leftovers of this stage after cancellation.
    ///
    /// Killing `docker run` does not stop the ZAP container, so it is removed
    /// by name.
    pub fn cancel_cleanup(&self, ctx: &RunContext, config: &PipelineConfig) -> Option<Invocation> {
        match self {
            Stage::DynamicScan => Some(
                Invocation::new(&config.tools.docker)
                    .args(["rm".to_string(), "-f".to_string(), zap_container_name(ctx)])
                    .timeout_secs(CLEANUP_TIMEOUT_SECS),
            ),
            _ => None,
        }
    }

    /// Build the ordered invocations this stage runs.
    pub fn invocations(
        &self,
        ctx: &RunContext,
        config: &PipelineConfig,
        secrets: &Secrets,
    ) -> Result<Vec<Invocation>> {
        let tools = &config.tools;
        let timeout = config.timeouts.for_stage(self.name());
        let base = |program: &str| {
            Invocation::new(program)
                .cwd(&ctx.workspace)
                .timeout_secs(timeout)
        };

        let invocations = match self {
            Stage::Checkout => vec![base(&tools.git).args(["checkout", "--force", ctx.commit.as_str()])],
            Stage::UnitTest => vec![base(&tools.maven).args(["-B", "test"])],
            Stage::StaticAnalysis => {
                let mut inv = base(&tools.maven).args([
                    "-B".to_string(),
                    "sonar:sonar".to_string(),
                    format!("-Dsonar.projectKey={}", config.sonar_project_key()),
                    format!("-Dsonar.host.url={}", config.sonar.host_url),
                    format!("-Dsonar.projectVersion={}", ctx.build_number),
                ]);
                if let Some(token) = secrets.get(&config.sonar.token_env) {
                    inv = inv.env("SONAR_TOKEN", token);
                }
                vec![inv]
            }
            Stage::DependencyAudit => vec![base(&tools.dependency_check)
                .args([
                    "--project",
                    config.project.name.as_str(),
                    "--scan",
                    ".",
                    "--format",
                    "JSON",
                    "--format",
                    "HTML",
                    "--out",
                    REPORTS_DIR,
                ])
                .output(ctx.report_path(DEPENDENCY_REPORT_JSON))
                .output(ctx.report_path(DEPENDENCY_REPORT_HTML))],
            Stage::Package => vec![base(&tools.maven).args(["-B", "package", "-DskipTests"])],
            Stage::ImageBuild => vec![base(&tools.docker).args([
                "build".to_string(),
                "-f".to_string(),
                config.project.dockerfile.clone(),
                "-t".to_string(),
                ctx.image.reference(),
                ".".to_string(),
            ])],
            Stage::ImageLint => vec![base(&tools.hadolint)
                .args([
                    "--format",
                    "json",
                    "--failure-threshold",
                    "error",
                    config.project.dockerfile.as_str(),
                ])
                .stdout_to(ctx.report_path(LINT_REPORT))],
            Stage::ImageScan => {
                let report = ctx.report_path(IMAGE_SCAN_REPORT);
                vec![base(&tools.trivy)
                    .args([
                        "image".to_string(),
                        "--format".to_string(),
                        "json".to_string(),
                        "--no-progress".to_string(),
                        "--output".to_string(),
                        report.display().to_string(),
                        ctx.image.reference(),
                    ])
                    .output(report)]
            }
            Stage::DynamicScan => vec![dynamic_scan_invocation(ctx, config)?.timeout_secs(timeout)],
            Stage::Publish => publish_invocations(ctx, config, secrets)?
                .into_iter()
                .map(|inv| inv.cwd(&ctx.workspace).timeout_secs(timeout))
                .collect(),
        };
        Ok(invocations)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Stage {
    type Err = PipelineError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        Stage::ALL
            .iter()
            .copied()
            .find(|stage| stage.name() == wanted)
            .ok_or_else(|| PipelineError::InvalidPlan(format!("unknown stage '{}'", s.trim())))
    }
}

/// Container name of the run's ZAP scan.
pub fn zap_container_name(ctx: &RunContext) -> String {
    format!("secpipe-zap-{}", ctx.run_id)
}

fn dynamic_scan_invocation(ctx: &RunContext, config: &PipelineConfig) -> Result<Invocation> {
    let variant = ctx.variant;
    let mount = format!("{}:/zap/wrk:rw", ctx.reports_dir().display());
    let name = zap_container_name(ctx);
    let mut inv = Invocation::new(&config.tools.docker)
        .cwd(&ctx.workspace)
        .args(["run", "--rm", "--name", name.as_str(), "-v", mount.as_str()])
        .arg(config.tools.zap_image.as_str())
        .arg(variant.zap_script());

    inv = match variant {
        ScanVariant::Api => {
            let definition = config.targets.api_definition.as_deref().ok_or_else(|| {
                PipelineError::Config(
                    "the api scan variant requires targets.api_definition".to_string(),
                )
            })?;
            inv.args(["-t", definition, "-f", "openapi"])
        }
        ScanVariant::Baseline | ScanVariant::Full => {
            inv.args(["-t", config.targets.app_url.as_str()])
        }
    };

    Ok(inv
        .args(["-r", variant.report_file()])
        .output(ctx.report_path(variant.report_file())))
}

fn publish_invocations(
    ctx: &RunContext,
    config: &PipelineConfig,
    secrets: &Secrets,
) -> Result<Vec<Invocation>> {
    let docker = config.tools.docker.as_str();
    let local = ctx.image.reference();
    let mut steps = Vec::new();

    if let Some(ecr) = &config.registry.ecr {
        let host = ecr.registry_host();
        let remote = ecr.repository_uri();
        steps.push(Invocation::new(&config.tools.aws).args([
            "ecr",
            "get-login-password",
            "--region",
            ecr.region.as_str(),
        ]));
        steps.push(
            Invocation::new(docker)
                .args(["login", "--username", "AWS", "--password-stdin", host.as_str()])
                .stdin(Stdin::PreviousStdout),
        );
        steps.extend(tag_and_push(docker, &local, &remote, &ctx.image.tag));
    }

    if let Some(hub) = &config.registry.dockerhub {
        let token = secrets.get(&hub.token_env).ok_or_else(|| {
            PipelineError::Config(format!(
                "DockerHub publishing needs a token in ${}",
                hub.token_env
            ))
        })?;
        steps.push(
            Invocation::new(docker)
                .args(["login", "--username", hub.username.as_str(), "--password-stdin"])
                .stdin(Stdin::Secret(token.to_string())),
        );
        steps.extend(tag_and_push(docker, &local, &hub.repository_uri(), &ctx.image.tag));
    }

    if steps.is_empty() {
        return Err(PipelineError::Config(
            "publish needs registry.ecr or registry.dockerhub (or skip the publish stage)"
                .to_string(),
        ));
    }
    Ok(steps)
}

fn tag_and_push(docker: &str, local: &str, remote: &str, tag: &str) -> Vec<Invocation> {
    let mut steps = Vec::new();
    for remote_tag in [tag, "latest"] {
        let target = format!("{remote}:{remote_tag}");
        steps.push(Invocation::new(docker).args(["tag", local, target.as_str()]));
        steps.push(Invocation::new(docker).args(["push", target.as_str()]));
    }
    steps
}

/// Credential values looked up by environment variable name.
#[derive(Clone, Default)]
pub struct Secrets {
    values: HashMap<String, String>,
}

impl Secrets {
    /// Read the credential variables named in `config` from the process
    /// environment.
    pub fn from_env(config: &PipelineConfig) -> Self {
        let mut names = vec![config.sonar.token_env.clone()];
        if let Some(hub) = &config.registry.dockerhub {
            names.push(hub.token_env.clone());
        }
        let values = names
            .into_iter()
            .filter_map(|name| {
                std::env::var(&name)
                    .ok()
                    .filter(|v| !v.is_empty())
                    .map(|v| (name, v))
            })
            .collect();
        Self { values }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.values.keys()).finish()
    }
}

/// Ordered, deduplicated list of stages to run.
///
/// Whatever order stages are given in, the plan always runs them in the
/// canonical [`Stage::ALL`] order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePlan {
    stages: Vec<Stage>,
}

impl StagePlan {
    /// Every stage.
    pub fn full() -> Self {
        Self {
            stages: Stage::ALL.to_vec(),
        }
    }

    pub fn from_stages(stages: impl IntoIterator<Item = Stage>) -> Self {
        let mut stages: Vec<Stage> = stages.into_iter().collect();
        stages.sort();
        stages.dedup();
        Self { stages }
    }

    /// Full plan minus the named stages.
    pub fn without_names<S: AsRef<str>>(skip: &[S]) -> Result<Self> {
        let skipped = skip
            .iter()
            .map(|name| name.as_ref().parse::<Stage>())
            .collect::<Result<Vec<_>>>()?;
        let plan = Self::from_stages(Stage::ALL.into_iter().filter(|s| !skipped.contains(s)));
        if plan.is_empty() {
            return Err(PipelineError::InvalidPlan(
                "every stage was skipped".to_string(),
            ));
        }
        Ok(plan)
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.stages.iter().map(Stage::name).collect()
    }

    pub fn contains(&self, stage: Stage) -> bool {
        self.stages.contains(&stage)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}
