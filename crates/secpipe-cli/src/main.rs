//! secpipe - DevSecOps pipeline runner CLI
//!
//! The `secpipe` command builds, scans and publishes a container image by
//! sequencing external tools, then reports the outcome to Slack and email.
//!
//! ## Commands
//!
//! - `run`: Execute the pipeline
//! - `plan`: Show the stages and commands a run would execute
//! - `gate`: Evaluate a scanner report against thresholds
//! - `config`: Print the effective configuration

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn, Level};

use secpipe_ci::{
    cancel_pair, NotifierSet, Pipeline, ProcessInvoker, Secrets, StagePlan, ToolInvoker,
};
use secpipe_core::{
    evaluate_gate, parse_report, GateDecision, GateThresholds, ImageRef, PipelineConfig,
    ReportFormat, RunContext, RunStatus, ScanVariant, SeverityLimits, SUMMARY_FILE,
};

#[derive(Parser)]
#[command(name = "secpipe")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "DevSecOps build, scan and publish pipeline", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug)]
struct Target {
    /// Workspace containing the project sources
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Config file (default: secpipe.toml in the workspace, if present)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline
    Run {
        #[command(flatten)]
        target: Target,

        /// Commit to check out (default: the workspace HEAD)
        #[arg(long, env = "GIT_COMMIT")]
        commit: Option<String>,

        /// Build number, also the default image tag
        #[arg(long, env = "BUILD_NUMBER", default_value_t = 0)]
        build_number: u64,

        /// Dynamic scan variant: baseline, api or full
        #[arg(long, default_value = "baseline")]
        variant: ScanVariant,

        /// Image tag (default: the build number)
        #[arg(long)]
        tag: Option<String>,

        /// Stages to skip, comma-separated
        #[arg(long, value_delimiter = ',')]
        skip: Vec<String>,

        /// Exit with code 2 when the run is unstable
        #[arg(long)]
        strict: bool,

        /// Print the plan and exit without running anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Show the resolved stage plan and commands
    Plan {
        #[command(flatten)]
        target: Target,

        /// Dynamic scan variant: baseline, api or full
        #[arg(long, default_value = "baseline")]
        variant: ScanVariant,

        /// Stages to skip, comma-separated
        #[arg(long, value_delimiter = ',')]
        skip: Vec<String>,
    },

    /// Evaluate a scanner report against thresholds
    Gate {
        /// Report file
        report: PathBuf,

        /// Report format: trivy or dependency-check
        #[arg(short, long, default_value = "trivy")]
        format: ReportFormat,

        /// Critical findings allowed before the gate fails
        #[arg(long, default_value_t = 1)]
        fail_critical: u32,

        /// High findings allowed before the gate fails
        #[arg(long, default_value_t = 5)]
        fail_high: u32,

        /// Critical findings tolerated as unstable
        #[arg(long)]
        unstable_critical: Option<u32>,

        /// High findings tolerated as unstable
        #[arg(long)]
        unstable_high: Option<u32>,

        /// Exit with code 2 when the verdict is unstable
        #[arg(long)]
        strict: bool,
    },

    /// Print the effective configuration (secrets masked)
    Config {
        #[command(flatten)]
        target: Target,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    secpipe_core::init_tracing(cli.json, level);

    let code = match cli.command {
        Commands::Run {
            target,
            commit,
            build_number,
            variant,
            tag,
            skip,
            strict,
            dry_run,
        } => {
            let options = RunOptions {
                commit,
                build_number,
                variant,
                tag,
                skip,
                strict,
                dry_run,
            };
            cmd_run(&target, options).await?
        }
        Commands::Plan {
            target,
            variant,
            skip,
        } => cmd_plan(&target, variant, &skip)?,
        Commands::Gate {
            report,
            format,
            fail_critical,
            fail_high,
            unstable_critical,
            unstable_high,
            strict,
        } => {
            let thresholds = gate_thresholds(fail_critical, fail_high, unstable_critical, unstable_high);
            cmd_gate(&report, format, &thresholds, strict)?
        }
        Commands::Config { target } => cmd_config(&target)?,
    };
    Ok(ExitCode::from(code))
}

struct RunOptions {
    commit: Option<String>,
    build_number: u64,
    variant: ScanVariant,
    tag: Option<String>,
    skip: Vec<String>,
    strict: bool,
    dry_run: bool,
}

/// Process exit code for a terminal run status.
fn status_code(status: RunStatus, strict: bool) -> u8 {
    match status {
        RunStatus::Completed => 0,
        RunStatus::Unstable if strict => 2,
        RunStatus::Unstable => 0,
        RunStatus::Failed => 1,
        RunStatus::Aborted => 130,
    }
}

fn decision_code(decision: GateDecision, strict: bool) -> u8 {
    match decision {
        GateDecision::Pass => 0,
        GateDecision::Unstable if strict => 2,
        GateDecision::Unstable => 0,
        GateDecision::Fail => 1,
    }
}

/// Build thresholds from flags; one unstable flag implies the other at its
/// failure value.
fn gate_thresholds(
    fail_critical: u32,
    fail_high: u32,
    unstable_critical: Option<u32>,
    unstable_high: Option<u32>,
) -> GateThresholds {
    let fail = SeverityLimits::new(fail_critical, fail_high);
    if unstable_critical.is_none() && unstable_high.is_none() {
        return GateThresholds::strict(fail);
    }
    GateThresholds::with_unstable(
        fail,
        SeverityLimits::new(
            unstable_critical.unwrap_or(fail_critical),
            unstable_high.unwrap_or(fail_high),
        ),
    )
}

fn resolve_workspace(path: &Path) -> Result<PathBuf> {
    std::fs::canonicalize(path)
        .with_context(|| format!("Workspace {} not found", path.display()))
}

fn load_config(target: &Target, workspace: &Path) -> Result<PipelineConfig> {
    PipelineConfig::load(target.config.as_deref(), workspace).context("Failed to load configuration")
}

/// HEAD of the workspace repository.
fn detect_commit(workspace: &Path) -> Result<String> {
    let output = std::process::Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(workspace)
        .output()
        .context("Failed to run git rev-parse")?;
    if !output.status.success() {
        bail!("Cannot determine commit in {}; pass --commit", workspace.display());
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn print_plan(pipeline: &Pipeline, ctx: &RunContext, plan: &StagePlan) {
    println!("Image: {}", ctx.image.reference());
    println!("Scan variant: {}", ctx.variant);
    println!("Workspace: {}", ctx.workspace.display());
    println!();
    for (stage, invocations) in pipeline.describe(ctx, plan) {
        println!("{stage}");
        match invocations {
            Ok(invocations) => {
                for invocation in invocations {
                    println!("    $ {}", invocation.command_line());
                }
            }
            Err(e) => println!("    ! {e}"),
        }
    }
}

async fn cmd_run(target: &Target, options: RunOptions) -> Result<u8> {
    let workspace = resolve_workspace(&target.workspace)?;
    let config = load_config(target, &workspace)?;
    let commit = match options.commit {
        Some(commit) => commit,
        None => detect_commit(&workspace)?,
    };
    let tag = options
        .tag
        .unwrap_or_else(|| options.build_number.to_string());
    let ctx = RunContext::new(
        commit,
        options.build_number,
        options.variant,
        ImageRef::new(&config.project.image_name, tag),
        workspace,
    );

    let secrets = Secrets::from_env(&config);
    let invoker: Arc<dyn ToolInvoker> = Arc::new(ProcessInvoker::new());
    let notifiers = NotifierSet::from_config(&config, invoker.clone())
        .context("Failed to set up notifications")?;
    let pipeline = Pipeline::new(Arc::new(config), invoker, Arc::new(notifiers)).with_secrets(secrets);

    let plan = pipeline.plan(&options.skip)?;
    pipeline.check_plan(&ctx, &plan)?;

    if options.dry_run {
        print_plan(&pipeline, &ctx, &plan);
        return Ok(0);
    }

    let (handle, signal) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            handle.cancel();
        }
    });

    info!(stages = plan.len(), variant = %ctx.variant, "Starting pipeline");
    let report = pipeline.run(ctx, &plan, signal).await;

    println!("{}", report.render_text());
    println!(
        "Summary written to {}",
        report.context.report_path(SUMMARY_FILE).display()
    );
    Ok(status_code(report.status, options.strict))
}

fn cmd_plan(target: &Target, variant: ScanVariant, skip: &[String]) -> Result<u8> {
    let workspace = resolve_workspace(&target.workspace)?;
    let config = load_config(target, &workspace)?;
    let ctx = RunContext::new(
        "HEAD",
        0,
        variant,
        ImageRef::new(&config.project.image_name, "0"),
        workspace,
    );
    let invoker: Arc<dyn ToolInvoker> = Arc::new(ProcessInvoker::new());
    let pipeline = Pipeline::new(Arc::new(config), invoker, Arc::new(NotifierSet::new()));

    let plan = pipeline.plan(skip)?;
    print_plan(&pipeline, &ctx, &plan);
    if let Err(e) = pipeline.check_plan(&ctx, &plan) {
        println!();
        println!("Plan is not runnable: {e}");
        return Ok(1);
    }
    Ok(0)
}

fn cmd_gate(
    report: &Path,
    format: ReportFormat,
    thresholds: &GateThresholds,
    strict: bool,
) -> Result<u8> {
    thresholds.validate()?;
    let counts = parse_report(format, report)?;
    let verdict = evaluate_gate(&counts, thresholds);

    println!("Report: {} ({format})", report.display());
    println!("Findings: {counts}");
    println!("Gate: {}", verdict.decision.label());
    for violation in &verdict.violations {
        println!("  - {violation}");
    }
    Ok(decision_code(verdict.decision, strict))
}

fn cmd_config(target: &Target) -> Result<u8> {
    let workspace = resolve_workspace(&target.workspace)?;
    let config = load_config(target, &workspace)?;
    print!("{}", config.to_toml_string()?);
    Ok(0)
}
