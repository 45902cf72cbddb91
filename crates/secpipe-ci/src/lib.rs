//! secpipe CI - build, scan and publish pipeline runner
//!
//! Provides the pipeline orchestrator that:
//! - Runs Maven, Dependency-Check, Docker, Hadolint, Trivy and OWASP ZAP stages in a fixed order
//! - Retries the image scan and gates dependency and image findings
//! - Notifies Slack and email once per run, whatever the outcome

pub mod fakes;
pub mod notify;
pub mod pipeline;
pub mod retry;
pub mod runner;
pub mod stage;

// Re-export key types
pub use notify::{EmailNotifier, Notifier, NotifierSet, NotifyError, SlackNotifier};
pub use pipeline::{cancel_pair, CancelHandle, CancelSignal, Pipeline, CANCELLED};
pub use retry::{retry, RetryOutcome, RetryPolicy};
pub use runner::{Invocation, ProcessInvoker, Stdin, ToolInvoker, ToolOutput};
pub use stage::{zap_container_name, FailurePolicy, GateKind, GateSpec, Secrets, Stage, StagePlan};
