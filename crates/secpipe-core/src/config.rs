//! Pipeline configuration.
//!
//! A [`PipelineConfig`] is built once before the run and shared immutably with
//! the sequencer. Sources, in priority order:
//!
//! 1. Environment variables (`SECPIPE_SLACK_WEBHOOK`, `SECPIPE_EMAIL_TO`,
//!    `SECPIPE_APP_URL`, `SECPIPE_SONAR_HOST`)
//! 2. TOML file (`secpipe.toml` in the workspace, or `--config`)
//! 3. Built-in defaults
//!
//! Credentials never live in the file: the config only names the environment
//! variables that hold them (`sonar.token_env`, `registry.dockerhub.token_env`).

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::gate::GateThresholds;

/// Default config file name looked up in the workspace.
pub const DEFAULT_CONFIG_FILE: &str = "secpipe.toml";

/// Complete, immutable configuration of a pipeline run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub project: ProjectConfig,
    pub targets: TargetsConfig,
    pub sonar: SonarConfig,
    pub thresholds: ThresholdsConfig,
    pub retry: RetryConfig,
    pub timeouts: TimeoutsConfig,
    pub registry: RegistryConfig,
    pub notify: NotifyConfig,
    pub tools: ToolsConfig,
    pub stages: StagesConfig,
}

/// Project identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProjectConfig {
    /// Project name used for Dependency-Check and SonarQube.
    pub name: String,
    /// Local image name built by `docker build`.
    pub image_name: String,
    /// Dockerfile path relative to the workspace.
    pub dockerfile: String,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            name: "webapp".to_string(),
            image_name: "webapp".to_string(),
            dockerfile: "Dockerfile".to_string(),
        }
    }
}

/// Dynamic scan targets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TargetsConfig {
    /// URL of the deployed application for baseline and full scans.
    pub app_url: String,
    /// OpenAPI definition URL for the API scan.
    pub api_definition: Option<String>,
}

impl Default for TargetsConfig {
    fn default() -> Self {
        Self {
            app_url: "http://localhost:8080".to_string(),
            api_definition: None,
        }
    }
}

/// SonarQube server coordinates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SonarConfig {
    pub host_url: String,
    /// Defaults to `project.name`.
    pub project_key: Option<String>,
    /// Environment variable holding the analysis token.
    pub token_env: String,
}

impl Default for SonarConfig {
    fn default() -> Self {
        Self {
            host_url: "http://localhost:9000".to_string(),
            project_key: None,
            token_env: "SONAR_TOKEN".to_string(),
        }
    }
}

/// Gate thresholds for the two gated stages.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ThresholdsConfig {
    /// Dependency-Check findings.
    pub dependency: GateThresholds,
    /// Trivy image findings.
    pub image: GateThresholds,
}

/// Retry policy for the image scan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_secs: 10,
        }
    }
}

impl RetryConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }
}

/// Per-invocation timeouts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutsConfig {
    /// Applied to stages without an override. Zero disables the timeout.
    pub default_secs: u64,
    /// Overrides keyed by stage name.
    pub stages: BTreeMap<String, u64>,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            default_secs: 1800,
            stages: BTreeMap::new(),
        }
    }
}

impl TimeoutsConfig {
    pub fn for_stage(&self, stage: &str) -> u64 {
        self.stages.get(stage).copied().unwrap_or(self.default_secs)
    }
}

/// Registries the image is published to. Both are optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RegistryConfig {
    pub ecr: Option<EcrConfig>,
    pub dockerhub: Option<DockerHubConfig>,
}

/// AWS ECR coordinates. Credentials come from the AWS CLI environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EcrConfig {
    pub account_id: String,
    pub region: String,
    pub repository: String,
}

impl EcrConfig {
    pub fn registry_host(&self) -> String {
        format!("{}.dkr.ecr.{}.amazonaws.com", self.account_id, self.region)
    }

    pub fn repository_uri(&self) -> String {
        format!("{}/{}", self.registry_host(), self.repository)
    }
}

/// DockerHub coordinates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DockerHubConfig {
    pub username: String,
    pub repository: String,
    /// Environment variable holding the access token.
    #[serde(default = "default_dockerhub_token_env")]
    pub token_env: String,
}

fn default_dockerhub_token_env() -> String {
    "DOCKERHUB_TOKEN".to_string()
}

impl DockerHubConfig {
    pub fn repository_uri(&self) -> String {
        format!("{}/{}", self.username, self.repository)
    }
}

/// Notification channels. Unconfigured channels are skipped.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NotifyConfig {
    pub slack: Option<SlackConfig>,
    pub email: Option<EmailConfig>,
}

/// Slack incoming webhook.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SlackConfig {
    pub webhook_url: String,
    #[serde(default)]
    pub channel: Option<String>,
}

/// Email delivery through a sendmail-compatible program.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmailConfig {
    pub to: Vec<String>,
    #[serde(default = "default_email_from")]
    pub from: String,
    #[serde(default = "default_sendmail")]
    pub sendmail: String,
}

fn default_email_from() -> String {
    "secpipe@localhost".to_string()
}

fn default_sendmail() -> String {
    "sendmail".to_string()
}

/// External tool executables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ToolsConfig {
    pub git: String,
    pub maven: String,
    pub dependency_check: String,
    pub docker: String,
    pub hadolint: String,
    pub trivy: String,
    pub aws: String,
    pub zap_image: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            git: "git".to_string(),
            maven: "mvn".to_string(),
            dependency_check: "dependency-check".to_string(),
            docker: "docker".to_string(),
            hadolint: "hadolint".to_string(),
            trivy: "trivy".to_string(),
            aws: "aws".to_string(),
            zap_image: "ghcr.io/zaproxy/zaproxy:stable".to_string(),
        }
    }
}

/// Stage selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StagesConfig {
    /// Stage names removed from the plan.
    pub skip: Vec<String>,
}

impl PipelineConfig {
    /// Parse a TOML document; missing sections take their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Load from an explicit file, or from `secpipe.toml` in `workspace` when
    /// present, then apply environment overrides and validate.
    pub fn load(explicit: Option<&Path>, workspace: &Path) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => {
                let body = std::fs::read_to_string(path).map_err(|e| {
                    PipelineError::Config(format!("cannot read {}: {e}", path.display()))
                })?;
                Self::from_toml_str(&body)?
            }
            None => {
                let path = workspace.join(DEFAULT_CONFIG_FILE);
                if path.is_file() {
                    debug!(path = %path.display(), "loading workspace config");
                    Self::from_toml_str(&std::fs::read_to_string(&path)?)?
                } else {
                    debug!("no config file found, using defaults");
                    Self::default()
                }
            }
        };
        config.apply_env_with(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply `SECPIPE_*` overrides from a variable lookup.
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("SECPIPE_SLACK_WEBHOOK").filter(|v| !v.is_empty()) {
            match self.notify.slack.as_mut() {
                Some(slack) => slack.webhook_url = url,
                None => {
                    self.notify.slack = Some(SlackConfig {
                        webhook_url: url,
                        channel: None,
                    })
                }
            }
        }
        if let Some(to) = lookup("SECPIPE_EMAIL_TO").filter(|v| !v.is_empty()) {
            let recipients: Vec<String> = to
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            match self.notify.email.as_mut() {
                Some(email) => email.to = recipients,
                None => {
                    self.notify.email = Some(EmailConfig {
                        to: recipients,
                        from: default_email_from(),
                        sendmail: default_sendmail(),
                    })
                }
            }
        }
        if let Some(url) = lookup("SECPIPE_APP_URL").filter(|v| !v.is_empty()) {
            self.targets.app_url = url;
        }
        if let Some(url) = lookup("SECPIPE_SONAR_HOST").filter(|v| !v.is_empty()) {
            self.sonar.host_url = url;
        }
    }

    /// Reject configurations the sequencer cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(PipelineError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.project.image_name.trim().is_empty() {
            return Err(PipelineError::Config(
                "project.image_name must not be empty".to_string(),
            ));
        }
        self.thresholds.dependency.validate()?;
        self.thresholds.image.validate()?;
        if let Some(email) = &self.notify.email {
            if email.to.is_empty() {
                return Err(PipelineError::Config(
                    "notify.email.to needs at least one recipient".to_string(),
                ));
            }
        }
        if let Some(ecr) = &self.registry.ecr {
            if ecr.account_id.is_empty() || ecr.region.is_empty() || ecr.repository.is_empty() {
                return Err(PipelineError::Config(
                    "registry.ecr requires account_id, region and repository".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// SonarQube project key, falling back to the project name.
    pub fn sonar_project_key(&self) -> &str {
        self.sonar
            .project_key
            .as_deref()
            .unwrap_or(&self.project.name)
    }

    /// Copy with the Slack webhook masked, for display.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if let Some(slack) = copy.notify.slack.as_mut() {
            slack.webhook_url = "<redacted>".to_string();
        }
        copy
    }

    /// Render as TOML with secrets masked.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(&self.redacted())
            .map_err(|e| PipelineError::Config(format!("cannot render config: {e}")))
    }
}
