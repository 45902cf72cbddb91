//! Slack incoming-webhook notifier.

use std::time::Duration;

use async_trait::async_trait;
use secpipe_core::{RunReport, RunStatus, SlackConfig};
use serde_json::{json, Value};

use super::{Notifier, NotifyError};

const USER_AGENT: &str = concat!("secpipe/", env!("CARGO_PKG_VERSION"));

pub struct SlackNotifier {
    config: SlackConfig,
    http_client: reqwest::Client,
}

impl SlackNotifier {
    pub fn new(config: SlackConfig) -> Result<Self, NotifyError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            config,
            http_client,
        })
    }

    /// Attachment-style message body.
    pub fn payload(&self, report: &RunReport) -> Value {
        let artifacts: Vec<String> = report
            .artifacts()
            .iter()
            .filter_map(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .collect();

        let mut fields = vec![
            json!({ "title": "Image", "value": report.context.image.reference(), "short": true }),
            json!({ "title": "Scan", "value": report.context.variant.name(), "short": true }),
            json!({
                "title": "Stages",
                "value": format!("{}/{} passed", report.passed_count(), report.stages.len()),
                "short": true,
            }),
        ];
        if let Some(stage) = report.stages.iter().rev().find(|s| !s.passed()) {
            fields.push(json!({
                "title": stage.stage,
                "value": stage.outcome.reason().unwrap_or_default(),
                "short": false,
            }));
        }
        if !artifacts.is_empty() {
            fields.push(json!({ "title": "Reports", "value": artifacts.join(", "), "short": false }));
        }

        let mut payload = json!({
            "text": report.headline(),
            "attachments": [{
                "color": colour(report.status),
                "fields": fields,
                "footer": format!("run {}", report.context.run_id),
            }],
        });
        if let Some(channel) = &self.config.channel {
            payload["channel"] = json!(channel);
        }
        payload
    }
}

fn colour(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Completed => "good",
        RunStatus::Unstable => "warning",
        RunStatus::Failed | RunStatus::Aborted => "danger",
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    fn channel(&self) -> &str {
        "slack"
    }

    async fn notify(&self, report: &RunReport) -> Result<(), NotifyError> {
        let response = self
            .http_client
            .post(&self.config.webhook_url)
            .json(&self.payload(report))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(NotifyError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}
