//! Run notifications.
//!
//! Every configured channel is notified once per run, whatever the terminal
//! status. Channel failures are collected into one error, logged once by the
//! caller and never retried; they never change the run status.

mod email;
mod slack;

use std::sync::Arc;

use async_trait::async_trait;
use secpipe_core::{PipelineConfig, RunReport};
use tracing::{debug, info};

use crate::runner::ToolInvoker;

pub use email::EmailNotifier;
pub use slack::SlackNotifier;

/// Errors from a notification channel.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("channel rejected the message with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("mailer failed: {0}")]
    Invocation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// One or more channels of a [`NotifierSet`] failed.
    #[error("notification failed on {}: {first}", .failed.join(", "))]
    Channels {
        failed: Vec<String>,
        first: Box<NotifyError>,
    },
}

/// A destination for run reports.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Short channel name used in logs ("slack", "email").
    fn channel(&self) -> &str;

    /// Deliver the report.
    async fn notify(&self, report: &RunReport) -> Result<(), NotifyError>;
}

/// Fan-out over every configured channel.
#[derive(Default)]
pub struct NotifierSet {
    channels: Vec<Arc<dyn Notifier>>,
}

impl NotifierSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, channel: Arc<dyn Notifier>) -> Self {
        self.channels.push(channel);
        self
    }

    /// Build the channels named in `config.notify`; unconfigured channels are
    /// skipped.
    pub fn from_config(
        config: &PipelineConfig,
        invoker: Arc<dyn ToolInvoker>,
    ) -> Result<Self, NotifyError> {
        let mut set = Self::new();
        match &config.notify.slack {
            Some(slack) => set = set.with(Arc::new(SlackNotifier::new(slack.clone())?)),
            None => debug!(channel = "slack", "notification channel not configured"),
        }
        match &config.notify.email {
            Some(email) => set = set.with(Arc::new(EmailNotifier::new(email.clone(), invoker))),
            None => debug!(channel = "email", "notification channel not configured"),
        }
        Ok(set)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[async_trait]
impl Notifier for NotifierSet {
    fn channel(&self) -> &str {
        "all"
    }

    /// Send to every channel. After all channels have been attempted, any
    /// failures come back as one [`NotifyError::Channels`].
    async fn notify(&self, report: &RunReport) -> Result<(), NotifyError> {
        if self.channels.is_empty() {
            info!("no notification channels configured");
            return Ok(());
        }

        let mut failed = Vec::new();
        let mut first_error = None;
        for channel in &self.channels {
            match channel.notify(report).await {
                Ok(()) => info!(channel = %channel.channel(), status = %report.status, "notification sent"),
                Err(err) => {
                    failed.push(channel.channel().to_string());
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(first) => Err(NotifyError::Channels {
                failed,
                first: Box::new(first),
            }),
            None => Ok(()),
        }
    }
}
