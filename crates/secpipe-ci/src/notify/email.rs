//! Email notifier: a MIME message piped to a sendmail-compatible program.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use secpipe_core::{EmailConfig, RunReport, SUMMARY_FILE};

use super::{Notifier, NotifyError};
use crate::runner::{Invocation, Stdin, ToolInvoker};

/// Base64 lines are wrapped at 76 characters.
const LINE_WIDTH: usize = 76;

pub struct EmailNotifier {
    config: EmailConfig,
    invoker: Arc<dyn ToolInvoker>,
}

impl EmailNotifier {
    pub fn new(config: EmailConfig, invoker: Arc<dyn ToolInvoker>) -> Self {
        Self { config, invoker }
    }

    /// Report artifacts plus the run summary, when present.
    fn attachments(report: &RunReport) -> Vec<PathBuf> {
        let mut files = report.artifacts();
        let summary = report.context.report_path(SUMMARY_FILE);
        if summary.is_file() && !files.contains(&summary) {
            files.push(summary);
        }
        files
    }

    /// Render the full message, headers included.
    pub fn render(&self, report: &RunReport) -> Result<String, NotifyError> {
        let boundary = format!("secpipe-{}", report.context.run_id.simple());
        let mut msg = String::new();
        let _ = writeln!(msg, "From: {}", self.config.from);
        let _ = writeln!(msg, "To: {}", self.config.to.join(", "));
        let _ = writeln!(msg, "Subject: {}", report.headline());
        let _ = writeln!(msg, "MIME-Version: 1.0");
        let _ = writeln!(msg, "Content-Type: multipart/mixed; boundary=\"{boundary}\"");
        let _ = writeln!(msg);
        let _ = writeln!(msg, "--{boundary}");
        let _ = writeln!(msg, "Content-Type: text/plain; charset=utf-8");
        let _ = writeln!(msg, "Content-Transfer-Encoding: 8bit");
        let _ = writeln!(msg);
        msg.push_str(&report.render_text());

        for path in Self::attachments(report) {
            let body = std::fs::read(&path)?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "report".to_string());
            let _ = writeln!(msg);
            let _ = writeln!(msg, "--{boundary}");
            let _ = writeln!(msg, "Content-Type: {}; name=\"{name}\"", content_type(&path));
            let _ = writeln!(msg, "Content-Transfer-Encoding: base64");
            let _ = writeln!(msg, "Content-Disposition: attachment; filename=\"{name}\"");
            let _ = writeln!(msg);
            let encoded = BASE64.encode(body);
            for chunk in encoded.as_bytes().chunks(LINE_WIDTH) {
                msg.push_str(&String::from_utf8_lossy(chunk));
                msg.push('\n');
            }
        }
        let _ = writeln!(msg, "--{boundary}--");
        Ok(msg)
    }
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => "application/json",
        Some("html") => "text/html",
        _ => "application/octet-stream",
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    fn channel(&self) -> &str {
        "email"
    }

    async fn notify(&self, report: &RunReport) -> Result<(), NotifyError> {
        if self.config.to.is_empty() {
            return Err(NotifyError::Invocation("no recipients configured".to_string()));
        }
        let message = self.render(report)?;
        let invocation = Invocation::new(&self.config.sendmail)
            .args(["-t", "-i"])
            .stdin(Stdin::Text(message))
            .timeout_secs(60);

        let output = self
            .invoker
            .invoke(&invocation)
            .await
            .map_err(|e| NotifyError::Invocation(e.to_string()))?;
        if !output.success() {
            return Err(NotifyError::Invocation(format!(
                "{} exited with code {}: {}",
                self.config.sendmail,
                output.exit_code,
                output.last_error_line().unwrap_or("no output")
            )));
        }
        Ok(())
    }
}
