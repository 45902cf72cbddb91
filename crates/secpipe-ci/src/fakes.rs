//! In-memory test doubles for the invoker and notifier seams.
//!
//! `ScriptedInvoker` never spawns anything: each invocation is matched
//! against substring rules on its command line and answered from a script.
//! `RecordingNotifier` counts deliveries and keeps the last report.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use secpipe_core::{PipelineError, Result, RunReport, RunStatus};

use crate::notify::{Notifier, NotifyError};
use crate::runner::{Invocation, ToolInvoker, ToolOutput};

/// Scripted response to one invocation.
#[derive(Debug, Clone, Default)]
pub struct Scripted {
    exit_code: i32,
    stdout: String,
    stderr: String,
    /// (file name, contents) written when the invocation declares that file.
    files: Vec<(String, String)>,
    hang: bool,
    spawn_error: bool,
}

impl Scripted {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn exit(code: i32) -> Self {
        Self {
            exit_code: code,
            stderr: format!("exited with {code}"),
            ..Self::default()
        }
    }

    /// Never completes; only cancellation ends it.
    pub fn hang() -> Self {
        Self {
            hang: true,
            ..Self::default()
        }
    }

    /// The program could not be started.
    pub fn spawn_error() -> Self {
        Self {
            spawn_error: true,
            ..Self::default()
        }
    }

    pub fn stdout(mut self, stdout: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self
    }

    pub fn writes(mut self, file_name: impl Into<String>, contents: impl Into<String>) -> Self {
        self.files.push((file_name.into(), contents.into()));
        self
    }
}

struct Rule {
    pattern: String,
    responses: VecDeque<Scripted>,
}

/// Invoker answering from substring rules; unmatched commands succeed.
///
/// Rules added later take precedence over earlier ones.
#[derive(Default)]
pub struct ScriptedInvoker {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<Invocation>>,
}

impl ScriptedInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands containing `pattern` with `response`, forever.
    pub fn on(self, pattern: impl Into<String>, response: Scripted) -> Self {
        self.on_sequence(pattern, [response])
    }

    /// Answer matching commands with `responses` in order; the last one repeats.
    pub fn on_sequence(
        self,
        pattern: impl Into<String>,
        responses: impl IntoIterator<Item = Scripted>,
    ) -> Self {
        if let Ok(mut rules) = self.rules.lock() {
            rules.push(Rule {
                pattern: pattern.into(),
                responses: responses.into_iter().collect(),
            });
        }
        self
    }

    /// Every invocation received so far, in order.
    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Program names received so far, in order.
    pub fn programs(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.program).collect()
    }

    /// Number of invocations whose command line contains `pattern`.
    pub fn count_matching(&self, pattern: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.command_line().contains(pattern))
            .count()
    }

    fn next_response(&self, command_line: &str) -> Scripted {
        let Ok(mut rules) = self.rules.lock() else {
            return Scripted::ok();
        };
        let Some(rule) = rules
            .iter_mut()
            .rev()
            .find(|r| command_line.contains(&r.pattern)) else {
            return Scripted::ok();
        };
        if rule.responses.len() > 1 {
            rule.responses.pop_front().unwrap_or_default()
        } else {
            rule.responses.front().cloned().unwrap_or_default()
        }
    }
}

#[async_trait]
impl ToolInvoker for ScriptedInvoker {
    async fn invoke(&self, invocation: &Invocation) -> Result<ToolOutput> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(invocation.clone());
        }
        let response = self.next_response(&invocation.command_line());

        if response.spawn_error {
            return Err(PipelineError::Spawn {
                program: invocation.program.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "not installed"),
            });
        }
        if response.hang {
            std::future::pending::<()>().await;
        }

        let mut produced = Vec::new();
        for path in invocation.expected_files() {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            if let Some((_, contents)) = response.files.iter().find(|(f, _)| f == name) {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, contents)?;
            }
            if path.exists() {
                produced.push(path.to_path_buf());
            }
        }

        Ok(ToolOutput {
            exit_code: response.exit_code,
            stdout: response.stdout,
            stderr: response.stderr,
            duration_ms: 0,
            produced,
        })
    }
}

/// Notifier that records deliveries.
pub struct RecordingNotifier {
    channel: String,
    fail: bool,
    calls: AtomicUsize,
    last: Mutex<Option<RunReport>>,
}

impl RecordingNotifier {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            fail: false,
            calls: AtomicUsize::new(0),
            last: Mutex::new(None),
        }
    }

    /// A channel that always rejects the message.
    pub fn failing(channel: impl Into<String>) -> Self {
        Self {
            fail: true,
            ..Self::new(channel)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_report(&self) -> Option<RunReport> {
        self.last.lock().ok().and_then(|r| r.clone())
    }

    pub fn last_status(&self) -> Option<RunStatus> {
        self.last_report().map(|r| r.status)
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn channel(&self) -> &str {
        &self.channel
    }

    async fn notify(&self, report: &RunReport) -> std::result::Result<(), NotifyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last.lock() {
            *last = Some(report.clone());
        }
        if self.fail {
            return Err(NotifyError::Rejected {
                status: 500,
                body: "scripted failure".to_string(),
            });
        }
        Ok(())
    }
}
