//! Tool invocation: run one external command and capture what it produced.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use secpipe_core::{PipelineError, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Data fed to a command's stdin.
#[derive(Clone, PartialEq, Eq)]
pub enum Stdin {
    /// Plain text, safe to show in logs.
    Text(String),

    /// Credential material; never printed.
    Secret(String),

    /// Trimmed stdout of the previous invocation in the same stage
    /// (e.g. a registry password fed to `docker login --password-stdin`).
    PreviousStdout,
}

impl fmt::Debug for Stdin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stdin::Text(text) => write!(f, "Text({} bytes)", text.len()),
            Stdin::Secret(_) => f.write_str("Secret(<redacted>)"),
            Stdin::PreviousStdout => f.write_str("PreviousStdout"),
        }
    }
}

/// A single external command.
#[derive(Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Executable name or path.
    pub program: String,

    /// Arguments, never containing credentials.
    pub args: Vec<String>,

    /// Working directory (inherited when `None`).
    pub cwd: Option<PathBuf>,

    /// Extra environment; values may be secret and are not printed.
    pub env: Vec<(String, String)>,

    /// Optional stdin payload.
    pub stdin: Option<Stdin>,

    /// File that receives the captured stdout.
    pub stdout_to: Option<PathBuf>,

    /// Files the command is expected to write.
    pub outputs: Vec<PathBuf>,

    /// Timeout in seconds; zero disables it.
    pub timeout_secs: u64,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            stdin: None,
            stdout_to: None,
            outputs: Vec::new(),
            timeout_secs: 0,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, stdin: Stdin) -> Self {
        self.stdin = Some(stdin);
        self
    }

    pub fn stdout_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout_to = Some(path.into());
        self
    }

    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.outputs.push(path.into());
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Shell-like rendering of program and arguments, for logs and plans.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(|part| {
                if part.is_empty() || part.contains(char::is_whitespace) {
                    format!("'{part}'")
                } else {
                    part.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Declared output files plus the stdout capture file.
    pub fn expected_files(&self) -> impl Iterator<Item = &Path> {
        self.outputs
            .iter()
            .chain(self.stdout_to.iter())
            .map(PathBuf::as_path)
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("command", &self.command_line())
            .field("cwd", &self.cwd)
            .field("env", &self.env.iter().map(|(k, _)| k).collect::<Vec<_>>())
            .field("stdin", &self.stdin)
            .field("stdout_to", &self.stdout_to)
            .field("outputs", &self.outputs)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

/// What an invocation left behind.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    /// Exit code (-1 when killed by a signal).
    pub exit_code: i32,

    /// Captured stdout.
    pub stdout: String,

    /// Captured stderr.
    pub stderr: String,

    /// Duration in milliseconds.
    pub duration_ms: u64,

    /// Expected files that exist after the command finished.
    pub produced: Vec<PathBuf>,
}

impl ToolOutput {
    /// Whether the command exited with status 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last non-empty line of stderr (or stdout), for failure messages.
    pub fn last_error_line(&self) -> Option<&str> {
        self.stderr
            .lines()
            .chain(self.stdout.lines())
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
    }
}

/// Runs external commands on behalf of stages and notifiers.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Run the command to completion.
    ///
    /// A non-zero exit is reported through [`ToolOutput::exit_code`]; `Err` is
    /// reserved for commands that could not run (spawn failure, timeout, I/O).
    async fn invoke(&self, invocation: &Invocation) -> Result<ToolOutput>;
}

/// Production invoker backed by `tokio::process`.
///
/// Children are spawned with `kill_on_drop`, so dropping the invoke future
/// (cancellation or timeout) terminates the external process.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessInvoker;

impl ProcessInvoker {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ToolInvoker for ProcessInvoker {
    async fn invoke(&self, invocation: &Invocation) -> Result<ToolOutput> {
        let start = Instant::now();

        for path in invocation.expected_files() {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);
        if let Some(cwd) = &invocation.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &invocation.env {
            command.env(key, value);
        }

        debug!(command = %invocation.command_line(), "spawning");
        let mut child = command.spawn().map_err(|source| PipelineError::Spawn {
            program: invocation.program.clone(),
            source,
        })?;

        let payload: &[u8] = match &invocation.stdin {
            Some(Stdin::Text(text)) | Some(Stdin::Secret(text)) => text.as_bytes(),
            // resolved by the caller; nothing left to feed here
            Some(Stdin::PreviousStdout) | None => &[],
        };
        let stdin = child.stdin.take();

        // stdin is fed while output drains, all under the timeout
        let completion = async {
            let feed = async move {
                let Some(mut handle) = stdin else {
                    return Ok(());
                };
                match handle.write_all(payload).await {
                    // the child exited or closed stdin without reading everything
                    Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
                    Err(e) => Err(e),
                    Ok(()) => handle.shutdown().await,
                }
            };
            let (fed, output) = tokio::join!(feed, child.wait_with_output());
            fed.and(output)
        };

        let output = if invocation.timeout_secs > 0 {
            tokio::time::timeout(Duration::from_secs(invocation.timeout_secs), completion)
                .await
                .map_err(|_| PipelineError::Timeout {
                    program: invocation.program.clone(),
                    timeout_secs: invocation.timeout_secs,
                })??
        } else {
            completion.await?
        };

        if let Some(path) = &invocation.stdout_to {
            tokio::fs::write(path, &output.stdout).await?;
        }

        let produced = invocation
            .expected_files()
            .filter(|p| p.exists())
            .map(Path::to_path_buf)
            .collect();

        Ok(ToolOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
            produced,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line_quotes_whitespace() {
        let inv = Invocation::new("docker")
            .args(["build", "-t", "webapp:1"])
            .arg("my dir");
        assert_eq!(inv.command_line(), "docker build -t webapp:1 'my dir'");
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let inv = Invocation::new("docker")
            .args(["login", "--password-stdin"])
            .env("SONAR_TOKEN", "sq-topsecret")
            .stdin(Stdin::Secret("hunter2".to_string()));
        let rendered = format!("{inv:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("sq-topsecret"));
        assert!(rendered.contains("SONAR_TOKEN"));
    }

    #[test]
    fn test_last_error_line_prefers_stderr() {
        let out = ToolOutput {
            exit_code: 1,
            stdout: "building\n".to_string(),
            stderr: "warning\nERROR: no space left\n\n".to_string(),
            ..ToolOutput::default()
        };
        assert_eq!(out.last_error_line(), Some("ERROR: no space left"));
    }

    #[tokio::test]
    async fn test_execute_simple_command() {
        let inv = Invocation::new("echo").arg("hello").timeout_secs(60);
        let out = ProcessInvoker.invoke(&inv).await.expect("invoke failed");
        assert!(out.success());
        assert!(out.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn test_execute_failing_command() {
        let inv = Invocation::new("false").timeout_secs(60);
        let out = ProcessInvoker.invoke(&inv).await.expect("invoke failed");
        assert!(!out.success());
        assert_ne!(out.exit_code, 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_error() {
        let inv = Invocation::new("/nonexistent-binary-that-does-not-exist");
        let err = ProcessInvoker.invoke(&inv).await.unwrap_err();
        assert!(matches!(err, PipelineError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_timeout_is_error() {
        let inv = Invocation::new("sleep").arg("5").timeout_secs(1);
        let err = ProcessInvoker.invoke(&inv).await.unwrap_err();
        assert!(matches!(err, PipelineError::Timeout { timeout_secs: 1, .. }));
    }

    #[tokio::test]
    async fn test_stdout_capture_and_produced_files() {
        let dir = tempfile::tempdir().unwrap();
        let capture = dir.path().join("reports").join("lint.json");
        let missing = dir.path().join("reports").join("never-written.html");
        let inv = Invocation::new("echo")
            .arg("[]")
            .stdout_to(&capture)
            .output(&missing);

        let out = ProcessInvoker.invoke(&inv).await.unwrap();
        assert_eq!(std::fs::read_to_string(&capture).unwrap().trim(), "[]");
        assert_eq!(out.produced, vec![capture]);
    }

    #[tokio::test]
    async fn test_stdin_is_fed() {
        let inv = Invocation::new("cat").stdin(Stdin::Secret("from-stdin".to_string()));
        let out = ProcessInvoker.invoke(&inv).await.unwrap();
        assert_eq!(out.stdout, "from-stdin");
    }

    #[tokio::test]
    async fn test_timeout_covers_unread_stdin() {
        // far larger than a pipe buffer; sleep never reads it
        let payload = "x".repeat(4 * 1024 * 1024);
        let inv = Invocation::new("sleep")
            .arg("5")
            .stdin(Stdin::Text(payload))
            .timeout_secs(1);

        let start = Instant::now();
        let err = ProcessInvoker.invoke(&inv).await.unwrap_err();
        assert!(matches!(err, PipelineError::Timeout { timeout_secs: 1, .. }));
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_large_stdin_round_trips_through_cat() {
        let payload = "y".repeat(1024 * 1024);
        let inv = Invocation::new("cat")
            .stdin(Stdin::Text(payload.clone()))
            .timeout_secs(30);
        let out = ProcessInvoker.invoke(&inv).await.unwrap();
        assert_eq!(out.stdout.len(), payload.len());
    }

    #[tokio::test]
    async fn test_cwd_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let inv = Invocation::new("ls").cwd(dir.path());
        let out = ProcessInvoker.invoke(&inv).await.unwrap();
        assert!(out.stdout.contains("marker.txt"));
    }
}
