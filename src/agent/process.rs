//! Agent subprocess handle
//!
//! `AgentLauncher` is the seam between the orchestrator and the agent
//! binary: it builds the command for a turn. `AgentProcess` owns the
//! spawned child, reads its stdout line by line, writes control lines to
//! its stdin, and captures stderr for failure reports.

use std::collections::VecDeque;
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command as TokioCommand};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::cli::{build_command, user_message_line, CommandOptions};

const STDERR_TAIL_CHARS: usize = 2000;

/// Builds the command for one agent turn
pub trait AgentLauncher: Send + Sync + 'static {
    /// The command to spawn for these options.
    fn command(&self, options: &CommandOptions) -> Command;
}

/// Launches the agent CLI named in the options
#[derive(Debug, Clone, Copy, Default)]
pub struct CliLauncher;

impl AgentLauncher for CliLauncher {
    fn command(&self, options: &CommandOptions) -> Command {
        build_command(options)
    }
}

/// How the process ended
#[derive(Debug, Clone, Default)]
pub struct ExitReport {
    /// Exit code, `None` if killed by a signal
    pub exit_code: Option<i32>,
    /// Tail of captured stderr
    pub stderr: String,
}

impl ExitReport {
    /// One-line description for error events.
    #[must_use]
    pub fn describe(&self) -> String {
        let status = self
            .exit_code
            .map_or_else(|| "killed by signal".to_string(), |c| format!("exit code {c}"));
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            format!("agent exited without a result ({status})")
        } else {
            format!("agent exited without a result ({status}): {stderr}")
        }
    }
}

/// A running agent turn
pub struct AgentProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    lines: Lines<BufReader<ChildStdout>>,
    stderr: Option<JoinHandle<String>>,
}

impl AgentProcess {
    /// Spawn the command and send the prompt as the first stdin message.
    ///
    /// A failure to write the prompt is logged, not returned: the process
    /// has already started and its exit is reported through stdout EOF.
    pub async fn spawn(cmd: Command, prompt: &str) -> Result<Self> {
        let program = cmd.get_program().to_string_lossy().into_owned();
        let mut tokio_cmd = TokioCommand::from(cmd);
        tokio_cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = tokio_cmd
            .spawn()
            .with_context(|| format!("Failed to spawn agent process '{program}'"))?;

        let stdout = child.stdout.take().context("Failed to capture stdout")?;
        let stdin = child.stdin.take().context("Failed to capture stdin")?;
        let stderr = child.stderr.take().context("Failed to capture stderr")?;

        let stderr_handle = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut captured = StderrTail::new(STDERR_TAIL_CHARS);
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(line = %line, "agent stderr");
                captured.push(line);
            }
            captured.into_string()
        });

        let mut process = Self {
            child,
            stdin: Some(stdin),
            lines: BufReader::new(stdout).lines(),
            stderr: Some(stderr_handle),
        };

        if let Err(e) = process.send_line(&user_message_line(prompt)).await {
            warn!(error = %e, "failed to write prompt to agent stdin");
        }

        Ok(process)
    }

    /// OS process id, if still running.
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Next stdout line, `None` at EOF.
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        self.lines.next_line().await
    }

    /// Write one line to the agent's stdin.
    pub async fn send_line(&mut self, line: &str) -> std::io::Result<()> {
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "agent stdin closed")
        })?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await
    }

    /// Kill the process immediately and collect its exit report.
    pub async fn kill(mut self) -> ExitReport {
        self.stdin.take();
        if let Err(e) = self.child.kill().await {
            debug!(error = %e, "agent kill failed, already exited");
        }
        self.report().await
    }

    /// Close stdin and give the process `grace` to exit before killing it.
    pub async fn shutdown(mut self, grace: Duration) -> ExitReport {
        self.stdin.take();
        if tokio::time::timeout(grace, self.child.wait()).await.is_err() {
            debug!("agent did not exit within grace period, killing");
            let _ = self.child.kill().await;
        }
        self.report().await
    }

    async fn report(&mut self) -> ExitReport {
        let exit_code = match self.child.try_wait() {
            Ok(Some(status)) => status.code(),
            _ => self.child.wait().await.ok().and_then(|s| s.code()),
        };
        let stderr = match self.stderr.take() {
            Some(handle) => tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .ok()
                .and_then(Result::ok)
                .unwrap_or_default(),
            None => String::new(),
        };
        ExitReport { exit_code, stderr }
    }
}

/// The most recent stderr lines, at most `max_chars` characters in total
struct StderrTail {
    lines: VecDeque<String>,
    chars: usize,
    max_chars: usize,
}

impl StderrTail {
    fn new(max_chars: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            chars: 0,
            max_chars,
        }
    }

    fn push(&mut self, line: String) {
        let line = tail(&line, self.max_chars);
        // joined with '\n', so every line but the first costs one extra char
        self.chars += line.chars().count() + usize::from(!self.lines.is_empty());
        self.lines.push_back(line);
        while self.chars > self.max_chars {
            let Some(front) = self.lines.pop_front() else {
                break;
            };
            self.chars -= front.chars().count() + usize::from(!self.lines.is_empty());
        }
    }

    fn into_string(self) -> String {
        Vec::from(self.lines).join("\n")
    }
}

fn tail(s: &str, max_chars: usize) -> String {
    let count = s.chars().count();
    if count <= max_chars {
        return s.to_string();
    }
    s.chars().skip(count - max_chars).collect()
}
