//! Rich CLI display for `tether chat`
//!
//! Renders stream events as human-readable terminal output.
//! All output goes to stderr so stdout remains clean for piping.

use colored::Colorize;
use serde_json::Value;

use crate::agent::permissions::primary_argument;
use crate::client::ConnectionState;
use crate::doctor::{DiagnosticReport, Severity};
use crate::protocol::{
    ContentBlock, PermissionOutcome, PermissionRequest, StreamEvent, TurnResult,
};

/// Display handler for one chat turn
pub struct TurnDisplay {
    session_id: String,
    tool_calls: usize,
    tool_errors: usize,
}

impl TurnDisplay {
    /// Create a new display handler for the given session
    #[must_use]
    pub fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            tool_calls: 0,
            tool_errors: 0,
        }
    }

    /// Print the session header at the start of a turn
    pub fn print_header(&self) {
        eprintln!(
            "\n{} {}",
            "===".bold().cyan(),
            format!("Session: {}", self.session_id).bold().cyan()
        );
        eprintln!("{}", "─".repeat(50).dimmed());
    }

    /// Render a stream event to stderr
    pub fn render_event(&mut self, event: &StreamEvent) {
        for line in self.format_event(event) {
            eprintln!("{line}");
        }
    }

    /// Lines to print for `event`.
    pub fn format_event(&mut self, event: &StreamEvent) -> Vec<String> {
        match event {
            StreamEvent::System { model, .. } => model
                .as_ref()
                .map(|m| vec![format!("  {} {m}", "Model:".dimmed())])
                .unwrap_or_default(),
            StreamEvent::Assistant { content } => content
                .iter()
                .filter_map(|block| self.format_block(block))
                .collect(),
            StreamEvent::PermissionRequest(request) => vec![format!(
                "  {} {} wants to run{}",
                "?".yellow().bold(),
                request.tool_name.bold(),
                summarize_tool_input(&request.tool_name, &request.input).dimmed()
            )],
            StreamEvent::Result(result) => self.format_result(result),
            StreamEvent::Error {
                code,
                message,
                recoverable,
            } => {
                let tag = if *recoverable {
                    "warning".yellow().bold()
                } else {
                    "error".red().bold()
                };
                vec![format!("  {tag} [{}] {message}", code.as_str())]
            }
        }
    }

    fn format_block(&mut self, block: &ContentBlock) -> Option<String> {
        match block {
            ContentBlock::Text { text } if !text.trim().is_empty() => {
                Some(format!("  {}", truncate(text, 200)))
            }
            ContentBlock::ToolUse { name, input, .. } => {
                self.tool_calls += 1;
                Some(format!(
                    "  {} {}{}",
                    "▶".blue(),
                    name.bold(),
                    summarize_tool_input(name, input).dimmed()
                ))
            }
            ContentBlock::ToolResult {
                is_error: true,
                content,
                ..
            } => {
                self.tool_errors += 1;
                Some(format!(
                    "  {} {}",
                    "✗".red().bold(),
                    truncate(content, 100).red()
                ))
            }
            // Successful tool results, thinking, and blank text are not displayed
            ContentBlock::Text { .. }
            | ContentBlock::ToolResult { .. }
            | ContentBlock::Thinking { .. } => None,
        }
    }

    fn format_result(&self, result: &TurnResult) -> Vec<String> {
        let mut lines = vec!["─".repeat(50).dimmed().to_string()];

        let status = if result.is_error {
            "FAILED".red().bold().to_string()
        } else {
            "COMPLETED".green().bold().to_string()
        };
        lines.push(format!("  {status} {}", self.session_id.bold()));

        if let Some(text) = result.result.as_deref().filter(|t| !t.is_empty()) {
            lines.push(format!("  {}", truncate(text, 200)));
        }

        let duration_secs = result.duration_ms / 1000;
        let mins = duration_secs / 60;
        let secs = duration_secs % 60;
        lines.push(format!(
            "  {} {} turns | ${:.2} | {mins}m {secs}s | {} in / {} out tokens",
            "Stats:".dimmed(),
            result.num_turns,
            result.total_cost_usd,
            result.usage.input_tokens,
            result.usage.output_tokens,
        ));

        if self.tool_calls > 0 {
            lines.push(format!(
                "  {} {} tool call(s), {} failed",
                "Tools:".dimmed(),
                self.tool_calls,
                self.tool_errors
            ));
        }
        lines
    }

    /// Report a connection state change
    pub fn render_state(&self, state: ConnectionState) {
        if let ConnectionState::Reconnecting { attempt } = state {
            eprintln!(
                "  {} connection lost, reconnecting (attempt {attempt})",
                "⟳".yellow()
            );
        }
    }

    /// Report that the stream was interrupted and the turn restarted
    pub fn render_gap(&self) {
        eprintln!(
            "  {} stream interrupted; the turn will restart",
            "⚠".yellow().bold()
        );
    }

    /// Print the question asked for a pending permission request
    pub fn render_permission_prompt(&self, request: &PermissionRequest) {
        eprint!(
            "  Allow {} {}? [y]es / [n]o / [a]lways / [d]on't ever: ",
            request.tool_name.bold(),
            request.input_summary
        );
    }
}

/// The permission question currently put to the user, if any
///
/// Cleared by an answer or by the turn ending, so a prompt never outlives
/// the request it asks about.
#[derive(Debug, Default)]
pub struct PermissionPrompt {
    request: Option<PermissionRequest>,
}

impl PermissionPrompt {
    /// Create a prompt with nothing pending
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track an incoming event. Returns the request to ask about when the
    /// event opens a new question.
    pub fn observe(&mut self, event: &StreamEvent) -> Option<&PermissionRequest> {
        match event {
            StreamEvent::PermissionRequest(request) => {
                self.request = Some(request.clone());
                self.request.as_ref()
            }
            e if e.is_terminal() => {
                self.request = None;
                None
            }
            _ => None,
        }
    }

    /// The open question
    #[must_use]
    pub const fn pending(&self) -> Option<&PermissionRequest> {
        self.request.as_ref()
    }

    /// Whether an answer is being waited on
    #[must_use]
    pub const fn is_waiting(&self) -> bool {
        self.request.is_some()
    }

    /// Take a line typed by the user; `None` means stdin closed, which
    /// refuses rather than block the agent forever. Returns `None` while
    /// the answer is unusable and the question stays open.
    pub fn answer(&mut self, line: Option<&str>) -> Option<PermissionOutcome> {
        self.request.as_ref()?;
        let outcome = match line {
            Some(line) => parse_decision(line)?,
            None => PermissionOutcome::Deny,
        };
        self.request = None;
        Some(outcome)
    }

    /// Drop the open question
    pub fn clear(&mut self) {
        self.request = None;
    }
}

/// Map an answer typed at the permission prompt to an outcome.
#[must_use]
pub fn parse_decision(answer: &str) -> Option<PermissionOutcome> {
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Some(PermissionOutcome::Allow),
        "n" | "no" => Some(PermissionOutcome::Deny),
        "a" | "always" => Some(PermissionOutcome::AllowAlways),
        "d" | "never" => Some(PermissionOutcome::DenyAlways),
        _ => None,
    }
}

/// Print a `tether doctor` report
pub fn render_diagnostic_report(report: &DiagnosticReport) {
    if report.is_clean() {
        eprintln!("{} No issues found", "✓".green().bold());
        return;
    }

    for finding in &report.findings {
        let label = match finding.severity {
            Severity::Error => "error".red().bold(),
            Severity::Warning => "warning".yellow().bold(),
            Severity::Info => "info".blue().bold(),
        };
        eprintln!("{label} [{}] {}", finding.code, finding.message);
        if let Some(suggestion) = &finding.suggestion {
            eprintln!("  {} {suggestion}", "→".dimmed());
        }
    }

    eprintln!(
        "\n{} error(s), {} warning(s), {} suggestion(s)",
        report.error_count(),
        report.warning_count(),
        report.info_count()
    );
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{kept}...")
}

/// Summarize tool input as a short one-line string
fn summarize_tool_input(tool_name: &str, input: &Value) -> String {
    let Some(argument) = primary_argument(tool_name, input) else {
        return String::new();
    };
    match tool_name {
        "Bash" => format!(" `{}`", truncate(argument, 60)),
        "Grep" => format!(" /{argument}/"),
        _ => format!(" {}", truncate(argument, 80)),
    }
}
