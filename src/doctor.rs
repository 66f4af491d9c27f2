//! Tether doctor: diagnostics and health checks
//!
//! Inspects `tether.toml`, the agent installation, and the turn history to
//! diagnose issues and suggest fixes. Returns a structured report with
//! categories: errors (must fix), warnings (should fix), info (suggestions).

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use crate::agent::permissions::ToolPattern;
use crate::config::TetherConfig;
use crate::protocol::PermissionMode;
use crate::store::{TurnRecord, TurnStatus};

/// Severity level for a diagnostic finding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Severity {
    /// Must fix: something is broken
    Error,
    /// Should fix: suboptimal configuration
    Warning,
    /// Suggestion
    Info,
}

/// A single diagnostic finding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    /// Severity of the finding
    pub severity: Severity,
    /// Short code for the finding (e.g., "D001")
    pub code: String,
    /// Human-readable message
    pub message: String,
    /// Suggested fix (optional)
    pub suggestion: Option<String>,
}

/// Diagnostic report from `tether doctor`
#[derive(Debug, Clone)]
pub struct DiagnosticReport {
    /// All findings, in order of severity (errors first)
    pub findings: Vec<Finding>,
}

impl DiagnosticReport {
    /// Returns true if the report has no findings at all
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    /// Returns the number of errors
    #[must_use]
    pub fn error_count(&self) -> usize {
        self.count(&Severity::Error)
    }

    /// Returns the number of warnings
    #[must_use]
    pub fn warning_count(&self) -> usize {
        self.count(&Severity::Warning)
    }

    /// Returns the number of info items
    #[must_use]
    pub fn info_count(&self) -> usize {
        self.count(&Severity::Info)
    }

    fn count(&self, severity: &Severity) -> usize {
        self.findings
            .iter()
            .filter(|f| &f.severity == severity)
            .count()
    }
}

/// Locate `program` the way a shell would, searching `path_var` for bare names.
#[must_use]
pub fn find_program(program: &str, path_var: Option<&OsStr>) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    std::env::split_paths(path_var?)
        .map(|dir| dir.join(program))
        .find(|full| full.is_file())
}

/// Run all diagnostic checks and return a report.
///
/// `path_var` is the `PATH` the server will launch agents with.
#[must_use]
pub fn diagnose(
    config: &TetherConfig,
    history: &[TurnRecord],
    path_var: Option<&OsStr>,
) -> DiagnosticReport {
    let mut findings = Vec::new();

    check_agent_program(config, path_var, &mut findings);
    check_permission_lint(config, &mut findings);
    check_timeouts(config, &mut findings);
    check_session_health(history, &mut findings);

    findings.sort_by_key(|f| match f.severity {
        Severity::Error => 0,
        Severity::Warning => 1,
        Severity::Info => 2,
    });

    DiagnosticReport { findings }
}

/// D000: Report for a config file that failed to load or validate
#[must_use]
pub fn config_failure(error: &anyhow::Error) -> DiagnosticReport {
    DiagnosticReport {
        findings: vec![Finding {
            severity: Severity::Error,
            code: "D000".to_string(),
            message: format!("Configuration is invalid: {error:#}"),
            suggestion: Some("Fix tether.toml, or pass --config with a valid file".to_string()),
        }],
    }
}

/// D001: The agent executable must be reachable
fn check_agent_program(config: &TetherConfig, path_var: Option<&OsStr>, findings: &mut Vec<Finding>) {
    let program = &config.agent.program;
    if find_program(program, path_var).is_none() {
        findings.push(Finding {
            severity: Severity::Error,
            code: "D001".to_string(),
            message: format!("Agent program '{program}' was not found"),
            suggestion: Some(
                "Install the agent CLI or set `program` under [agent] in tether.toml to its full path"
                    .to_string(),
            ),
        });
    }
}

/// D002, D003: Lint permission settings
fn check_permission_lint(config: &TetherConfig, findings: &mut Vec<Finding>) {
    let agent = &config.agent;

    if agent.default_permission_mode == PermissionMode::BypassPermissions {
        findings.push(Finding {
            severity: Severity::Warning,
            code: "D002".to_string(),
            message: "default_permission_mode is bypassPermissions: agents run every tool without asking"
                .to_string(),
            suggestion: Some(
                "Use `acceptEdits` with an `allowed_tools` list instead".to_string(),
            ),
        });
    }

    let disallowed: Vec<ToolPattern> = agent
        .disallowed_tools
        .iter()
        .filter_map(|p| ToolPattern::parse(p).ok())
        .collect();
    for allowed in &agent.allowed_tools {
        let conflicting = ToolPattern::parse(allowed)
            .ok()
            .is_some_and(|pattern| disallowed.contains(&pattern));
        if conflicting {
            findings.push(Finding {
                severity: Severity::Info,
                code: "D003".to_string(),
                message: format!("'{allowed}' is both allowed and disallowed; it will be refused"),
                suggestion: Some(format!("Remove '{allowed}' from one of the lists")),
            });
        }
    }
}

/// D004, D005: Timeouts that make turns fail spuriously
fn check_timeouts(config: &TetherConfig, findings: &mut Vec<Finding>) {
    let stall = config.agent.stall_timeout_secs;
    if stall < 10 {
        findings.push(Finding {
            severity: Severity::Warning,
            code: "D004".to_string(),
            message: format!(
                "stall_timeout_secs is {stall}s; agents often go quiet longer than that while working"
            ),
            suggestion: Some("Set `stall_timeout_secs = 30` or more under [agent]".to_string()),
        });
    }

    let keep_alive = config.server.keep_alive_secs;
    let read_timeout = config.client.read_timeout_secs;
    if read_timeout <= keep_alive {
        findings.push(Finding {
            severity: Severity::Warning,
            code: "D005".to_string(),
            message: format!(
                "client read_timeout_secs ({read_timeout}) does not exceed server keep_alive_secs ({keep_alive}); idle streams will reconnect"
            ),
            suggestion: Some(format!(
                "Set `read_timeout_secs` under [client] above {}",
                keep_alive * 2
            )),
        });
    }
}

/// D006, D007: Sessions that keep failing or spending
fn check_session_health(history: &[TurnRecord], findings: &mut Vec<Finding>) {
    if history.is_empty() {
        return;
    }

    let mut by_session: HashMap<&str, Vec<&TurnRecord>> = HashMap::new();
    for record in history {
        by_session
            .entry(record.session_id.as_str())
            .or_default()
            .push(record);
    }

    let mut sessions: Vec<_> = by_session.into_iter().collect();
    sessions.sort_by_key(|(id, _)| *id);

    for (session_id, turns) in sessions {
        let failures = turns
            .iter()
            .filter(|t| t.status == TurnStatus::Failed)
            .count();
        let total = turns.len();

        if total >= 2 && failures * 2 > total {
            findings.push(Finding {
                severity: Severity::Warning,
                code: "D006".to_string(),
                message: format!("Session '{session_id}' failed {failures}/{total} turns"),
                suggestion: Some(
                    "Check the server log for upstream_failure and stall_timeout errors".to_string(),
                ),
            });
        }

        let expensive: Vec<f64> = turns
            .iter()
            .map(|t| t.total_cost_usd)
            .filter(|&c| c > 5.0)
            .collect();
        if !expensive.is_empty() {
            let max_cost = expensive.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            findings.push(Finding {
                severity: Severity::Info,
                code: "D007".to_string(),
                message: format!(
                    "Session '{session_id}' had {} turn(s) over $5.00 (max ${max_cost:.2})",
                    expensive.len()
                ),
                suggestion: Some("Set `max_budget_usd` under [agent] to cap turn spend".to_string()),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sample_record;
    use tempfile::TempDir;

    /// A PATH containing an executable named `claude`
    fn fake_path() -> (TempDir, std::ffi::OsString) {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("claude"), "#!/bin/sh\n").unwrap();
        let path = std::env::join_paths([dir.path()]).unwrap();
        (dir, path)
    }

    fn record(session: &str, status: TurnStatus, cost: f64) -> TurnRecord {
        let mut record = sample_record(session, None);
        record.status = status;
        record.total_cost_usd = cost;
        record
    }

    #[test]
    fn test_clean_report_with_defaults() {
        let (_dir, path) = fake_path();
        let report = diagnose(&TetherConfig::default(), &[], Some(&path));
        assert!(report.is_clean(), "{:?}", report.findings);
        assert_eq!(report.error_count(), 0);
    }

    #[test]
    fn test_report_counts() {
        let report = DiagnosticReport {
            findings: vec![
                Finding {
                    severity: Severity::Error,
                    code: "E1".to_string(),
                    message: "error".to_string(),
                    suggestion: None,
                },
                Finding {
                    severity: Severity::Info,
                    code: "I1".to_string(),
                    message: "info".to_string(),
                    suggestion: None,
                },
            ],
        };
        assert_eq!(report.error_count(), 1);
        assert_eq!(report.warning_count(), 0);
        assert_eq!(report.info_count(), 1);
        assert!(!report.is_clean());
    }

    #[test]
    fn test_d001_missing_program() {
        let report = diagnose(&TetherConfig::default(), &[], None);
        let finding = &report.findings[0];
        assert_eq!(finding.code, "D001");
        assert_eq!(finding.severity, Severity::Error);
        assert!(finding.message.contains("claude"));
    }

    #[test]
    fn test_find_program_with_explicit_path() {
        let (dir, _) = fake_path();
        let full = dir.path().join("claude");
        assert_eq!(
            find_program(full.to_str().unwrap(), None),
            Some(full.clone())
        );
        assert_eq!(find_program("/definitely/not/here/claude", None), None);
    }

    #[test]
    fn test_d002_bypass_default_warns() {
        let (_dir, path) = fake_path();
        let mut config = TetherConfig::default();
        config.agent.default_permission_mode = PermissionMode::BypassPermissions;

        let report = diagnose(&config, &[], Some(&path));
        assert!(report.findings.iter().any(|f| f.code == "D002"));
        assert_eq!(report.warning_count(), 1);
    }

    #[test]
    fn test_d003_conflicting_tool_lists() {
        let (_dir, path) = fake_path();
        let mut config = TetherConfig::default();
        config.agent.allowed_tools = vec!["Read".to_string(), "Bash(rm *)".to_string()];
        config.agent.disallowed_tools = vec!["Bash(rm *)".to_string()];

        let report = diagnose(&config, &[], Some(&path));
        let d003: Vec<_> = report.findings.iter().filter(|f| f.code == "D003").collect();
        assert_eq!(d003.len(), 1);
        assert!(d003[0].message.contains("Bash(rm *)"));
    }

    #[test]
    fn test_d004_short_stall_timeout() {
        let (_dir, path) = fake_path();
        let mut config = TetherConfig::default();
        config.agent.stall_timeout_secs = 3;

        let report = diagnose(&config, &[], Some(&path));
        assert!(report.findings.iter().any(|f| f.code == "D004"));
    }

    #[test]
    fn test_d005_read_timeout_below_keep_alive() {
        let (_dir, path) = fake_path();
        let mut config = TetherConfig::default();
        config.client.read_timeout_secs = 10;

        let report = diagnose(&config, &[], Some(&path));
        let finding = report.findings.iter().find(|f| f.code == "D005").unwrap();
        assert!(finding.message.contains("(10)"));
    }

    #[test]
    fn test_d006_detects_frequent_failures() {
        let (_dir, path) = fake_path();
        let history = vec![
            record("s-1", TurnStatus::Failed, 0.1),
            record("s-1", TurnStatus::Failed, 0.1),
            record("s-1", TurnStatus::Completed, 0.1),
            record("s-2", TurnStatus::Failed, 0.1),
        ];

        let report = diagnose(&TetherConfig::default(), &history, Some(&path));
        let d006: Vec<_> = report.findings.iter().filter(|f| f.code == "D006").collect();
        assert_eq!(d006.len(), 1, "single failed turn is not flagged");
        assert!(d006[0].message.contains("2/3"));
    }

    #[test]
    fn test_d007_expensive_turns() {
        let (_dir, path) = fake_path();
        let history = vec![
            record("s-1", TurnStatus::Completed, 7.5),
            record("s-1", TurnStatus::Completed, 0.2),
        ];

        let report = diagnose(&TetherConfig::default(), &history, Some(&path));
        let finding = report.findings.iter().find(|f| f.code == "D007").unwrap();
        assert_eq!(finding.severity, Severity::Info);
        assert!(finding.message.contains("$7.50"));
    }

    #[test]
    fn test_config_failure_report() {
        let err = TetherConfig::parse("[agent]\nmax_turns = 0").unwrap_err();
        let report = config_failure(&err);
        assert_eq!(report.error_count(), 1);
        assert_eq!(report.findings[0].code, "D000");
        assert!(report.findings[0].message.contains("max_turns"));
    }

    #[test]
    fn test_errors_sort_first() {
        let mut config = TetherConfig::default();
        config.agent.stall_timeout_secs = 1;
        let report = diagnose(&config, &[], None);
        assert_eq!(report.findings[0].severity, Severity::Error);
        assert_eq!(report.findings[1].severity, Severity::Warning);
    }
}
