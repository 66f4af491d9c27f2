//! Tool permission policy
//!
//! Decides, for every `tool_use` the agent emits, whether the tool runs
//! without asking, is refused, or needs a client decision. Patterns use
//! the `ToolName` / `ToolName(specifier)` syntax of `--allowedTools`; a
//! specifier ending in `*` is a prefix match on the tool's primary argument.

use std::collections::HashSet;
use std::fmt;

use anyhow::{bail, Result};
use serde_json::Value;

use crate::protocol::{PermissionMode, PermissionOutcome};

/// Tools that `acceptEdits` lets through without asking.
pub const EDIT_TOOLS: [&str; 4] = ["Edit", "MultiEdit", "Write", "NotebookEdit"];

const SUMMARY_MAX_CHARS: usize = 120;

/// A parsed permission pattern
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ToolPattern {
    tool: String,
    specifier: Option<String>,
}

impl ToolPattern {
    /// Parse `ToolName` or `ToolName(specifier)`.
    pub fn parse(perm: &str) -> Result<Self> {
        if perm.is_empty() {
            bail!("Invalid permission '': permission string cannot be empty");
        }

        let tool_end = perm
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(perm.len());
        let tool_name = &perm[..tool_end];

        let well_formed_name = tool_name.starts_with(|c: char| c.is_ascii_uppercase())
            || (tool_name.starts_with("mcp__") && tool_name.len() > 5);
        if !well_formed_name {
            bail!("Invalid permission '{perm}': tool name must start with an uppercase letter");
        }

        let rest = &perm[tool_end..];
        if rest.is_empty() {
            return Ok(Self {
                tool: tool_name.to_string(),
                specifier: None,
            });
        }

        if !rest.starts_with('(') || !rest.ends_with(')') {
            bail!(
                "Invalid permission '{perm}': expected format 'ToolName' or 'ToolName(specifier)'"
            );
        }

        let specifier = &rest[1..rest.len() - 1];
        if specifier.is_empty() {
            bail!("Invalid permission '{perm}': specifier inside parentheses cannot be empty");
        }

        Ok(Self {
            tool: tool_name.to_string(),
            specifier: Some(specifier.to_string()),
        })
    }

    /// The exact pattern a standing rule records for this invocation.
    #[must_use]
    pub fn for_invocation(tool: &str, input: &Value) -> Self {
        Self {
            tool: tool.to_string(),
            specifier: primary_argument(tool, input).map(String::from),
        }
    }

    /// Whether this pattern covers the given invocation.
    #[must_use]
    pub fn matches(&self, tool: &str, input: &Value) -> bool {
        if self.tool != tool {
            return false;
        }
        let Some(specifier) = &self.specifier else {
            return true;
        };
        let Some(argument) = primary_argument(tool, input) else {
            return false;
        };

        let argument = normalize(argument);
        let stripped = specifier.trim_end_matches('*');
        if stripped.len() == specifier.len() {
            return argument == normalize(specifier);
        }
        let prefix = stripped.strip_suffix(':').unwrap_or(stripped);
        argument.starts_with(normalize(prefix))
    }
}

impl fmt::Display for ToolPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.specifier {
            Some(spec) => write!(f, "{}({spec})", self.tool),
            None => write!(f, "{}", self.tool),
        }
    }
}

fn normalize(s: &str) -> &str {
    s.strip_prefix("./").unwrap_or(s)
}

/// Validate a permission string without keeping the parsed pattern.
pub fn validate_permission(perm: &str) -> Result<()> {
    ToolPattern::parse(perm).map(|_| ())
}

/// The argument a pattern specifier is matched against.
#[must_use]
pub fn primary_argument<'a>(tool: &str, input: &'a Value) -> Option<&'a str> {
    let field = match tool {
        "Bash" => "command",
        "Glob" | "Grep" => "pattern",
        "WebFetch" => "url",
        "WebSearch" => "query",
        "NotebookEdit" => "notebook_path",
        _ => {
            return input
                .get("file_path")
                .or_else(|| input.get("path"))
                .and_then(Value::as_str);
        }
    };
    input.get(field).and_then(Value::as_str)
}

/// Short one-line rendering of a tool input for permission prompts.
#[must_use]
pub fn summarize_input(tool: &str, input: &Value) -> String {
    let full = match primary_argument(tool, input) {
        Some(arg) => arg.to_string(),
        None if input.is_null() => String::new(),
        None => input.to_string(),
    };
    let full = full.replace('\n', " ");
    if full.chars().count() <= SUMMARY_MAX_CHARS {
        return full;
    }
    let truncated: String = full.chars().take(SUMMARY_MAX_CHARS - 3).collect();
    format!("{truncated}...")
}

/// Merge two permission lists, deduplicated, base entries first.
#[must_use]
pub fn resolve_permissions(base: &[String], extra: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut result = Vec::new();

    for perm in base.iter().chain(extra) {
        if seen.insert(perm.as_str()) {
            result.push(perm.clone());
        }
    }

    result
}

/// Session-scoped rules recorded from `allowAlways` / `denyAlways`.
#[derive(Debug, Clone, Default)]
pub struct StandingRules {
    allow: Vec<ToolPattern>,
    deny: Vec<ToolPattern>,
}

impl StandingRules {
    /// Create an empty rule set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether no rule has been recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.allow.is_empty() && self.deny.is_empty()
    }

    /// Record a standing rule for the invocation if the outcome asks for one.
    /// Returns the recorded pattern.
    pub fn record(
        &mut self,
        outcome: PermissionOutcome,
        tool: &str,
        input: &Value,
    ) -> Option<ToolPattern> {
        let pattern = ToolPattern::for_invocation(tool, input);
        let list = match outcome {
            PermissionOutcome::AllowAlways => &mut self.allow,
            PermissionOutcome::DenyAlways => &mut self.deny,
            PermissionOutcome::Allow | PermissionOutcome::Deny => return None,
        };
        if !list.contains(&pattern) {
            list.push(pattern.clone());
        }
        Some(pattern)
    }

    /// `Some(false)` when a deny rule matches, `Some(true)` for an allow
    /// rule, `None` otherwise. Deny wins.
    #[must_use]
    pub fn check(&self, tool: &str, input: &Value) -> Option<bool> {
        if self.deny.iter().any(|p| p.matches(tool, input)) {
            return Some(false);
        }
        if self.allow.iter().any(|p| p.matches(tool, input)) {
            return Some(true);
        }
        None
    }

    /// Number of recorded rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.allow.len() + self.deny.len()
    }
}

/// What to do with a `tool_use`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    /// The agent runs it on its own; no reply is expected
    PreApproved,
    /// A standing rule approves; reply allow without asking
    Allow,
    /// Refused on the command line; the agent refuses on its own
    Blocked,
    /// A standing rule refuses; reply deny without asking
    Deny,
    /// The client must decide
    Ask,
}

/// Per-turn permission policy
#[derive(Debug, Clone)]
pub struct PermissionPolicy {
    mode: PermissionMode,
    allowed: Vec<ToolPattern>,
    disallowed: Vec<ToolPattern>,
}

impl PermissionPolicy {
    /// Build a policy, rejecting malformed patterns.
    pub fn new(mode: PermissionMode, allowed: &[String], disallowed: &[String]) -> Result<Self> {
        Ok(Self {
            mode,
            allowed: allowed
                .iter()
                .map(|p| ToolPattern::parse(p))
                .collect::<Result<_>>()?,
            disallowed: disallowed
                .iter()
                .map(|p| ToolPattern::parse(p))
                .collect::<Result<_>>()?,
        })
    }

    /// The permission mode in force.
    #[must_use]
    pub const fn mode(&self) -> PermissionMode {
        self.mode
    }

    /// Decide how to handle an invocation.
    #[must_use]
    pub fn evaluate(&self, rules: &StandingRules, tool: &str, input: &Value) -> PolicyDecision {
        if self.disallowed.iter().any(|p| p.matches(tool, input)) {
            return PolicyDecision::Blocked;
        }
        if rules.check(tool, input) == Some(false) {
            return PolicyDecision::Deny;
        }
        if self.mode.skips_prompts() {
            return PolicyDecision::PreApproved;
        }
        if self.mode != PermissionMode::Plan && self.allowed.iter().any(|p| p.matches(tool, input))
        {
            return PolicyDecision::PreApproved;
        }
        if self.mode == PermissionMode::AcceptEdits && EDIT_TOOLS.contains(&tool) {
            return PolicyDecision::PreApproved;
        }
        if rules.check(tool, input) == Some(true) {
            return PolicyDecision::Allow;
        }
        PolicyDecision::Ask
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_valid_patterns() {
        assert!(ToolPattern::parse("Read").is_ok());
        assert!(ToolPattern::parse("Edit(./src/**)").is_ok());
        assert!(ToolPattern::parse("Bash(cargo test *)").is_ok());
        assert!(ToolPattern::parse("mcp__github__create_issue").is_ok());
    }

    #[test]
    fn test_parse_invalid_patterns() {
        for bad in ["", "read", "Edit(", "Edit()", "Bash cargo", "(x)"] {
            assert!(ToolPattern::parse(bad).is_err(), "accepted {bad:?}");
        }
        let err = validate_permission("Edit()").unwrap_err().to_string();
        assert!(err.contains("cannot be empty"), "got: {err}");
    }

    #[test]
    fn test_display_round_trips() {
        assert_eq!(
            ToolPattern::parse("Bash(git *)").unwrap().to_string(),
            "Bash(git *)"
        );
        assert_eq!(ToolPattern::parse("Read").unwrap().to_string(), "Read");
    }

    #[test]
    fn test_bare_tool_matches_any_input() {
        let pattern = ToolPattern::parse("Read").unwrap();
        assert!(pattern.matches("Read", &json!({"file_path": "x"})));
        assert!(!pattern.matches("Edit", &json!({"file_path": "x"})));
    }

    #[test]
    fn test_prefix_and_exact_specifiers() {
        let prefix = ToolPattern::parse("Bash(cargo test *)").unwrap();
        assert!(prefix.matches("Bash", &json!({"command": "cargo test --lib"})));
        assert!(!prefix.matches("Bash", &json!({"command": "rm -rf /"})));

        let colon = ToolPattern::parse("Bash(npm run test:*)").unwrap();
        assert!(colon.matches("Bash", &json!({"command": "npm run test -- --watch"})));

        let exact = ToolPattern::parse("Bash(ls)").unwrap();
        assert!(exact.matches("Bash", &json!({"command": "ls"})));
        assert!(!exact.matches("Bash", &json!({"command": "ls -la"})));

        let path = ToolPattern::parse("Edit(./src/**)").unwrap();
        assert!(path.matches("Edit", &json!({"file_path": "src/main.rs"})));
        assert!(!path.matches("Edit", &json!({"file_path": "tests/a.rs"})));
        assert!(!path.matches("Edit", &json!({})));
    }

    #[test]
    fn test_primary_argument_by_tool() {
        assert_eq!(primary_argument("Bash", &json!({"command": "ls"})), Some("ls"));
        assert_eq!(
            primary_argument("Grep", &json!({"pattern": "fn main"})),
            Some("fn main")
        );
        assert_eq!(
            primary_argument("Read", &json!({"file_path": "a.rs"})),
            Some("a.rs")
        );
        assert_eq!(primary_argument("LS", &json!({"path": "src"})), Some("src"));
        assert_eq!(primary_argument("Task", &json!({"prompt": "x"})), None);
    }

    #[test]
    fn test_summarize_input_truncates() {
        assert_eq!(summarize_input("Bash", &json!({"command": "ls"})), "ls");
        let long = "a".repeat(300);
        let summary = summarize_input("Bash", &json!({ "command": long }));
        assert_eq!(summary.chars().count(), 120);
        assert!(summary.ends_with("..."));
        assert_eq!(
            summarize_input("Task", &json!({"prompt": "x"})),
            r#"{"prompt":"x"}"#
        );
    }

    #[test]
    fn test_resolve_permissions_merges_and_dedups() {
        let base = vec!["Read".to_string(), "Bash(cargo *)".to_string()];
        let extra = vec!["Read".to_string(), "Edit(./src/**)".to_string()];
        assert_eq!(
            resolve_permissions(&base, &extra),
            vec!["Read", "Bash(cargo *)", "Edit(./src/**)"]
        );
        assert_eq!(resolve_permissions(&[], &extra), extra);
    }

    #[test]
    fn test_standing_rules_record_exact_pattern() {
        let mut rules = StandingRules::new();
        let input = json!({"command": "cargo test"});
        assert!(rules.record(PermissionOutcome::Allow, "Bash", &input).is_none());
        assert!(rules.is_empty());

        let pattern = rules
            .record(PermissionOutcome::AllowAlways, "Bash", &input)
            .unwrap();
        assert_eq!(pattern.to_string(), "Bash(cargo test)");
        assert_eq!(rules.check("Bash", &input), Some(true));
        assert_eq!(rules.check("Bash", &json!({"command": "cargo build"})), None);

        rules.record(PermissionOutcome::DenyAlways, "Bash", &input);
        assert_eq!(rules.check("Bash", &input), Some(false));
        assert_eq!(rules.len(), 2);
    }

    #[test]
    fn test_policy_default_mode_asks() {
        let policy = PermissionPolicy::new(PermissionMode::Default, &[], &[]).unwrap();
        let rules = StandingRules::new();
        assert_eq!(
            policy.evaluate(&rules, "Bash", &json!({"command": "ls"})),
            PolicyDecision::Ask
        );
    }

    #[test]
    fn test_policy_allowed_and_disallowed() {
        let policy = PermissionPolicy::new(
            PermissionMode::Default,
            &["Read".to_string()],
            &["Bash(rm *)".to_string()],
        )
        .unwrap();
        let rules = StandingRules::new();
        assert_eq!(
            policy.evaluate(&rules, "Read", &json!({"file_path": "a"})),
            PolicyDecision::PreApproved
        );
        assert_eq!(
            policy.evaluate(&rules, "Bash", &json!({"command": "rm -rf target"})),
            PolicyDecision::Blocked
        );
    }

    #[test]
    fn test_policy_modes() {
        let rules = StandingRules::new();
        let edit = json!({"file_path": "src/lib.rs"});

        let accept = PermissionPolicy::new(PermissionMode::AcceptEdits, &[], &[]).unwrap();
        assert_eq!(
            accept.evaluate(&rules, "Edit", &edit),
            PolicyDecision::PreApproved
        );
        assert_eq!(
            accept.evaluate(&rules, "Bash", &json!({"command": "ls"})),
            PolicyDecision::Ask
        );

        let bypass = PermissionPolicy::new(PermissionMode::BypassPermissions, &[], &[]).unwrap();
        assert_eq!(
            bypass.evaluate(&rules, "Bash", &json!({"command": "ls"})),
            PolicyDecision::PreApproved
        );

        let plan = PermissionPolicy::new(PermissionMode::Plan, &["Read".to_string()], &[]).unwrap();
        assert_eq!(plan.evaluate(&rules, "Read", &edit), PolicyDecision::Ask);
    }

    #[test]
    fn test_policy_consults_standing_rules() {
        let policy = PermissionPolicy::new(PermissionMode::Default, &[], &[]).unwrap();
        let mut rules = StandingRules::new();
        let input = json!({"command": "make"});
        rules.record(PermissionOutcome::AllowAlways, "Bash", &input);
        assert_eq!(policy.evaluate(&rules, "Bash", &input), PolicyDecision::Allow);

        rules.record(PermissionOutcome::DenyAlways, "Write", &json!({"file_path": "x"}));
        assert_eq!(
            policy.evaluate(&rules, "Write", &json!({"file_path": "x"})),
            PolicyDecision::Deny
        );
    }

    #[test]
    fn test_policy_rejects_bad_patterns() {
        assert!(PermissionPolicy::new(PermissionMode::Default, &["bash".to_string()], &[]).is_err());
    }
}
