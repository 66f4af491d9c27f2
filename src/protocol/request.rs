//! Request bodies shared by the server endpoints and the client

use serde::{Deserialize, Serialize};

/// Permission mode the agent runs under
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    /// Prompt for every tool not otherwise allowed
    #[default]
    Default,
    /// Edit tools run without prompting
    AcceptEdits,
    /// Planning only; every tool prompts
    Plan,
    /// Skip all permission checks
    BypassPermissions,
    /// Delegate decisions to the host
    Delegate,
    /// Never ask; behaves like `BypassPermissions`
    DontAsk,
}

impl PermissionMode {
    /// The mode name as the agent CLI spells it.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::AcceptEdits => "acceptEdits",
            Self::Plan => "plan",
            Self::BypassPermissions => "bypassPermissions",
            Self::Delegate => "delegate",
            Self::DontAsk => "dontAsk",
        }
    }

    /// Whether the agent runs every tool without asking.
    #[must_use]
    pub const fn skips_prompts(self) -> bool {
        matches!(self, Self::BypassPermissions | Self::DontAsk)
    }
}

/// Per-turn agent options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOptions {
    /// Model override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Permission mode override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<PermissionMode>,
    /// Maximum agentic turns
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,
    /// Spending cap in USD
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_budget_usd: Option<f64>,
    /// Extra pre-approved tool patterns, added to the server's
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_tools: Vec<String>,
    /// Extra refused tool patterns, added to the server's
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disallowed_tools: Vec<String>,
    /// Replacement system prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Text appended to the default system prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub append_system_prompt: Option<String>,
}

/// Body of a stream-start request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    /// User prompt for this turn
    pub prompt: String,
    /// Agent options
    #[serde(default)]
    pub options: StartOptions,
    /// Continue the session's previous agent conversation when one exists
    #[serde(default = "default_resume")]
    pub resume: bool,
}

const fn default_resume() -> bool {
    true
}

impl StartRequest {
    /// A request with default options.
    #[must_use]
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            options: StartOptions::default(),
            resume: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_start_request_defaults() {
        let req: StartRequest = serde_json::from_str(r#"{"prompt":"hi"}"#).unwrap();
        assert_eq!(req.prompt, "hi");
        assert!(req.resume);
        assert_eq!(req.options, StartOptions::default());
    }

    #[test]
    fn test_start_options_camel_case() {
        let req: StartRequest = serde_json::from_str(
            r#"{"prompt":"hi","resume":false,"options":{"permissionMode":"acceptEdits","maxTurns":3,"allowedTools":["Read"]}}"#,
        )
        .unwrap();
        assert!(!req.resume);
        assert_eq!(
            req.options.permission_mode,
            Some(PermissionMode::AcceptEdits)
        );
        assert_eq!(req.options.max_turns, Some(3));
        assert_eq!(req.options.allowed_tools, vec!["Read"]);
    }

    #[test]
    fn test_permission_mode_flags() {
        assert_eq!(PermissionMode::AcceptEdits.as_str(), "acceptEdits");
        assert!(PermissionMode::BypassPermissions.skips_prompts());
        assert!(PermissionMode::DontAsk.skips_prompts());
        assert!(!PermissionMode::Plan.skips_prompts());
    }
}
