//! Agent CLI command builder
//!
//! Constructs the `std::process::Command` for one agent turn and the JSON
//! lines written to the agent's stdin: the opening user message and the
//! replies to its permission prompts.

use std::path::PathBuf;
use std::process::Command;

use serde_json::json;

use crate::protocol::PermissionMode;

/// Options for building an agent command.
#[derive(Debug, Clone)]
pub struct CommandOptions {
    /// Executable to run
    pub program: String,
    /// Model override (maps to `--model`)
    pub model: Option<String>,
    /// Permission mode; `bypassPermissions` maps to `--dangerously-skip-permissions`
    pub permission_mode: PermissionMode,
    /// Agent conversation to continue (maps to `--resume`)
    pub resume: Option<String>,
    /// Maximum agentic turns (maps to `--max-turns`)
    pub max_turns: Option<u32>,
    /// Maximum cost in USD (maps to `--max-budget-usd`)
    pub max_budget_usd: Option<f64>,
    /// Pre-approved tool patterns (maps to `--allowedTools`)
    pub allowed_tools: Vec<String>,
    /// Refused tool patterns (maps to `--disallowedTools`)
    pub disallowed_tools: Vec<String>,
    /// Replacement system prompt
    pub system_prompt: Option<String>,
    /// Appended system prompt
    pub append_system_prompt: Option<String>,
    /// Directory the agent runs in
    pub working_dir: Option<PathBuf>,
}

impl Default for CommandOptions {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            model: None,
            permission_mode: PermissionMode::Default,
            resume: None,
            max_turns: None,
            max_budget_usd: None,
            allowed_tools: Vec::new(),
            disallowed_tools: Vec::new(),
            system_prompt: None,
            append_system_prompt: None,
            working_dir: None,
        }
    }
}

/// Build a `Command` to run one agent turn.
///
/// The command uses `-p` with stream-json on both stdin and stdout so the
/// prompt and permission replies travel over stdin, and
/// `--permission-prompt-tool stdio` so permission prompts arrive inline.
#[must_use]
pub fn build_command(options: &CommandOptions) -> Command {
    let mut cmd = Command::new(&options.program);

    cmd.arg("-p");
    cmd.arg("--verbose");
    cmd.arg("--output-format").arg("stream-json");
    cmd.arg("--input-format").arg("stream-json");
    cmd.arg("--permission-prompt-tool").arg("stdio");

    if let Some(model) = &options.model {
        cmd.arg("--model").arg(model);
    }

    match options.permission_mode {
        PermissionMode::Default => {}
        PermissionMode::BypassPermissions => {
            cmd.arg("--dangerously-skip-permissions");
        }
        mode => {
            cmd.arg("--permission-mode").arg(mode.as_str());
        }
    }

    if let Some(session) = &options.resume {
        cmd.arg("--resume").arg(session);
    }

    if let Some(max_turns) = options.max_turns {
        cmd.arg("--max-turns").arg(max_turns.to_string());
    }

    if let Some(max_cost) = options.max_budget_usd {
        cmd.arg("--max-budget-usd").arg(max_cost.to_string());
    }

    if !options.allowed_tools.is_empty() {
        cmd.arg("--allowedTools");
        for perm in &options.allowed_tools {
            cmd.arg(perm);
        }
    }

    if !options.disallowed_tools.is_empty() {
        cmd.arg("--disallowedTools");
        for perm in &options.disallowed_tools {
            cmd.arg(perm);
        }
    }

    if let Some(prompt) = &options.system_prompt {
        cmd.arg("--system-prompt").arg(prompt);
    }

    if let Some(prompt) = &options.append_system_prompt {
        cmd.arg("--append-system-prompt").arg(prompt);
    }

    if let Some(dir) = &options.working_dir {
        cmd.current_dir(dir);
    }

    cmd
}

/// The stdin line that opens a turn with the user's prompt.
#[must_use]
pub fn user_message_line(prompt: &str) -> String {
    json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": [{"type": "text", "text": prompt}],
        },
    })
    .to_string()
}

/// The stdin line answering a permission prompt for `tool_use_id`.
#[must_use]
pub fn permission_reply_line(tool_use_id: &str, allow: bool, message: Option<&str>) -> String {
    let mut response = json!({
        "behavior": if allow { "allow" } else { "deny" },
    });
    if let Some(message) = message {
        response["message"] = json!(message);
    }
    json!({
        "type": "control_response",
        "response": {
            "subtype": "success",
            "request_id": tool_use_id,
            "response": response,
        },
    })
    .to_string()
}
