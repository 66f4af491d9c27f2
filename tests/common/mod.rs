//! Scripted agents shared by the integration tests
#![allow(dead_code, missing_docs)]

use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

use tether::agent::cli::CommandOptions;
use tether::{AgentLauncher, MemorySessionStore, Orchestrator, OrchestratorSettings};

/// Runs a fixed `sh` script as the agent and records the options of every turn.
#[derive(Default)]
pub struct ScriptLauncher {
    script: String,
    pub launched: Mutex<Vec<CommandOptions>>,
}

impl ScriptLauncher {
    pub fn new(script: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            script: script.into(),
            launched: Mutex::new(Vec::new()),
        })
    }
}

impl AgentLauncher for ScriptLauncher {
    fn command(&self, options: &CommandOptions) -> Command {
        self.launched.lock().unwrap().push(options.clone());
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&self.script);
        cmd
    }
}

pub fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        stall_timeout: Duration::from_secs(10),
        shutdown_grace: Duration::from_millis(500),
        ..OrchestratorSettings::default()
    }
}

pub fn orchestrator(
    launcher: Arc<ScriptLauncher>,
    settings: OrchestratorSettings,
) -> (Orchestrator, Arc<MemorySessionStore>) {
    let store = Arc::new(MemorySessionStore::new());
    let orchestrator = Orchestrator::new(launcher, store.clone(), settings);
    (orchestrator, store)
}

// Script fragments. Each emits one stream-json line on stdout.

fn emit(value: &Value) -> String {
    format!("echo '{value}'\n")
}

/// Consume the prompt the orchestrator writes as the first stdin line
pub const READ_PROMPT: &str = "read -r prompt\n";

/// Block until stdin closes; the agent never finishes on its own
pub const HANG: &str = "read -r prompt\nwhile read -r line; do :; done\n";

pub fn init(agent_session: &str) -> String {
    emit(&json!({
        "type": "system",
        "subtype": "init",
        "session_id": agent_session,
        "model": "test-model",
        "tools": ["Bash", "Read"]
    }))
}

pub fn text(text: &str) -> String {
    emit(&json!({
        "type": "assistant",
        "message": {"content": [{"type": "text", "text": text}]}
    }))
}

pub fn tool_use(id: &str, name: &str, input: &Value) -> String {
    emit(&json!({
        "type": "assistant",
        "message": {"content": [{"type": "tool_use", "id": id, "name": name, "input": input}]}
    }))
}

pub fn tool_result(id: &str, content: &str, is_error: bool) -> String {
    emit(&json!({
        "type": "user",
        "message": {"content": [{
            "type": "tool_result",
            "tool_use_id": id,
            "content": content,
            "is_error": is_error
        }]}
    }))
}

pub fn result(agent_session: &str) -> String {
    emit(&json!({
        "type": "result",
        "subtype": "success",
        "is_error": false,
        "num_turns": 1,
        "duration_ms": 12,
        "total_cost_usd": 0.02,
        "usage": {"input_tokens": 10, "output_tokens": 20},
        "result": "done",
        "session_id": agent_session
    }))
}

/// Read the permission reply and branch on it.
pub fn on_reply(allowed: &str, denied: &str) -> String {
    format!(
        "read -r reply\ncase \"$reply\" in\n*'\"behavior\":\"allow\"'*)\n{allowed};;\n*)\n{denied};;\nesac\n"
    )
}

/// A turn that asks to run `ls` and reports what it was told.
pub fn permission_script() -> String {
    [
        READ_PROMPT.to_string(),
        init("agent-perm"),
        tool_use("tu_1", "Bash", &json!({"command": "ls"})),
        on_reply(
            &(tool_result("tu_1", "file.txt", false) + &text("allowed")),
            &(tool_result("tu_1", "agent saw denial", true) + &text("understood")),
        ),
        result("agent-perm"),
    ]
    .concat()
}
