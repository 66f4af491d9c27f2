//! Parser for the agent's `--output-format stream-json` output
//!
//! Turns newline-delimited JSON lines from the agent process into typed
//! `AgentOutput` values. Content blocks are translated into the wire
//! `ContentBlock` model so the orchestrator can forward them unchanged.

use serde_json::{json, Value};

use crate::protocol::{ContentBlock, TurnResult, Usage};

/// A parsed line of agent output
#[derive(Debug, Clone, PartialEq)]
pub enum AgentOutput {
    /// System initialization with session metadata
    Init {
        /// The agent's conversation id
        session_id: String,
        /// The model being used
        model: Option<String>,
        /// Tools the agent can call
        tools: Vec<String>,
    },
    /// Assistant message content
    Assistant {
        /// Blocks in emission order
        blocks: Vec<ContentBlock>,
        /// Incremental usage reported with this message
        usage: Option<Usage>,
    },
    /// Tool results fed back to the model
    ToolResults {
        /// `tool_result` blocks
        blocks: Vec<ContentBlock>,
    },
    /// Final result of the turn
    Result(TurnResult),
    /// A well-formed line of a type the orchestrator does not forward
    Ignored {
        /// The raw event type string
        event_type: String,
    },
}

/// Parse a single line of stream-json output.
///
/// Returns `None` if the line is empty, not valid JSON, or lacks the fields
/// its type requires.
#[must_use]
pub fn parse_event(line: &str) -> Option<AgentOutput> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let value: Value = serde_json::from_str(line).ok()?;
    let event_type = value.get("type")?.as_str()?;

    match event_type {
        "system" => Some(parse_system_event(&value)),
        "assistant" => parse_assistant_event(&value),
        "user" => parse_user_event(&value),
        "result" => Some(parse_result_event(&value)),
        other => Some(AgentOutput::Ignored {
            event_type: other.to_string(),
        }),
    }
}

fn parse_system_event(value: &Value) -> AgentOutput {
    let subtype = value.get("subtype").and_then(Value::as_str).unwrap_or("");
    if subtype != "init" && !subtype.is_empty() {
        return AgentOutput::Ignored {
            event_type: format!("system:{subtype}"),
        };
    }

    let session_id = value
        .get("session_id")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let model = value
        .get("model")
        .and_then(Value::as_str)
        .map(String::from);
    let tools = value
        .get("tools")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default();

    AgentOutput::Init {
        session_id,
        model,
        tools,
    }
}

fn parse_assistant_event(value: &Value) -> Option<AgentOutput> {
    let message = value.get("message")?;
    let content = message.get("content")?.as_array()?;
    let blocks = content.iter().map(parse_block).collect::<Option<Vec<_>>>()?;
    let usage = message.get("usage").map(parse_usage);

    Some(AgentOutput::Assistant { blocks, usage })
}

fn parse_user_event(value: &Value) -> Option<AgentOutput> {
    let content = value.get("message")?.get("content")?;
    // Plain-string user content is the agent echoing a prompt
    let Some(content) = content.as_array() else {
        return Some(AgentOutput::Ignored {
            event_type: "user".to_string(),
        });
    };

    let blocks: Vec<ContentBlock> = content
        .iter()
        .filter(|b| b.get("type").and_then(Value::as_str) == Some("tool_result"))
        .map(parse_block)
        .collect::<Option<Vec<_>>>()?;

    if blocks.is_empty() {
        return Some(AgentOutput::Ignored {
            event_type: "user".to_string(),
        });
    }
    Some(AgentOutput::ToolResults { blocks })
}

fn parse_block(block: &Value) -> Option<ContentBlock> {
    let block_type = block.get("type")?.as_str()?;
    let parsed = match block_type {
        "text" => ContentBlock::Text {
            text: block.get("text")?.as_str()?.to_string(),
        },
        "tool_use" => ContentBlock::ToolUse {
            tool_use_id: block.get("id")?.as_str()?.to_string(),
            name: block
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            input: block.get("input").cloned().unwrap_or_else(|| json!({})),
        },
        "tool_result" => ContentBlock::ToolResult {
            tool_use_id: block.get("tool_use_id")?.as_str()?.to_string(),
            content: tool_result_text(block.get("content")),
            is_error: block
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        },
        "thinking" => ContentBlock::Thinking {
            thinking: block
                .get("thinking")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
        },
        other => ContentBlock::Text {
            text: format!("[unsupported block: {other}]"),
        },
    };
    Some(parsed)
}

/// Tool result content is either a string or a list of text items.
fn tool_result_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn parse_usage(value: &Value) -> Usage {
    let field = |name: &str| value.get(name).and_then(Value::as_u64).unwrap_or(0);
    Usage {
        input_tokens: field("input_tokens"),
        output_tokens: field("output_tokens"),
        cache_read_input_tokens: field("cache_read_input_tokens"),
        cache_creation_input_tokens: field("cache_creation_input_tokens"),
    }
}

fn parse_result_event(value: &Value) -> AgentOutput {
    let is_error = value
        .get("is_error")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let subtype = value
        .get("subtype")
        .and_then(Value::as_str)
        .unwrap_or(if is_error { "error" } else { "success" })
        .to_string();
    let num_turns = value
        .get("num_turns")
        .and_then(Value::as_u64)
        .map_or(0, |v| u32::try_from(v).unwrap_or(u32::MAX));
    let total_cost_usd = value
        .get("total_cost_usd")
        .and_then(Value::as_f64)
        .unwrap_or(0.0);
    let duration_ms = value
        .get("duration_ms")
        .and_then(Value::as_u64)
        .unwrap_or(0);

    AgentOutput::Result(TurnResult {
        subtype,
        is_error,
        num_turns,
        duration_ms,
        total_cost_usd,
        usage: value.get("usage").map(parse_usage).unwrap_or_default(),
        result: value
            .get("result")
            .and_then(Value::as_str)
            .map(String::from),
        agent_session_id: value
            .get("session_id")
            .and_then(Value::as_str)
            .map(String::from),
    })
}

/// Collects turn data across agent output for persistence.
#[derive(Debug, Default)]
pub struct TurnAccumulator {
    /// Text fragments from forwarded assistant blocks
    pub text_fragments: Vec<String>,
    /// Tool invocations, as `{id, name, input}`
    pub tool_calls: Vec<Value>,
    /// Tool outcomes, as `{toolUseId, content, isError}`
    pub tool_results: Vec<Value>,
    /// Running usage from per-message reports
    pub usage: Usage,
    /// Agent conversation id, from init or result
    pub agent_session_id: Option<String>,
    /// Final result, once seen
    pub result: Option<TurnResult>,
}

impl TurnAccumulator {
    /// Create a new empty accumulator
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record session metadata, usage and the final result.
    pub fn process(&mut self, output: &AgentOutput) {
        match output {
            AgentOutput::Init { session_id, .. } if !session_id.is_empty() => {
                self.agent_session_id = Some(session_id.clone());
            }
            AgentOutput::Assistant {
                usage: Some(usage), ..
            } => {
                self.usage.add(usage);
            }
            AgentOutput::Result(result) => {
                if let Some(id) = &result.agent_session_id {
                    self.agent_session_id = Some(id.clone());
                }
                self.result = Some(result.clone());
            }
            _ => {}
        }
    }

    /// Record a block that was forwarded to the client. Thinking is not kept.
    pub fn record_block(&mut self, block: &ContentBlock) {
        match block {
            ContentBlock::Text { text } => self.text_fragments.push(text.clone()),
            ContentBlock::ToolUse {
                tool_use_id,
                name,
                input,
            } => self.tool_calls.push(json!({
                "id": tool_use_id,
                "name": name,
                "input": input,
            })),
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => self.tool_results.push(json!({
                "toolUseId": tool_use_id,
                "content": content,
                "isError": is_error,
            })),
            ContentBlock::Thinking { .. } => {}
        }
    }

    /// The accumulated assistant text.
    #[must_use]
    pub fn text(&self) -> String {
        self.text_fragments.join("")
    }

    /// Usage to persist: the result's totals when present, else the running sum.
    #[must_use]
    pub fn final_usage(&self) -> Usage {
        match &self.result {
            Some(result) if !result.usage.is_empty() => result.usage,
            _ => self.usage,
        }
    }

    /// Cost to persist.
    #[must_use]
    pub fn total_cost_usd(&self) -> f64 {
        self.result.as_ref().map_or(0.0, |r| r.total_cost_usd)
    }
}
