//! Stream event data model
//!
//! The closed set of events a session stream delivers to clients. Every
//! event carries a `type` discriminant so decoders can reject anything
//! outside this set deterministically.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One event on a session's push channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum StreamEvent {
    /// Session metadata at turn start
    System {
        /// Event subtype reported by the agent (usually "init")
        subtype: String,
        /// Session the turn belongs to
        session_id: String,
        /// The agent's own conversation id, used for resumption
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_session_id: Option<String>,
        /// Model the agent is running
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        /// Tools available to the agent
        #[serde(default)]
        tools: Vec<String>,
    },
    /// One or more content blocks produced by the agent
    Assistant {
        /// Blocks in agent emission order
        content: Vec<ContentBlock>,
    },
    /// Terminal turn summary
    Result(TurnResult),
    /// The agent is blocked until the client decides on a tool use
    PermissionRequest(PermissionRequest),
    /// A failure; terminal unless `recoverable`
    Error {
        /// Machine-readable failure tag
        code: ErrorCode,
        /// Human-readable detail
        message: String,
        /// Recoverable errors do not end the turn
        #[serde(default)]
        recoverable: bool,
    },
}

impl StreamEvent {
    /// Build a terminal error event.
    #[must_use]
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
            recoverable: false,
        }
    }

    /// The wire discriminant, also used as the SSE event name.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::System { .. } => "system",
            Self::Assistant { .. } => "assistant",
            Self::Result(_) => "result",
            Self::PermissionRequest(_) => "permission_request",
            Self::Error { .. } => "error",
        }
    }

    /// Whether this event ends a turn. Only a `result` or a non-recoverable
    /// `error` terminates.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        match self {
            Self::Result(_) => true,
            Self::Error { recoverable, .. } => !*recoverable,
            _ => false,
        }
    }
}

/// A unit of assistant output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ContentBlock {
    /// Plain text
    Text {
        /// The text content
        text: String,
    },
    /// A tool invocation requested by the agent
    ToolUse {
        /// Id unique within the session, referenced by the matching result
        tool_use_id: String,
        /// Tool name (e.g., "Edit", "Bash")
        name: String,
        /// Tool input as raw JSON
        #[serde(default)]
        input: Value,
    },
    /// Outcome of a tool invocation
    ToolResult {
        /// Id of the `tool_use` block this answers
        tool_use_id: String,
        /// Result content
        #[serde(default)]
        content: String,
        /// Whether the tool failed or was denied
        #[serde(default)]
        is_error: bool,
    },
    /// Model reasoning
    Thinking {
        /// Reasoning text
        thinking: String,
    },
}

/// Token usage counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    /// Prompt tokens
    #[serde(default)]
    pub input_tokens: u64,
    /// Completion tokens
    #[serde(default)]
    pub output_tokens: u64,
    /// Tokens served from the prompt cache
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    /// Tokens written to the prompt cache
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
}

impl Usage {
    /// Add another usage report to this one.
    pub fn add(&mut self, other: &Self) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_input_tokens += other.cache_read_input_tokens;
        self.cache_creation_input_tokens += other.cache_creation_input_tokens;
    }

    /// True when nothing has been counted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Summary carried by the terminal `result` event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnResult {
    /// Agent-reported subtype ("success", "error_max_turns", ...)
    pub subtype: String,
    /// Whether the turn ended in failure
    pub is_error: bool,
    /// Number of agent turns
    #[serde(default)]
    pub num_turns: u32,
    /// Wall-clock duration in milliseconds
    #[serde(default)]
    pub duration_ms: u64,
    /// Total cost in USD
    #[serde(default)]
    pub total_cost_usd: f64,
    /// Authoritative token totals for the turn
    #[serde(default)]
    pub usage: Usage,
    /// Final result text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// The agent's conversation id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_session_id: Option<String>,
}

/// A tool use waiting on a client decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    /// Correlation id for the decision
    pub id: String,
    /// Tool the agent wants to run
    pub tool_name: String,
    /// Id of the pending `tool_use` block
    pub tool_use_id: String,
    /// Short human-readable rendering of the input
    pub input_summary: String,
    /// Full tool input
    #[serde(default)]
    pub input: Value,
    /// When the request was raised
    pub requested_at: DateTime<Utc>,
}

/// How the client answered a permission request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionOutcome {
    /// Run the tool once
    Allow,
    /// Refuse the tool once
    Deny,
    /// Run it and stop asking for this pattern in the session
    AllowAlways,
    /// Refuse it and stop asking for this pattern in the session
    DenyAlways,
}

impl PermissionOutcome {
    /// Whether the tool gets to run.
    #[must_use]
    pub const fn is_allow(self) -> bool {
        matches!(self, Self::Allow | Self::AllowAlways)
    }

    /// Whether a standing rule should be recorded.
    #[must_use]
    pub const fn is_standing(self) -> bool {
        matches!(self, Self::AllowAlways | Self::DenyAlways)
    }
}

/// A client decision for a pending request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionDecision {
    /// Id of the `PermissionRequest` being answered
    pub id: String,
    /// The decision
    pub outcome: PermissionOutcome,
}

/// Machine-readable error tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The user cancelled the turn
    Cancelled,
    /// The agent process crashed or exited without a result
    UpstreamFailure,
    /// The agent process could not be started
    SpawnFailure,
    /// The agent produced no valid output for too long
    StallTimeout,
    /// The request was throttled
    RateLimited,
    /// The request was malformed
    Validation,
    /// Anything else
    Internal,
}

impl ErrorCode {
    /// The wire string for this code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::UpstreamFailure => "upstream_failure",
            Self::SpawnFailure => "spawn_failure",
            Self::StallTimeout => "stall_timeout",
            Self::RateLimited => "rate_limited",
            Self::Validation => "validation",
            Self::Internal => "internal",
        }
    }
}
