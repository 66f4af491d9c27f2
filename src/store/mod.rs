//! Turn persistence
//!
//! The orchestrator records every finished turn through `SessionStore` and
//! asks it for the agent conversation to resume on the next turn.

mod jsonl;
mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;
use crate::protocol::Usage;

pub use jsonl::JsonlSessionStore;
pub use memory::MemorySessionStore;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// How a turn ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnStatus {
    /// Ended with a successful `result`
    Completed,
    /// Ended with an error `result` or a failure
    Failed,
    /// Cancelled by the user or by subscriber disconnect
    Cancelled,
}

/// Everything persisted about one turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRecord {
    /// Session the turn belongs to
    pub session_id: String,
    /// The user's prompt
    pub prompt: String,
    /// Assistant text, concatenated
    pub text: String,
    /// Tool invocations
    #[serde(default)]
    pub tool_calls: Vec<Value>,
    /// Tool outcomes
    #[serde(default)]
    pub tool_results: Vec<Value>,
    /// Authoritative usage
    pub usage: Usage,
    /// Authoritative cost
    pub total_cost_usd: f64,
    /// Final status
    pub status: TurnStatus,
    /// Agent conversation id for resumption
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_session_id: Option<String>,
    /// When the turn finished
    pub completed_at: DateTime<Utc>,
}

/// Storage interface for turn persistence.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist a finished turn.
    ///
    /// Called exactly once per turn, after its terminator is decided.
    async fn record_turn(&self, record: TurnRecord) -> StoreResult<()>;

    /// The agent conversation id of the session's latest turn that had one.
    ///
    /// Returns `Ok(None)` for unknown sessions.
    async fn last_agent_session(&self, session_id: &str) -> StoreResult<Option<String>>;
}

#[cfg(test)]
pub(crate) fn sample_record(session_id: &str, agent_session: Option<&str>) -> TurnRecord {
    TurnRecord {
        session_id: session_id.to_string(),
        prompt: "Fix the bug".to_string(),
        text: "Fixed".to_string(),
        tool_calls: vec![serde_json::json!({"id": "tu_1", "name": "Edit"})],
        tool_results: Vec::new(),
        usage: Usage {
            input_tokens: 12,
            output_tokens: 34,
            ..Usage::default()
        },
        total_cost_usd: 0.02,
        status: TurnStatus::Completed,
        agent_session_id: agent_session.map(String::from),
        completed_at: Utc::now(),
    }
}
