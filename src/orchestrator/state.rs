//! Per-session stream state
//!
//! `idle → running → (awaitingPermission ⇄ running)* → terminated`, with
//! `cancelling` reachable from every non-terminal state.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::protocol::{PermissionRequest, Usage};

/// Lifecycle of one turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StreamStatus {
    /// Admitted, agent not yet running
    Idle,
    /// Forwarding agent output
    Running,
    /// Paused on a permission request
    AwaitingPermission,
    /// Tearing down after a cancel
    Cancelling,
    /// Terminator emitted; resources released
    Terminated,
}

impl StreamStatus {
    /// Whether the turn is over.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated)
    }

    /// Whether moving to `next` is legal.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Idle, Self::Running)
            | (Self::Running, Self::AwaitingPermission)
            | (Self::AwaitingPermission, Self::Running) => true,
            (Self::Terminated, _) => false,
            (_, Self::Cancelling | Self::Terminated) => true,
            _ => false,
        }
    }
}

/// Snapshot of a session's live turn
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStreamState {
    /// Session id
    pub session_id: String,
    /// Current status
    pub status: StreamStatus,
    /// The outstanding permission request, if any
    pub pending_permission: Option<PermissionRequest>,
    /// Usage reported so far
    pub usage: Usage,
    /// Cost reported so far
    pub total_cost_usd: f64,
    /// When the turn was admitted
    pub started_at: DateTime<Utc>,
    /// When the current permission wait began
    #[serde(skip_serializing_if = "Option::is_none")]
    pub awaiting_since: Option<DateTime<Utc>>,
}

impl SessionStreamState {
    /// Fresh `idle` state for an admitted turn.
    #[must_use]
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            status: StreamStatus::Idle,
            pending_permission: None,
            usage: Usage::default(),
            total_cost_usd: 0.0,
            started_at: Utc::now(),
            awaiting_since: None,
        }
    }

    /// Move to `next` if legal. Returns whether the move happened.
    pub fn transition(&mut self, next: StreamStatus) -> bool {
        if self.status == next {
            return true;
        }
        let legal = self.status.can_transition_to(next);
        debug_assert!(legal, "illegal transition {:?} -> {next:?}", self.status);
        if legal {
            self.status = next;
        }
        legal
    }
}
