//! Permission handshake
//!
//! Correlates the single outstanding permission request of a session with
//! the client's decision. `resolve` is the only mutating entry point and
//! succeeds at most once per request id.

use std::time::{Duration, Instant};

use crate::error::PermissionError;
use crate::protocol::{PermissionDecision, PermissionRequest};

#[derive(Debug)]
struct Pending {
    request: PermissionRequest,
    opened: Instant,
}

/// Outstanding request slot for one session
#[derive(Debug, Default)]
pub struct Handshake {
    pending: Option<Pending>,
}

impl Handshake {
    /// Create an empty handshake
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new outstanding request, replacing nothing: the
    /// orchestrator never opens a second one while one is pending.
    pub fn open(&mut self, request: PermissionRequest) {
        debug_assert!(self.pending.is_none(), "permission request already pending");
        self.pending = Some(Pending {
            request,
            opened: Instant::now(),
        });
    }

    /// Take the pending request if `decision` answers it.
    ///
    /// A stale or unknown id leaves the slot untouched.
    pub fn resolve(
        &mut self,
        decision: &PermissionDecision,
    ) -> Result<PermissionRequest, PermissionError> {
        match &self.pending {
            Some(p) if p.request.id == decision.id => {}
            _ => return Err(PermissionError::Stale(decision.id.clone())),
        }
        self.pending
            .take()
            .map(|p| p.request)
            .ok_or_else(|| PermissionError::Stale(decision.id.clone()))
    }

    /// The outstanding request, if any.
    #[must_use]
    pub fn pending(&self) -> Option<&PermissionRequest> {
        self.pending.as_ref().map(|p| &p.request)
    }

    /// How long the outstanding request has been waiting.
    #[must_use]
    pub fn awaiting_for(&self) -> Option<Duration> {
        self.pending.as_ref().map(|p| p.opened.elapsed())
    }

    /// Drop the outstanding request, e.g. on cancel.
    pub fn clear(&mut self) -> Option<PermissionRequest> {
        self.pending.take().map(|p| p.request)
    }
}
