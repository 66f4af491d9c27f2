//! Error types for the streaming subsystem
//!
//! Orchestrator-side failures that happen mid-turn are never returned to the
//! caller directly; they become a terminal `error` event on the turn's
//! stream (`TurnFailure::into_event`). The errors returned from function
//! calls are the ones that happen before a stream exists or outside it.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::{ErrorCode, StreamEvent};

/// Errors returned by `Orchestrator::start`
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OrchestratorError {
    /// The session already has a live turn
    #[error("session {0} already has an active stream")]
    SessionBusy(String),

    /// The start request was malformed; no state was created
    #[error("invalid start request: {0}")]
    Validation(String),
}

impl OrchestratorError {
    /// The wire error code for this failure.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::SessionBusy(_) => ErrorCode::Internal,
            Self::Validation(_) => ErrorCode::Validation,
        }
    }
}

/// Reasons a running turn failed
#[derive(Debug, Error)]
pub enum TurnFailure {
    /// The agent process could not be started
    #[error("failed to start agent: {0}")]
    Spawn(String),

    /// The agent crashed or exited without a result
    #[error("agent failed: {0}")]
    Upstream(String),

    /// No valid output within the stall timeout
    #[error("agent produced no valid output for {}s", .0.as_secs())]
    Stall(Duration),

    /// The turn ran longer than its running-time cap
    #[error("turn exceeded its {}s running-time limit", .0.as_secs())]
    TurnLimit(Duration),

    /// The user cancelled the turn
    #[error("cancelled by user")]
    Cancelled,

    /// The subscriber went away mid-turn
    #[error("stream subscriber disconnected")]
    Disconnected,
}

impl TurnFailure {
    /// The wire error code for this failure.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Spawn(_) => ErrorCode::SpawnFailure,
            Self::Upstream(_) => ErrorCode::UpstreamFailure,
            Self::Stall(_) | Self::TurnLimit(_) => ErrorCode::StallTimeout,
            Self::Cancelled | Self::Disconnected => ErrorCode::Cancelled,
        }
    }

    /// Convert into the terminal event that ends the turn.
    #[must_use]
    pub fn into_event(self) -> StreamEvent {
        StreamEvent::error(self.code(), self.to_string())
    }
}

/// Errors from the permission handshake
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PermissionError {
    /// The id is not the session's outstanding request
    #[error("permission request {0} is not pending")]
    Stale(String),
}

/// Frame decoding failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Frame had no payload
    #[error("empty frame")]
    Empty,

    /// Payload lacked a `type` discriminant
    #[error("frame has no type discriminant")]
    MissingType,

    /// Discriminant is not a known event type
    #[error("unknown event type: {0}")]
    UnknownType(String),

    /// Payload was not valid JSON or did not match its type
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// Frame bytes were not UTF-8
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,

    /// SSE `event:` name disagrees with the payload's `type`
    #[error("event name {declared} does not match payload type {actual}")]
    EventMismatch {
        /// Name from the `event:` line
        declared: String,
        /// Type from the payload
        actual: String,
    },
}

/// Persistence failures
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O error on the store's files
    #[error("I/O error at {path}: {source}")]
    Io {
        /// File being accessed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// A record could not be (de)serialized
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Create an I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Client consumer failures
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// Network or HTTP transport failure
    #[error("transport failure: {0}")]
    Transport(String),

    /// Server throttled the request
    #[error("rate limited, retry after {}s", .retry_after.as_secs())]
    RateLimited {
        /// Server-provided wait hint
        retry_after: Duration,
    },

    /// Server refused the request outright
    #[error("request rejected with status {status}: {message}")]
    Rejected {
        /// HTTP status code
        status: u16,
        /// Server-provided message
        message: String,
    },

    /// Reconnection attempts hit the configured cap
    #[error("gave up after {attempts} connection attempts")]
    RetriesExhausted {
        /// Attempts made
        attempts: u32,
    },

    /// A frame could not be decoded
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// `connect` was called while a stream is already active
    #[error("consumer already has an active stream")]
    AlreadyActive,

    /// `decide` was called with no permission request outstanding
    #[error("no permission request is pending")]
    NoPendingPermission,
}

impl ConsumerError {
    /// Whether the consumer should retry after this error.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::RateLimited { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turn_failure_codes() {
        assert_eq!(
            TurnFailure::Spawn("no such file".into()).code(),
            ErrorCode::SpawnFailure
        );
        assert_eq!(
            TurnFailure::Upstream("exit 1".into()).code(),
            ErrorCode::UpstreamFailure
        );
        assert_eq!(
            TurnFailure::Stall(Duration::from_secs(30)).code(),
            ErrorCode::StallTimeout
        );
        assert_eq!(TurnFailure::Cancelled.code(), ErrorCode::Cancelled);
        assert_eq!(
            TurnFailure::TurnLimit(Duration::from_secs(300)).code(),
            ErrorCode::StallTimeout
        );
    }

    #[test]
    fn test_turn_failure_into_event_is_terminal() {
        let event = TurnFailure::Stall(Duration::from_secs(30)).into_event();
        assert!(event.is_terminal());
        match event {
            StreamEvent::Error { code, message, .. } => {
                assert_eq!(code, ErrorCode::StallTimeout);
                assert!(message.contains("30s"), "got: {message}");
            }
            other => panic!("expected error event, got {other:?}"),
        }
    }

    #[test]
    fn test_consumer_error_retryability() {
        assert!(ConsumerError::Transport("reset".into()).is_retryable());
        assert!(ConsumerError::RateLimited {
            retry_after: Duration::from_secs(3)
        }
        .is_retryable());
        assert!(!ConsumerError::Rejected {
            status: 422,
            message: "empty prompt".into()
        }
        .is_retryable());
        assert!(!ConsumerError::RetriesExhausted { attempts: 5 }.is_retryable());
    }

    #[test]
    fn test_validation_error_code() {
        assert_eq!(
            OrchestratorError::Validation("empty".into()).code(),
            ErrorCode::Validation
        );
    }
}
