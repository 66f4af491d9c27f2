//! Connection state machine and backoff

use std::fmt;
use std::time::Duration;

/// Client-side connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No stream; initial and final state
    #[default]
    Disconnected,
    /// Stream-start request in flight
    Connecting,
    /// Reading frames
    Connected,
    /// Waiting out the backoff before retry number `attempt`
    Reconnecting {
        /// 1-based retry number
        attempt: u32,
    },
}

impl ConnectionState {
    /// Whether `next` is a legal successor of `self`.
    ///
    /// Any state may move to `Disconnected` (cancel or give up).
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (_, Self::Disconnected)
            | (Self::Disconnected | Self::Reconnecting { .. }, Self::Connecting)
            | (Self::Connecting, Self::Connected) => true,
            (Self::Connected | Self::Connecting, Self::Reconnecting { attempt }) => attempt >= 1,
            _ => false,
        }
    }

    /// Whether a stream is open or being opened.
    #[must_use]
    pub const fn is_active(self) -> bool {
        !matches!(self, Self::Disconnected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting { attempt } => write!(f, "reconnecting({attempt})"),
        }
    }
}

/// Delay before retry number `attempt`: `base * 2^(attempt-1)`, capped at `max`.
#[must_use]
pub fn backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1 << exponent).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_transitions() {
        use ConnectionState::{Connected, Connecting, Disconnected, Reconnecting};

        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Reconnecting { attempt: 1 }));
        assert!(Reconnecting { attempt: 1 }.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Reconnecting { attempt: 2 }));
        assert!(Connected.can_transition_to(Disconnected));
        assert!(Reconnecting { attempt: 3 }.can_transition_to(Disconnected));
        assert!(Disconnected.can_transition_to(Disconnected));
    }

    #[test]
    fn test_illegal_transitions() {
        use ConnectionState::{Connected, Connecting, Disconnected, Reconnecting};

        assert!(!Connected.can_transition_to(Reconnecting { attempt: 0 }));
        assert!(!Connected.can_transition_to(Connecting));
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Disconnected.can_transition_to(Reconnecting { attempt: 1 }));
        assert!(!Reconnecting { attempt: 1 }.can_transition_to(Connected));
        assert!(!Connecting.can_transition_to(Reconnecting { attempt: 0 }));
    }

    #[test]
    fn test_display() {
        assert_eq!(
            ConnectionState::Reconnecting { attempt: 2 }.to_string(),
            "reconnecting(2)"
        );
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_millis(500);
        let max = Duration::from_secs(8);

        assert_eq!(backoff(1, base, max), Duration::from_millis(500));
        assert_eq!(backoff(2, base, max), Duration::from_secs(1));
        assert_eq!(backoff(3, base, max), Duration::from_secs(2));
        assert_eq!(backoff(5, base, max), Duration::from_secs(8));
        assert_eq!(backoff(40, base, max), Duration::from_secs(8));
    }

    #[test]
    fn test_backoff_attempt_zero_uses_base() {
        assert_eq!(
            backoff(0, Duration::from_millis(100), Duration::from_secs(1)),
            Duration::from_millis(100)
        );
    }
}
