//! Relay lifecycle states.
//!
//! ```text
//! Idle ─▶ Opened ─▶ Streaming ─┬─▶ Completing ─┐
//!            │                 ├─▶ Cancelling ─┼─▶ Closed
//!            └─────────────────┴─▶ Failing ────┘
//! ```
//!
//! `Failing` may still move to `Cancelling` while fallback content is
//! being delivered. `Closed` is terminal.

use std::fmt;

/// Lifecycle state of one relay
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayState {
    /// Created, nothing sent
    Idle,
    /// `init` sent, upstream call issued
    Opened,
    /// Reading the upstream body
    Streaming,
    /// Upstream finished; moderation and persistence pending
    Completing,
    /// Stopped by the client
    Cancelling,
    /// Upstream failed; fallback content in flight
    Failing,
    /// Terminal frame attempted; no further writes
    Closed,
}

impl RelayState {
    /// Whether `next` is a legal successor
    #[must_use]
    pub fn can_transition_to(self, next: RelayState) -> bool {
        use RelayState::{Cancelling, Closed, Completing, Failing, Idle, Opened, Streaming};
        matches!(
            (self, next),
            (Idle, Opened)
                | (Opened, Streaming | Cancelling | Failing)
                | (Streaming, Completing | Cancelling | Failing)
                | (Failing, Cancelling)
                | (Completing | Cancelling | Failing, Closed)
        )
    }

    /// Whether this is the terminal state
    #[must_use]
    pub fn is_closed(self) -> bool {
        self == RelayState::Closed
    }
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Opened => "opened",
            Self::Streaming => "streaming",
            Self::Completing => "completing",
            Self::Cancelling => "cancelling",
            Self::Failing => "failing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}
