//! Restart Signal Port (Driven Port)
//!
//! The correlation layer never touches the engine process. When the engine
//! reports a reserved failure code it only raises a signal through this
//! port; the process supervisor decides what to do with it.

use std::fmt;

/// Why a restart was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RestartReason {
    /// Engine returned `-1`: request could not be sent on its network link.
    NetworkFailure,
    /// Engine returned `-2`: unprocessed-request queue saturated.
    QueueOverflow,
    /// Operator or liveness policy asked for a restart.
    Manual,
}

impl RestartReason {
    /// Metric / log label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NetworkFailure => "network_failure",
            Self::QueueOverflow => "queue_overflow",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sink for restart requests.
pub trait RestartSignal: Send + Sync {
    /// Request a restart.
    ///
    /// Returns `true` if a new restart cycle was queued, `false` if the
    /// request coalesced into one that is already pending.
    fn request_restart(&self, reason: RestartReason) -> bool;
}
