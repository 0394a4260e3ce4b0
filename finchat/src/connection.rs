//! Connection lifecycle types and the reconnection backoff policy.
//!
//! The session supervisor in [`crate::net`] drives these states; everything
//! here is plain data so the lifecycle is testable without a socket.

use std::time::Duration;

use rand::Rng;

/// Lifecycle phase of the session's one transport connection.
///
/// `Closed` is terminal and entered only on explicit user shutdown, never
/// by error; every failure path lands in `Reconnecting` or `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// No transport, no retry scheduled.
    Disconnected,
    /// A dial and handshake are in flight.
    Connecting,
    /// Handshake acknowledged; chat envelopes flow.
    Connected,
    /// The transport was lost; a backoff timer is running.
    Reconnecting,
    /// Explicit shutdown; the session will not come back.
    Closed,
}

impl std::fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        };
        write!(f, "{name}")
    }
}

/// Observable connection state: the phase plus retry bookkeeping.
///
/// Owned exclusively by the supervisor; everything else reads snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    /// Current lifecycle phase.
    pub phase: ConnectionPhase,
    /// Consecutive failed attempts since the last successful connection.
    /// Reset to 0 on every `Connected` transition.
    pub retry_count: u32,
    /// Description of the most recent failure, if any.
    pub last_error: Option<String>,
}

impl ConnectionState {
    /// Initial state: disconnected, no retries, no error.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            phase: ConnectionPhase::Disconnected,
            retry_count: 0,
            last_error: None,
        }
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Exponential backoff with jitter for reconnection scheduling.
///
/// The delay for attempt `n` is `min(base * 2^n, max)`, jittered by up to
/// ±20% so a fleet of clients does not reconnect in lockstep.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any retry delay.
    pub max_delay: Duration,
}

/// Jitter applied to every delay, as a fraction of the raw delay.
const JITTER_FRACTION: f64 = 0.2;

impl BackoffPolicy {
    /// The un-jittered delay for the given retry count.
    #[must_use]
    pub fn raw_delay(&self, retry_count: u32) -> Duration {
        let exp = retry_count.min(31);
        self.base_delay
            .saturating_mul(1_u32 << exp)
            .min(self.max_delay)
    }

    /// The jittered delay for the given retry count.
    #[must_use]
    pub fn delay(&self, retry_count: u32) -> Duration {
        let raw = self.raw_delay(retry_count);
        let factor = rand::rng().random_range(1.0 - JITTER_FRACTION..=1.0 + JITTER_FRACTION);
        raw.mul_f64(factor)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}
