//! Inferred peer liveness
//!
//! The tunnel protocol has no keepalive exchange of its own, so liveness is
//! inferred from which direction has been carrying traffic. A signed bias
//! counts idle ticks:
//!
//! ```text
//!            keepalive                                   timeout
//!   ◄──────────┼─────────────────── 0 ───────────────────────┼──────────►
//!   -keepalive_ticks    receiving only │ sending only   +timeout_ticks
//! ```
//!
//! - Outbound traffic moves the bias to the positive side, inbound traffic
//!   to zero.
//! - Each idle tick pushes the bias further away from zero in the direction
//!   it already leans.
//! - Far on the negative side we have only been receiving: send keepalives
//!   so NAT state toward the client does not expire.
//! - Far on the positive side we have been sending without hearing back:
//!   the peer is gone.

use std::time::Duration;

// ============================================================================
// Constants
// ============================================================================

/// Sleep between idle loop iterations
pub const IDLE_TICK: Duration = Duration::from_millis(100);

/// Receive-only silence before keepalives are sent
pub const KEEPALIVE_AFTER: Duration = Duration::from_secs(10);

/// Default send-only silence before the peer is declared unreachable
pub const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(60);

/// Longest accepted peer timeout
pub const MAX_PEER_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Keepalives sent per trigger (datagrams may be lost)
pub const KEEPALIVE_BURST: usize = 3;

// ============================================================================
// Tracker
// ============================================================================

/// What the forwarding loop must do after an idle tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessAction {
    Continue,
    SendKeepalive,
    TimedOut,
}

/// Tick thresholds for a [`LivenessTracker`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessConfig {
    pub tick: Duration,
    pub keepalive_ticks: i64,
    pub timeout_ticks: i64,
}

impl LivenessConfig {
    /// Thresholds expressed in whole ticks of `tick`
    pub fn new(tick: Duration, keepalive_after: Duration, peer_timeout: Duration) -> Self {
        LivenessConfig {
            tick,
            keepalive_ticks: ticks(keepalive_after, tick),
            timeout_ticks: ticks(peer_timeout, tick),
        }
    }

    /// Production thresholds with the given peer timeout
    pub fn with_timeout(peer_timeout: Duration) -> Self {
        Self::new(IDLE_TICK, KEEPALIVE_AFTER, peer_timeout)
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self::with_timeout(DEFAULT_PEER_TIMEOUT)
    }
}

fn ticks(span: Duration, tick: Duration) -> i64 {
    let tick_ms = tick.as_millis().max(1);
    i64::try_from(span.as_millis() / tick_ms).unwrap_or(i64::MAX)
}

/// Idle-tick counter inferring one-sided silence
#[derive(Debug, Clone)]
pub struct LivenessTracker {
    config: LivenessConfig,
    bias: i64,
}

impl LivenessTracker {
    pub fn new(config: LivenessConfig) -> Self {
        LivenessTracker { config, bias: 0 }
    }

    pub fn config(&self) -> LivenessConfig {
        self.config
    }

    /// Current bias (negative: receiving only, positive: sending only)
    pub fn bias(&self) -> i64 {
        self.bias
    }

    /// A packet went out to the client
    pub fn on_sent(&mut self) {
        if self.bias < 1 {
            self.bias = 1;
        }
    }

    /// A message came in from the client
    pub fn on_received(&mut self) {
        if self.bias > 0 {
            self.bias = 0;
        }
    }

    /// Neither direction moved during the last iteration
    pub fn on_idle_tick(&mut self) -> LivenessAction {
        self.bias = if self.bias > 0 {
            self.bias.saturating_add(1)
        } else {
            self.bias.saturating_sub(1)
        };

        if self.bias < -self.config.keepalive_ticks {
            // Switch to the sending side so the keepalive is not repeated
            // until another full window of silence has passed
            self.bias = 1;
            return LivenessAction::SendKeepalive;
        }

        if self.bias > self.config.timeout_ticks {
            return LivenessAction::TimedOut;
        }

        LivenessAction::Continue
    }
}
