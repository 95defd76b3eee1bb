//! Relay connection status and statistics

use crate::config::FlappingConfig;
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Number of connection durations kept for flapping detection
const MAX_DURATIONS: usize = 100;

/// Connection status of a relay.
///
/// Variants are ordered: every status at or above `Connected` has a live
/// socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RelayStatus {
    Disconnecting,
    Disconnected,
    Reconnecting,
    Flapping,
    Connecting,
    Connected,
    AuthRequested,
    Authenticating,
    Authenticated,
}

impl RelayStatus {
    pub fn is_connected(self) -> bool {
        self >= RelayStatus::Connected
    }

    /// Whether a `connect()` call may start from this status.
    pub fn can_connect(self) -> bool {
        matches!(self, RelayStatus::Disconnected | RelayStatus::Reconnecting)
    }
}

impl fmt::Display for RelayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RelayStatus::Disconnecting => "disconnecting",
            RelayStatus::Disconnected => "disconnected",
            RelayStatus::Reconnecting => "reconnecting",
            RelayStatus::Flapping => "flapping",
            RelayStatus::Connecting => "connecting",
            RelayStatus::Connected => "connected",
            RelayStatus::AuthRequested => "auth_requested",
            RelayStatus::Authenticating => "authenticating",
            RelayStatus::Authenticated => "authenticated",
        };
        f.write_str(s)
    }
}

/// Connection attempt history for one relay.
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    pub attempts: u32,
    pub successes: u32,
    /// Lifetimes of the most recent connections, in milliseconds
    pub durations: VecDeque<u64>,
    /// Start of the most recent successful connection
    pub connected_at: Option<Instant>,
    pub next_reconnect_at: Option<Instant>,
}

impl ConnectionStats {
    pub fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    pub fn record_success(&mut self, now: Instant) {
        self.successes += 1;
        self.connected_at = Some(now);
        self.next_reconnect_at = None;
    }

    /// Record the end of the current connection. Returns its lifetime.
    pub fn record_disconnect(&mut self, now: Instant) -> Option<Duration> {
        let connected_at = self.connected_at?;
        let lifetime = now.saturating_duration_since(connected_at);
        self.durations.push_back(lifetime.as_millis() as u64);
        if self.durations.len() > MAX_DURATIONS {
            self.durations.pop_front();
        }
        Some(lifetime)
    }

    /// A relay is flapping when its recent connections all lasted about the
    /// same (short or long) time. Checked on every third disconnect.
    pub fn is_flapping(&self, stddev_threshold_ms: f64) -> bool {
        let n = self.durations.len();
        if n == 0 || n % 3 != 0 {
            return false;
        }

        let mean = self.durations.iter().map(|d| *d as f64).sum::<f64>() / n as f64;
        let variance = self
            .durations
            .iter()
            .map(|d| (*d as f64 - mean).powi(2))
            .sum::<f64>()
            / n as f64;

        variance.sqrt() < stddev_threshold_ms
    }

    /// Delay before the next reconnect attempt.
    ///
    /// A relay that was connected waits out the rest of the reconnect window
    /// measured from when it connected. One that never connected backs off
    /// linearly with the number of attempts.
    pub fn reconnect_delay(&self, now: Instant, config: &FlappingConfig) -> Duration {
        match self.connected_at {
            Some(at) => {
                let window = Duration::from_millis(config.reconnect_window_ms);
                window.saturating_sub(now.saturating_duration_since(at))
            }
            None => Duration::from_millis(
                config.reconnect_base_delay_ms * (u64::from(self.attempts) + 1),
            ),
        }
    }

    /// Forget reconnect scheduling so the next attempt happens immediately.
    pub fn reset_reconnect_state(&mut self) {
        self.attempts = 0;
        self.next_reconnect_at = None;
    }
}
