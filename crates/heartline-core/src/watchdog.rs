//! Member heartbeat watchdog.
//!
//! The hub announces its heartbeat interval right after accepting a member.
//! The member adopts it as `heartbeat_duration` and checks every duration
//! whether the hub has gone quiet for longer than `duration * margin`.

use std::time::Duration;

use crate::config::WatchdogConfig;

#[derive(Debug, Clone)]
pub struct HeartbeatWatch {
    duration_ms: u64,
    margin: u32,
    last_heartbeat_at: u64,
}

impl HeartbeatWatch {
    pub fn new(config: &WatchdogConfig, now_ms: u64) -> Self {
        Self {
            duration_ms: config.default_duration_ms,
            margin: config.margin,
            last_heartbeat_at: now_ms,
        }
    }

    /// Current heartbeat duration in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    /// Period of the watchdog timer.
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    pub fn last_heartbeat_at(&self) -> u64 {
        self.last_heartbeat_at
    }

    /// Start a fresh silence window.
    pub fn arm(&mut self, now_ms: u64) {
        self.last_heartbeat_at = now_ms;
    }

    /// Adopt the hub's announced interval and re-arm.
    ///
    /// A zero interval is ignored (returns false).
    pub fn negotiate(&mut self, duration_ms: u64, now_ms: u64) -> bool {
        if duration_ms == 0 {
            return false;
        }
        self.duration_ms = duration_ms;
        self.arm(now_ms);
        true
    }

    /// A `PING` arrived.
    pub fn record_ping(&mut self, now_ms: u64) {
        self.last_heartbeat_at = now_ms;
    }

    /// Whether the hub has been silent past the tolerated window.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        let elapsed = now_ms.saturating_sub(self.last_heartbeat_at);
        elapsed > self.duration_ms.saturating_mul(self.margin as u64)
    }
}
