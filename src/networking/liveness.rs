//! Heartbeat-based liveness and round-trip timing.
//!
//! The monitor is driven by explicit timestamps so the coordinator can run it from any
//! clock: the async service passes `Instant::now()`, tests pass simulated instants.

use std::time::{Duration, Instant};

use super::protocol::Message;

/// Heartbeat interval in milliseconds.
pub const HEARTBEAT_INTERVAL_MS: u64 = 1000;

/// Silence after which the link is declared dead, in milliseconds.
pub const HEARTBEAT_TIMEOUT_MS: u64 = 3000;

/// Shortest heartbeat interval the monitor will schedule.
pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1);

/// What the owner should do after polling the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessAction {
    /// Nothing due.
    Idle,
    /// Send `Message::Heartbeat { is_reply: false }`.
    SendPing,
    /// No heartbeat seen within the timeout. The monitor has stopped itself.
    TimedOut,
}

/// Periodic ping emitter and silent-disconnect detector.
#[derive(Debug)]
pub struct LivenessMonitor {
    interval: Duration,
    timeout: Duration,
    running: bool,
    next_ping_at: Option<Instant>,
    last_ping_sent_at: Option<Instant>,
    last_remote_seen: Option<Instant>,
    ping_ms: Option<f64>,
}

impl Default for LivenessMonitor {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(HEARTBEAT_INTERVAL_MS),
            Duration::from_millis(HEARTBEAT_TIMEOUT_MS),
        )
    }
}

impl LivenessMonitor {
    /// Intervals below [`MIN_HEARTBEAT_INTERVAL`] are raised to it.
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval: interval.max(MIN_HEARTBEAT_INTERVAL),
            timeout,
            running: false,
            next_ping_at: None,
            last_ping_sent_at: None,
            last_remote_seen: None,
            ping_ms: None,
        }
    }

    /// Begin heartbeating. The peer is considered seen at `now`.
    pub fn start(&mut self, now: Instant) {
        self.running = true;
        self.next_ping_at = now.checked_add(self.interval);
        self.last_ping_sent_at = None;
        self.last_remote_seen = Some(now);
    }

    pub fn stop(&mut self) {
        self.running = false;
        self.next_ping_at = None;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Check the timeout, then the ping schedule.
    pub fn poll(&mut self, now: Instant) -> LivenessAction {
        if !self.running {
            return LivenessAction::Idle;
        }

        if let Some(seen) = self.last_remote_seen {
            if now.saturating_duration_since(seen) > self.timeout {
                tracing::warn!(
                    "No heartbeat for {} ms, declaring link dead",
                    now.saturating_duration_since(seen).as_millis()
                );
                self.stop();
                return LivenessAction::TimedOut;
            }
        }

        match self.next_ping_at {
            Some(due) if now >= due => {
                self.last_ping_sent_at = Some(now);
                // Skip missed slots rather than bursting pings after a stall.
                let missed = now.duration_since(due).as_nanos() / self.interval.as_nanos();
                let slots = u32::try_from(missed + 1).unwrap_or(u32::MAX);
                self.next_ping_at = self
                    .interval
                    .checked_mul(slots)
                    .and_then(|step| due.checked_add(step));
                LivenessAction::SendPing
            }
            _ => LivenessAction::Idle,
        }
    }

    /// Record a heartbeat from the peer. Returns the pong to send for a ping.
    pub fn on_heartbeat(&mut self, is_reply: bool, now: Instant) -> Option<Message> {
        if !self.running {
            return None;
        }

        self.last_remote_seen = Some(now);

        if is_reply {
            if let Some(sent) = self.last_ping_sent_at {
                self.ping_ms = Some(now.saturating_duration_since(sent).as_secs_f64() * 1000.0);
            }
            None
        } else {
            Some(Message::Heartbeat { is_reply: true })
        }
    }

    /// Last measured round trip in milliseconds.
    pub fn ping_ms(&self) -> Option<f64> {
        self.ping_ms
    }

    /// Earliest instant at which `poll` may act.
    pub fn next_deadline(&self) -> Option<Instant> {
        if !self.running {
            return None;
        }
        let timeout_at = self
            .last_remote_seen
            .and_then(|seen| seen.checked_add(self.timeout));
        match (self.next_ping_at, timeout_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}
