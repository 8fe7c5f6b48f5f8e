//! Remote state smoothing.
//!
//! Blends the two most recent authoritative snapshots over an adaptive window so that a
//! 20 Hz state stream renders smoothly at display rate. Never extrapolates past the newest
//! snapshot.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use super::protocol::StateSnapshot;

/// Shortest blend window in milliseconds.
pub const MIN_WINDOW_MS: u64 = 30;

/// Longest blend window in milliseconds.
pub const MAX_WINDOW_MS: u64 = 100;

/// Window used until two snapshots have arrived (one 20 Hz period).
pub const DEFAULT_WINDOW_MS: u64 = 50;

/// Interpolation window bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpolationConfig {
    pub min_window_ms: u64,
    pub max_window_ms: u64,
    pub default_window_ms: u64,
}

impl Default for InterpolationConfig {
    fn default() -> Self {
        Self {
            min_window_ms: MIN_WINDOW_MS,
            max_window_ms: MAX_WINDOW_MS,
            default_window_ms: DEFAULT_WINDOW_MS,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Arrival {
    snapshot: StateSnapshot,
    received_at: Instant,
}

/// Holds the previous and current remote snapshot and samples between them.
#[derive(Debug)]
pub struct RemoteStateBuffer {
    previous: Option<Arrival>,
    current: Option<Arrival>,
    window: Duration,
    min_window: Duration,
    max_window: Duration,
    default_window: Duration,
    received: u64,
}

impl Default for RemoteStateBuffer {
    fn default() -> Self {
        Self::new(&InterpolationConfig::default())
    }
}

impl RemoteStateBuffer {
    pub fn new(config: &InterpolationConfig) -> Self {
        let min_window = Duration::from_millis(config.min_window_ms);
        let max_window = Duration::from_millis(config.max_window_ms.max(config.min_window_ms));
        let default_window =
            Duration::from_millis(config.default_window_ms).clamp(min_window, max_window);

        Self {
            previous: None,
            current: None,
            window: default_window,
            min_window,
            max_window,
            default_window,
            received: 0,
        }
    }

    /// Store a newly received snapshot and adapt the window to the arrival rate.
    ///
    /// Snapshots carry no sequence number, so whatever arrives last is treated as newest.
    pub fn push(&mut self, snapshot: StateSnapshot, now: Instant) {
        if let Some(current) = self.current {
            let delta = now.saturating_duration_since(current.received_at);
            self.window = delta.clamp(self.min_window, self.max_window);
        }

        self.previous = self.current.take();
        self.current = Some(Arrival {
            snapshot,
            received_at: now,
        });
        self.received += 1;
    }

    /// Interpolated state for `now`, or `None` before anything arrived.
    pub fn sample(&self, now: Instant) -> Option<StateSnapshot> {
        let current = self.current?;
        let Some(previous) = self.previous else {
            return Some(current.snapshot);
        };

        let t = self.fraction_between(current.received_at, now);
        Some(lerp_snapshot(&previous.snapshot, &current.snapshot, t))
    }

    /// Blend fraction `sample(now)` would use, clamped to `[0, 1]`.
    pub fn interpolation_fraction(&self, now: Instant) -> Option<f32> {
        let current = self.current?;
        self.previous?;
        Some(self.fraction_between(current.received_at, now))
    }

    fn fraction_between(&self, arrived: Instant, now: Instant) -> f32 {
        let elapsed = now.saturating_duration_since(arrived).as_secs_f32();
        let window = self.window.as_secs_f32();
        if window <= 0.0 {
            return 1.0;
        }
        (elapsed / window).clamp(0.0, 1.0)
    }

    /// Current blend window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Number of snapshots pushed since creation or the last clear.
    pub fn received_count(&self) -> u64 {
        self.received
    }

    /// Newest raw snapshot.
    pub fn latest(&self) -> Option<StateSnapshot> {
        self.current.map(|a| a.snapshot)
    }

    pub fn clear(&mut self) {
        self.previous = None;
        self.current = None;
        self.window = self.default_window;
        self.received = 0;
    }
}

fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

fn lerp_snapshot(from: &StateSnapshot, to: &StateSnapshot, t: f32) -> StateSnapshot {
    let a = from.fields();
    let b = to.fields();
    let blended = std::array::from_fn(|i| lerp(a[i], b[i], t));
    // Flags are discrete and always come from the newest snapshot.
    StateSnapshot::from_fields(blended, to.flags)
}
