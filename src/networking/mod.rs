//! Networking module for the two-rider tandem link
//!
//! Provides the wire codec, remote state interpolation, heartbeat liveness, primary and relay
//! transports, the connection coordinator and its async service wrapper.

pub mod coordinator;
pub mod interpolation;
pub mod liveness;
pub mod loopback;
pub mod protocol;
pub mod relay;
pub mod room;
pub mod service;
pub mod transport;

use serde::{Deserialize, Serialize};

// Re-export commonly used types
pub use coordinator::{
    ConnectionCoordinator, ConnectionState, Diagnostics, LinkPhase, SessionHandler, SyncError,
};
pub use interpolation::{InterpolationConfig, RemoteStateBuffer};
pub use liveness::{LivenessAction, LivenessMonitor};
pub use loopback::{LoopbackConnector, LoopbackNetwork};
pub use protocol::{DecodeError, Foot, GameEvent, Message, StateFlags, StateSnapshot};
pub use relay::WebSocketRelay;
pub use room::{Role, RoomCode, RoomCodeError};
pub use service::{SyncCommand, SyncEvent, SyncService};
pub use transport::{
    PrimaryConnector, RelayConnector, RelayControl, SessionId, TransportEnvelope, TransportError,
    TransportEvent, TransportKind, TransportSession,
};

/// Primary transport wait before falling back to the relay, in milliseconds.
pub const FALLBACK_TIMEOUT_MS: u64 = 60_000;

/// Reconnection attempts after a lost link.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// First reconnection delay in milliseconds; doubles per attempt.
pub const RECONNECT_BASE_DELAY_MS: u64 = 1000;

/// Service timer resolution in milliseconds.
pub const TICK_INTERVAL_MS: u64 = 50;

/// Room code registrations tried before giving up on collisions.
pub const MAX_ROOM_CODE_ATTEMPTS: u32 = 8;

/// Network configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// WebSocket relay endpoint used when the primary transport fails. `None` disables it.
    pub relay_url: Option<String>,
    /// Primary transport wait before relay fallback.
    pub fallback_timeout_ms: u64,
    /// Heartbeat interval in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Heartbeat silence that counts as a dead link.
    pub heartbeat_timeout_ms: u64,
    /// Reconnection attempts after a lost link.
    pub max_reconnect_attempts: u32,
    /// First reconnection delay; doubles per attempt.
    pub reconnect_base_delay_ms: u64,
    /// Service timer resolution.
    pub tick_interval_ms: u64,
    /// Room code registrations tried before giving up.
    pub max_room_code_attempts: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            relay_url: None,
            fallback_timeout_ms: FALLBACK_TIMEOUT_MS,
            heartbeat_interval_ms: liveness::HEARTBEAT_INTERVAL_MS,
            heartbeat_timeout_ms: liveness::HEARTBEAT_TIMEOUT_MS,
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            reconnect_base_delay_ms: RECONNECT_BASE_DELAY_MS,
            tick_interval_ms: TICK_INTERVAL_MS,
            max_room_code_attempts: MAX_ROOM_CODE_ATTEMPTS,
        }
    }
}

impl NetworkConfig {
    /// Create a new network configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults plus a relay endpoint.
    pub fn with_relay(url: impl Into<String>) -> Self {
        Self {
            relay_url: Some(url.into()),
            ..Self::default()
        }
    }
}
