//! TandemSync - Two-rider link for a split-device tandem bicycle game
//!
//! Keeps the Captain (front seat, runs physics) and the Stoker (rear seat) in sync over a
//! low-latency peer-to-peer transport, falling back to a WebSocket relay. Provides the binary
//! wire codec, remote state interpolation, heartbeat liveness, reconnection with backoff and
//! room code pairing.

pub mod logging;
pub mod networking;
pub mod storage;

// Re-export commonly used types
pub use networking::{
    ConnectionCoordinator, ConnectionState, Message, RemoteStateBuffer, Role, RoomCode,
    StateSnapshot, SyncError, SyncEvent, SyncService,
};
pub use storage::config::SyncConfig;
