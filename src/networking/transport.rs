//! Transport session contract shared by the primary and relay links.
//!
//! Opening a session is asynchronous: connectors return a handle immediately and report
//! lifecycle and inbound frames later as [`TransportEnvelope`]s on an [`EventSink`]. Each
//! session carries the [`SessionId`] the coordinator assigned, so events from sessions it
//! has already discarded can be recognised and ignored.

use serde::Deserialize;
use tokio::sync::mpsc;

use super::room::{Role, RoomCode};

/// Coordinator-assigned identity of one opened session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which transport carries the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransportKind {
    #[default]
    None,
    /// Low-latency peer-to-peer session addressed by room code.
    Primary,
    /// Server-mediated fallback.
    Relay,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::None => write!(f, "none"),
            TransportKind::Primary => write!(f, "primary"),
            TransportKind::Relay => write!(f, "relay"),
        }
    }
}

/// Out-of-band relay frames, sent as JSON text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RelayControl {
    /// Both legs of the relay are present.
    PartnerReady,
    /// The other leg dropped.
    Disconnect,
    #[serde(other)]
    Unknown,
}

impl RelayControl {
    /// Parse a text frame. Anything unrecognised, malformed JSON included, is `Unknown`.
    pub fn parse(text: &str) -> Self {
        serde_json::from_str(text).unwrap_or(RelayControl::Unknown)
    }
}

/// Something that happened on a session.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Data path is usable. For a Captain's listener this fires per accepted peer.
    Open,
    /// Binary game frame.
    Data(Vec<u8>),
    /// Relay control frame.
    Control(RelayControl),
    /// Non-fatal transport error. Only `Closed` ends a session.
    Error(String),
    /// The data path went away.
    Closed,
}

/// A session event tagged with its origin.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportEnvelope {
    pub session: SessionId,
    pub event: TransportEvent,
}

/// Where connectors deliver session events.
pub type EventSink = mpsc::UnboundedSender<TransportEnvelope>;

/// Deliver one event. A dropped receiver means the owner is gone, which is not an error here.
pub fn emit(sink: &EventSink, session: SessionId, event: TransportEvent) {
    let _ = sink.send(TransportEnvelope { session, event });
}

/// One underlying connection, primary or relay.
pub trait TransportSession: Send {
    fn id(&self) -> SessionId;

    fn kind(&self) -> TransportKind;

    /// Fire-and-forget send of one binary frame.
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Tear the session down. Must be safe to call more than once.
    fn close(&mut self);
}

/// The collaborator-supplied point-to-point primitive, addressed by room code.
pub trait PrimaryConnector: Send {
    /// Register as `code` and accept incoming connections (Captain).
    ///
    /// Returns [`TransportError::AddressTaken`] when another peer already holds the code.
    fn listen(
        &mut self,
        session: SessionId,
        code: &RoomCode,
    ) -> Result<Box<dyn TransportSession>, TransportError>;

    /// Connect to the peer registered as `code` (Stoker).
    fn connect(
        &mut self,
        session: SessionId,
        code: &RoomCode,
    ) -> Result<Box<dyn TransportSession>, TransportError>;
}

/// Opens relay fallback sessions.
pub trait RelayConnector: Send {
    fn open(
        &mut self,
        session: SessionId,
        url: &str,
        code: &RoomCode,
        role: Role,
    ) -> Result<Box<dyn TransportSession>, TransportError>;
}

/// Relay endpoint with room and role as connection parameters.
pub fn relay_endpoint(url: &str, code: &RoomCode, role: Role) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{}{}room={}&role={}", url, separator, code, role.as_str())
}

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Address already taken: {0}")]
    AddressTaken(String),

    #[error("Session is not open")]
    NotOpen,

    #[error("Failed to connect: {0}")]
    ConnectFailed(String),

    #[error("Failed to send: {0}")]
    SendFailed(String),

    #[error("No async runtime available")]
    NoRuntime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_control_parsing() {
        assert_eq!(
            RelayControl::parse(r#"{"type":"partner-ready"}"#),
            RelayControl::PartnerReady
        );
        assert_eq!(
            RelayControl::parse(r#"{"type":"disconnect","reason":"left"}"#),
            RelayControl::Disconnect
        );
        assert_eq!(RelayControl::parse(r#"{"type":"welcome"}"#), RelayControl::Unknown);
        assert_eq!(RelayControl::parse(r#"{"kind":"partner-ready"}"#), RelayControl::Unknown);
        assert_eq!(RelayControl::parse("not json"), RelayControl::Unknown);
    }

    #[test]
    fn test_relay_endpoint_parameters() {
        let code = RoomCode::parse("TNDM-K7M2").unwrap();
        assert_eq!(
            relay_endpoint("wss://relay.example/ws", &code, Role::Captain),
            "wss://relay.example/ws?room=TNDM-K7M2&role=captain"
        );
        assert_eq!(
            relay_endpoint("ws://localhost:9000/?v=2", &code, Role::Stoker),
            "ws://localhost:9000/?v=2&room=TNDM-K7M2&role=stoker"
        );
    }

    #[test]
    fn test_emit_survives_dropped_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        emit(&tx, SessionId(1), TransportEvent::Open);
    }
}
