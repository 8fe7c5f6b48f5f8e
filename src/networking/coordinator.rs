//! Connection coordinator for one Captain/Stoker pairing.
//!
//! Owns the room code, role, transport sessions, liveness monitor and the single
//! [`ConnectionState`] record. Every input (transport event, timer tick, game command) is a
//! `&mut self` call carrying the current instant, so a transition is always completed before
//! any [`SessionHandler`] callback observes it.

use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::SeedableRng;

use super::liveness::{LivenessAction, LivenessMonitor};
use super::protocol::{Foot, GameEvent, Message, StateSnapshot};
use super::room::{Role, RoomCode, RoomCodeError};
use super::transport::{
    PrimaryConnector, RelayConnector, RelayControl, SessionId, TransportError, TransportEvent,
    TransportKind, TransportSession,
};
use super::NetworkConfig;

/// Receives everything the link surfaces to the game.
///
/// All methods default to no-ops so collaborators implement only what they consume.
pub trait SessionHandler: Send {
    fn on_connected(&mut self, _transport: TransportKind) {}

    /// Link lost or reconnection given up. The reason is for display only.
    fn on_disconnected(&mut self, _reason: &str) {}

    fn on_pedal_received(&mut self, _foot: Foot) {}

    fn on_state_received(&mut self, _snapshot: &StateSnapshot, _received_at: Instant) {}

    fn on_event_received(&mut self, _event: GameEvent) {}

    fn on_lean_received(&mut self, _value: f32) {}
}

/// Where the link is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPhase {
    /// No room created or joined.
    Idle,
    /// Waiting for the given transport to come up.
    Connecting(TransportKind),
    /// Link up over the given transport.
    Connected(TransportKind),
    /// Link lost; `attempt` reconnection attempts made so far.
    Reconnecting { attempt: u32 },
    /// Reconnection exhausted. Only `destroy` leaves this phase.
    Failed,
}

/// Connection facts shared with the game.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConnectionState {
    pub transport: TransportKind,
    pub connected: bool,
    pub ping_ms: f64,
    pub reconnect_attempts: u32,
}

/// Counters for diagnostics overlays and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Diagnostics {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub malformed_messages: u64,
    pub transport_errors: u64,
    pub unknown_control_frames: u64,
    pub stale_events: u64,
}

/// Primary/relay connection policy and message dispatch.
pub struct ConnectionCoordinator {
    config: NetworkConfig,
    primary_connector: Box<dyn PrimaryConnector>,
    relay_connector: Option<Box<dyn RelayConnector>>,
    handler: Box<dyn SessionHandler>,
    rng: StdRng,
    role: Option<Role>,
    room_code: Option<RoomCode>,
    phase: LinkPhase,
    state: ConnectionState,
    primary: Option<Box<dyn TransportSession>>,
    relay: Option<Box<dyn TransportSession>>,
    liveness: LivenessMonitor,
    fallback_deadline: Option<Instant>,
    reconnect_deadline: Option<Instant>,
    next_session: u64,
    diagnostics: Diagnostics,
}

impl ConnectionCoordinator {
    pub fn new(
        config: NetworkConfig,
        primary_connector: Box<dyn PrimaryConnector>,
        relay_connector: Option<Box<dyn RelayConnector>>,
        handler: Box<dyn SessionHandler>,
    ) -> Self {
        let liveness = LivenessMonitor::new(
            Duration::from_millis(config.heartbeat_interval_ms),
            Duration::from_millis(config.heartbeat_timeout_ms),
        );

        Self {
            config,
            primary_connector,
            relay_connector,
            handler,
            rng: StdRng::from_entropy(),
            role: None,
            room_code: None,
            phase: LinkPhase::Idle,
            state: ConnectionState::default(),
            primary: None,
            relay: None,
            liveness,
            fallback_deadline: None,
            reconnect_deadline: None,
            next_session: 0,
            diagnostics: Diagnostics::default(),
        }
    }

    /// Use a specific random source for room codes.
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn phase(&self) -> LinkPhase {
        self.phase
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn room_code(&self) -> Option<&RoomCode> {
        self.room_code.as_ref()
    }

    pub fn diagnostics(&self) -> Diagnostics {
        self.diagnostics
    }

    pub fn is_connected(&self) -> bool {
        self.state.connected
    }

    /// Host a room as Captain. Taken codes are regenerated without surfacing an error.
    pub fn create_room(&mut self, now: Instant) -> Result<RoomCode, SyncError> {
        if self.phase != LinkPhase::Idle {
            return Err(SyncError::AlreadyActive);
        }

        for _ in 0..self.config.max_room_code_attempts {
            let code = RoomCode::generate(&mut self.rng);
            let id = self.next_session_id();

            match self.primary_connector.listen(id, &code) {
                Ok(session) => {
                    tracing::info!("Created room {} as Captain", code);
                    self.role = Some(Role::Captain);
                    self.primary = Some(session);
                    self.room_code = Some(code.clone());
                    self.enter_connecting(now);
                    return Ok(code);
                }
                Err(TransportError::AddressTaken(_)) => {
                    tracing::debug!("Room code {} already taken, regenerating", code);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(SyncError::RoomCodeExhausted)
    }

    /// Join the Captain's room as Stoker.
    pub fn join_room(&mut self, code: RoomCode, now: Instant) -> Result<(), SyncError> {
        if self.phase != LinkPhase::Idle {
            return Err(SyncError::AlreadyActive);
        }

        let id = self.next_session_id();
        let session = self.primary_connector.connect(id, &code)?;

        tracing::info!("Joining room {} as Stoker", code);
        self.role = Some(Role::Stoker);
        self.primary = Some(session);
        self.room_code = Some(code);
        self.enter_connecting(now);
        Ok(())
    }

    pub fn send_pedal(&mut self, foot: Foot) -> Result<(), SyncError> {
        self.send_message(Message::Pedal { foot })
    }

    /// Send an authoritative snapshot. Only the Captain runs physics.
    pub fn send_state(&mut self, snapshot: StateSnapshot) -> Result<(), SyncError> {
        if self.role != Some(Role::Captain) {
            return Err(SyncError::NotAuthoritative);
        }
        self.send_message(Message::State(snapshot))
    }

    pub fn send_event(&mut self, event: GameEvent) -> Result<(), SyncError> {
        self.send_message(Message::Event(event))
    }

    pub fn send_lean(&mut self, value: f32) -> Result<(), SyncError> {
        self.send_message(Message::Lean(value))
    }

    /// Route a game message to the matching send operation.
    pub fn send(&mut self, message: Message) -> Result<(), SyncError> {
        match message {
            Message::Pedal { foot } => self.send_pedal(foot),
            Message::State(snapshot) => self.send_state(snapshot),
            Message::Event(event) => self.send_event(event),
            Message::Lean(value) => self.send_lean(value),
            Message::Heartbeat { .. } => Err(SyncError::HeartbeatReserved),
        }
    }

    /// Stop everything and return to `Idle`. Safe from any phase, any number of times.
    pub fn destroy(&mut self) {
        if self.phase != LinkPhase::Idle {
            tracing::info!("Destroying link ({:?})", self.phase);
        }

        self.liveness.stop();
        self.fallback_deadline = None;
        self.reconnect_deadline = None;
        self.close_primary();
        self.close_relay();
        self.state = ConnectionState::default();
        self.phase = LinkPhase::Idle;
        self.role = None;
        self.room_code = None;
    }

    /// Earliest instant at which `tick` has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.fallback_deadline,
            self.reconnect_deadline,
            self.liveness.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Fire due timers: primary fallback, reconnection backoff, heartbeat.
    pub fn tick(&mut self, now: Instant) {
        if self.fallback_deadline.is_some_and(|due| now >= due) {
            self.fallback_deadline = None;
            self.on_fallback_timer();
        }

        if self.reconnect_deadline.is_some_and(|due| now >= due) {
            self.reconnect_deadline = None;
            self.on_reconnect_timer(now);
        }

        if self.state.connected {
            match self.liveness.poll(now) {
                LivenessAction::SendPing => {
                    if let Err(e) = self.send_message(Message::Heartbeat { is_reply: false }) {
                        tracing::debug!("Heartbeat not sent: {}", e);
                    }
                }
                LivenessAction::TimedOut => self.link_lost("Heartbeat timeout", now),
                LivenessAction::Idle => {}
            }
        }
    }

    /// Feed one event from a transport session.
    pub fn handle_transport_event(
        &mut self,
        session: SessionId,
        event: TransportEvent,
        now: Instant,
    ) {
        let Some(kind) = self.session_kind(session) else {
            self.diagnostics.stale_events += 1;
            tracing::trace!("Ignoring event from discarded session {}", session);
            return;
        };

        match event {
            TransportEvent::Open => self.on_session_open(kind, now),
            TransportEvent::Data(bytes) => self.on_session_data(kind, &bytes, now),
            TransportEvent::Control(control) => self.on_control(kind, control, now),
            TransportEvent::Error(message) => {
                self.diagnostics.transport_errors += 1;
                tracing::warn!("{} transport error: {}", kind, message);
            }
            TransportEvent::Closed => self.on_session_closed(kind, now),
        }
    }

    fn next_session_id(&mut self) -> SessionId {
        self.next_session += 1;
        SessionId(self.next_session)
    }

    fn session_kind(&self, session: SessionId) -> Option<TransportKind> {
        if self.primary.as_ref().is_some_and(|s| s.id() == session) {
            Some(TransportKind::Primary)
        } else if self.relay.as_ref().is_some_and(|s| s.id() == session) {
            Some(TransportKind::Relay)
        } else {
            None
        }
    }

    fn enter_connecting(&mut self, now: Instant) {
        self.phase = LinkPhase::Connecting(TransportKind::Primary);
        self.state.transport = TransportKind::Primary;
        self.fallback_deadline =
            deadline_after(now, Duration::from_millis(self.config.fallback_timeout_ms));
    }

    fn enter_connected(&mut self, kind: TransportKind, now: Instant) {
        self.fallback_deadline = None;
        self.reconnect_deadline = None;

        // First path to connect wins; the other one is discarded.
        match kind {
            TransportKind::Primary => self.close_relay(),
            TransportKind::Relay => self.close_primary(),
            TransportKind::None => {}
        }

        self.phase = LinkPhase::Connected(kind);
        self.state.transport = kind;
        self.state.connected = true;
        self.state.reconnect_attempts = 0;
        self.liveness.start(now);

        tracing::info!("Connected over {} transport", kind);
        self.handler.on_connected(kind);
    }

    fn on_fallback_timer(&mut self) {
        if self.phase != LinkPhase::Connecting(TransportKind::Primary) {
            return;
        }

        let Some(url) = self.config.relay_url.clone() else {
            tracing::warn!(
                "Primary transport not open after {} ms and no relay configured; still waiting",
                self.config.fallback_timeout_ms
            );
            return;
        };

        tracing::warn!(
            "Primary transport not open after {} ms, falling back to relay",
            self.config.fallback_timeout_ms
        );
        if self.open_relay(&url) {
            self.phase = LinkPhase::Connecting(TransportKind::Relay);
            self.state.transport = TransportKind::Relay;
        }
    }

    fn on_session_open(&mut self, kind: TransportKind, now: Instant) {
        match (kind, self.phase) {
            (TransportKind::Primary, LinkPhase::Connected(TransportKind::Primary)) => {
                tracing::debug!("Primary accepted a fresh peer connection");
            }
            (TransportKind::Primary, LinkPhase::Connected(_)) => {
                tracing::debug!("Primary opened after relay won, discarding it");
                self.close_primary();
            }
            (TransportKind::Primary, LinkPhase::Connecting(_) | LinkPhase::Reconnecting { .. }) => {
                self.enter_connected(TransportKind::Primary, now);
            }
            (TransportKind::Relay, _) => {
                tracing::debug!("Relay socket open, waiting for partner");
            }
            _ => {}
        }
    }

    fn on_session_data(&mut self, kind: TransportKind, bytes: &[u8], now: Instant) {
        if !self.state.connected || self.state.transport != kind {
            self.diagnostics.stale_events += 1;
            return;
        }

        let message = match Message::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                self.diagnostics.malformed_messages += 1;
                tracing::debug!("Dropping malformed frame: {}", e);
                return;
            }
        };

        self.diagnostics.messages_received += 1;

        match message {
            Message::Heartbeat { is_reply } => {
                if let Some(reply) = self.liveness.on_heartbeat(is_reply, now) {
                    if let Err(e) = self.send_message(reply) {
                        tracing::debug!("Heartbeat reply not sent: {}", e);
                    }
                }
                if let Some(ping) = self.liveness.ping_ms() {
                    self.state.ping_ms = ping;
                }
            }
            Message::Pedal { foot } => self.handler.on_pedal_received(foot),
            Message::State(snapshot) => self.handler.on_state_received(&snapshot, now),
            Message::Event(event) => self.handler.on_event_received(event),
            Message::Lean(value) => self.handler.on_lean_received(value),
        }
    }

    fn on_control(&mut self, kind: TransportKind, control: RelayControl, now: Instant) {
        if kind != TransportKind::Relay {
            return;
        }

        match control {
            RelayControl::PartnerReady => match self.phase {
                LinkPhase::Connected(TransportKind::Relay) => {}
                LinkPhase::Connected(_) => {
                    tracing::debug!("Relay partner ready after primary won, discarding relay");
                    self.close_relay();
                }
                LinkPhase::Connecting(_) | LinkPhase::Reconnecting { .. } => {
                    self.enter_connected(TransportKind::Relay, now);
                }
                LinkPhase::Idle | LinkPhase::Failed => {}
            },
            RelayControl::Disconnect => {
                if self.phase == LinkPhase::Connected(TransportKind::Relay) {
                    self.link_lost("Partner disconnected", now);
                } else {
                    tracing::debug!("Relay partner left before the link came up");
                }
            }
            RelayControl::Unknown => {
                self.diagnostics.unknown_control_frames += 1;
                tracing::debug!("Ignoring unknown relay control frame");
            }
        }
    }

    fn on_session_closed(&mut self, kind: TransportKind, now: Instant) {
        let active = self.state.connected && self.state.transport == kind;

        match kind {
            // A Captain's listener outlives its peer connections.
            TransportKind::Primary if self.role == Some(Role::Captain) => {}
            TransportKind::Primary => self.close_primary(),
            TransportKind::Relay => self.close_relay(),
            TransportKind::None => {}
        }

        if kind == TransportKind::Relay && self.phase == LinkPhase::Connecting(TransportKind::Relay) {
            tracing::warn!("Relay closed before the partner was ready, waiting on primary again");
            self.phase = LinkPhase::Connecting(TransportKind::Primary);
            self.state.transport = TransportKind::Primary;
            self.fallback_deadline =
                deadline_after(now, Duration::from_millis(self.config.fallback_timeout_ms));
            return;
        }

        if active {
            self.link_lost("Connection closed", now);
        } else {
            tracing::debug!("{} session closed while not active", kind);
        }
    }

    fn link_lost(&mut self, reason: &str, now: Instant) {
        if !self.state.connected {
            return;
        }

        let lost = self.state.transport;
        self.liveness.stop();
        self.state.connected = false;
        self.state.reconnect_attempts = 0;
        if lost == TransportKind::Relay {
            self.close_relay();
        }

        self.phase = LinkPhase::Reconnecting { attempt: 0 };
        self.reconnect_deadline = deadline_after(now, self.backoff_delay(1));

        tracing::warn!("Link over {} lost: {}", lost, reason);
        self.handler.on_disconnected(reason);
    }

    /// Delay before attempt `n` (1-based): base, 2x base, 4x base, ...
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.config.reconnect_base_delay_ms.saturating_mul(factor))
    }

    fn on_reconnect_timer(&mut self, now: Instant) {
        let LinkPhase::Reconnecting { attempt } = self.phase else {
            return;
        };

        if attempt >= self.config.max_reconnect_attempts {
            self.give_up();
            return;
        }

        let attempt = attempt + 1;
        self.phase = LinkPhase::Reconnecting { attempt };
        self.state.reconnect_attempts = attempt;
        tracing::info!(
            "Reconnection attempt {}/{}",
            attempt,
            self.config.max_reconnect_attempts
        );

        self.attempt_reconnect();

        // After the last attempt this is the grace period before giving up.
        self.reconnect_deadline = deadline_after(now, self.backoff_delay(attempt + 1));
    }

    fn attempt_reconnect(&mut self) {
        let Some(code) = self.room_code.clone() else {
            return;
        };

        match self.role {
            Some(Role::Stoker) => {
                self.close_primary();
                let id = self.next_session_id();
                match self.primary_connector.connect(id, &code) {
                    Ok(session) => self.primary = Some(session),
                    Err(e) => {
                        self.diagnostics.transport_errors += 1;
                        tracing::warn!("Primary reconnect to {} failed: {}", code, e);
                    }
                }
            }
            Some(Role::Captain) => {
                if self.primary.is_none() {
                    let id = self.next_session_id();
                    match self.primary_connector.listen(id, &code) {
                        Ok(session) => self.primary = Some(session),
                        Err(e) => {
                            self.diagnostics.transport_errors += 1;
                            tracing::warn!("Re-registering room {} failed: {}", code, e);
                        }
                    }
                }
                if let Some(url) = self.config.relay_url.clone() {
                    self.open_relay(&url);
                }
            }
            None => {}
        }
    }

    fn give_up(&mut self) {
        self.phase = LinkPhase::Failed;
        self.fallback_deadline = None;
        self.reconnect_deadline = None;
        self.close_primary();
        self.close_relay();
        self.state.transport = TransportKind::None;

        let reason = format!(
            "Reconnection failed after {} attempts",
            self.config.max_reconnect_attempts
        );
        tracing::error!("{}", reason);
        self.handler.on_disconnected(&reason);
    }

    fn open_relay(&mut self, url: &str) -> bool {
        let (Some(code), Some(role)) = (self.room_code.clone(), self.role) else {
            return false;
        };
        if self.relay_connector.is_none() {
            tracing::warn!("Relay URL configured but no relay connector available");
            return false;
        }

        self.close_relay();
        let id = self.next_session_id();
        let Some(connector) = self.relay_connector.as_mut() else {
            return false;
        };

        match connector.open(id, url, &code, role) {
            Ok(session) => {
                self.relay = Some(session);
                true
            }
            Err(e) => {
                self.diagnostics.transport_errors += 1;
                tracing::warn!("Opening relay session failed: {}", e);
                false
            }
        }
    }

    fn send_message(&mut self, message: Message) -> Result<(), SyncError> {
        if !self.state.connected {
            return Err(SyncError::NotConnected);
        }

        let session = match self.state.transport {
            TransportKind::Primary => self.primary.as_mut(),
            TransportKind::Relay => self.relay.as_mut(),
            TransportKind::None => None,
        }
        .ok_or(SyncError::NotConnected)?;

        if let Err(e) = session.send(&message.encode()) {
            self.diagnostics.transport_errors += 1;
            return Err(e.into());
        }

        self.diagnostics.messages_sent += 1;
        Ok(())
    }

    fn close_primary(&mut self) {
        if let Some(mut session) = self.primary.take() {
            session.close();
        }
    }

    fn close_relay(&mut self) {
        if let Some(mut session) = self.relay.take() {
            session.close();
        }
    }
}

/// `now + delay`, or no deadline at all if that is beyond what `Instant` can represent.
fn deadline_after(now: Instant, delay: Duration) -> Option<Instant> {
    let deadline = now.checked_add(delay);
    if deadline.is_none() {
        tracing::warn!("Timer of {:?} is out of range, not scheduling it", delay);
    }
    deadline
}

impl Drop for ConnectionCoordinator {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Coordinator errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("A room is already active")]
    AlreadyActive,

    #[error("Not connected")]
    NotConnected,

    #[error("Only the Captain sends state")]
    NotAuthoritative,

    #[error("Heartbeats are sent by the link itself")]
    HeartbeatReserved,

    #[error("Could not find a free room code")]
    RoomCodeExhausted,

    #[error("Invalid room code: {0}")]
    InvalidRoomCode(#[from] RoomCodeError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Sync service stopped")]
    ServiceStopped,
}
