//! Async front for the connection coordinator.
//!
//! [`SyncService`] owns a [`ConnectionCoordinator`] inside one tokio task. Game commands arrive
//! over a channel, transport sessions report into the task's event sink, and a fixed-rate tick
//! drives the timers. Everything the link surfaces is published as [`SyncEvent`]s; received
//! snapshots are also pushed into a shared [`RemoteStateBuffer`] for the render loop.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use super::coordinator::{
    ConnectionCoordinator, ConnectionState, Diagnostics, SessionHandler, SyncError,
};
use super::interpolation::{InterpolationConfig, RemoteStateBuffer};
use super::loopback::LoopbackNetwork;
use super::protocol::{Foot, GameEvent, Message, StateSnapshot};
use super::relay::WebSocketRelay;
use super::room::RoomCode;
use super::transport::{
    EventSink, PrimaryConnector, RelayConnector, TransportEnvelope, TransportError, TransportKind,
};
use super::NetworkConfig;

/// Event channel capacity.
const EVENT_CAPACITY: usize = 256;

/// What the link surfaced to the game.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected(TransportKind),
    Disconnected(String),
    Pedal(Foot),
    State(StateSnapshot),
    Event(GameEvent),
    Lean(f32),
}

/// Requests handled by the service task.
#[derive(Debug)]
pub enum SyncCommand {
    CreateRoom {
        reply: oneshot::Sender<Result<RoomCode, SyncError>>,
    },
    JoinRoom {
        code: RoomCode,
        reply: oneshot::Sender<Result<(), SyncError>>,
    },
    Send {
        message: Message,
        reply: oneshot::Sender<Result<(), SyncError>>,
    },
    Diagnostics {
        reply: oneshot::Sender<Diagnostics>,
    },
    Destroy,
}

struct ServiceHandler {
    event_tx: broadcast::Sender<SyncEvent>,
    remote: Arc<RwLock<RemoteStateBuffer>>,
}

impl SessionHandler for ServiceHandler {
    fn on_connected(&mut self, transport: TransportKind) {
        let _ = self.event_tx.send(SyncEvent::Connected(transport));
    }

    fn on_disconnected(&mut self, reason: &str) {
        let _ = self.event_tx.send(SyncEvent::Disconnected(reason.to_string()));
    }

    fn on_pedal_received(&mut self, foot: Foot) {
        let _ = self.event_tx.send(SyncEvent::Pedal(foot));
    }

    fn on_state_received(&mut self, snapshot: &StateSnapshot, received_at: Instant) {
        self.remote
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(*snapshot, received_at);
        let _ = self.event_tx.send(SyncEvent::State(*snapshot));
    }

    fn on_event_received(&mut self, event: GameEvent) {
        let _ = self.event_tx.send(SyncEvent::Event(event));
    }

    fn on_lean_received(&mut self, value: f32) {
        let _ = self.event_tx.send(SyncEvent::Lean(value));
    }
}

/// Handle to a running link task. Dropping it destroys the link and ends the task.
pub struct SyncService {
    commands: mpsc::UnboundedSender<SyncCommand>,
    event_tx: broadcast::Sender<SyncEvent>,
    remote: Arc<RwLock<RemoteStateBuffer>>,
    state: Arc<RwLock<ConnectionState>>,
}

impl SyncService {
    /// Start the link task on the current tokio runtime.
    ///
    /// `primary` builds the point-to-point connector around the task's event sink. A relay
    /// connector is added when `network.relay_url` is set.
    pub fn spawn<F>(
        network: NetworkConfig,
        interpolation: &InterpolationConfig,
        primary: F,
    ) -> Result<Self, SyncError>
    where
        F: FnOnce(EventSink) -> Box<dyn PrimaryConnector>,
    {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| TransportError::NoRuntime)?;

        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (sink, transport_rx) = mpsc::unbounded_channel();
        let remote = Arc::new(RwLock::new(RemoteStateBuffer::new(interpolation)));
        let state = Arc::new(RwLock::new(ConnectionState::default()));

        let relay: Option<Box<dyn RelayConnector>> = network
            .relay_url
            .as_ref()
            .map(|_| Box::new(WebSocketRelay::new(sink.clone())) as Box<dyn RelayConnector>);
        let tick = Duration::from_millis(network.tick_interval_ms.max(1));

        let handler = ServiceHandler {
            event_tx: event_tx.clone(),
            remote: Arc::clone(&remote),
        };
        let coordinator =
            ConnectionCoordinator::new(network, primary(sink), relay, Box::new(handler));

        runtime.spawn(run_link(
            coordinator,
            command_rx,
            transport_rx,
            Arc::clone(&remote),
            Arc::clone(&state),
            tick,
        ));

        Ok(Self {
            commands: command_tx,
            event_tx,
            remote,
            state,
        })
    }

    /// Start a link whose primary transport is an in-process [`LoopbackNetwork`].
    pub fn spawn_loopback(
        network: NetworkConfig,
        interpolation: &InterpolationConfig,
        loopback: &LoopbackNetwork,
    ) -> Result<Self, SyncError> {
        Self::spawn(network, interpolation, |sink| {
            Box::new(loopback.connector(sink)) as Box<dyn PrimaryConnector>
        })
    }

    /// Host a room as Captain.
    pub async fn create_room(&self) -> Result<RoomCode, SyncError> {
        self.request(|reply| SyncCommand::CreateRoom { reply })
            .await?
    }

    /// Join a room as Stoker. `code` is user input and is normalised first.
    pub async fn join_room(&self, code: &str) -> Result<(), SyncError> {
        let code = RoomCode::parse(code)?;
        self.request(|reply| SyncCommand::JoinRoom { code, reply })
            .await?
    }

    /// Send one game message to the partner.
    pub async fn send(&self, message: Message) -> Result<(), SyncError> {
        self.request(|reply| SyncCommand::Send { message, reply })
            .await?
    }

    pub async fn diagnostics(&self) -> Result<Diagnostics, SyncError> {
        self.request(|reply| SyncCommand::Diagnostics { reply }).await
    }

    /// Tear the link down. The service stays usable for a new room.
    pub fn destroy(&self) -> Result<(), SyncError> {
        self.commands
            .send(SyncCommand::Destroy)
            .map_err(|_| SyncError::ServiceStopped)
    }

    /// Subscribe to link events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.event_tx.subscribe()
    }

    /// Interpolated partner state for `now`.
    pub fn remote_state(&self, now: Instant) -> Option<StateSnapshot> {
        self.remote
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .sample(now)
    }

    /// Shared snapshot buffer, for render loops that sample it directly.
    pub fn remote_buffer(&self) -> Arc<RwLock<RemoteStateBuffer>> {
        Arc::clone(&self.remote)
    }

    /// Connection state as of the task's last step.
    pub fn connection_state(&self) -> ConnectionState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SyncCommand,
    ) -> Result<T, SyncError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(make(reply_tx))
            .map_err(|_| SyncError::ServiceStopped)?;
        reply_rx.await.map_err(|_| SyncError::ServiceStopped)
    }
}

async fn run_link(
    mut coordinator: ConnectionCoordinator,
    mut commands: mpsc::UnboundedReceiver<SyncCommand>,
    mut transport_rx: mpsc::UnboundedReceiver<TransportEnvelope>,
    remote: Arc<RwLock<RemoteStateBuffer>>,
    state: Arc<RwLock<ConnectionState>>,
    tick: Duration,
) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    tracing::debug!("Sync service handle dropped, stopping link task");
                    break;
                };
                handle_command(&mut coordinator, command, &remote);
            }
            Some(envelope) = transport_rx.recv() => {
                coordinator.handle_transport_event(envelope.session, envelope.event, Instant::now());
            }
            _ = ticker.tick() => {
                coordinator.tick(Instant::now());
            }
        }

        publish_state(&state, coordinator.state());
    }

    coordinator.destroy();
    publish_state(&state, coordinator.state());
}

fn handle_command(
    coordinator: &mut ConnectionCoordinator,
    command: SyncCommand,
    remote: &RwLock<RemoteStateBuffer>,
) {
    match command {
        SyncCommand::CreateRoom { reply } => {
            clear_remote(remote);
            let _ = reply.send(coordinator.create_room(Instant::now()));
        }
        SyncCommand::JoinRoom { code, reply } => {
            clear_remote(remote);
            let _ = reply.send(coordinator.join_room(code, Instant::now()));
        }
        SyncCommand::Send { message, reply } => {
            let _ = reply.send(coordinator.send(message));
        }
        SyncCommand::Diagnostics { reply } => {
            let _ = reply.send(coordinator.diagnostics());
        }
        SyncCommand::Destroy => {
            coordinator.destroy();
            clear_remote(remote);
        }
    }
}

fn clear_remote(remote: &RwLock<RemoteStateBuffer>) {
    remote
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .clear();
}

fn publish_state(shared: &RwLock<ConnectionState>, current: &ConnectionState) {
    let mut guard = shared.write().unwrap_or_else(PoisonError::into_inner);
    if *guard != *current {
        *guard = current.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networking::protocol::StateFlags;
    use tokio::sync::broadcast::error::RecvError;

    async fn wait_for<F>(rx: &mut broadcast::Receiver<SyncEvent>, matches: F) -> SyncEvent
    where
        F: Fn(&SyncEvent) -> bool,
    {
        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(event) if matches(&event) => return event,
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => panic!("event channel closed"),
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("timed out waiting for sync event")
    }

    fn pair(network: &LoopbackNetwork) -> (SyncService, SyncService) {
        let interpolation = InterpolationConfig::default();
        let captain =
            SyncService::spawn_loopback(NetworkConfig::default(), &interpolation, network)
                .unwrap();
        let stoker =
            SyncService::spawn_loopback(NetworkConfig::default(), &interpolation, network)
                .unwrap();
        (captain, stoker)
    }

    #[test]
    fn test_spawn_requires_runtime() {
        let result = SyncService::spawn_loopback(
            NetworkConfig::default(),
            &InterpolationConfig::default(),
            &LoopbackNetwork::new(),
        );
        assert!(matches!(
            result,
            Err(SyncError::Transport(TransportError::NoRuntime))
        ));
    }

    #[tokio::test]
    async fn test_captain_and_stoker_connect_and_exchange() {
        let network = LoopbackNetwork::new();
        let (captain, stoker) = pair(&network);
        let mut captain_events = captain.subscribe();
        let mut stoker_events = stoker.subscribe();

        let code = captain.create_room().await.unwrap();
        stoker.join_room(&code.to_string().to_lowercase()).await.unwrap();

        wait_for(&mut captain_events, |e| {
            *e == SyncEvent::Connected(TransportKind::Primary)
        })
        .await;
        wait_for(&mut stoker_events, |e| {
            *e == SyncEvent::Connected(TransportKind::Primary)
        })
        .await;

        let snapshot = StateSnapshot {
            x: 3.0,
            speed: 6.0,
            flags: StateFlags::BRAKING,
            ..Default::default()
        };
        captain.send(Message::State(snapshot)).await.unwrap();
        wait_for(&mut stoker_events, |e| matches!(e, SyncEvent::State(_))).await;

        assert_eq!(stoker.remote_state(Instant::now()), Some(snapshot));
        assert_eq!(
            stoker.remote_buffer().read().unwrap().received_count(),
            1
        );

        stoker
            .send(Message::Pedal { foot: Foot::Down })
            .await
            .unwrap();
        let pedal = wait_for(&mut captain_events, |e| matches!(e, SyncEvent::Pedal(_))).await;
        assert_eq!(pedal, SyncEvent::Pedal(Foot::Down));

        assert_eq!(
            stoker.send(Message::State(snapshot)).await,
            Err(SyncError::NotAuthoritative)
        );
    }

    #[tokio::test]
    async fn test_invalid_room_code_rejected_before_task() {
        let network = LoopbackNetwork::new();
        let (_captain, stoker) = pair(&network);

        assert!(matches!(
            stoker.join_room("ROOM-1234").await,
            Err(SyncError::InvalidRoomCode(_))
        ));
        assert!(!stoker.connection_state().connected);
    }

    #[tokio::test]
    async fn test_destroy_allows_new_room() {
        let network = LoopbackNetwork::new();
        let (captain, _stoker) = pair(&network);

        let first = captain.create_room().await.unwrap();
        assert!(network.is_registered(&first));
        assert_eq!(captain.create_room().await, Err(SyncError::AlreadyActive));

        captain.destroy().unwrap();
        let second = captain.create_room().await.unwrap();
        assert!(!network.is_registered(&first) || first == second);
        assert!(network.is_registered(&second));

        assert_eq!(
            captain.send(Message::Lean(0.1)).await,
            Err(SyncError::NotConnected)
        );
        assert_eq!(captain.diagnostics().await.unwrap().messages_sent, 0);
    }
}
