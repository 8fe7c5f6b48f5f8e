//! Two-rider link scenarios
//!
//! Drives a Captain and a Stoker coordinator against a shared in-process network with
//! simulated time: pairing, state delivery, silent link loss and passive reconnection.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::mpsc;

use tandemsync::networking::{
    ConnectionCoordinator, Foot, LinkPhase, LoopbackNetwork, NetworkConfig, RemoteStateBuffer,
    Role, RoomCode, SessionHandler, StateFlags, StateSnapshot, TransportEnvelope, TransportKind,
};

#[derive(Default)]
struct Log {
    connected: Vec<TransportKind>,
    disconnected: Vec<String>,
    pedals: Vec<Foot>,
    remote: RemoteStateBuffer,
}

struct LogHandler(Arc<Mutex<Log>>);

impl SessionHandler for LogHandler {
    fn on_connected(&mut self, transport: TransportKind) {
        self.0.lock().unwrap().connected.push(transport);
    }

    fn on_disconnected(&mut self, reason: &str) {
        self.0.lock().unwrap().disconnected.push(reason.to_string());
    }

    fn on_pedal_received(&mut self, foot: Foot) {
        self.0.lock().unwrap().pedals.push(foot);
    }

    fn on_state_received(&mut self, snapshot: &StateSnapshot, received_at: Instant) {
        self.0.lock().unwrap().remote.push(*snapshot, received_at);
    }
}

struct Rider {
    coordinator: ConnectionCoordinator,
    events: mpsc::UnboundedReceiver<TransportEnvelope>,
    log: Arc<Mutex<Log>>,
}

impl Rider {
    fn new(network: &LoopbackNetwork, seed: u64) -> Self {
        let (sink, events) = mpsc::unbounded_channel();
        let log = Arc::new(Mutex::new(Log::default()));
        let coordinator = ConnectionCoordinator::new(
            NetworkConfig::default(),
            Box::new(network.connector(sink)),
            None,
            Box::new(LogHandler(Arc::clone(&log))),
        )
        .with_rng(StdRng::seed_from_u64(seed));

        Self {
            coordinator,
            events,
            log,
        }
    }

    /// Feed every queued transport event. Returns how many were handled.
    fn pump(&mut self, now: Instant) -> usize {
        let mut handled = 0;
        while let Ok(envelope) = self.events.try_recv() {
            self.coordinator
                .handle_transport_event(envelope.session, envelope.event, now);
            handled += 1;
        }
        handled
    }

    fn disconnects(&self) -> Vec<String> {
        self.log.lock().unwrap().disconnected.clone()
    }

    fn connects(&self) -> Vec<TransportKind> {
        self.log.lock().unwrap().connected.clone()
    }
}

struct Pair {
    network: LoopbackNetwork,
    captain: Rider,
    stoker: Rider,
    code: RoomCode,
    t0: Instant,
}

impl Pair {
    /// Captain hosts, Stoker joins, both linked at t0.
    fn linked() -> Self {
        let network = LoopbackNetwork::new();
        let mut captain = Rider::new(&network, 1);
        let mut stoker = Rider::new(&network, 2);
        let t0 = Instant::now();

        let code = captain.coordinator.create_room(t0).unwrap();
        stoker.coordinator.join_room(code.clone(), t0).unwrap();

        let mut pair = Self {
            network,
            captain,
            stoker,
            code,
            t0,
        };
        pair.settle(0);
        pair
    }

    fn at(&self, ms: u64) -> Instant {
        self.t0 + Duration::from_millis(ms)
    }

    /// Deliver events back and forth until both queues are empty.
    fn settle(&mut self, ms: u64) {
        let now = self.at(ms);
        while self.captain.pump(now) + self.stoker.pump(now) > 0 {}
    }

    fn step(&mut self, ms: u64) {
        let now = self.at(ms);
        self.captain.coordinator.tick(now);
        self.stoker.coordinator.tick(now);
        self.settle(ms);
    }

    fn run(&mut self, from_ms: u64, to_ms: u64, step_ms: u64) {
        let mut ms = from_ms;
        while ms <= to_ms {
            self.step(ms);
            ms += step_ms;
        }
    }
}

/// Test pairing over the primary transport and authoritative state delivery
#[test]
fn test_captain_and_stoker_pair_and_sync_state() {
    let mut pair = Pair::linked();

    assert_eq!(pair.captain.coordinator.role(), Some(Role::Captain));
    assert_eq!(pair.stoker.coordinator.role(), Some(Role::Stoker));
    assert_eq!(pair.captain.connects(), vec![TransportKind::Primary]);
    assert_eq!(pair.stoker.connects(), vec![TransportKind::Primary]);
    assert_eq!(pair.captain.coordinator.state().transport, TransportKind::Primary);
    assert!(pair.stoker.coordinator.state().connected);

    let snapshot = StateSnapshot {
        x: 12.5,
        z: -4.0,
        heading: 1.2,
        speed: 8.0,
        crank_angle: 3.1,
        distance_traveled: 140.0,
        flags: StateFlags::BRAKING,
        ..Default::default()
    };
    pair.captain.coordinator.send_state(snapshot).unwrap();
    pair.settle(50);

    let log = pair.stoker.log.lock().unwrap();
    assert_eq!(log.remote.received_count(), 1);
    assert_eq!(log.remote.sample(pair.at(60)), Some(snapshot));
}

/// Test pedal input flows from Stoker to Captain
#[test]
fn test_stoker_pedals_reach_captain() {
    let mut pair = Pair::linked();

    pair.stoker.coordinator.send_pedal(Foot::Down).unwrap();
    pair.stoker.coordinator.send_pedal(Foot::Up).unwrap();
    pair.settle(10);

    assert_eq!(
        pair.captain.log.lock().unwrap().pedals,
        vec![Foot::Down, Foot::Up]
    );
}

/// Test heartbeats keep a healthy link up indefinitely
#[test]
fn test_heartbeats_keep_link_alive() {
    let mut pair = Pair::linked();

    pair.run(50, 20_000, 50);

    assert!(pair.captain.disconnects().is_empty());
    assert!(pair.stoker.disconnects().is_empty());
    assert!(pair.captain.coordinator.state().ping_ms >= 0.0);
    assert_eq!(pair.captain.coordinator.diagnostics().malformed_messages, 0);
}

/// Test a half-open link is detected by heartbeat timeout on both sides
#[test]
fn test_silent_link_times_out_once() {
    let mut pair = Pair::linked();
    pair.network.set_dropping(&pair.code, true);

    pair.run(50, 3000, 50);
    assert!(pair.captain.disconnects().is_empty());
    assert!(pair.stoker.disconnects().is_empty());

    pair.run(3050, 3500, 50);
    assert_eq!(pair.captain.disconnects(), vec!["Heartbeat timeout".to_string()]);
    assert_eq!(pair.stoker.disconnects(), vec!["Heartbeat timeout".to_string()]);
    assert!(!pair.captain.coordinator.is_connected());
}

/// Test the Captain keeps its room registered and the Stoker redials after a dropped path
#[test]
fn test_captain_passive_reconnect_after_sever() {
    let mut pair = Pair::linked();

    pair.network.sever(&pair.code);
    pair.settle(1000);

    assert_eq!(pair.captain.disconnects(), vec!["Connection closed".to_string()]);
    assert_eq!(pair.stoker.disconnects(), vec!["Connection closed".to_string()]);
    assert!(pair.network.is_registered(&pair.code));
    assert_eq!(
        pair.stoker.coordinator.phase(),
        LinkPhase::Reconnecting { attempt: 0 }
    );

    pair.run(1050, 2000, 50);

    assert!(pair.network.is_linked(&pair.code));
    assert_eq!(
        pair.captain.connects(),
        vec![TransportKind::Primary, TransportKind::Primary]
    );
    assert_eq!(
        pair.stoker.coordinator.phase(),
        LinkPhase::Connected(TransportKind::Primary)
    );
    assert_eq!(pair.stoker.coordinator.state().reconnect_attempts, 0);
    assert_eq!(pair.captain.coordinator.state().reconnect_attempts, 0);
}

/// Test the Stoker gives up when the Captain has left for good
#[test]
fn test_stoker_gives_up_when_captain_gone() {
    let mut pair = Pair::linked();

    pair.captain.coordinator.destroy();
    pair.settle(500);
    assert_eq!(pair.stoker.disconnects(), vec!["Connection closed".to_string()]);

    pair.run(550, 20_000, 50);
    assert_eq!(pair.stoker.coordinator.phase(), LinkPhase::Failed);
    assert_eq!(
        pair.stoker.disconnects().last().map(String::as_str),
        Some("Reconnection failed after 3 attempts")
    );
    assert!(pair.captain.disconnects().is_empty());
}

/// Test a taken room code is regenerated without the caller noticing
#[test]
fn test_taken_room_code_is_regenerated() {
    let network = LoopbackNetwork::new();
    let taken = RoomCode::generate(&mut StdRng::seed_from_u64(7));
    network.occupy(&taken);

    let (sink, _events) = mpsc::unbounded_channel();
    let mut captain = ConnectionCoordinator::new(
        NetworkConfig::default(),
        Box::new(network.connector(sink)),
        None,
        Box::new(LogHandler(Arc::default())),
    )
    .with_rng(StdRng::seed_from_u64(7));

    let code = captain.create_room(Instant::now()).unwrap();
    assert_ne!(code, taken);
    assert!(network.is_registered(&code));
}
