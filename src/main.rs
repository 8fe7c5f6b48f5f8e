//! TandemSync relay probe
//!
//! Opens one relay leg for a room and role, waits for the partner, then heartbeats once per
//! interval and logs round-trip time and any game frames until the relay drops.
//!
//! Usage: `tandemsync <captain|stoker> <ROOM-CODE> [relay-url]`

use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context};
use tokio::sync::mpsc;

use tandemsync::logging;
use tandemsync::networking::{
    LivenessAction, LivenessMonitor, Message, RelayConnector, RelayControl, Role, RoomCode,
    SessionId, TransportEvent, WebSocketRelay,
};
use tandemsync::storage::config::load_config;

const PROBE_SESSION: SessionId = SessionId(1);

fn parse_role(arg: &str) -> anyhow::Result<Role> {
    match arg.to_ascii_lowercase().as_str() {
        "captain" => Ok(Role::Captain),
        "stoker" => Ok(Role::Stoker),
        other => bail!("Unknown role '{}', expected captain or stoker", other),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();
    tracing::info!("Starting TandemSync relay probe v{}", env!("CARGO_PKG_VERSION"));

    let mut args = std::env::args().skip(1);
    let role = parse_role(&args.next().ok_or_else(|| anyhow!("Missing role argument"))?)?;
    let code: RoomCode = args
        .next()
        .ok_or_else(|| anyhow!("Missing room code argument"))?
        .parse()
        .context("Invalid room code")?;

    let config = load_config().context("Failed to load configuration")?;
    let url = args
        .next()
        .or(config.network.relay_url.clone())
        .ok_or_else(|| anyhow!("No relay URL given and none configured"))?;

    let (sink, mut events) = mpsc::unbounded_channel();
    let mut relay = WebSocketRelay::new(sink);
    let mut session = relay.open(PROBE_SESSION, &url, &code, role)?;

    let mut liveness = LivenessMonitor::new(
        Duration::from_millis(config.network.heartbeat_interval_ms),
        Duration::from_millis(config.network.heartbeat_timeout_ms),
    );
    let mut ticker =
        tokio::time::interval(Duration::from_millis(config.network.tick_interval_ms.max(1)));

    tracing::info!("Probing room {} as {} via {}", code, role, url);

    loop {
        tokio::select! {
            envelope = events.recv() => {
                let Some(envelope) = envelope else { break };
                match envelope.event {
                    TransportEvent::Open => tracing::info!("Relay socket open, waiting for partner"),
                    TransportEvent::Control(RelayControl::PartnerReady) => {
                        tracing::info!("Partner ready");
                        liveness.start(Instant::now());
                    }
                    TransportEvent::Control(RelayControl::Disconnect) => {
                        tracing::warn!("Partner disconnected");
                        liveness.stop();
                    }
                    TransportEvent::Control(RelayControl::Unknown) => {
                        tracing::debug!("Unknown control frame");
                    }
                    TransportEvent::Data(bytes) => match Message::decode(&bytes) {
                        Ok(Message::Heartbeat { is_reply }) => {
                            if let Some(reply) = liveness.on_heartbeat(is_reply, Instant::now()) {
                                session.send(&reply.encode())?;
                            }
                            if let (true, Some(ping)) = (is_reply, liveness.ping_ms()) {
                                tracing::info!("RTT {:.1} ms", ping);
                            }
                        }
                        Ok(message) => tracing::info!("{} frame: {:?}", message.kind(), message),
                        Err(e) => tracing::warn!("Malformed frame: {}", e),
                    },
                    TransportEvent::Error(e) => tracing::warn!("Relay error: {}", e),
                    TransportEvent::Closed => {
                        tracing::info!("Relay closed");
                        break;
                    }
                }
            }
            _ = ticker.tick() => match liveness.poll(Instant::now()) {
                LivenessAction::SendPing => {
                    session.send(&Message::Heartbeat { is_reply: false }.encode())?;
                }
                LivenessAction::TimedOut => {
                    tracing::warn!("Heartbeat timeout");
                    break;
                }
                LivenessAction::Idle => {}
            },
        }
    }

    session.close();
    Ok(())
}
