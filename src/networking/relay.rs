//! WebSocket relay fallback transport.
//!
//! Each relay leg is a WebSocket to `<url>?room=<code>&role=<role>`. Binary frames carry game
//! messages; JSON text frames carry relay control (`partner-ready`, `disconnect`).

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

use super::room::{Role, RoomCode};
use super::transport::{
    emit, relay_endpoint, EventSink, RelayConnector, RelayControl, SessionId, TransportError,
    TransportEvent, TransportKind, TransportSession,
};

enum Outbound {
    Frame(Vec<u8>),
    Close,
}

/// [`RelayConnector`] that spawns one socket task per session on the current tokio runtime.
pub struct WebSocketRelay {
    sink: EventSink,
}

impl WebSocketRelay {
    pub fn new(sink: EventSink) -> Self {
        Self { sink }
    }
}

impl RelayConnector for WebSocketRelay {
    fn open(
        &mut self,
        session: SessionId,
        url: &str,
        code: &RoomCode,
        role: Role,
    ) -> Result<Box<dyn TransportSession>, TransportError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| TransportError::NoRuntime)?;

        let endpoint = relay_endpoint(url, code, role);
        tracing::info!("Opening relay session {} to {}", session, endpoint);

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        runtime.spawn(run_socket(session, endpoint, self.sink.clone(), out_rx));

        Ok(Box::new(RelaySession {
            id: session,
            out_tx,
            closed: false,
        }))
    }
}

async fn run_socket(
    session: SessionId,
    endpoint: String,
    sink: EventSink,
    mut out_rx: mpsc::UnboundedReceiver<Outbound>,
) {
    let socket = match connect_async(endpoint.as_str()).await {
        Ok((socket, _response)) => socket,
        Err(e) => {
            tracing::warn!("Relay session {} failed to connect: {}", session, e);
            emit(&sink, session, TransportEvent::Error(e.to_string()));
            emit(&sink, session, TransportEvent::Closed);
            return;
        }
    };

    emit(&sink, session, TransportEvent::Open);
    let (mut write, mut read) = socket.split();

    loop {
        tokio::select! {
            outbound = out_rx.recv() => match outbound {
                Some(Outbound::Frame(bytes)) => {
                    if let Err(e) = write.send(WsMessage::Binary(bytes)).await {
                        emit(&sink, session, TransportEvent::Error(e.to_string()));
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    // Closed locally; the owner has already discarded this session.
                    let _ = write.send(WsMessage::Close(None)).await;
                    return;
                }
            },
            inbound = read.next() => match inbound {
                Some(Ok(WsMessage::Binary(data))) => {
                    emit(&sink, session, TransportEvent::Data(data));
                }
                Some(Ok(WsMessage::Text(text))) => {
                    emit(&sink, session, TransportEvent::Control(RelayControl::parse(&text)));
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!("Relay session {} receive error: {}", session, e);
                    emit(&sink, session, TransportEvent::Error(e.to_string()));
                    break;
                }
            },
        }
    }

    emit(&sink, session, TransportEvent::Closed);
}

struct RelaySession {
    id: SessionId,
    out_tx: mpsc::UnboundedSender<Outbound>,
    closed: bool,
}

impl TransportSession for RelaySession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Relay
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::NotOpen);
        }
        self.out_tx
            .send(Outbound::Frame(bytes.to_vec()))
            .map_err(|_| TransportError::NotOpen)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.out_tx.send(Outbound::Close);
        }
    }
}

impl Drop for RelaySession {
    fn drop(&mut self) {
        self.close();
    }
}
