//! In-process primary transport.
//!
//! Stands in for the peer-to-peer primitive when both riders share one process (split-screen
//! play, soak runs, tests). Listeners register under a room code; a dialer connecting to that
//! code is linked to the listener and both sides receive `Open`. Faults can be injected per
//! room code.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use super::room::RoomCode;
use super::transport::{
    emit, EventSink, PrimaryConnector, SessionId, TransportError, TransportEvent, TransportKind,
    TransportSession,
};

#[derive(Clone)]
struct Endpoint {
    session: SessionId,
    sink: EventSink,
}

struct Link {
    listener: Endpoint,
    dialer: Endpoint,
}

#[derive(Default)]
struct NetworkInner {
    listeners: HashMap<String, Endpoint>,
    links: HashMap<String, Link>,
    dropping: HashSet<String>,
}

/// Shared registry all loopback connectors talk through.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connector delivering this endpoint's events to `sink`.
    pub fn connector(&self, sink: EventSink) -> LoopbackConnector {
        LoopbackConnector {
            network: self.clone(),
            sink,
        }
    }

    /// Register a listener nobody will answer for, so `code` looks taken.
    pub fn occupy(&self, code: &RoomCode) {
        let (sink, _) = mpsc::unbounded_channel();
        self.lock().listeners.insert(
            code.as_str().to_string(),
            Endpoint {
                session: SessionId(u64::MAX),
                sink,
            },
        );
    }

    pub fn is_registered(&self, code: &RoomCode) -> bool {
        self.lock().listeners.contains_key(code.as_str())
    }

    pub fn is_linked(&self, code: &RoomCode) -> bool {
        self.lock().links.contains_key(code.as_str())
    }

    /// Drop the live link for `code` as if the network path failed. Listeners stay registered.
    pub fn sever(&self, code: &RoomCode) {
        if let Some(link) = self.lock().links.remove(code.as_str()) {
            tracing::debug!("Loopback link {} severed", code);
            emit(&link.listener.sink, link.listener.session, TransportEvent::Closed);
            emit(&link.dialer.sink, link.dialer.session, TransportEvent::Closed);
        }
    }

    /// Silently discard frames on `code` without closing anything (a half-open link).
    pub fn set_dropping(&self, code: &RoomCode, dropping: bool) {
        let mut inner = self.lock();
        if dropping {
            inner.dropping.insert(code.as_str().to_string());
        } else {
            inner.dropping.remove(code.as_str());
        }
    }
}

/// [`PrimaryConnector`] over a [`LoopbackNetwork`].
pub struct LoopbackConnector {
    network: LoopbackNetwork,
    sink: EventSink,
}

impl PrimaryConnector for LoopbackConnector {
    fn listen(
        &mut self,
        session: SessionId,
        code: &RoomCode,
    ) -> Result<Box<dyn TransportSession>, TransportError> {
        let mut inner = self.network.lock();
        if inner.listeners.contains_key(code.as_str()) {
            return Err(TransportError::AddressTaken(code.to_string()));
        }

        inner.listeners.insert(
            code.as_str().to_string(),
            Endpoint {
                session,
                sink: self.sink.clone(),
            },
        );

        Ok(Box::new(LoopbackSession {
            network: self.network.clone(),
            code: code.as_str().to_string(),
            id: session,
            side: Side::Listener,
            closed: false,
        }))
    }

    fn connect(
        &mut self,
        session: SessionId,
        code: &RoomCode,
    ) -> Result<Box<dyn TransportSession>, TransportError> {
        let mut inner = self.network.lock();
        let dialer = Endpoint {
            session,
            sink: self.sink.clone(),
        };

        match inner.listeners.get(code.as_str()).cloned() {
            Some(listener) => {
                if let Some(old) = inner.links.remove(code.as_str()) {
                    emit(&old.dialer.sink, old.dialer.session, TransportEvent::Closed);
                }
                emit(&listener.sink, listener.session, TransportEvent::Open);
                emit(&dialer.sink, dialer.session, TransportEvent::Open);
                inner
                    .links
                    .insert(code.as_str().to_string(), Link { listener, dialer });
            }
            None => {
                emit(
                    &dialer.sink,
                    session,
                    TransportEvent::Error(format!("peer {} unavailable", code)),
                );
                emit(&dialer.sink, session, TransportEvent::Closed);
            }
        }

        Ok(Box::new(LoopbackSession {
            network: self.network.clone(),
            code: code.as_str().to_string(),
            id: session,
            side: Side::Dialer,
            closed: false,
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Listener,
    Dialer,
}

struct LoopbackSession {
    network: LoopbackNetwork,
    code: String,
    id: SessionId,
    side: Side,
    closed: bool,
}

impl LoopbackSession {
    fn owns(&self, link: &Link) -> bool {
        match self.side {
            Side::Listener => link.listener.session == self.id,
            Side::Dialer => link.dialer.session == self.id,
        }
    }
}

impl TransportSession for LoopbackSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Primary
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::NotOpen);
        }

        let inner = self.network.lock();
        let link = inner
            .links
            .get(&self.code)
            .filter(|link| self.owns(link))
            .ok_or(TransportError::NotOpen)?;

        if inner.dropping.contains(&self.code) {
            return Ok(());
        }

        let peer = match self.side {
            Side::Listener => &link.dialer,
            Side::Dialer => &link.listener,
        };
        emit(&peer.sink, peer.session, TransportEvent::Data(bytes.to_vec()));
        Ok(())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let mut inner = self.network.lock();
        let owned = inner
            .links
            .get(&self.code)
            .map(|link| self.owns(link))
            .unwrap_or(false);
        if owned {
            if let Some(link) = inner.links.remove(&self.code) {
                let peer = match self.side {
                    Side::Listener => link.dialer,
                    Side::Dialer => link.listener,
                };
                emit(&peer.sink, peer.session, TransportEvent::Closed);
            }
        }

        if self.side == Side::Listener
            && inner
                .listeners
                .get(&self.code)
                .map(|l| l.session == self.id)
                .unwrap_or(false)
        {
            inner.listeners.remove(&self.code);
        }
    }
}

impl Drop for LoopbackSession {
    fn drop(&mut self) {
        self.close();
    }
}
