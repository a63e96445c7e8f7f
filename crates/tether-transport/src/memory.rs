//! In-process connection pairs.
//!
//! A [`MemoryConnection`] pair behaves like the two ends of a socket:
//! whatever one half sends, the other half's `message` event emits. Close
//! and terminate end both halves. Unlike the WebSocket adapter, any close
//! code is accepted, including negative ones, which makes the pair the
//! natural way to simulate a dropped transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tether_event::{Deferred, Event};

use crate::{
    CloseEvent, CloseMessage, Connection, ConnectionError, ConnectionId, ConnectionTarget, Data,
    SendParams, TERMINATED_MESSAGE,
};

struct Half {
    id: ConnectionId,
    message: Event<Data>,
    closed: Deferred<CloseEvent>,
    is_closed: AtomicBool,
    peer: OnceLock<Weak<Half>>,
}

impl Half {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId::next(),
            message: Event::new(),
            closed: Deferred::new(),
            is_closed: AtomicBool::new(false),
            peer: OnceLock::new(),
        })
    }

    fn peer(&self) -> Option<Arc<Half>> {
        self.peer.get().and_then(Weak::upgrade)
    }
}

/// One half of an in-memory duplex pipe.
#[derive(Clone)]
pub struct MemoryConnection {
    half: Arc<Half>,
}

impl MemoryConnection {
    /// Creates two connected halves.
    pub fn pair() -> (Self, Self) {
        let a = Half::new();
        let b = Half::new();
        let _ = a.peer.set(Arc::downgrade(&b));
        let _ = b.peer.set(Arc::downgrade(&a));
        (Self { half: a }, Self { half: b })
    }

    pub fn id(&self) -> ConnectionId {
        self.half.id
    }

    /// Marks both halves closed, then resolves them. Returns `false` if
    /// this half was already closed.
    fn end(&self, message: CloseMessage) -> bool {
        if self.half.is_closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let peer = self.half.peer();
        if let Some(peer) = &peer {
            peer.is_closed.store(true, Ordering::SeqCst);
        }
        self.half.closed.resolve(CloseEvent::local(message.clone()));
        if let Some(peer) = peer {
            peer.closed.resolve(CloseEvent::remote(message));
        }
        true
    }
}

impl std::fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("id", &self.half.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn message(&self) -> &Event<Data> {
        &self.half.message
    }

    fn closed(&self) -> &Deferred<CloseEvent> {
        &self.half.closed
    }

    fn is_closed(&self) -> bool {
        self.half.is_closed.load(Ordering::SeqCst)
    }

    async fn send_with(&self, data: Data, _params: SendParams) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let peer = self.half.peer().ok_or(ConnectionError::Closed)?;
        peer.message.emit(data);
        Ok(())
    }

    async fn close(&self, message: CloseMessage) -> Result<(), ConnectionError> {
        tracing::debug!(id = %self.half.id, %message, "closing memory connection");
        if self.end(message) {
            Ok(())
        } else {
            Err(ConnectionError::Closed)
        }
    }

    fn terminate(&self) {
        self.end(TERMINATED_MESSAGE);
    }
}

// ---------------------------------------------------------------------------
// MemoryTarget
// ---------------------------------------------------------------------------

/// A [`ConnectionTarget`] whose "listening side" is in the same process.
///
/// Each call to [`connect`](Self::connect) creates a pair, announces the
/// server half on `connection`, and hands the client half back.
#[derive(Clone, Default)]
pub struct MemoryTarget {
    connection: Event<MemoryConnection>,
    clients: Arc<Mutex<Vec<MemoryConnection>>>,
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new connection and returns the client half.
    pub fn connect(&self) -> MemoryConnection {
        let (server, client) = MemoryConnection::pair();
        self.clients.lock().push(server.clone());

        let clients = Arc::downgrade(&self.clients);
        let id = server.id();
        server.closed().then(move |_| {
            if let Some(clients) = clients.upgrade() {
                clients.lock().retain(|c| c.id() != id);
            }
        });

        self.connection.emit(server);
        client
    }
}

impl ConnectionTarget for MemoryTarget {
    type Conn = MemoryConnection;

    fn connection(&self) -> &Event<MemoryConnection> {
        &self.connection
    }

    fn clients(&self) -> Vec<MemoryConnection> {
        self.clients.lock().clone()
    }
}
