//! The client side of a resumable connection.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tether_event::{Deferred, Event, Subscription};
use tether_transport::{
    CloseEvent, CloseMessage, Connection, ConnectionError, ConnectionId, ConnectionRef, Data,
    PROTOCOL_MESSAGE, SendParams, TERMINATED_MESSAGE, TransportError, spawn_detached,
};
use tokio::sync::{oneshot, watch};

use crate::link::{self, Status};
use crate::protocol::{NO_KEY, REJECTED_TAKEOVER_MESSAGE, RESUME_TOKEN};
use crate::{ClientConfig, SessionError};

/// Opens new physical connections for a [`Client`].
///
/// Implemented for any `Fn() -> impl Future<Output = Result<ConnectionRef,
/// TransportError>>`, so a closure around a connect call is enough.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    async fn connect(&self) -> Result<ConnectionRef, TransportError>;
}

#[async_trait]
impl<F, Fut> ConnectionFactory for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ConnectionRef, TransportError>> + Send + 'static,
{
    async fn connect(&self) -> Result<ConnectionRef, TransportError> {
        self().await
    }
}

#[derive(Default)]
struct ClientState {
    key: String,
    generation: u64,
    /// The connection being handshaken or in use.
    conn: Option<ConnectionRef>,
    forward: Option<Subscription>,
    closed: bool,
}

impl ClientState {
    /// Drops the current connection without closing it.
    fn release(&mut self) -> Option<ConnectionRef> {
        if let Some(forward) = self.forward.take() {
            forward.dispose();
        }
        self.conn.take()
    }
}

struct ClientInner {
    id: ConnectionId,
    factory: Box<dyn ConnectionFactory>,
    config: ClientConfig,
    message: Event<Data>,
    closed: Deferred<CloseEvent>,
    ready: Deferred<()>,
    broken_pipe: Event<CloseMessage>,
    resuming: Event<()>,
    state: Mutex<ClientState>,
    status: watch::Sender<Status>,
}

impl ClientInner {
    async fn establish(self: Arc<Self>) {
        if let Err(e) = self.connect().await {
            tracing::warn!(id = %self.id, error = %e, "could not establish session");
            self.fail().await;
        }
    }

    async fn connect(self: &Arc<Self>) -> Result<(), SessionError> {
        let conn = self.open_transport().await?;
        let (generation, key) = {
            let mut state = self.state.lock();
            if state.closed {
                conn.terminate();
                return Ok(());
            }
            state.generation += 1;
            state.release();
            state.conn = Some(Arc::clone(&conn));
            (state.generation, state.key.clone())
        };

        let weak = Arc::downgrade(self);
        conn.closed().then(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.link_closed(generation, event);
            }
        });

        // The reply is taken off the first message; everything after it is
        // forwarded straight away so nothing slips between the two.
        let (reply_tx, reply_rx) = oneshot::channel();
        let reply_tx = Mutex::new(Some(reply_tx));
        let target = self.message.clone();
        let forward = conn.message().subscribe(move |data| {
            let first = reply_tx.lock().take();
            match first {
                Some(tx) => {
                    let _ = tx.send(data);
                }
                None => target.emit(data),
            }
        });
        {
            let mut state = self.state.lock();
            if state.generation != generation {
                forward.dispose();
                return Ok(());
            }
            state.forward = Some(forward);
        }

        let closed = conn.closed().wait();
        if let Err(e) = conn.send(key.as_str().into()).await {
            if conn.is_closed() {
                return Ok(());
            }
            return Err(e.into());
        }
        let reply = tokio::select! {
            reply = reply_rx => reply.ok(),
            _ = closed => None,
        };
        // A close before the reply is handled by `link_closed`.
        let Some(reply) = reply else { return Ok(()) };

        let Data::Text(reply) = reply else {
            return Err(SessionError::Protocol("handshake reply was binary".into()));
        };
        let resumed = key != NO_KEY;
        if resumed && reply != RESUME_TOKEN {
            return Err(SessionError::Protocol(format!(
                "expected resume token, got {reply:?}"
            )));
        }
        if !resumed && reply.is_empty() {
            return Err(SessionError::Protocol("server issued an empty key".into()));
        }

        {
            let mut state = self.state.lock();
            if state.closed || state.generation != generation {
                return Ok(());
            }
            if !resumed {
                state.key = reply;
            }
            self.status.send_replace(Status::Ready(conn));
        }
        if resumed {
            tracing::info!(id = %self.id, "session resumed");
            self.resuming.emit(());
        } else {
            tracing::info!(id = %self.id, "session established");
            self.ready.resolve(());
        }
        Ok(())
    }

    async fn open_transport(&self) -> Result<ConnectionRef, SessionError> {
        let attempts = self.config.reconnect_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.factory.connect().await {
                Ok(conn) => return Ok(conn),
                Err(e) if attempt < attempts => {
                    tracing::debug!(id = %self.id, attempt, error = %e, "connect failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(self.config.reconnect_delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn link_closed(self: &Arc<Self>, generation: u64, event: CloseEvent) {
        let mut state = self.state.lock();
        if state.closed || state.generation != generation {
            return;
        }
        state.release();
        let message = event.message.clone();

        if message.code == REJECTED_TAKEOVER_MESSAGE.code {
            self.status.send_replace(Status::Waiting);
            drop(state);
            tracing::debug!(id = %self.id, "takeover refused, backing off");
            let inner = Arc::clone(self);
            let backoff = self.config.takeover_backoff;
            spawn_detached(async move {
                tokio::time::sleep(backoff).await;
                inner.establish().await;
            });
        } else if message.is_intentional() {
            state.closed = true;
            self.status.send_replace(Status::Closed);
            drop(state);
            tracing::info!(id = %self.id, %message, "session closed by server");
            self.closed.resolve(event);
        } else {
            let had_key = !state.key.is_empty();
            self.status.send_replace(Status::Waiting);
            drop(state);
            if had_key {
                tracing::info!(id = %self.id, %message, "link dropped, resuming");
                self.broken_pipe.emit(message);
            }
            spawn_detached(Arc::clone(self).establish());
        }
    }

    /// Marks the client closed and returns the connection to dispose of.
    /// `None` if it was already closed.
    fn shut(&self) -> Option<Option<ConnectionRef>> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        state.closed = true;
        state.generation += 1;
        self.status.send_replace(Status::Closed);
        Some(state.release())
    }

    /// Gives up after a failed (re)connect.
    async fn fail(&self) {
        let Some(conn) = self.shut() else { return };
        if let Some(conn) = conn {
            let _ = conn.close(PROTOCOL_MESSAGE).await;
        }
        self.closed.resolve(CloseEvent::local(PROTOCOL_MESSAGE));
    }
}

/// A resumable connection to a session [`Server`](crate::Server).
///
/// The client starts connecting as soon as it is built and resolves
/// [`ready`](Self::ready) after its first handshake. When the transport
/// drops it reconnects with its session key; sends issued meanwhile wait
/// for the resume, unless they ask to fail fast with
/// [`SendParams::immediate`].
///
/// Messages that arrive before anyone observes
/// [`message`](Connection::message) are held, so nothing the server sends
/// on announcement is lost while the caller awaits `ready`.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Starts connecting in the background. Must be called from within a
    /// Tokio runtime.
    pub fn new<F: ConnectionFactory>(factory: F, config: ClientConfig) -> Self {
        let (status, _) = watch::channel(Status::Waiting);
        let inner = Arc::new(ClientInner {
            id: ConnectionId::next(),
            factory: Box::new(factory),
            config,
            message: Event::buffered(),
            closed: Deferred::new(),
            ready: Deferred::new(),
            broken_pipe: Event::new(),
            resuming: Event::new(),
            state: Mutex::new(ClientState::default()),
            status,
        });
        spawn_detached(Arc::clone(&inner).establish());
        Self { inner }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// The session key, once the server has issued one.
    pub fn key(&self) -> Option<String> {
        let state = self.inner.state.lock();
        (!state.key.is_empty()).then(|| state.key.clone())
    }

    pub fn is_ready(&self) -> bool {
        link::is_ready(&self.inner.status)
    }

    /// Resolves after the first successful handshake.
    pub fn ready(&self) -> &Deferred<()> {
        &self.inner.ready
    }

    /// Fires with the drop reason when an established link goes down.
    pub fn broken_pipe(&self) -> &Event<CloseMessage> {
        &self.inner.broken_pipe
    }

    /// Fires after each successful resume.
    pub fn resuming(&self) -> &Event<()> {
        &self.inner.resuming
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.inner.id)
            .field("ready", &self.is_ready())
            .finish()
    }
}

#[async_trait]
impl Connection for Client {
    fn message(&self) -> &Event<Data> {
        &self.inner.message
    }

    fn closed(&self) -> &Deferred<CloseEvent> {
        &self.inner.closed
    }

    fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    async fn send_with(&self, data: Data, params: SendParams) -> Result<(), ConnectionError> {
        link::send_when_ready(&self.inner.status, data, params).await
    }

    /// Ends the client and closes the live link with `message`.
    ///
    /// The link has to be able to carry the code. A WebSocket only takes
    /// codes `0..=1999`; anything else is refused by the link, which is
    /// then terminated, so the server sees a dropped transport rather than
    /// `message` and holds the session until its timeout. This side still
    /// resolves `closed` with `message`.
    async fn close(&self, message: CloseMessage) -> Result<(), ConnectionError> {
        let conn = self.inner.shut().ok_or(ConnectionError::Closed)?;
        if let Some(conn) = conn {
            if let Err(e) = conn.close(message.clone()).await {
                tracing::debug!(id = %self.inner.id, error = %e, "link close failed, terminating");
                conn.terminate();
            }
        }
        tracing::info!(id = %self.inner.id, %message, "session closed");
        self.inner.closed.resolve(CloseEvent::local(message));
        Ok(())
    }

    fn terminate(&self) {
        let Some(conn) = self.inner.shut() else { return };
        if let Some(conn) = conn {
            conn.terminate();
        }
        self.inner.closed.resolve(CloseEvent::local(TERMINATED_MESSAGE));
    }
}
