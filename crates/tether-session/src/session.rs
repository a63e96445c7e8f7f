//! The server side of a resumable connection.
//!
//! A [`Session`] outlives the physical connections under it:
//!
//! ```text
//!            link drops (code < 0)
//!   Live ─────────────────────────→ Hanging ──(timeout)──→ Closed
//!    ↑  ↖                              │
//!    │   └──────(on_reconnect)─────────┘
//!    └──(on_reconnect, takeover)
//!
//!   Live ──(link closes with code ≥ 0, close, terminate)──→ Closed
//! ```

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tether_event::{Deferred, Event};
use tether_transport::{
    CloseEvent, CloseMessage, Connection, ConnectionError, ConnectionId, ConnectionRef, Data,
    SendParams, TERMINATED_MESSAGE,
};
use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::SessionConfig;
use crate::link::{self, Link, Status};
use crate::protocol::{
    REJECTED_TAKEOVER_MESSAGE, RESUME_TOKEN, SESSION_TIMEOUT_MESSAGE, TAKEOVER_MESSAGE,
};

enum Phase {
    Live(Link),
    Hanging,
    Closed,
}

struct State {
    phase: Phase,
    generation: u64,
    timeout: Option<AbortHandle>,
}

/// Result of adopting a connection under the lock.
struct Adopted {
    generation: u64,
    replaced: Option<ConnectionRef>,
    resumed: bool,
}

struct SessionInner {
    id: ConnectionId,
    key: String,
    config: SessionConfig,
    message: Event<Data>,
    closed: Deferred<CloseEvent>,
    broken_pipe: Event<CloseMessage>,
    resuming: Event<()>,
    state: Mutex<State>,
    status: watch::Sender<Status>,
}

impl SessionInner {
    /// Installs `conn` as the live link. The status stays `Waiting`; the
    /// caller flips it to `Ready` when the link may be written to.
    fn adopt(self: &Arc<Self>, state: &mut State, conn: ConnectionRef) -> Adopted {
        if let Some(timeout) = state.timeout.take() {
            timeout.abort();
        }
        let (replaced, resumed) = match std::mem::replace(&mut state.phase, Phase::Hanging) {
            Phase::Live(link) => (Some(link.detach()), false),
            Phase::Hanging => (None, true),
            Phase::Closed => (None, false),
        };

        state.generation += 1;
        let generation = state.generation;
        let weak = Arc::downgrade(self);
        conn.closed().then(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.link_closed(generation, event);
            }
        });
        state.phase = Phase::Live(Link::new(generation, conn, &self.message));
        self.status.send_replace(Status::Waiting);

        Adopted {
            generation,
            replaced,
            resumed,
        }
    }

    fn link_closed(self: &Arc<Self>, generation: u64, event: CloseEvent) {
        let mut state = self.state.lock();
        let link = match std::mem::replace(&mut state.phase, Phase::Hanging) {
            Phase::Live(link) if link.generation == generation => link,
            other => {
                state.phase = other;
                return;
            }
        };
        link.detach();

        let message = event.message.clone();
        if message.is_intentional() {
            state.phase = Phase::Closed;
            self.status.send_replace(Status::Closed);
            drop(state);
            tracing::info!(id = %self.id, %message, "session closed by peer");
            self.closed.resolve(event);
            return;
        }

        self.status.send_replace(Status::Waiting);
        let weak = Arc::downgrade(self);
        state.timeout = link::spawn_timer(self.config.timeout, move || {
            if let Some(inner) = weak.upgrade() {
                inner.expire();
            }
        });
        drop(state);
        tracing::info!(id = %self.id, %message, "session link dropped");
        self.broken_pipe.emit(message);
    }

    fn expire(&self) {
        {
            let mut state = self.state.lock();
            if !matches!(state.phase, Phase::Hanging) {
                return;
            }
            state.phase = Phase::Closed;
            state.timeout = None;
            self.status.send_replace(Status::Closed);
        }
        tracing::info!(id = %self.id, "session timed out");
        self.closed.resolve(CloseEvent::local(SESSION_TIMEOUT_MESSAGE));
    }

    /// Moves to `Closed` and returns the live connection, if any. `None`
    /// if the session was already closed.
    fn shut(&self) -> Option<Option<ConnectionRef>> {
        let mut state = self.state.lock();
        let link = match std::mem::replace(&mut state.phase, Phase::Closed) {
            Phase::Closed => return None,
            Phase::Live(link) => Some(link.detach()),
            Phase::Hanging => None,
        };
        if let Some(timeout) = state.timeout.take() {
            timeout.abort();
        }
        self.status.send_replace(Status::Closed);
        Some(link)
    }
}

/// A logical connection that survives its transport being replaced.
///
/// Created by a [`Server`](crate::Server) on an empty-key handshake. While
/// the link is down, sends wait for a resume (or fail fast with
/// [`SendParams::immediate`]); the session closes for good on an
/// intentional close from either side or when no resume arrives within
/// [`SessionConfig::timeout`].
///
/// Messages from the client are held until someone observes
/// [`message`](Connection::message), so a session taken off
/// `Server::connection` can be subscribed to at leisure.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Wraps `connection`, which is live from the start.
    pub fn new(key: impl Into<String>, connection: ConnectionRef, config: SessionConfig) -> Self {
        let (status, _) = watch::channel(Status::Waiting);
        let inner = Arc::new(SessionInner {
            id: ConnectionId::next(),
            key: key.into(),
            config,
            message: Event::buffered(),
            closed: Deferred::new(),
            broken_pipe: Event::new(),
            resuming: Event::new(),
            state: Mutex::new(State {
                phase: Phase::Hanging,
                generation: 0,
                timeout: None,
            }),
            status,
        });
        {
            let mut state = inner.state.lock();
            inner.adopt(&mut state, Arc::clone(&connection));
            inner.status.send_replace(Status::Ready(connection));
        }
        Self { inner }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// The key a client presents to resume this session.
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// `true` while a link is up and writable.
    pub fn is_ready(&self) -> bool {
        link::is_ready(&self.inner.status)
    }

    /// Fires with the drop reason when the link goes down.
    pub fn broken_pipe(&self) -> &Event<CloseMessage> {
        &self.inner.broken_pipe
    }

    /// Fires when a dropped link is replaced.
    pub fn resuming(&self) -> &Event<()> {
        &self.inner.resuming
    }

    /// Hands the session a new physical connection from a resuming client.
    ///
    /// If a link is still up, the takeover policy decides: with takeovers
    /// enabled the old link is closed with [`TAKEOVER_MESSAGE`], otherwise
    /// `connection` is closed with [`REJECTED_TAKEOVER_MESSAGE`]. The
    /// adopted connection receives [`RESUME_TOKEN`] before anything else.
    ///
    /// # Errors
    /// [`ConnectionError::Closed`] if the session already ended.
    pub async fn on_reconnect(&self, connection: ConnectionRef) -> Result<(), ConnectionError> {
        let adopted = {
            let mut state = self.inner.state.lock();
            let live = match state.phase {
                Phase::Closed => return Err(ConnectionError::Closed),
                Phase::Live(_) => true,
                Phase::Hanging => false,
            };
            if live && !self.inner.config.takeover {
                None
            } else {
                Some(self.inner.adopt(&mut state, Arc::clone(&connection)))
            }
        };

        let Some(adopted) = adopted else {
            tracing::warn!(id = %self.inner.id, "takeover refused, session is live");
            let _ = connection.close(REJECTED_TAKEOVER_MESSAGE).await;
            return Ok(());
        };

        if let Some(old) = adopted.replaced {
            tracing::info!(id = %self.inner.id, "session taken over");
            let _ = old.close(TAKEOVER_MESSAGE).await;
        }

        if let Err(e) = connection.send(RESUME_TOKEN.into()).await {
            // The link's close handler deals with the fallout.
            tracing::debug!(id = %self.inner.id, error = %e, "resume token not delivered");
            return Ok(());
        }

        {
            let state = self.inner.state.lock();
            if matches!(&state.phase, Phase::Live(link) if link.generation == adopted.generation) {
                self.inner.status.send_replace(Status::Ready(connection));
            }
        }
        if adopted.resumed {
            tracing::info!(id = %self.inner.id, "session resumed");
            self.inner.resuming.emit(());
        }
        Ok(())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self.inner.state.lock().phase {
            Phase::Live(_) => "live",
            Phase::Hanging => "hanging",
            Phase::Closed => "closed",
        };
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("phase", &phase)
            .finish()
    }
}

#[async_trait]
impl Connection for Session {
    fn message(&self) -> &Event<Data> {
        &self.inner.message
    }

    fn closed(&self) -> &Deferred<CloseEvent> {
        &self.inner.closed
    }

    fn is_closed(&self) -> bool {
        matches!(self.inner.state.lock().phase, Phase::Closed)
    }

    async fn send_with(&self, data: Data, params: SendParams) -> Result<(), ConnectionError> {
        link::send_when_ready(&self.inner.status, data, params).await
    }

    /// Ends the session and closes the live link with `message`.
    ///
    /// The link has to be able to carry the code. A WebSocket only takes
    /// codes `0..=1999`; anything else is refused by the link, which is
    /// then terminated, so the peer sees a dropped transport rather than
    /// `message` and ends up with `INVALID_SESSION` when it tries to
    /// resume. This side still resolves `closed` with `message`.
    async fn close(&self, message: CloseMessage) -> Result<(), ConnectionError> {
        let link = self.inner.shut().ok_or(ConnectionError::Closed)?;
        if let Some(conn) = link {
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
        let Some(link) = self.inner.shut() else { return };
        if let Some(conn) = link {
            conn.terminate();
        }
        tracing::info!(id = %self.inner.id, "session terminated");
        self.inner.closed.resolve(CloseEvent::local(TERMINATED_MESSAGE));
    }
}
