//! The session registry.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tether_event::{Event, Next, Subscription};
use tether_transport::{
    Connection, ConnectionRef, ConnectionTarget, Data, TIMEOUT_MESSAGE, spawn_detached,
};

use crate::protocol::{INVALID_SESSION_MESSAGE, NO_HANDSHAKE_MESSAGE, NO_KEY};
use crate::{KeyGenerator, ServerConfig, Session};

struct ServerInner {
    keys: Box<dyn KeyGenerator>,
    config: ServerConfig,
    sessions: Mutex<HashMap<String, Session>>,
    connection: Event<Session>,
    subscription: Mutex<Option<Subscription>>,
}

impl ServerInner {
    async fn handshake(self: Arc<Self>, conn: ConnectionRef, first: Next<Data>) {
        let closed = conn.closed().wait();
        let reply = async {
            tokio::select! {
                data = first => data,
                _ = closed => None,
            }
        };
        let reply = match self.config.handshake_timeout {
            Some(limit) => match tokio::time::timeout(limit, reply).await {
                Ok(reply) => reply,
                Err(_) => {
                    tracing::warn!(?limit, "handshake timed out");
                    let _ = conn.close(TIMEOUT_MESSAGE).await;
                    return;
                }
            },
            None => reply.await,
        };

        match reply {
            None => tracing::debug!("connection closed before handshake"),
            Some(Data::Binary(_)) => {
                tracing::warn!("handshake was binary, closing");
                let _ = conn.close(NO_HANDSHAKE_MESSAGE).await;
            }
            Some(Data::Text(key)) if key == NO_KEY => self.open_session(conn).await,
            Some(Data::Text(key)) => self.resume_session(&key, conn).await,
        }
    }

    async fn open_session(self: &Arc<Self>, conn: ConnectionRef) {
        let key = self.keys.generate();
        let session = Session::new(key.clone(), Arc::clone(&conn), self.config.session.clone());
        let stored = {
            let mut sessions = self.sessions.lock();
            if key.is_empty() || sessions.contains_key(&key) {
                false
            } else {
                sessions.insert(key.clone(), session.clone());
                true
            }
        };
        if !stored {
            tracing::error!("key generator returned an empty or live key");
            session.terminate();
            return;
        }

        let weak = Arc::downgrade(self);
        let evicted = key.clone();
        session.closed().then(move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.sessions.lock().remove(&evicted);
            }
        });

        if let Err(e) = conn.send(key.into()).await {
            tracing::debug!(id = %session.id(), error = %e, "could not send session key");
            session.terminate();
            return;
        }
        tracing::info!(id = %session.id(), "session created");
        self.connection.emit(session);
    }

    async fn resume_session(&self, key: &str, conn: ConnectionRef) {
        let session = self.sessions.lock().get(key).cloned();
        let Some(session) = session else {
            tracing::warn!("unknown session key");
            let _ = conn.close(INVALID_SESSION_MESSAGE).await;
            return;
        };
        if let Err(e) = session.on_reconnect(Arc::clone(&conn)).await {
            tracing::debug!(id = %session.id(), error = %e, "resume of a closed session");
            let _ = conn.close(INVALID_SESSION_MESSAGE).await;
        }
    }
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.get_mut().take() {
            subscription.dispose();
        }
    }
}

/// Turns raw connections into [`Session`]s.
///
/// Every connection announced by the underlying target must open with a
/// text handshake: an empty string asks for a new session, anything else
/// is a key to resume. Sessions are announced on
/// [`connection`](ConnectionTarget::connection) once their key has been
/// sent, and forgotten when they close.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Starts accepting handshakes on every connection `target` announces
    /// from now on.
    pub fn new<T, K>(target: &T, keys: K, config: ServerConfig) -> Self
    where
        T: ConnectionTarget,
        K: KeyGenerator,
    {
        let inner = Arc::new(ServerInner {
            keys: Box::new(keys),
            config,
            sessions: Mutex::new(HashMap::new()),
            connection: Event::new(),
            subscription: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let subscription = target.connection().subscribe(move |conn: T::Conn| {
            let Some(inner) = weak.upgrade() else { return };
            // Registered before any message can be delivered.
            let first = conn.message().next();
            spawn_detached(inner.handshake(Arc::new(conn), first));
        });
        *inner.subscription.lock() = Some(subscription);

        Self { inner }
    }

    /// The live session with this key, if any.
    pub fn session(&self, key: &str) -> Option<Session> {
        self.inner.sessions.lock().get(key).cloned()
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("sessions", &self.inner.sessions.lock().len())
            .finish()
    }
}

impl ConnectionTarget for Server {
    type Conn = Session;

    fn connection(&self) -> &Event<Session> {
        &self.inner.connection
    }

    fn clients(&self) -> Vec<Session> {
        self.inner.sessions.lock().values().cloned().collect()
    }
}
