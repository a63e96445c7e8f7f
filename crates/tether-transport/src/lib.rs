//! Connection abstraction layer for Tether.
//!
//! Provides the [`Connection`] and [`ConnectionTarget`] traits that every
//! layer of Tether speaks, whatever sits underneath: a raw WebSocket, an
//! in-memory pipe, a multiplexed channel, or a resumable session.
//!
//! # Feature Flags
//!
//! - `websocket` (default) — WebSocket adapter via `tokio-tungstenite`

pub mod buffer;
mod close;
mod error;
mod memory;
#[cfg(feature = "websocket")]
mod websocket;

pub use close::{
    APPLICATION_CODE_BASE, CLOSE_CODE_OFFSET, CloseEvent, CloseMessage, PING_TIMEOUT_MESSAGE,
    PROTOCOL_MESSAGE, RESERVED_CODE_RANGE, TERMINATED_MESSAGE, TIMEOUT_MESSAGE,
};
pub use error::{ConnectionError, TransportError};
pub use memory::{MemoryConnection, MemoryTarget};
#[cfg(feature = "websocket")]
pub use websocket::{WsConfig, WsConnection, WsListener, connect};

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tether_event::{Deferred, Event};

/// Counter for generating unique connection IDs.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identifier for a physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Creates a new `ConnectionId` from a raw `u64`.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Allocates the next process-unique id.
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Data / SendParams
// ---------------------------------------------------------------------------

/// One message: either text or binary, never both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Data {
    Text(String),
    Binary(Bytes),
}

impl Data {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Data::Text(s) => Some(s),
            Data::Binary(_) => None,
        }
    }

    pub fn as_binary(&self) -> Option<&Bytes> {
        match self {
            Data::Text(_) => None,
            Data::Binary(b) => Some(b),
        }
    }
}

impl From<String> for Data {
    fn from(s: String) -> Self {
        Data::Text(s)
    }
}

impl From<&str> for Data {
    fn from(s: &str) -> Self {
        Data::Text(s.to_owned())
    }
}

impl From<Bytes> for Data {
    fn from(b: Bytes) -> Self {
        Data::Binary(b)
    }
}

impl From<Vec<u8>> for Data {
    fn from(b: Vec<u8>) -> Self {
        Data::Binary(Bytes::from(b))
    }
}

/// Per-send options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendParams {
    /// Fail with [`ConnectionError::Suspended`] instead of waiting when a
    /// resumable connection is between transports.
    pub immediate: bool,
}

impl SendParams {
    pub const IMMEDIATE: SendParams = SendParams { immediate: true };
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// A bidirectional, message-oriented connection.
///
/// # Contract
///
/// - `message` fires once per inbound message, in arrival order.
/// - `closed` resolves exactly once. `is_closed` is already `true` when
///   any continuation of `closed` runs.
/// - `close` ends the connection with a message the peer will see;
///   `terminate` drops it without one and resolves with
///   [`TERMINATED_MESSAGE`].
///
/// The trait is object safe; `Arc<dyn Connection>` ([`ConnectionRef`]) is
/// how layers hold the connection underneath them.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Inbound messages.
    fn message(&self) -> &Event<Data>;

    /// Resolves once, when the connection ends.
    fn closed(&self) -> &Deferred<CloseEvent>;

    fn is_closed(&self) -> bool;

    /// Sends one message.
    async fn send_with(&self, data: Data, params: SendParams) -> Result<(), ConnectionError>;

    /// Sends one message with default parameters.
    async fn send(&self, data: Data) -> Result<(), ConnectionError> {
        self.send_with(data, SendParams::default()).await
    }

    /// Closes with `message`, which the peer receives as its close reason.
    async fn close(&self, message: CloseMessage) -> Result<(), ConnectionError>;

    /// Drops the connection immediately.
    fn terminate(&self);
}

/// Shared handle to any connection.
pub type ConnectionRef = Arc<dyn Connection>;

#[async_trait]
impl<C: Connection + ?Sized> Connection for Arc<C> {
    fn message(&self) -> &Event<Data> {
        (**self).message()
    }

    fn closed(&self) -> &Deferred<CloseEvent> {
        (**self).closed()
    }

    fn is_closed(&self) -> bool {
        (**self).is_closed()
    }

    async fn send_with(&self, data: Data, params: SendParams) -> Result<(), ConnectionError> {
        (**self).send_with(data, params).await
    }

    async fn close(&self, message: CloseMessage) -> Result<(), ConnectionError> {
        (**self).close(message).await
    }

    fn terminate(&self) {
        (**self).terminate()
    }
}

/// Something that produces connections: a listener, a multiplexer host,
/// a session server.
pub trait ConnectionTarget: Send + Sync + 'static {
    /// The connection type this target announces.
    type Conn: Connection + Clone;

    /// Fires once per new connection.
    fn connection(&self) -> &Event<Self::Conn>;

    /// Currently open connections.
    fn clients(&self) -> Vec<Self::Conn>;

    fn client_count(&self) -> usize {
        self.clients().len()
    }
}

/// Spawns `future` on the current Tokio runtime, if there is one.
///
/// Event listeners run outside of any task, so they use this to start
/// async work (a send, a handshake) without awaiting it.
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(future);
        }
        Err(_) => tracing::warn!("no tokio runtime, background task dropped"),
    }
}
