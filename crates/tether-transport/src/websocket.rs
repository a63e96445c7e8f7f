//! WebSocket adapter using `tokio-tungstenite`.
//!
//! [`WsConnection`] turns a WebSocket stream into a [`Connection`]:
//!
//! - text frames become [`Data::Text`], binary frames [`Data::Binary`]
//! - a received close frame resolves `closed` with the code decoded by
//!   [`CloseMessage::from_wire`] (native code minus 3000)
//! - a stream that ends without a close frame reads as native 1006, i.e. a
//!   negative, unintentional close
//! - a background probe pings every [`WsConfig::ping_interval`]; a ping left
//!   unanswered for a whole interval drops the socket and reports
//!   [`PING_TIMEOUT_MESSAGE`]

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tether_event::{Deferred, Event};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::{
    CloseEvent, CloseMessage, Connection, ConnectionError, ConnectionId, ConnectionTarget, Data,
    PING_TIMEOUT_MESSAGE, SendParams, TERMINATED_MESSAGE, TransportError,
};

/// Native code reported when a close frame carries no status.
const NO_STATUS_CODE: u16 = 1005;
/// Native code reported when the stream ends without a close frame.
const ABNORMAL_CODE: u16 = 1006;

type BoxSink = Pin<Box<dyn Sink<Message, Error = tungstenite::Error> + Send>>;
type BoxStream = Pin<Box<dyn Stream<Item = Result<Message, tungstenite::Error>> + Send>>;

fn io_error(kind: std::io::ErrorKind, e: tungstenite::Error) -> std::io::Error {
    std::io::Error::new(kind, e)
}

// ---------------------------------------------------------------------------
// WsConfig
// ---------------------------------------------------------------------------

/// Configuration for WebSocket connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WsConfig {
    /// Interval between liveness probes. A probe still unanswered at the
    /// next tick drops the connection.
    ///
    /// Default: 10 seconds.
    pub ping_interval: Duration,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(10),
        }
    }
}

// ---------------------------------------------------------------------------
// WsConnection
// ---------------------------------------------------------------------------

struct WsInner {
    id: ConnectionId,
    message: Event<Data>,
    closed: Deferred<CloseEvent>,
    is_closed: AtomicBool,
    alive: AtomicBool,
    sink: tokio::sync::Mutex<Option<BoxSink>>,
    reader: parking_lot::Mutex<Option<AbortHandle>>,
    pinger: parking_lot::Mutex<Option<AbortHandle>>,
}

impl WsInner {
    /// Marks the connection closed and resolves `closed`. Later calls only
    /// keep the first resolution.
    fn finish(&self, event: CloseEvent) {
        self.is_closed.store(true, Ordering::SeqCst);
        self.stop_pinger();
        let code = event.message.code;
        let local = event.local;
        if self.closed.resolve(event) {
            tracing::debug!(id = %self.id, code, local, "WebSocket connection closed");
        }
    }

    fn stop_pinger(&self) {
        if let Some(handle) = self.pinger.lock().take() {
            handle.abort();
        }
    }

    /// Drops both halves of the socket without a close handshake.
    fn drop_socket(self: &Arc<Self>) {
        self.stop_pinger();
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
        match self.sink.try_lock() {
            Ok(mut sink) => {
                sink.take();
            }
            Err(_) => {
                let inner = Arc::clone(self);
                crate::spawn_detached(async move {
                    inner.sink.lock().await.take();
                });
            }
        }
    }
}

/// A single WebSocket connection.
///
/// Cheap to clone; all clones refer to the same socket.
#[derive(Clone)]
pub struct WsConnection {
    inner: Arc<WsInner>,
}

impl WsConnection {
    /// Wraps an upgraded stream. Nothing is read until [`start`](Self::start).
    fn wrap<S>(ws: tokio_tungstenite::WebSocketStream<S>) -> (Self, BoxStream)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();
        let inner = Arc::new(WsInner {
            id: ConnectionId::next(),
            message: Event::new(),
            closed: Deferred::new(),
            is_closed: AtomicBool::new(false),
            alive: AtomicBool::new(true),
            sink: tokio::sync::Mutex::new(Some(Box::pin(sink))),
            reader: parking_lot::Mutex::new(None),
            pinger: parking_lot::Mutex::new(None),
        });
        (Self { inner }, Box::pin(stream))
    }

    /// Starts the read loop and the liveness probe.
    fn start(&self, stream: BoxStream, config: &WsConfig) {
        let reader = tokio::spawn(read_loop(Arc::clone(&self.inner), stream));
        *self.inner.reader.lock() = Some(reader.abort_handle());

        if !config.ping_interval.is_zero() {
            let pinger = tokio::spawn(ping_loop(
                Arc::downgrade(&self.inner),
                config.ping_interval,
            ));
            *self.inner.pinger.lock() = Some(pinger.abort_handle());
        }
    }

    /// Returns the unique identifier for this connection.
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }
}

impl std::fmt::Debug for WsConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConnection")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn read_loop(inner: Arc<WsInner>, mut stream: BoxStream) {
    while let Some(item) = stream.next().await {
        match item {
            Ok(Message::Text(text)) => {
                if !inner.is_closed.load(Ordering::SeqCst) {
                    inner.message.emit(Data::Text(text.as_str().to_owned()));
                }
            }
            Ok(Message::Binary(data)) => {
                if !inner.is_closed.load(Ordering::SeqCst) {
                    inner.message.emit(Data::Binary(data));
                }
            }
            Ok(Message::Pong(_)) => inner.alive.store(true, Ordering::SeqCst),
            Ok(Message::Close(frame)) => {
                let message = match frame {
                    Some(frame) => {
                        CloseMessage::from_wire(u16::from(frame.code), frame.reason.as_str().to_owned())
                    }
                    None => CloseMessage::from_wire(NO_STATUS_CODE, ""),
                };
                // Keep reading so tungstenite can flush its close reply.
                inner.finish(CloseEvent::remote(message));
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(id = %inner.id, error = %e, "WebSocket read failed");
                break;
            }
        }
    }
    inner.finish(CloseEvent::remote(CloseMessage::from_wire(
        ABNORMAL_CODE,
        "connection lost",
    )));
}

async fn ping_loop(inner: Weak<WsInner>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    // The first tick completes immediately.
    interval.tick().await;
    loop {
        interval.tick().await;
        let Some(inner) = inner.upgrade() else { break };
        if inner.is_closed.load(Ordering::SeqCst) {
            break;
        }
        if !inner.alive.swap(false, Ordering::SeqCst) {
            tracing::warn!(id = %inner.id, "WebSocket peer missed ping, dropping");
            inner.drop_socket();
            inner.finish(CloseEvent::remote(PING_TIMEOUT_MESSAGE));
            break;
        }
        let mut sink = inner.sink.lock().await;
        if let Some(sink) = sink.as_mut() {
            if let Err(e) = sink.send(Message::Ping(Bytes::new())).await {
                tracing::debug!(id = %inner.id, error = %e, "ping failed");
            }
        }
    }
}

#[async_trait]
impl Connection for WsConnection {
    fn message(&self) -> &Event<Data> {
        &self.inner.message
    }

    fn closed(&self) -> &Deferred<CloseEvent> {
        &self.inner.closed
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed.load(Ordering::SeqCst)
    }

    async fn send_with(&self, data: Data, _params: SendParams) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let msg = match data {
            Data::Text(text) => Message::Text(text.into()),
            Data::Binary(bytes) => Message::Binary(bytes),
        };
        let mut sink = self.inner.sink.lock().await;
        let sink = sink.as_mut().ok_or(ConnectionError::Closed)?;
        sink.send(msg)
            .await
            .map_err(|e| ConnectionError::SendFailed(io_error(std::io::ErrorKind::BrokenPipe, e)))
    }

    async fn close(&self, message: CloseMessage) -> Result<(), ConnectionError> {
        let code = message
            .wire_code()
            .ok_or(ConnectionError::InvalidCloseCode(message.code))?;
        if self.inner.is_closed.swap(true, Ordering::SeqCst) {
            return Err(ConnectionError::Closed);
        }
        self.inner.stop_pinger();

        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: message.reason.to_string().into(),
        };
        let result = {
            let mut sink = self.inner.sink.lock().await;
            match sink.as_mut() {
                Some(sink) => sink.send(Message::Close(Some(frame))).await,
                None => Ok(()),
            }
        };
        self.inner.finish(CloseEvent::local(message));
        result.map_err(|e| ConnectionError::SendFailed(io_error(std::io::ErrorKind::BrokenPipe, e)))
    }

    fn terminate(&self) {
        if self.inner.is_closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.drop_socket();
        self.inner.finish(CloseEvent::local(TERMINATED_MESSAGE));
    }
}

// ---------------------------------------------------------------------------
// WsListener
// ---------------------------------------------------------------------------

struct ListenerInner {
    local_addr: SocketAddr,
    config: WsConfig,
    connection: Event<WsConnection>,
    clients: parking_lot::Mutex<Vec<WsConnection>>,
}

impl ListenerInner {
    fn adopt(self: &Arc<Self>, ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>) {
        let (conn, stream) = WsConnection::wrap(ws);
        self.clients.lock().push(conn.clone());

        let weak = Arc::downgrade(self);
        let id = conn.id();
        conn.closed().then(move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.clients.lock().retain(|c| c.id() != id);
            }
        });

        // Announce before reading so no first message can slip past a
        // listener that subscribes on announcement.
        self.connection.emit(conn.clone());
        conn.start(stream, &self.config);
    }
}

/// A [`ConnectionTarget`] accepting WebSocket connections on a TCP port.
///
/// The accept loop runs in the background until the listener is dropped
/// or [`shutdown`](Self::shutdown) is called.
pub struct WsListener {
    inner: Arc<ListenerInner>,
    accept_task: AbortHandle,
}

impl WsListener {
    /// Binds to `addr` and starts accepting.
    pub async fn bind(addr: &str, config: WsConfig) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(TransportError::BindFailed)?;
        let local_addr = listener.local_addr().map_err(TransportError::BindFailed)?;
        tracing::info!(%local_addr, "WebSocket listener bound");

        let inner = Arc::new(ListenerInner {
            local_addr,
            config,
            connection: Event::new(),
            clients: parking_lot::Mutex::new(Vec::new()),
        });

        let accept_task = tokio::spawn(accept_loop(listener, Arc::downgrade(&inner))).abort_handle();
        Ok(Self { inner, accept_task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Stops accepting. Open connections are left alone.
    pub fn shutdown(&self) {
        self.accept_task.abort();
        tracing::info!(local_addr = %self.inner.local_addr, "WebSocket listener shut down");
    }
}

impl Drop for WsListener {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(listener: TcpListener, inner: Weak<ListenerInner>) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                let e = TransportError::AcceptFailed(e);
                tracing::error!(error = %e, "accept failed");
                continue;
            }
        };
        let inner = inner.clone();
        tokio::spawn(async move {
            match tokio_tungstenite::accept_async(stream).await {
                Ok(ws) => {
                    if let Some(inner) = inner.upgrade() {
                        tracing::debug!(%addr, "accepted WebSocket connection");
                        inner.adopt(ws);
                    }
                }
                Err(e) => {
                    let e = TransportError::AcceptFailed(io_error(
                        std::io::ErrorKind::ConnectionRefused,
                        e,
                    ));
                    tracing::debug!(%addr, error = %e, "WebSocket upgrade failed");
                }
            }
        });
    }
}

impl ConnectionTarget for WsListener {
    type Conn = WsConnection;

    fn connection(&self) -> &Event<WsConnection> {
        &self.inner.connection
    }

    fn clients(&self) -> Vec<WsConnection> {
        self.inner.clients.lock().clone()
    }
}

// ---------------------------------------------------------------------------
// connect
// ---------------------------------------------------------------------------

/// Opens a WebSocket connection to `url`.
pub async fn connect(url: &str, config: &WsConfig) -> Result<WsConnection, TransportError> {
    let (ws, _) = tokio_tungstenite::connect_async(url).await.map_err(|e| {
        TransportError::ConnectFailed(io_error(std::io::ErrorKind::ConnectionRefused, e))
    })?;
    let (conn, stream) = WsConnection::wrap(ws);
    tracing::debug!(id = %conn.id(), url, "WebSocket connected");
    conn.start(stream, config);
    Ok(conn)
}
