//! `TetherServer` builder and the WebSocket client entry point.
//!
//! Ties the layers together: WebSocket listener → session server. What
//! runs on top of each session (plain messages, a mux `Host`) is up to
//! the application.

use std::net::SocketAddr;
use std::sync::Arc;

use tether_event::Event;
use tether_session::{
    Client, ClientConfig, KeyGenerator, RandomKeys, Server, ServerConfig, Session,
};
use tether_transport::{ConnectionRef, ConnectionTarget, TransportError, WsConfig, WsListener};

use crate::TetherError;

/// Builder for configuring and starting a Tether server.
///
/// # Example
///
/// ```rust,no_run
/// use tether::prelude::*;
///
/// # async fn run() -> Result<(), TetherError> {
/// let server = TetherServer::builder()
///     .bind("0.0.0.0:8080")
///     .build()
///     .await?;
/// let _sessions = server.connection().subscribe(|session| {
///     tracing::info!(id = %session.id(), "new session");
/// });
/// # Ok(())
/// # }
/// ```
pub struct TetherServerBuilder<K = RandomKeys> {
    bind_addr: String,
    ws_config: WsConfig,
    server_config: ServerConfig,
    keys: K,
}

impl TetherServerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            ws_config: WsConfig::default(),
            server_config: ServerConfig::default(),
            keys: RandomKeys,
        }
    }
}

impl Default for TetherServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: KeyGenerator> TetherServerBuilder<K> {
    /// Sets the address to bind the server to.
    pub fn bind(mut self, addr: &str) -> Self {
        self.bind_addr = addr.to_string();
        self
    }

    /// Sets the WebSocket configuration.
    pub fn ws_config(mut self, config: WsConfig) -> Self {
        self.ws_config = config;
        self
    }

    /// Sets the session server configuration.
    pub fn server_config(mut self, config: ServerConfig) -> Self {
        self.server_config = config;
        self
    }

    /// Replaces the session key generator.
    pub fn keys<G: KeyGenerator>(self, keys: G) -> TetherServerBuilder<G> {
        TetherServerBuilder {
            bind_addr: self.bind_addr,
            ws_config: self.ws_config,
            server_config: self.server_config,
            keys,
        }
    }

    /// Binds the listener and starts accepting sessions.
    pub async fn build(self) -> Result<TetherServer, TetherError> {
        let listener = WsListener::bind(&self.bind_addr, self.ws_config).await?;
        let sessions = Server::new(&listener, self.keys, self.server_config);
        tracing::info!(addr = %listener.local_addr(), "Tether server running");
        Ok(TetherServer { listener, sessions })
    }
}

/// A running Tether server: a WebSocket listener with a session server on
/// top of it.
///
/// New sessions are announced on
/// [`connection`](ConnectionTarget::connection).
pub struct TetherServer {
    listener: WsListener,
    sessions: Server,
}

impl TetherServer {
    /// Creates a new builder.
    pub fn builder() -> TetherServerBuilder {
        TetherServerBuilder::new()
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// The session registry.
    pub fn sessions(&self) -> &Server {
        &self.sessions
    }

    /// The raw WebSocket listener under the sessions.
    pub fn listener(&self) -> &WsListener {
        &self.listener
    }

    /// Stops accepting new connections. Existing sessions stay up.
    pub fn shutdown(&self) {
        self.listener.shutdown();
    }
}

impl std::fmt::Debug for TetherServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TetherServer")
            .field("addr", &self.local_addr())
            .field("sessions", &self.sessions)
            .finish()
    }
}

impl ConnectionTarget for TetherServer {
    type Conn = Session;

    fn connection(&self) -> &Event<Session> {
        self.sessions.connection()
    }

    fn clients(&self) -> Vec<Session> {
        self.sessions.clients()
    }
}

/// Opens a resumable session to the Tether server at `url`.
///
/// Returns immediately; the client connects in the background and
/// reconnects over fresh WebSockets whenever the link drops. Must be called
/// from within a Tokio runtime.
pub fn connect(url: impl Into<String>, config: ClientConfig, ws_config: WsConfig) -> Client {
    let url = url.into();
    let factory = move || {
        let url = url.clone();
        let ws_config = ws_config.clone();
        async move {
            let conn = tether_transport::connect(&url, &ws_config).await?;
            Ok::<ConnectionRef, TransportError>(Arc::new(conn))
        }
    };
    Client::new(factory, config)
}
