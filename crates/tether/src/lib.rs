//! # Tether
//!
//! Resilient, multiplexed connections over WebSockets.
//!
//! Tether stacks three layers, each of which is a [`Connection`]:
//!
//! - **transport**: WebSocket (or in-memory) connections with close codes
//!   that tell a deliberate close from a dropped link;
//! - **session**: a logical connection that survives the link dropping and
//!   resumes with a key;
//! - **mux**: many independent channels over one connection.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tether::prelude::*;
//!
//! # async fn run() -> Result<(), TetherError> {
//! let server = TetherServer::builder().bind("127.0.0.1:8080").build().await?;
//!
//! let client = tether::connect(
//!     "ws://127.0.0.1:8080",
//!     ClientConfig::default(),
//!     WsConfig::default(),
//! );
//! client.ready().wait().await;
//! client.send("hello".into()).await?;
//! # Ok(())
//! # }
//! ```

mod error;
mod server;

pub use error::TetherError;
pub use server::{TetherServer, TetherServerBuilder, connect};

pub use tether_event as event;
pub use tether_mux as mux;
pub use tether_session as session;
pub use tether_transport as transport;

pub use tether_transport::{Connection, ConnectionTarget};

pub mod prelude {
    pub use crate::{TetherError, TetherServer, TetherServerBuilder};
    pub use tether_event::{Deferred, Event, Subscription};
    pub use tether_mux::{Channel, Host, MuxError};
    pub use tether_session::{
        Client, ClientConfig, KeyGenerator, RandomKeys, SeededKeys, Server, ServerConfig,
        Session, SessionConfig, SessionError,
    };
    pub use tether_transport::{
        CloseEvent, CloseMessage, Connection, ConnectionError, ConnectionTarget, Data, SendParams,
        TransportError, WsConfig,
    };
}
