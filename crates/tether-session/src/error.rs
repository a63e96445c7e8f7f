//! Error types for the session layer.

use tether_transport::{ConnectionError, TransportError};

/// Errors that can occur while establishing or resuming a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The peer did not follow the handshake: a binary reply, or something
    /// other than the resume token when resuming.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A new physical connection could not be opened.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The connection failed or closed mid-handshake.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}
