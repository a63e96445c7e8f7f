//! Unified error type for Tether.

use tether_mux::MuxError;
use tether_session::SessionError;
use tether_transport::{ConnectionError, TransportError};

/// Top-level error that wraps all crate-specific errors.
///
/// The `#[from]` attribute on each variant lets `?` convert sub-crate
/// errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum TetherError {
    /// Binding, accepting or opening a physical connection failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// An operation on an open connection failed.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Channel negotiation or framing failed.
    #[error(transparent)]
    Mux(#[from] MuxError),

    /// The session handshake failed.
    #[error(transparent)]
    Session(#[from] SessionError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_transport_error() {
        let err = TransportError::BindFailed(std::io::ErrorKind::AddrInUse.into());
        let tether_err: TetherError = err.into();
        assert!(matches!(tether_err, TetherError::Transport(_)));
        assert!(tether_err.to_string().contains("bind failed"));
    }

    #[test]
    fn test_from_connection_error() {
        let tether_err: TetherError = ConnectionError::Suspended.into();
        assert!(matches!(tether_err, TetherError::Connection(_)));
    }

    #[test]
    fn test_from_mux_error() {
        let tether_err: TetherError = MuxError::ChannelIdInUse(14).into();
        assert!(matches!(tether_err, TetherError::Mux(_)));
        assert!(tether_err.to_string().contains("14"));
    }

    #[test]
    fn test_from_session_error() {
        let tether_err: TetherError = SessionError::Protocol("no key".into()).into();
        assert!(matches!(tether_err, TetherError::Session(_)));
    }
}
