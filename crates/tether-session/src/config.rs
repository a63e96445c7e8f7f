//! Session, server and client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// SessionConfig
// ---------------------------------------------------------------------------

/// Per-session behavior on the server side.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long a session waits for a reconnect after its link drops
    /// before closing for good.
    ///
    /// Default: 10 seconds.
    pub timeout: Duration,

    /// Whether a resume while the old link is still up replaces that link.
    /// When `false` the incoming connection is turned away instead.
    ///
    /// Default: `true`.
    pub takeover: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            takeover: true,
        }
    }
}

// ---------------------------------------------------------------------------
// ServerConfig
// ---------------------------------------------------------------------------

/// Configuration for a session [`Server`](crate::Server).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Applied to every session the server creates.
    pub session: SessionConfig,

    /// How long a new connection may take to send its handshake.
    /// `None` waits forever.
    ///
    /// Default: 5 seconds.
    pub handshake_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            handshake_timeout: Some(Duration::from_secs(5)),
        }
    }
}

// ---------------------------------------------------------------------------
// ClientConfig
// ---------------------------------------------------------------------------

/// Configuration for a session [`Client`](crate::Client).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Pause before retrying after the server refused a takeover, so that
    /// competing clients do not hammer it.
    ///
    /// Default: 500 milliseconds.
    pub takeover_backoff: Duration,

    /// How many times to try opening a transport before giving up on a
    /// (re)connect.
    ///
    /// Default: 1.
    pub reconnect_attempts: u32,

    /// Pause between failed transport attempts.
    ///
    /// Default: 1 second.
    pub reconnect_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            takeover_backoff: Duration::from_millis(500),
            reconnect_attempts: 1,
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let server = ServerConfig::default();
        assert_eq!(server.session.timeout, Duration::from_secs(10));
        assert!(server.session.takeover);
        assert_eq!(server.handshake_timeout, Some(Duration::from_secs(5)));

        let client = ClientConfig::default();
        assert_eq!(client.takeover_backoff, Duration::from_millis(500));
        assert_eq!(client.reconnect_attempts, 1);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"session": {"takeover": false}}"#).expect("should parse");
        assert!(!config.session.takeover);
        assert_eq!(config.session.timeout, Duration::from_secs(10));
        assert_eq!(config.handshake_timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_handshake_timeout_can_be_disabled() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"handshake_timeout": null}"#).expect("should parse");
        assert_eq!(config.handshake_timeout, None);
    }
}
