//! Handshake strings and session close messages.
//!
//! The handshake runs as plain text messages on the raw connection, before
//! anything else is sent on it:
//!
//! ```text
//!  client                              server
//!  |--- ""  (no key yet) ------------->|  issue key, create Session
//!  |<-- "<key>" -----------------------|
//!
//!  |--- "<key>" (after a drop) ------->|  look up Session, hand it the link
//!  |<-- "resume" ----------------------|
//! ```

use tether_transport::CloseMessage;

/// Sent by a client that has no session yet.
pub const NO_KEY: &str = "";

/// The server's reply to a successful resume.
pub const RESUME_TOKEN: &str = "resume";

/// The first message was not text.
pub const NO_HANDSHAKE_MESSAGE: CloseMessage =
    CloseMessage::from_static(101, "first message was not a session key");

/// The key does not name a live session.
pub const INVALID_SESSION_MESSAGE: CloseMessage =
    CloseMessage::from_static(102, "unknown session key");

/// Another connection resumed this session.
pub const TAKEOVER_MESSAGE: CloseMessage =
    CloseMessage::from_static(103, "session taken over by another connection");

/// The session is still live and refuses takeovers.
pub const REJECTED_TAKEOVER_MESSAGE: CloseMessage =
    CloseMessage::from_static(104, "session is live and takeovers are disabled");

/// Nobody resumed the session in time.
pub const SESSION_TIMEOUT_MESSAGE: CloseMessage =
    CloseMessage::from_static(105, "session was not resumed in time");
