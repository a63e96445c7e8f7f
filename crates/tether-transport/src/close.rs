//! Close messages and the close-code namespaces.
//!
//! Every connection in Tether ends with a [`CloseMessage`]: a numeric code
//! plus a human-readable reason. The code tells the layer above what kind
//! of ending it was:
//!
//! ```text
//!   < 0      transport domain: the link dropped, it was not a decision
//!   0..100   reserved for the protocol itself (terminated, protocol, timeout)
//!   100..200 session control (takeover, invalid session, ...)
//!   200..    application defined
//! ```
//!
//! A negative code is the only signal a session uses to decide between
//! "resume later" and "this is over".

use std::borrow::Cow;
use std::fmt;

/// Offset added to a code before it is put on a WebSocket close frame.
///
/// WebSocket reserves native codes below 3000, so a local code `c` travels
/// as `c + 3000` and a native code `n` is read back as `n - 3000`. Native
/// codes from the standard range (1000..3000) therefore read back negative.
pub const CLOSE_CODE_OFFSET: i32 = 3000;

/// Highest native close code a peer is allowed to send.
pub(crate) const MAX_WIRE_CODE: i32 = 4999;

/// Codes below this value belong to the protocol itself.
pub const RESERVED_CODE_RANGE: i32 = 100;

/// First code available to applications.
pub const APPLICATION_CODE_BASE: i32 = 200;

/// The connection was dropped without a close handshake.
pub const TERMINATED_MESSAGE: CloseMessage = CloseMessage::from_static(0, "terminated");

/// The peer broke the protocol.
pub const PROTOCOL_MESSAGE: CloseMessage = CloseMessage::from_static(1, "protocol violation");

/// A protocol-level wait ran out (for example a handshake).
pub const TIMEOUT_MESSAGE: CloseMessage = CloseMessage::from_static(2, "timeout");

/// The liveness probe went unanswered. Negative, so sessions resume.
pub const PING_TIMEOUT_MESSAGE: CloseMessage = CloseMessage::from_static(-1, "timeout");

// ---------------------------------------------------------------------------
// CloseMessage
// ---------------------------------------------------------------------------

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CloseMessage {
    pub code: i32,
    pub reason: Cow<'static, str>,
}

impl CloseMessage {
    pub fn new(code: i32, reason: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Const constructor for well-known messages.
    pub const fn from_static(code: i32, reason: &'static str) -> Self {
        Self {
            code,
            reason: Cow::Borrowed(reason),
        }
    }

    /// Decodes a native WebSocket close code.
    pub fn from_wire(native: u16, reason: impl Into<Cow<'static, str>>) -> Self {
        Self::new(i32::from(native) - CLOSE_CODE_OFFSET, reason)
    }

    /// Native WebSocket code for this message, if it can be sent at all.
    ///
    /// Only local codes `0..=1999` map into the sendable native range
    /// `3000..=4999`.
    pub fn wire_code(&self) -> Option<u16> {
        let native = self.code.checked_add(CLOSE_CODE_OFFSET)?;
        if (CLOSE_CODE_OFFSET..=MAX_WIRE_CODE).contains(&native) {
            u16::try_from(native).ok()
        } else {
            None
        }
    }

    /// `true` when one side chose to end the connection, `false` when the
    /// transport dropped underneath it.
    pub fn is_intentional(&self) -> bool {
        self.code >= 0
    }

    pub fn is_reserved(&self) -> bool {
        (0..RESERVED_CODE_RANGE).contains(&self.code)
    }
}

impl fmt::Display for CloseMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.reason, self.code)
    }
}

// ---------------------------------------------------------------------------
// CloseEvent
// ---------------------------------------------------------------------------

/// Payload of a connection's `closed` deferred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    pub message: CloseMessage,
    /// `true` if this side initiated the close.
    pub local: bool,
}

impl CloseEvent {
    pub fn local(message: CloseMessage) -> Self {
        Self {
            message,
            local: true,
        }
    }

    pub fn remote(message: CloseMessage) -> Self {
        Self {
            message,
            local: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_code_adds_offset() {
        assert_eq!(CloseMessage::new(42, "x").wire_code(), Some(3042));
        assert_eq!(TERMINATED_MESSAGE.wire_code(), Some(3000));
    }

    #[test]
    fn test_wire_code_rejects_unsendable_codes() {
        assert_eq!(PING_TIMEOUT_MESSAGE.wire_code(), None);
        assert_eq!(CloseMessage::new(2000, "x").wire_code(), None);
        assert_eq!(CloseMessage::new(i32::MAX, "x").wire_code(), None);
    }

    #[test]
    fn test_from_wire_standard_codes_are_negative() {
        let normal = CloseMessage::from_wire(1000, "bye");
        assert_eq!(normal.code, -2000);
        assert!(!normal.is_intentional());

        let app = CloseMessage::from_wire(3201, "left");
        assert_eq!(app.code, 201);
        assert!(app.is_intentional());
    }

    #[test]
    fn test_reserved_range() {
        assert!(PROTOCOL_MESSAGE.is_reserved());
        assert!(!CloseMessage::new(APPLICATION_CODE_BASE, "app").is_reserved());
        assert!(!PING_TIMEOUT_MESSAGE.is_reserved());
    }

    #[test]
    fn test_close_message_display() {
        assert_eq!(TIMEOUT_MESSAGE.to_string(), "timeout (2)");
    }
}
