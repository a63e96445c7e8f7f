//! Channel multiplexing for Tether.
//!
//! Runs many independent [`Channel`]s over one physical connection. The
//! [`Host`] owns the connection, negotiates channel ids with its peer and
//! routes frames; each channel is a full
//! [`Connection`](tether_transport::Connection), so anything that works on
//! a raw connection works on a channel too (including another `Host`).
//!
//! # How it fits in the stack
//!
//! ```text
//! Application   ← uses Channels like any Connection
//!     ↕
//! Mux (this crate)   ← frames: magic word, target id, tag/opcode
//!     ↕
//! Session / Transport (below)   ← one message-oriented connection
//! ```

mod channel;
mod error;
mod host;
pub mod protocol;

pub use channel::Channel;
pub use error::MuxError;
pub use host::Host;
