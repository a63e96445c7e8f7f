//! Resumable sessions for Tether.
//!
//! A session is a logical connection that outlives the physical ones under
//! it. When a transport drops, the [`Client`] reconnects and presents its
//! session key; the [`Server`] hands the new transport to the existing
//! [`Session`] and both sides carry on. Application code only sees the
//! [`broken_pipe`](Session::broken_pipe) and
//! [`resuming`](Session::resuming) signals.
//!
//! # How it fits in the stack
//!
//! ```text
//! Mux / Application (above)   ← sees one Connection that never drops
//!     ↕
//! Session Layer (this crate)  ← handshake, key issuance, resume
//!     ↕
//! Transport (below)           ← physical connections that do drop
//! ```
//!
//! Whether a close is final is read off its code: non-negative codes are
//! deliberate and end the session, negative codes are transport failures
//! and trigger a resume.

mod client;
mod config;
mod error;
mod keys;
mod link;
pub mod protocol;
mod server;
mod session;

pub use client::{Client, ConnectionFactory};
pub use config::{ClientConfig, ServerConfig, SessionConfig};
pub use error::SessionError;
pub use keys::{KeyGenerator, RandomKeys, SeededKeys};
pub use server::Server;
pub use session::Session;
