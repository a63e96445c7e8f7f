//! Event primitives for Tether.
//!
//! Every layer in Tether talks to the layer above it through two small
//! building blocks:
//!
//! - [`Event`] — a multi-listener signal. Listeners subscribe with a
//!   closure, or await the next value with [`Event::next`].
//! - [`Deferred`] — a one-shot value (the "closed" notification of a
//!   connection, the "ready" notification of a client). Continuations
//!   registered with [`Deferred::then`] fire exactly once.
//!
//! # Delivery model
//!
//! Nothing is ever delivered synchronously. `emit` and `resolve` push a
//! job onto a single process-wide FIFO queue that is drained by one
//! dedicated thread:
//!
//! ```text
//! emit(a) ──┐
//! resolve(b)┼──→ [ dispatch queue ] ──→ tether-dispatch thread ──→ listeners
//! emit(c) ──┘
//! ```
//!
//! Because there is exactly one queue, signals are observed in the order
//! they were raised, even across different events. Each job runs inside
//! the Tokio runtime that was current when it was queued, so listeners
//! can call `tokio::spawn`.

mod deferred;
mod dispatch;
mod event;

pub use deferred::{Deferred, Wait};
pub use event::{Event, Next, Receiver, Subscription};
