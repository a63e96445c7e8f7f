//! The multiplexer endpoint.
//!
//! A [`Host`] owns one physical connection and hands out [`Channel`]s on
//! top of it. Opening a channel is a two-step handshake over control
//! frames:
//!
//! ```text
//!  A                                   B
//!  | create_channel(14)                |
//!  |--- CREATE_CHANNEL 14 ------------>|  14 unused? register Channel(14)
//!  |<-- APPROVED 14 -------------------|  then emit it on `connection`
//!  register Channel(14), return it     |
//! ```
//!
//! If 14 is already live (or being negotiated) on B, B answers `REJECTED`
//! and A's `create_channel` fails with [`MuxError::ChannelIdInUse`].

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tether_event::{Deferred, Event, Subscription};
use tether_transport::{
    CloseEvent, CloseMessage, Connection, ConnectionError, ConnectionRef, ConnectionTarget, Data,
    SendParams, spawn_detached,
};
use tokio::sync::oneshot;

use crate::protocol::{CHANNEL_ID_LIMIT, Frame, build_channel_reply, build_create_channel};
use crate::{Channel, MuxError};

type PendingReply = oneshot::Sender<Result<Channel, MuxError>>;

#[derive(Default)]
struct Registry {
    channels: HashMap<u16, Channel>,
    /// Ids we proposed and are waiting on a reply for.
    pending: HashMap<u16, PendingReply>,
    next_id: u16,
}

impl Registry {
    fn in_use(&self, id: u16) -> bool {
        self.channels.contains_key(&id) || self.pending.contains_key(&id)
    }

    /// Next unused id, counting up and wrapping below `CHANNEL_ID_LIMIT`.
    fn allocate(&mut self) -> Result<u16, MuxError> {
        for _ in 0..CHANNEL_ID_LIMIT {
            let id = self.next_id;
            self.next_id = (id + 1) % CHANNEL_ID_LIMIT;
            if !self.in_use(id) {
                return Ok(id);
            }
        }
        Err(MuxError::OutOfChannelSlots)
    }
}

struct HostInner {
    transport: ConnectionRef,
    message: Event<Data>,
    connection: Event<Channel>,
    registry: Mutex<Registry>,
    subscription: Mutex<Option<Subscription>>,
}

impl HostInner {
    fn receive(self: &Arc<Self>, data: Data) {
        if matches!(data, Data::Text(_)) {
            self.message.emit(data);
            return;
        }
        let buf = match &data {
            Data::Binary(buf) => buf.clone(),
            Data::Text(_) => return,
        };
        match Frame::parse(&buf) {
            Ok(None) => self.message.emit(data),
            Ok(Some(Frame::CreateChannel(id))) => self.accept_channel(id),
            Ok(Some(Frame::Reply { id, accepted })) => self.complete_channel(id, accepted),
            Ok(Some(Frame::Content { id, .. } | Frame::Close { id, .. })) => {
                if !self.registry.lock().channels.contains_key(&id) {
                    self.message.emit(data);
                }
            }
            Err(e) => tracing::debug!(error = %e, "dropping malformed frame"),
        }
    }

    /// Handles the peer's CREATE_CHANNEL.
    fn accept_channel(self: &Arc<Self>, id: u16) {
        let channel = {
            let mut registry = self.registry.lock();
            if id >= CHANNEL_ID_LIMIT || registry.in_use(id) {
                None
            } else {
                let channel = Channel::open(Arc::clone(&self.transport), id);
                registry.channels.insert(id, channel.clone());
                Some(channel)
            }
        };

        let transport = Arc::clone(&self.transport);
        match channel {
            None => {
                tracing::debug!(channel = id, "rejecting channel");
                spawn_detached(async move {
                    let _ = transport.send(build_channel_reply(id, false).into()).await;
                });
            }
            Some(channel) => {
                tracing::debug!(channel = id, "accepting channel");
                self.track(&channel);
                let connection = self.connection.clone();
                spawn_detached(async move {
                    match transport.send(build_channel_reply(id, true).into()).await {
                        Ok(()) => connection.emit(channel),
                        Err(e) => {
                            tracing::debug!(channel = id, error = %e, "approval failed");
                            channel.terminate();
                        }
                    }
                });
            }
        }
    }

    /// Handles the peer's reply to one of our CREATE_CHANNELs.
    fn complete_channel(self: &Arc<Self>, id: u16, accepted: bool) {
        let mut registry = self.registry.lock();
        let Some(reply) = registry.pending.remove(&id) else {
            return;
        };
        let result = if accepted {
            let channel = Channel::open(Arc::clone(&self.transport), id);
            registry.channels.insert(id, channel.clone());
            drop(registry);
            self.track(&channel);
            Ok(channel)
        } else {
            drop(registry);
            Err(MuxError::ChannelIdInUse(id))
        };
        if let Err(Ok(channel)) = reply.send(result) {
            // Nobody is waiting any more.
            channel.terminate();
        }
    }

    /// Removes `channel` from the registry once it closes.
    fn track(self: &Arc<Self>, channel: &Channel) {
        let weak: Weak<HostInner> = Arc::downgrade(self);
        let tracked = channel.clone();
        channel.closed().then(move |_| {
            let Some(inner) = weak.upgrade() else { return };
            let mut registry = inner.registry.lock();
            let id = tracked.id();
            if registry.channels.get(&id).is_some_and(|c| c.same(&tracked)) {
                registry.channels.remove(&id);
            }
        });
    }
}

impl Drop for HostInner {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.get_mut().take() {
            subscription.dispose();
        }
    }
}

/// Multiplexer endpoint owning one physical connection.
///
/// `Host` is itself a [`Connection`]: text and foreign binary messages
/// (the "default channel") arrive on its `message` event, and sending on
/// it writes straight to the transport. It is also a
/// [`ConnectionTarget`] announcing channels the peer opens.
#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

impl Host {
    /// Takes ownership of `transport`.
    pub fn new<C: Connection>(transport: C) -> Self {
        Self::from_ref(Arc::new(transport))
    }

    /// Like [`new`](Self::new), for an already shared transport.
    pub fn from_ref(transport: ConnectionRef) -> Self {
        let inner = Arc::new(HostInner {
            transport,
            message: Event::new(),
            connection: Event::new(),
            registry: Mutex::new(Registry::default()),
            subscription: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let subscription = inner.transport.message().subscribe(move |data| {
            if let Some(inner) = weak.upgrade() {
                inner.receive(data);
            }
        });
        *inner.subscription.lock() = Some(subscription);

        // Dropping the senders fails every pending create_channel.
        let weak = Arc::downgrade(&inner);
        inner.transport.closed().then(move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.registry.lock().pending.clear();
            }
        });

        Self { inner }
    }

    /// Opens a channel, allocating an id if `id` is `None`.
    ///
    /// Waits for the peer's answer; there is no timeout at this layer.
    ///
    /// # Errors
    /// - [`MuxError::InvalidChannelId`] — `id` is `0xFFFE` or `0xFFFF`
    /// - [`MuxError::ChannelIdInUse`] — live here, or rejected by the peer
    /// - [`MuxError::OutOfChannelSlots`] — no free id left
    /// - [`MuxError::Connection`] — the transport failed or closed first
    pub async fn create_channel(&self, id: Option<u16>) -> Result<Channel, MuxError> {
        if self.inner.transport.is_closed() {
            return Err(ConnectionError::Closed.into());
        }
        let (id, reply) = {
            let mut registry = self.inner.registry.lock();
            let id = match id {
                Some(id) if id >= CHANNEL_ID_LIMIT => return Err(MuxError::InvalidChannelId(id)),
                Some(id) if registry.in_use(id) => return Err(MuxError::ChannelIdInUse(id)),
                Some(id) => id,
                None => registry.allocate()?,
            };
            let (tx, rx) = oneshot::channel();
            registry.pending.insert(id, tx);
            (id, rx)
        };

        tracing::debug!(channel = id, "requesting channel");
        if let Err(e) = self.inner.transport.send(build_create_channel(id).into()).await {
            self.inner.registry.lock().pending.remove(&id);
            return Err(e.into());
        }

        reply
            .await
            .map_err(|_| MuxError::Connection(ConnectionError::Closed))?
    }

    /// The live channel with this id, if any.
    pub fn channel(&self, id: u16) -> Option<Channel> {
        self.inner.registry.lock().channels.get(&id).cloned()
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.inner.registry.lock();
        f.debug_struct("Host")
            .field("channels", &registry.channels.len())
            .field("pending", &registry.pending.len())
            .finish()
    }
}

#[async_trait]
impl Connection for Host {
    fn message(&self) -> &Event<Data> {
        &self.inner.message
    }

    fn closed(&self) -> &Deferred<CloseEvent> {
        self.inner.transport.closed()
    }

    fn is_closed(&self) -> bool {
        self.inner.transport.is_closed()
    }

    async fn send_with(&self, data: Data, params: SendParams) -> Result<(), ConnectionError> {
        self.inner.transport.send_with(data, params).await
    }

    async fn close(&self, message: CloseMessage) -> Result<(), ConnectionError> {
        self.inner.transport.close(message).await
    }

    fn terminate(&self) {
        self.inner.transport.terminate()
    }
}

impl ConnectionTarget for Host {
    type Conn = Channel;

    fn connection(&self) -> &Event<Channel> {
        &self.inner.connection
    }

    fn clients(&self) -> Vec<Channel> {
        self.inner.registry.lock().channels.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_counts_up_from_zero() {
        let mut registry = Registry::default();
        assert_eq!(registry.allocate().unwrap(), 0);
        assert_eq!(registry.allocate().unwrap(), 1);
    }

    #[test]
    fn test_allocate_skips_pending_and_wraps() {
        let mut registry = Registry {
            next_id: CHANNEL_ID_LIMIT - 1,
            ..Registry::default()
        };
        let (tx, _rx) = oneshot::channel();
        registry.pending.insert(0, tx);

        assert_eq!(registry.allocate().unwrap(), CHANNEL_ID_LIMIT - 1);
        assert_eq!(registry.allocate().unwrap(), 1);
    }

    #[test]
    fn test_allocate_fails_when_exhausted() {
        let mut registry = Registry::default();
        for id in 0..CHANNEL_ID_LIMIT {
            let (tx, _rx) = oneshot::channel();
            registry.pending.insert(id, tx);
        }
        assert!(matches!(registry.allocate(), Err(MuxError::OutOfChannelSlots)));
    }
}
