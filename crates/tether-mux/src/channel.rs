//! A virtual connection multiplexed over a shared transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tether_event::{Deferred, Event, Subscription};
use tether_transport::buffer::read_u16;
use tether_transport::{
    CloseEvent, CloseMessage, Connection, ConnectionError, ConnectionRef, Data, SendParams,
    TERMINATED_MESSAGE, spawn_detached,
};

use crate::protocol::{
    Frame, MAGIC_WORD, build_close_frame, build_data_frame, build_terminate_frame,
};

struct ChannelInner {
    id: u16,
    transport: ConnectionRef,
    message: Event<Data>,
    closed: Deferred<CloseEvent>,
    is_closed: AtomicBool,
    subscription: Mutex<Option<Subscription>>,
}

impl ChannelInner {
    fn receive(&self, data: Data) {
        let Data::Binary(buf) = data else { return };
        if read_u16(&buf, 0) != Some(MAGIC_WORD) || read_u16(&buf, 2) != Some(self.id) {
            return;
        }
        if self.is_closed.load(Ordering::SeqCst) {
            return;
        }
        match Frame::parse(&buf) {
            Ok(Some(Frame::Content { data, .. })) => self.message.emit(data),
            Ok(Some(Frame::Close { message, .. })) => {
                let message = message.unwrap_or(TERMINATED_MESSAGE);
                tracing::debug!(channel = self.id, %message, "channel closed by peer");
                self.finish(CloseEvent::remote(message));
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(channel = self.id, error = %e, "dropping malformed frame"),
        }
    }

    fn finish(&self, event: CloseEvent) {
        self.is_closed.store(true, Ordering::SeqCst);
        if let Some(subscription) = self.subscription.lock().take() {
            subscription.dispose();
        }
        self.closed.resolve(event);
    }
}

/// One logical connection inside a [`Host`](crate::Host).
///
/// A channel reads the frames addressed to its id off the shared
/// transport and writes its own frames back onto it. When the shared
/// transport closes, every channel on it closes with the same event.
///
/// Messages that arrive before anyone observes [`message`](Connection::message)
/// are held, so the opener can subscribe after `create_channel` returns.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    pub(crate) fn open(transport: ConnectionRef, id: u16) -> Self {
        let inner = Arc::new(ChannelInner {
            id,
            transport,
            message: Event::buffered(),
            closed: Deferred::new(),
            is_closed: AtomicBool::new(false),
            subscription: Mutex::new(None),
        });

        let weak: Weak<ChannelInner> = Arc::downgrade(&inner);
        let subscription = inner.transport.message().subscribe(move |data| {
            if let Some(inner) = weak.upgrade() {
                inner.receive(data);
            }
        });
        *inner.subscription.lock() = Some(subscription);

        let weak = Arc::downgrade(&inner);
        inner.transport.closed().then(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.finish(event);
            }
        });

        Self { inner }
    }

    /// The channel id, unique among live channels on its host.
    pub fn id(&self) -> u16 {
        self.inner.id
    }

    pub(crate) fn same(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[async_trait]
impl Connection for Channel {
    fn message(&self) -> &Event<Data> {
        &self.inner.message
    }

    fn closed(&self) -> &Deferred<CloseEvent> {
        &self.inner.closed
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed.load(Ordering::SeqCst)
    }

    async fn send_with(&self, data: Data, params: SendParams) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let frame = build_data_frame(self.inner.id, &data);
        self.inner.transport.send_with(Data::Binary(frame), params).await
    }

    async fn close(&self, message: CloseMessage) -> Result<(), ConnectionError> {
        let frame = build_close_frame(self.inner.id, &message)?;
        if self.inner.is_closed.swap(true, Ordering::SeqCst) {
            return Err(ConnectionError::Closed);
        }
        let sent = self.inner.transport.send(Data::Binary(frame)).await;
        self.inner.finish(CloseEvent::local(message));
        sent
    }

    fn terminate(&self) {
        if self.inner.is_closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let transport = Arc::clone(&self.inner.transport);
        let frame = build_terminate_frame(self.inner.id);
        spawn_detached(async move {
            let _ = transport.send(Data::Binary(frame)).await;
        });
        self.inner.finish(CloseEvent::local(TERMINATED_MESSAGE));
    }
}
