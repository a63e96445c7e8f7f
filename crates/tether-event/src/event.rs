//! Multi-listener events.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::dispatch;

type Listener<T> = Arc<dyn Fn(T) + Send + Sync>;

struct Registry<T> {
    listeners: Vec<(u64, Listener<T>)>,
    waiters: Vec<oneshot::Sender<T>>,
    next_id: u64,
    /// Values that found nobody to deliver to. Only kept while `buffering`.
    backlog: VecDeque<T>,
    /// Set on buffered events until the first persistent listener arrives.
    buffering: bool,
}

impl<T> Registry<T> {
    fn new(buffering: bool) -> Self {
        Self {
            listeners: Vec::new(),
            waiters: Vec::new(),
            next_id: 0,
            backlog: VecDeque::new(),
            buffering,
        }
    }

    fn is_unobserved(&self) -> bool {
        self.listeners.is_empty() && self.waiters.is_empty()
    }
}

/// Delivers the backlog, then `value`, to whoever is registered when each
/// value is taken. Values nobody observes go to the backlog while the
/// event is still buffering and are dropped otherwise.
fn deliver<T: Clone>(inner: &Mutex<Registry<T>>, mut value: Option<T>) {
    loop {
        let (next, listeners, waiters) = {
            let mut reg = inner.lock();
            reg.waiters.retain(|waiter| !waiter.is_closed());
            if reg.is_unobserved() {
                if reg.buffering {
                    reg.backlog.extend(value.take());
                }
                return;
            }
            let Some(next) = reg.backlog.pop_front().or_else(|| value.take()) else {
                return;
            };
            let listeners: Vec<Listener<T>> =
                reg.listeners.iter().map(|(_, l)| Arc::clone(l)).collect();
            (next, listeners, std::mem::take(&mut reg.waiters))
        };
        for listener in listeners {
            listener(next.clone());
        }
        for waiter in waiters {
            let _ = waiter.send(next.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// A signal that can be observed by any number of listeners.
///
/// `Event` is a cheap handle: cloning it yields another handle to the same
/// listener set, which is how a connection hands its `message` event to
/// callers while keeping the ability to emit on it.
///
/// # Example
///
/// ```rust
/// use tether_event::Event;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let event: Event<u32> = Event::new();
/// let next = event.next();
/// event.emit(7);
/// assert_eq!(next.await, Some(7));
/// # }
/// ```
pub struct Event<T> {
    inner: Arc<Mutex<Registry<T>>>,
}

impl<T> Clone for Event<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Event<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Event<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reg = self.inner.lock();
        f.debug_struct("Event")
            .field("listeners", &reg.listeners.len())
            .field("waiters", &reg.waiters.len())
            .field("backlog", &reg.backlog.len())
            .finish()
    }
}

impl<T: Clone + Send + 'static> Event<T> {
    /// Creates an event with no listeners. Values emitted while nobody is
    /// listening are dropped.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry::new(false))),
        }
    }

    /// Creates an event that keeps what it emits until someone observes it.
    ///
    /// Values that reach no listener or waiter are queued. Each
    /// [`next`](Self::next) takes the oldest queued value; the first
    /// [`subscribe`](Self::subscribe) (or [`receiver`](Self::receiver))
    /// receives the whole queue in order and ends buffering for good.
    ///
    /// Connections use this for `message`, so a caller that awaits the
    /// connection before subscribing still sees its first messages.
    pub fn buffered() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry::new(true))),
        }
    }

    /// Queues a job draining the backlog, if there is one.
    fn drain_backlog(&self) {
        let inner = Arc::clone(&self.inner);
        dispatch::defer(move || deliver(&inner, None));
    }

    /// Registers a persistent listener.
    ///
    /// The listener stays registered until the returned [`Subscription`]
    /// is disposed. Dropping the subscription does NOT unsubscribe.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let (id, backlog) = {
            let mut reg = self.inner.lock();
            let id = reg.next_id;
            reg.next_id += 1;
            reg.listeners.push((id, Arc::new(listener)));
            reg.buffering = false;
            (id, !reg.backlog.is_empty())
        };
        if backlog {
            self.drain_backlog();
        }

        let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.lock().listeners.retain(|(i, _)| *i != id);
            }
        })
    }

    /// Returns a future for the next emitted value.
    ///
    /// The waiter is registered when `next` is called, not when the
    /// future is first polled, so a value emitted in between is not lost.
    pub fn next(&self) -> Next<T> {
        let (tx, rx) = oneshot::channel();
        let backlog = {
            let mut reg = self.inner.lock();
            reg.waiters.push(tx);
            !reg.backlog.is_empty()
        };
        if backlog {
            self.drain_backlog();
        }
        Next { rx }
    }

    /// Queues `value` for delivery to every listener and pending waiter.
    pub fn emit(&self, value: T) {
        let inner = Arc::clone(&self.inner);
        dispatch::defer(move || deliver(&inner, Some(value)));
    }

    /// Re-emits every value of this event on `target`.
    pub fn forward(&self, target: &Event<T>) -> Subscription {
        let target = target.clone();
        self.subscribe(move |value| target.emit(value))
    }

    /// Re-emits every value of this event on `target`, converted by `map`.
    pub fn forward_map<U, F>(&self, target: &Event<U>, map: F) -> Subscription
    where
        U: Clone + Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        let target = target.clone();
        self.subscribe(move |value| target.emit(map(value)))
    }

    /// Subscribes a queue that buffers every value until it is read.
    ///
    /// Unlike a chain of [`next`](Self::next) calls, nothing emitted
    /// between two reads is missed. The subscription ends when the
    /// receiver is dropped.
    pub fn receiver(&self) -> Receiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(move |value| {
            let _ = tx.send(value);
        });
        Receiver {
            rx,
            subscription: Some(subscription),
        }
    }

    /// Number of persistent listeners currently registered.
    pub fn listener_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Handle to a registered listener.
#[must_use = "a subscription does nothing unless disposed; bind it or call `dispose`"]
pub struct Subscription {
    dispose: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    fn new<F>(dispose: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            dispose: Some(Box::new(dispose)),
        }
    }

    /// Removes the listener. Values already queued are still delivered
    /// if their delivery job started before this call.
    pub fn dispose(mut self) {
        if let Some(dispose) = self.dispose.take() {
            dispose();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.dispose.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Next / Receiver
// ---------------------------------------------------------------------------

/// Future returned by [`Event::next`].
///
/// Resolves to `None` if the event is dropped before it fires again.
#[derive(Debug)]
pub struct Next<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Future for Next<T> {
    type Output = Option<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(Result::ok)
    }
}

/// Buffered stream of values from an [`Event`].
#[derive(Debug)]
pub struct Receiver<T> {
    rx: mpsc::UnboundedReceiver<T>,
    subscription: Option<Subscription>,
}

impl<T> Receiver<T> {
    /// Waits for the next buffered value.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Returns a buffered value without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.dispose();
        }
    }
}
