//! One-shot values with ordered continuations.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::dispatch;

type Continuation<T> = Box<dyn FnOnce(T) + Send>;

enum State<T> {
    Pending(Vec<Continuation<T>>),
    Resolved(T),
}

/// A value that becomes available exactly once.
///
/// Continuations registered with [`then`](Self::then) run in the order they
/// were registered, on the dispatch queue, never inside the call to
/// [`resolve`](Self::resolve). Registering after resolution still runs the
/// continuation (also deferred).
pub struct Deferred<T> {
    inner: Arc<Mutex<State<T>>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.inner.lock() {
            State::Pending(c) => f
                .debug_struct("Deferred")
                .field("pending", &c.len())
                .finish(),
            State::Resolved(v) => f
                .debug_struct("Deferred")
                .field("resolved", v)
                .finish(),
        }
    }
}

impl<T: Clone + Send + 'static> Deferred<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(State::Pending(Vec::new()))),
        }
    }

    /// Resolves with `value`. Returns `false` if already resolved, in which
    /// case `value` is discarded.
    pub fn resolve(&self, value: T) -> bool {
        let continuations = {
            let mut state = self.inner.lock();
            if matches!(*state, State::Resolved(_)) {
                return false;
            }
            match std::mem::replace(&mut *state, State::Resolved(value.clone())) {
                State::Pending(c) => c,
                State::Resolved(_) => Vec::new(),
            }
        };
        if !continuations.is_empty() {
            dispatch::defer(move || {
                for continuation in continuations {
                    continuation(value.clone());
                }
            });
        }
        true
    }

    /// Registers a continuation.
    pub fn then<F>(&self, continuation: F)
    where
        F: FnOnce(T) + Send + 'static,
    {
        let value = {
            let mut state = self.inner.lock();
            match &mut *state {
                State::Pending(c) => {
                    c.push(Box::new(continuation));
                    return;
                }
                State::Resolved(v) => v.clone(),
            }
        };
        dispatch::defer(move || continuation(value));
    }

    /// Returns a future for the resolved value.
    ///
    /// The wait is queued as a continuation at call time, so it completes
    /// after every continuation registered before it.
    pub fn wait(&self) -> Wait<T> {
        let (tx, rx) = oneshot::channel();
        self.then(move |value| {
            let _ = tx.send(value);
        });
        Wait { rx }
    }

    /// The resolved value, if any.
    pub fn get(&self) -> Option<T> {
        match &*self.inner.lock() {
            State::Pending(_) => None,
            State::Resolved(v) => Some(v.clone()),
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(&*self.inner.lock(), State::Resolved(_))
    }
}

/// Future returned by [`Deferred::wait`]. Stays pending forever if the
/// deferred is dropped unresolved.
#[derive(Debug)]
pub struct Wait<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Future for Wait<T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(value)) => Poll::Ready(value),
            Poll::Ready(Err(_)) | Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_then_runs_in_registration_order() {
        let deferred: Deferred<u32> = Deferred::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        for tag in ["first", "second", "third"] {
            let tx = tx.clone();
            deferred.then(move |v| {
                let _ = tx.send((tag, v));
            });
        }

        assert!(deferred.resolve(1));

        assert_eq!(rx.recv().await, Some(("first", 1)));
        assert_eq!(rx.recv().await, Some(("second", 1)));
        assert_eq!(rx.recv().await, Some(("third", 1)));
    }

    #[tokio::test]
    async fn test_then_after_resolve_still_runs() {
        let deferred: Deferred<&'static str> = Deferred::new();
        deferred.resolve("done");
        assert!(deferred.is_resolved());

        let (tx, rx) = oneshot::channel();
        deferred.then(move |v| {
            let _ = tx.send(v);
        });
        assert_eq!(rx.await.expect("continuation should run"), "done");
    }

    #[tokio::test]
    async fn test_resolve_twice_keeps_first_value() {
        let deferred: Deferred<u32> = Deferred::new();
        assert!(deferred.resolve(1));
        assert!(!deferred.resolve(2));
        assert_eq!(deferred.get(), Some(1));
        assert_eq!(deferred.wait().await, 1);
    }

    #[tokio::test]
    async fn test_wait_completes_after_earlier_continuations() {
        let deferred: Deferred<u32> = Deferred::new();
        let seen = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&seen);
        deferred.then(move |_| *flag.lock() = true);
        let wait = deferred.wait();

        deferred.resolve(0);
        wait.await;
        assert!(*seen.lock(), "earlier continuation must have run");
    }
}
