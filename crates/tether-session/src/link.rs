//! The physical connection a resumable endpoint currently sends on.
//!
//! Both ends of a session swap their underlying connection over time. Each
//! adopted connection gets a generation number; close events from an older
//! generation are ignored. Senders watch a [`Status`] cell instead of the
//! endpoint's lock, so a send issued while the endpoint is between
//! transports can simply wait for the next `Ready`.

use std::time::Duration;

use tether_event::{Event, Subscription};
use tether_transport::{ConnectionError, ConnectionRef, Data, SendParams};
use tokio::sync::watch;
use tokio::task::AbortHandle;

/// What a send should do right now.
#[derive(Clone)]
pub(crate) enum Status {
    Ready(ConnectionRef),
    Waiting,
    Closed,
}

/// An adopted connection whose messages are forwarded to the endpoint.
pub(crate) struct Link {
    pub(crate) generation: u64,
    pub(crate) conn: ConnectionRef,
    forward: Subscription,
}

impl Link {
    pub(crate) fn new(generation: u64, conn: ConnectionRef, target: &Event<Data>) -> Self {
        let forward = conn.message().forward(target);
        Self {
            generation,
            conn,
            forward,
        }
    }

    /// Stops forwarding and hands back the connection.
    pub(crate) fn detach(self) -> ConnectionRef {
        self.forward.dispose();
        self.conn
    }
}

/// Sends once the status allows it.
///
/// `Waiting` blocks until the status changes, unless `params.immediate`
/// asks to fail fast with [`ConnectionError::Suspended`].
pub(crate) async fn send_when_ready(
    status: &watch::Sender<Status>,
    data: Data,
    params: SendParams,
) -> Result<(), ConnectionError> {
    let mut rx = status.subscribe();
    loop {
        let current = rx.borrow_and_update().clone();
        match current {
            Status::Closed => return Err(ConnectionError::Closed),
            Status::Ready(conn) => return conn.send_with(data, params).await,
            Status::Waiting if params.immediate => return Err(ConnectionError::Suspended),
            Status::Waiting => {
                if rx.changed().await.is_err() {
                    return Err(ConnectionError::Closed);
                }
            }
        }
    }
}

pub(crate) fn is_ready(status: &watch::Sender<Status>) -> bool {
    matches!(*status.borrow(), Status::Ready(_))
}

/// Runs `job` after `delay` on the current runtime. The returned handle
/// cancels it.
pub(crate) fn spawn_timer<F>(delay: Duration, job: F) -> Option<AbortHandle>
where
    F: FnOnce() + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            let task = handle.spawn(async move {
                tokio::time::sleep(delay).await;
                job();
            });
            Some(task.abort_handle())
        }
        Err(_) => {
            tracing::warn!("no tokio runtime, timer dropped");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tether_transport::{Connection, MemoryConnection};

    #[tokio::test]
    async fn test_send_when_ready_fails_fast_when_immediate() {
        let (status, _rx) = watch::channel(Status::Waiting);
        let result = send_when_ready(&status, "x".into(), SendParams::IMMEDIATE).await;
        assert!(matches!(result, Err(ConnectionError::Suspended)));
    }

    #[tokio::test]
    async fn test_send_when_ready_waits_for_ready() {
        let (a, b) = MemoryConnection::pair();
        let (status, _rx) = watch::channel(Status::Waiting);
        let status = Arc::new(status);
        let next = b.message().next();

        let pending = tokio::spawn({
            let status = Arc::clone(&status);
            async move { send_when_ready(&status, "late".into(), SendParams::default()).await }
        });
        tokio::task::yield_now().await;
        status.send_replace(Status::Ready(Arc::new(a)));

        pending.await.unwrap().expect("send after ready");
        assert_eq!(next.await, Some(Data::from("late")));
    }

    #[tokio::test]
    async fn test_send_when_ready_fails_once_closed() {
        let (status, _rx) = watch::channel(Status::Waiting);
        let status = Arc::new(status);
        let pending = tokio::spawn({
            let status = Arc::clone(&status);
            async move { send_when_ready(&status, "x".into(), SendParams::default()).await }
        });
        tokio::task::yield_now().await;
        status.send_replace(Status::Closed);
        assert!(matches!(pending.await.unwrap(), Err(ConnectionError::Closed)));
    }
}
