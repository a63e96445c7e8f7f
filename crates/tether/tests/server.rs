//! End-to-end tests: sessions and channels over real WebSockets.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tether::prelude::*;
use tether::session::protocol::INVALID_SESSION_MESSAGE;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::AbortHandle;

const WAIT: Duration = Duration::from_secs(5);

// =========================================================================
// Helpers
// =========================================================================

async fn within<F: std::future::Future>(future: F) -> F::Output {
    tokio::time::timeout(WAIT, future).await.expect("timed out")
}

async fn relay(from: &impl Connection, to: &impl Connection, data: Data) {
    let next = to.message().next();
    from.send(data.clone()).await.expect("send");
    assert_eq!(within(next).await, Some(data));
}

async fn start_server() -> TetherServer {
    TetherServer::builder()
        .bind("127.0.0.1:0")
        .build()
        .await
        .expect("server should bind")
}

/// Connects a client to `addr` and waits for both ends of the session.
async fn open_session(server: &TetherServer, addr: SocketAddr) -> (Client, Session) {
    let announced = server.connection().next();
    let client = tether::connect(
        format!("ws://{addr}"),
        ClientConfig::default(),
        WsConfig::default(),
    );
    within(client.ready().wait()).await;
    let session = within(announced).await.expect("session announced");
    (client, session)
}

/// TCP relay whose live connections can be cut at once, so both ends see
/// the socket vanish without a close frame.
struct Proxy {
    addr: SocketAddr,
    links: Arc<Mutex<Vec<AbortHandle>>>,
    accept: AbortHandle,
}

impl Proxy {
    async fn start(upstream: SocketAddr) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("proxy bind");
        let addr = listener.local_addr().expect("proxy addr");
        let links = Arc::new(Mutex::new(Vec::new()));
        let tracked = Arc::clone(&links);
        let accept = tokio::spawn(async move {
            while let Ok((mut inbound, _)) = listener.accept().await {
                let Ok(mut outbound) = TcpStream::connect(upstream).await else {
                    continue;
                };
                let task = tokio::spawn(async move {
                    let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
                });
                tracked.lock().unwrap().push(task.abort_handle());
            }
        })
        .abort_handle();
        Self {
            addr,
            links,
            accept,
        }
    }

    fn cut(&self) {
        for link in self.links.lock().unwrap().drain(..) {
            link.abort();
        }
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.accept.abort();
        self.cut();
    }
}

// =========================================================================
// Sessions over WebSocket
// =========================================================================

#[tokio::test]
async fn test_session_relays_over_websocket() {
    let server = start_server().await;
    let (client, session) = open_session(&server, server.local_addr()).await;

    assert_eq!(client.key().as_deref(), Some(session.key()));
    assert_eq!(server.client_count(), 1);
    relay(&client, &session, "asdf".into()).await;
    relay(&session, &client, Data::from(vec![0u8, 255, 7])).await;
}

#[tokio::test]
async fn test_session_close_code_survives_the_wire() {
    let server = start_server().await;
    let (client, session) = open_session(&server, server.local_addr()).await;
    let message = CloseMessage::new(250, "bye");

    let client_closed = client.closed().wait();
    session.close(message.clone()).await.expect("close");
    assert_eq!(within(client_closed).await, CloseEvent::remote(message));
    assert!(client.is_closed());
}

#[tokio::test]
async fn test_close_code_beyond_wire_range_drops_the_link() {
    let server = start_server().await;
    let (client, session) = open_session(&server, server.local_addr()).await;
    let message = CloseMessage::new(3042, "Test reason");

    let client_broken = client.broken_pipe().next();
    let client_closed = client.closed().wait();
    session.close(message.clone()).await.expect("close");
    assert_eq!(session.closed().get(), Some(CloseEvent::local(message)));

    // The link cannot carry 3042, so the client sees a drop and its resume
    // attempt finds the session gone.
    let dropped = within(client_broken).await.expect("client broken pipe");
    assert!(dropped.code < 0);
    assert_eq!(
        within(client_closed).await,
        CloseEvent::remote(INVALID_SESSION_MESSAGE)
    );
    assert_eq!(server.client_count(), 0);
}

#[tokio::test]
async fn test_client_resumes_after_socket_loss() {
    let server = start_server().await;
    let proxy = Proxy::start(server.local_addr()).await;
    let (client, session) = open_session(&server, proxy.addr).await;

    let client_broken = client.broken_pipe().next();
    let session_broken = session.broken_pipe().next();
    let client_resumed = client.resuming().next();
    let session_resumed = session.resuming().next();
    proxy.cut();

    let dropped = within(client_broken).await.expect("client broken pipe");
    assert!(dropped.code < 0);
    within(session_broken).await.expect("session broken pipe");
    within(client_resumed).await.expect("client resumed");
    within(session_resumed).await.expect("session resumed");

    assert!(client.is_ready());
    assert_eq!(server.client_count(), 1);
    relay(&client, &session, "after the cut".into()).await;
    relay(&session, &client, "still one session".into()).await;
}

// =========================================================================
// Channels over a session
// =========================================================================

#[tokio::test]
async fn test_channels_over_session() {
    let server = start_server().await;
    let (client, session) = open_session(&server, server.local_addr()).await;
    let client_host = Host::new(client);
    let server_host = Host::new(session);

    let announced = server_host.connection().next();
    let local = client_host.create_channel(Some(14)).await.expect("channel");
    let remote = within(announced).await.expect("channel announced");
    assert_eq!(remote.id(), 14);
    assert_eq!(client_host.client_count(), 1);
    assert_eq!(server_host.client_count(), 1);

    relay(&local, &remote, "asdf".into()).await;
    relay(&remote, &local, Data::from(vec![1u8, 2, 3])).await;
    relay(&client_host, &server_host, "default channel".into()).await;

    let remote_closed = remote.closed().wait();
    local
        .close(CloseMessage::new(3042, "Test reason"))
        .await
        .expect("close");
    let event = within(remote_closed).await;
    assert_eq!(event, CloseEvent::remote(CloseMessage::new(3042, "Test reason")));
    assert_eq!(client_host.client_count(), 0);
    assert_eq!(server_host.client_count(), 0);
}
