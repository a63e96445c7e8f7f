//! Integration tests for `Host` and `Channel` over an in-memory pair.

use std::time::Duration;

use tether_mux::protocol::{build_channel_reply, build_create_channel, build_data_frame, Frame};
use tether_mux::{Channel, Host, MuxError};
use tether_transport::{
    CloseEvent, CloseMessage, Connection, ConnectionError, ConnectionTarget, Data,
    MemoryConnection, TERMINATED_MESSAGE,
};
use tokio::sync::oneshot;

const WAIT: Duration = Duration::from_secs(5);

// =========================================================================
// Helpers
// =========================================================================

fn hosts() -> (Host, Host) {
    let (a, b) = MemoryConnection::pair();
    (Host::new(a), Host::new(b))
}

/// Opens channel `id` from `a` and returns both ends.
async fn open_channel(a: &Host, b: &Host, id: u16) -> (Channel, Channel) {
    let announced = b.connection().next();
    let local = a.create_channel(Some(id)).await.expect("should create");
    let remote = tokio::time::timeout(WAIT, announced)
        .await
        .expect("timed out")
        .expect("channel announced");
    (local, remote)
}

fn observe_close<C: Connection + Clone>(conn: &C) -> oneshot::Receiver<(CloseEvent, bool)> {
    let (tx, rx) = oneshot::channel();
    let probe = conn.clone();
    conn.closed().then(move |event| {
        let _ = tx.send((event, probe.is_closed()));
    });
    rx
}

async fn relay<C: Connection>(from: &C, to: &C, data: Data) {
    let next = to.message().next();
    from.send(data.clone()).await.expect("send");
    let got = tokio::time::timeout(WAIT, next).await.expect("timed out");
    assert_eq!(got, Some(data));
}

fn binary_payload() -> Data {
    let mut payload = Vec::new();
    payload.extend_from_slice(&2500u32.to_be_bytes());
    payload.extend_from_slice(&0xffff_ffffu32.to_be_bytes());
    payload.into()
}

// =========================================================================
// Channels behave like plain connections
// =========================================================================

#[tokio::test]
async fn test_channel_relays_strings_and_binary() {
    let (a, b) = hosts();
    let (local, remote) = open_channel(&a, &b, 14).await;
    assert_eq!(local.id(), 14);
    assert_eq!(remote.id(), 14);

    relay(&local, &remote, "asdf".into()).await;
    relay(&remote, &local, "asdf".into()).await;
    relay(&local, &remote, binary_payload()).await;
}

#[tokio::test]
async fn test_opener_sees_messages_sent_on_announcement() {
    let (a, b) = hosts();
    let _greeter = b.connection().subscribe(|channel: Channel| {
        tokio::spawn(async move {
            let _ = channel.send("hello".into()).await;
            let _ = channel.send(binary_payload()).await;
        });
    });

    let local = a.create_channel(Some(14)).await.expect("should create");
    // Subscribe late, after the greeting has certainly arrived.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let first = tokio::time::timeout(WAIT, local.message().next()).await.expect("timed out");
    assert_eq!(first, Some(Data::from("hello")));
    let second = tokio::time::timeout(WAIT, local.message().next()).await.expect("timed out");
    assert_eq!(second, Some(binary_payload()));
}

#[tokio::test]
async fn test_channel_close_seen_by_both_sides() {
    let (a, b) = hosts();
    let (local, remote) = open_channel(&a, &b, 14).await;
    let message = CloseMessage::new(3042, "Test reason");
    let local_closed = observe_close(&local);
    let remote_closed = observe_close(&remote);

    local.close(message.clone()).await.expect("close");

    let (event, closed) = local_closed.await.unwrap();
    assert_eq!(event, CloseEvent::local(message.clone()));
    assert!(closed);
    let (event, closed) = tokio::time::timeout(WAIT, remote_closed).await.expect("timed out").unwrap();
    assert_eq!(event, CloseEvent::remote(message));
    assert!(closed);
}

#[tokio::test]
async fn test_channel_terminate_seen_by_both_sides() {
    let (a, b) = hosts();
    let (local, remote) = open_channel(&a, &b, 3).await;
    let local_closed = observe_close(&remote);
    let remote_closed = observe_close(&local);

    remote.terminate();
    remote.terminate();

    let (event, closed) = local_closed.await.unwrap();
    assert_eq!(event, CloseEvent::local(TERMINATED_MESSAGE));
    assert!(closed);
    let (event, closed) = tokio::time::timeout(WAIT, remote_closed).await.expect("timed out").unwrap();
    assert_eq!(event, CloseEvent::remote(TERMINATED_MESSAGE));
    assert!(closed);
}

#[tokio::test]
async fn test_channel_rejects_unencodable_close_code() {
    let (a, b) = hosts();
    let (local, _remote) = open_channel(&a, &b, 1).await;

    let result = local.close(CloseMessage::new(-1, "negative")).await;
    assert!(matches!(result, Err(ConnectionError::InvalidCloseCode(-1))));
    assert!(!local.is_closed());
}

#[tokio::test]
async fn test_channel_send_after_close_fails() {
    let (a, b) = hosts();
    let (local, _remote) = open_channel(&a, &b, 1).await;
    local.terminate();
    assert!(matches!(local.send("x".into()).await, Err(ConnectionError::Closed)));
}

// =========================================================================
// Host registry
// =========================================================================

#[tokio::test]
async fn test_client_counts_follow_channel_lifetime() {
    let (a, b) = hosts();
    assert_eq!((a.client_count(), b.client_count()), (0, 0));

    let (local, remote) = open_channel(&a, &b, 14).await;
    assert_eq!((a.client_count(), b.client_count()), (1, 1));
    assert!(a.channel(14).is_some());

    let remote_gone = remote.closed().wait();
    let local_gone = local.closed().wait();
    remote.close(CloseMessage::new(200, "done")).await.expect("close");
    local_gone.await;
    remote_gone.await;
    assert_eq!((a.client_count(), b.client_count()), (0, 0));
}

#[tokio::test]
async fn test_create_channel_allocates_ids() {
    let (a, b) = hosts();
    let first = a.create_channel(None).await.expect("first");
    let second = a.create_channel(None).await.expect("second");
    assert_ne!(first.id(), second.id());
    assert_eq!(b.client_count(), 2);
}

#[tokio::test]
async fn test_create_channel_rejects_live_and_reserved_ids() {
    let (a, b) = hosts();
    let _pair = open_channel(&a, &b, 14).await;

    assert!(matches!(
        a.create_channel(Some(14)).await,
        Err(MuxError::ChannelIdInUse(14))
    ));
    assert!(matches!(
        b.create_channel(Some(14)).await,
        Err(MuxError::ChannelIdInUse(14))
    ));
    assert!(matches!(
        a.create_channel(Some(0xFFFF)).await,
        Err(MuxError::InvalidChannelId(0xFFFF))
    ));
}

#[tokio::test]
async fn test_transport_close_closes_channels() {
    let (raw_a, raw_b) = MemoryConnection::pair();
    let a = Host::new(raw_a.clone());
    let b = Host::new(raw_b);
    let (local, remote) = open_channel(&a, &b, 8).await;

    let local_closed = local.closed().wait();
    let remote_closed = remote.closed().wait();
    raw_a.close(CloseMessage::new(-1, "link lost")).await.expect("close");

    let event = tokio::time::timeout(WAIT, local_closed).await.expect("timed out");
    assert_eq!(event.message.code, -1);
    let event = tokio::time::timeout(WAIT, remote_closed).await.expect("timed out");
    assert_eq!(event.message.code, -1);
    assert!(a.is_closed());
}

// =========================================================================
// Default channel and handshake details (raw peer)
// =========================================================================

#[tokio::test]
async fn test_host_default_channel_carries_foreign_messages() {
    let (a, b) = hosts();
    relay(&a, &b, "plain text".into()).await;
    relay(&b, &a, Data::from(b"not a frame".to_vec())).await;
}

#[tokio::test]
async fn test_frames_for_unknown_channels_reach_default_channel() {
    let (raw, peer) = MemoryConnection::pair();
    let host = Host::new(raw);

    let frame = Data::Binary(build_data_frame(50, &"stray".into()));
    let next = host.message().next();
    peer.send(frame.clone()).await.expect("send");
    assert_eq!(next.await, Some(frame));
}

#[tokio::test]
async fn test_create_channel_fails_when_peer_rejects() {
    let (raw, peer) = MemoryConnection::pair();
    let host = Host::new(raw);

    let request = peer.message().next();
    let pending = tokio::spawn({
        let host = host.clone();
        async move { host.create_channel(Some(3)).await }
    });
    let got = request.await.expect("request");
    assert_eq!(got, Data::Binary(build_create_channel(3)));

    peer.send(build_channel_reply(3, false).into()).await.expect("reply");
    let result = tokio::time::timeout(WAIT, pending).await.expect("timed out").unwrap();
    assert!(matches!(result, Err(MuxError::ChannelIdInUse(3))));
    assert_eq!(host.client_count(), 0);
}

#[tokio::test]
async fn test_create_channel_fails_when_transport_closes() {
    let (raw, peer) = MemoryConnection::pair();
    let host = Host::new(raw);

    let request = peer.message().next();
    let pending = tokio::spawn({
        let host = host.clone();
        async move { host.create_channel(Some(3)).await }
    });
    request.await.expect("request");
    peer.terminate();

    let result = tokio::time::timeout(WAIT, pending).await.expect("timed out").unwrap();
    assert!(matches!(
        result,
        Err(MuxError::Connection(ConnectionError::Closed))
    ));
}

#[tokio::test]
async fn test_host_rejects_duplicate_create() {
    let (raw, peer) = MemoryConnection::pair();
    let host = Host::new(raw);

    let mut replies = peer.message().receiver();
    peer.send(build_create_channel(4).into()).await.expect("create");
    peer.send(build_create_channel(4).into()).await.expect("create again");

    let mut seen = Vec::new();
    for _ in 0..2 {
        let Data::Binary(reply) = tokio::time::timeout(WAIT, replies.recv())
            .await
            .expect("timed out")
            .expect("reply")
        else {
            panic!("control replies are binary");
        };
        seen.push(Frame::parse(&reply).expect("valid").expect("mux frame"));
    }
    seen.sort_by_key(|f| matches!(f, Frame::Reply { accepted: true, .. }));
    assert_eq!(
        seen,
        vec![
            Frame::Reply { id: 4, accepted: false },
            Frame::Reply { id: 4, accepted: true },
        ]
    );
    assert_eq!(host.client_count(), 1);
}
