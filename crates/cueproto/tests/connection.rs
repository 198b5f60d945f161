//! Connection lifecycle under a paused clock.
//!
//! Sockets are in-memory pairs, so every timing assertion is exact: the
//! runtime only advances time when all tasks are idle.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::{sleep, timeout, Instant};

use cueproto::transport::memory;
use cueproto::{
    Connection, ConnectionEvent, EventReceiver, Frame, MemoryConnector, Role, Socket,
    TransportError, LIVENESS_TIMEOUT, PING_INTERVAL, RECONNECT_INTERVAL,
};

async fn next_event(events: &mut EventReceiver) -> ConnectionEvent {
    timeout(Duration::from_secs(120), events.recv())
        .await
        .expect("timed out waiting for a connection event")
        .expect("event channel closed")
}

async fn next_frame(socket: &mut Socket) -> Frame {
    timeout(Duration::from_secs(120), socket.rx.next())
        .await
        .expect("timed out waiting for a frame")
        .expect("socket closed")
        .expect("socket error")
}

/// Answer every ping with a pong, forever.
fn spawn_ponger(mut socket: Socket) {
    tokio::spawn(async move {
        while let Some(Ok(frame)) = socket.rx.next().await {
            if let Frame::Ping(payload) = frame {
                if socket.tx.send(Frame::Pong(payload)).await.is_err() {
                    break;
                }
            }
        }
    });
}

#[tokio::test(start_paused = true)]
async fn first_dial_is_immediate() {
    let (connector, mut peers) = MemoryConnector::new();
    let started = Instant::now();
    let (connection, mut events) = Connection::dial("ws://bridge:5401", connector.clone());

    assert_eq!(next_event(&mut events).await, ConnectionEvent::Connected);
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(connection.role(), Role::Dialer);
    assert_eq!(connection.url(), Some("ws://bridge:5401"));
    assert!(connection.is_connected());

    let (url, _far) = peers.recv().await.unwrap();
    assert_eq!(url, "ws://bridge:5401");
    connection.terminate();
}

#[tokio::test(start_paused = true)]
async fn redials_on_the_reconnect_interval() {
    let (connector, mut peers) = MemoryConnector::new();
    connector.refuse_next(3);
    let started = Instant::now();
    let (connection, mut events) = Connection::dial("ws://bridge:5401", connector.clone());

    assert_eq!(next_event(&mut events).await, ConnectionEvent::Connected);
    assert_eq!(started.elapsed(), RECONNECT_INTERVAL * 3);
    assert_eq!(connector.attempts(), 4);

    let _far = peers.recv().await.unwrap();
    connection.terminate();
}

#[tokio::test(start_paused = true)]
async fn silent_peer_is_declared_dead_exactly_once() {
    let (connector, mut peers) = MemoryConnector::new();
    let (connection, mut events) = Connection::dial("ws://bridge:5401", connector.clone());

    assert_eq!(next_event(&mut events).await, ConnectionEvent::Connected);
    let connected_at = Instant::now();
    // Far end stays open but never answers
    let (_url, _far) = peers.recv().await.unwrap();
    connector.set_online(false);

    assert_eq!(next_event(&mut events).await, ConnectionEvent::Disconnected);
    assert_eq!(connected_at.elapsed(), LIVENESS_TIMEOUT);
    assert!(!connection.is_connected());

    sleep(Duration::from_secs(60)).await;
    assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
    assert!(connector.attempts() > 1, "dialer keeps retrying after a drop");
    connection.terminate();
}

#[tokio::test(start_paused = true)]
async fn answered_pings_keep_the_link_up() {
    let (connector, mut peers) = MemoryConnector::new();
    let (connection, mut events) = Connection::dial("ws://bridge:5401", connector.clone());

    assert_eq!(next_event(&mut events).await, ConnectionEvent::Connected);
    let (_url, far) = peers.recv().await.unwrap();
    spawn_ponger(far);

    sleep(PING_INTERVAL * 20).await;
    assert!(connection.is_connected());
    assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
    assert_eq!(connector.attempts(), 1);
    connection.terminate();
}

#[tokio::test(start_paused = true)]
async fn dialer_pings_on_interval() {
    let (connector, mut peers) = MemoryConnector::new();
    let (connection, mut events) = Connection::dial("ws://bridge:5401", connector);
    assert_eq!(next_event(&mut events).await, ConnectionEvent::Connected);
    let (_url, mut far) = peers.recv().await.unwrap();

    let started = Instant::now();
    assert!(matches!(next_frame(&mut far).await, Frame::Ping(_)));
    assert_eq!(started.elapsed(), PING_INTERVAL);
    connection.terminate();
}

#[tokio::test(start_paused = true)]
async fn terminate_stops_redialing() {
    let (connector, _peers) = MemoryConnector::new();
    connector.set_online(false);
    let (connection, mut events) = Connection::dial("ws://bridge:5401", connector.clone());

    sleep(RECONNECT_INTERVAL + Duration::from_secs(2)).await;
    assert_eq!(connector.attempts(), 2);

    connection.terminate();
    sleep(RECONNECT_INTERVAL * 10).await;
    assert_eq!(connector.attempts(), 2);
    // Never connected, so no disconnected either
    assert!(matches!(
        events.try_recv(),
        Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected)
    ));
}

#[tokio::test(start_paused = true)]
async fn terminate_while_connected_closes_the_socket() {
    let (connector, mut peers) = MemoryConnector::new();
    let (connection, mut events) = Connection::dial("ws://bridge:5401", connector.clone());
    assert_eq!(next_event(&mut events).await, ConnectionEvent::Connected);
    let (_url, mut far) = peers.recv().await.unwrap();

    connection.terminate();
    assert!(matches!(
        connection.send(&serde_json::json!({"type": "status"})),
        Err(TransportError::NotConnected)
    ));
    assert_eq!(next_event(&mut events).await, ConnectionEvent::Disconnected);
    assert_eq!(next_frame(&mut far).await, Frame::Close);

    sleep(RECONNECT_INTERVAL * 4).await;
    assert_eq!(connector.attempts(), 1);
    assert!(events.recv().await.is_none(), "task ended after terminate");
}

#[tokio::test(start_paused = true)]
async fn queued_text_reaches_the_peer_in_order() {
    let (connector, mut peers) = MemoryConnector::new();
    let (connection, mut events) = Connection::dial("ws://bridge:5401", connector);
    assert_eq!(next_event(&mut events).await, ConnectionEvent::Connected);
    let (_url, mut far) = peers.recv().await.unwrap();

    connection.send(&serde_json::json!({"type": "getTimelineIds"})).unwrap();
    connection.send_text(r#"{"type":"refreshResources"}"#.to_string()).unwrap();

    assert_eq!(next_frame(&mut far).await, Frame::Text(r#"{"type":"getTimelineIds"}"#.into()));
    assert_eq!(next_frame(&mut far).await, Frame::Text(r#"{"type":"refreshResources"}"#.into()));

    far.tx.send(Frame::Text(r#"{"type":"status"}"#.into())).await.unwrap();
    assert_eq!(
        next_event(&mut events).await,
        ConnectionEvent::Message(r#"{"type":"status"}"#.into())
    );
    connection.terminate();
}

#[tokio::test(start_paused = true)]
async fn reconnect_after_peer_close_gets_a_fresh_link() {
    let (connector, mut peers) = MemoryConnector::new();
    let (connection, mut events) = Connection::dial("ws://bridge:5401", connector.clone());
    assert_eq!(next_event(&mut events).await, ConnectionEvent::Connected);

    let (_url, first) = peers.recv().await.unwrap();
    let dropped_at = Instant::now();
    drop(first);

    assert_eq!(next_event(&mut events).await, ConnectionEvent::Disconnected);
    assert_eq!(next_event(&mut events).await, ConnectionEvent::Connected);
    assert_eq!(dropped_at.elapsed(), RECONNECT_INTERVAL);
    assert_eq!(connector.attempts(), 2);

    let (_url, _second) = peers.recv().await.unwrap();
    connection.terminate();
}

#[tokio::test(start_paused = true)]
async fn acceptor_closes_for_good_when_peer_leaves() {
    let (near, far) = memory::pair("bridge", "hub");
    let (connection, mut events) = Connection::wrap(near);
    assert_eq!(next_event(&mut events).await, ConnectionEvent::Connected);

    drop(far);
    assert_eq!(next_event(&mut events).await, ConnectionEvent::Disconnected);
    assert_eq!(next_event(&mut events).await, ConnectionEvent::Closed);
    assert!(events.recv().await.is_none());
    assert!(!connection.is_connected());
}

#[tokio::test(start_paused = true)]
async fn acceptor_answers_pings_and_times_out_on_silence() {
    let (near, mut far) = memory::pair("bridge", "hub");
    let (_connection, mut events) = Connection::wrap(near);
    assert_eq!(next_event(&mut events).await, ConnectionEvent::Connected);

    far.tx.send(Frame::Ping(Bytes::from_static(b"hb"))).await.unwrap();
    assert_eq!(next_frame(&mut far).await, Frame::Pong(Bytes::from_static(b"hb")));

    let last_ping = Instant::now();
    assert_eq!(next_event(&mut events).await, ConnectionEvent::Disconnected);
    assert_eq!(last_ping.elapsed(), LIVENESS_TIMEOUT);
    assert_eq!(next_event(&mut events).await, ConnectionEvent::Closed);
}

#[tokio::test(start_paused = true)]
async fn clones_share_one_link() {
    let (connector, mut peers) = MemoryConnector::new();
    let (connection, mut events) = Connection::dial("ws://bridge:5401", Arc::clone(&connector) as _);
    assert_eq!(next_event(&mut events).await, ConnectionEvent::Connected);
    let (_url, _far) = peers.recv().await.unwrap();

    let other = connection.clone();
    assert_eq!(other.id(), connection.id());
    other.terminate();
    assert!(connection.is_terminated());
    assert_eq!(next_event(&mut events).await, ConnectionEvent::Disconnected);
}
