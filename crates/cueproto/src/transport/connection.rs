//! A single logical link with liveness and reconnection.
//!
//! Each `Connection` is an actor: a spawned task owns the socket and the
//! timers, and the cloneable handle talks to it over a channel. Lifecycle
//! notifications come out on a separate event receiver, in order.
//!
//! Dialer-role connections redial every `RECONNECT_INTERVAL` until
//! terminated. Acceptor-role connections are single-use: once the socket goes
//! away they emit `Disconnected` then `Closed`, and the task ends.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{Connector, Frame, Socket, TransportError};

/// How often a dialer pings its peer.
pub const PING_INTERVAL: Duration = Duration::from_millis(5_000);

/// Delay between a failed or dropped dial and the next attempt.
pub const RECONNECT_INTERVAL: Duration = Duration::from_millis(5_000);

/// Silence after which a link is declared dead (2.5 ping intervals).
pub const LIVENESS_TIMEOUT: Duration = Duration::from_millis(12_500);

/// Upper bound on flushing the close frame during terminate.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Which side opened the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Dialer,
    Acceptor,
}

/// Lifecycle notifications, delivered in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    /// One text frame, undecoded.
    Message(String),
    /// Acceptor only: the connection is finished and will not come back.
    Closed,
}

pub type EventReceiver = mpsc::UnboundedReceiver<ConnectionEvent>;

struct Shared {
    id: ConnectionId,
    role: Role,
    url: Option<String>,
    connected: AtomicBool,
    outbound: mpsc::UnboundedSender<Frame>,
    cancel: CancellationToken,
}

/// Handle to a connection. Clones refer to the same link.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("role", &self.shared.role)
            .field("url", &self.shared.url)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Connection {
    /// Dial `url` and keep redialing until terminated. The first attempt
    /// starts immediately.
    pub fn dial(url: impl Into<String>, connector: Arc<dyn Connector>) -> (Self, EventReceiver) {
        Self::spawn_dialer(url.into(), connector, CancellationToken::new())
    }

    /// Adopt an already-open socket as an acceptor-role connection.
    /// `Connected` is the first event on the returned receiver.
    pub fn wrap(socket: Socket) -> (Self, EventReceiver) {
        Self::spawn_acceptor(socket, CancellationToken::new())
    }

    pub(crate) fn spawn_dialer(
        url: String,
        connector: Arc<dyn Connector>,
        cancel: CancellationToken,
    ) -> (Self, EventReceiver) {
        let (connection, driver, events) = Self::build(Role::Dialer, Some(url.clone()), cancel);
        tokio::spawn(driver.run_dialer(url, connector));
        (connection, events)
    }

    pub(crate) fn spawn_acceptor(socket: Socket, cancel: CancellationToken) -> (Self, EventReceiver) {
        let (connection, driver, events) = Self::build(Role::Acceptor, None, cancel);
        connection.shared.connected.store(true, Ordering::SeqCst);
        let _ = driver.events.send(ConnectionEvent::Connected);
        tokio::spawn(driver.run_acceptor(socket));
        (connection, events)
    }

    fn build(role: Role, url: Option<String>, cancel: CancellationToken) -> (Self, Driver, EventReceiver) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            id: ConnectionId::next(),
            role,
            url,
            connected: AtomicBool::new(false),
            outbound: outbound_tx,
            cancel,
        });
        let driver = Driver {
            shared: shared.clone(),
            events: events_tx,
            outbound: outbound_rx,
        };
        (Self { shared }, driver, events_rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Dial target, for dialer-role connections.
    pub fn url(&self) -> Option<&str> {
        self.shared.url.as_deref()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Serialize `message` as JSON and queue it as one text frame.
    ///
    /// Fails synchronously with `NotConnected` while the link is down;
    /// nothing is buffered across a disconnect.
    pub fn send<T: Serialize>(&self, message: &T) -> Result<(), TransportError> {
        let text = serde_json::to_string(message)
            .map_err(crate::messages::ProtocolError::Encode)?;
        self.send_text(text)
    }

    pub fn send_text(&self, text: String) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.shared
            .outbound
            .send(Frame::Text(text))
            .map_err(|_| TransportError::NotConnected)
    }

    /// Close the socket and stop all timers and redials. Idempotent.
    pub fn terminate(&self) {
        if self.shared.cancel.is_cancelled() {
            return;
        }
        debug!("{} terminating", self.shared.id);
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.cancel.cancel();
    }
}

/// Why a live link ended.
enum LinkEnd {
    Terminated,
    Lost(String),
}

/// The task side of a connection.
struct Driver {
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    outbound: mpsc::UnboundedReceiver<Frame>,
}

impl Driver {
    fn emit(&self, event: ConnectionEvent) {
        // Receiver gone means nobody cares any more
        let _ = self.events.send(event);
    }

    async fn run_dialer(mut self, url: String, connector: Arc<dyn Connector>) {
        let id = self.shared.id;
        let cancel = self.shared.cancel.clone();
        let mut failures: u32 = 0;

        loop {
            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = connector.connect(&url) => result,
            };

            match attempt {
                Ok(socket) => {
                    if failures > 0 {
                        info!("🔌 {} reached {} after {} failed attempts", id, url, failures);
                    } else {
                        info!("🔌 {} connected to {}", id, url);
                    }
                    failures = 0;

                    // Frames queued against a previous link are not replayed
                    while self.outbound.try_recv().is_ok() {}

                    self.shared.connected.store(true, Ordering::SeqCst);
                    self.emit(ConnectionEvent::Connected);

                    let end = self.drive(socket).await;

                    self.shared.connected.store(false, Ordering::SeqCst);
                    self.emit(ConnectionEvent::Disconnected);

                    match end {
                        LinkEnd::Terminated => break,
                        LinkEnd::Lost(reason) => {
                            warn!("💔 {} lost link to {}: {}", id, url, reason);
                        }
                    }
                }
                Err(e) => {
                    failures += 1;
                    if failures == 1 {
                        warn!("{} cannot reach {}: {}", id, url, e);
                    } else {
                        debug!("{} attempt {} to {} failed: {}", id, failures, url, e);
                    }
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = sleep(RECONNECT_INTERVAL) => {}
            }
        }

        debug!("{} dialer for {} stopped", id, url);
    }

    async fn run_acceptor(mut self, socket: Socket) {
        let id = self.shared.id;
        let peer = socket.peer.clone();
        let end = self.drive(socket).await;

        self.shared.connected.store(false, Ordering::SeqCst);
        match end {
            LinkEnd::Terminated => debug!("{} to {} terminated", id, peer),
            LinkEnd::Lost(reason) => info!("{} to {} closed: {}", id, peer, reason),
        }
        self.emit(ConnectionEvent::Disconnected);
        self.emit(ConnectionEvent::Closed);
    }

    /// Pump one socket until it dies or the connection is terminated.
    async fn drive(&mut self, socket: Socket) -> LinkEnd {
        let Socket { mut tx, mut rx, peer } = socket;
        let dialer = self.shared.role == Role::Dialer;
        let cancel = self.shared.cancel.clone();

        let mut ping = tokio::time::interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
        ping.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let liveness = sleep(LIVENESS_TIMEOUT);
        tokio::pin!(liveness);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    let _ = timeout(CLOSE_GRACE, tx.send(Frame::Close)).await;
                    return LinkEnd::Terminated;
                }

                _ = &mut liveness => {
                    return LinkEnd::Lost(format!(
                        "no ping or pong from {} for {:?}",
                        peer, LIVENESS_TIMEOUT
                    ));
                }

                frame = self.outbound.recv() => match frame {
                    Some(frame) => {
                        if let Err(e) = tx.send(frame).await {
                            return LinkEnd::Lost(e.to_string());
                        }
                    }
                    None => return LinkEnd::Terminated,
                },

                incoming = rx.next() => match incoming {
                    Some(Ok(Frame::Text(text))) => {
                        self.emit(ConnectionEvent::Message(text));
                    }
                    Some(Ok(Frame::Ping(payload))) => {
                        trace!("{} ping from {}", self.shared.id, peer);
                        liveness.as_mut().reset(Instant::now() + LIVENESS_TIMEOUT);
                        if let Err(e) = tx.send(Frame::Pong(payload)).await {
                            return LinkEnd::Lost(e.to_string());
                        }
                    }
                    Some(Ok(Frame::Pong(_))) => {
                        liveness.as_mut().reset(Instant::now() + LIVENESS_TIMEOUT);
                    }
                    Some(Ok(Frame::Close)) | None => {
                        return LinkEnd::Lost("closed by peer".to_string());
                    }
                    Some(Err(e)) => return LinkEnd::Lost(e.to_string()),
                },

                _ = ping.tick(), if dialer => {
                    if let Err(e) = tx.send(Frame::Ping(Bytes::new())).await {
                        return LinkEnd::Lost(e.to_string());
                    }
                }
            }
        }
    }
}
