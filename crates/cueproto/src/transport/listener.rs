//! Listener: one pipeline for accepted and dialed connections.
//!
//! Consumers see a single stream of `NewConnection`s and do not care which
//! side opened the link. Every connection hangs off the listener's root
//! cancellation token, so `shutdown` stops the accept loop and terminates
//! every connection it produced.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::{Connection, EventReceiver};
use super::{ws, Connector, Socket, TransportError};

/// Time allowed for the WebSocket upgrade on an accepted TCP stream.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A connection handed to the consumer together with its event receiver.
#[derive(Debug)]
pub struct NewConnection {
    pub connection: Connection,
    pub events: EventReceiver,
}

struct Inner {
    connector: Arc<dyn Connector>,
    root: CancellationToken,
    new_connections: mpsc::UnboundedSender<NewConnection>,
    local_addr: Option<SocketAddr>,
}

/// Handle to a listener. Clones share the same pipeline.
#[derive(Clone)]
pub struct Listener {
    inner: Arc<Inner>,
}

impl Listener {
    /// Bind a TCP port and accept WebSocket connections on it.
    pub async fn bind(
        addr: impl ToSocketAddrs + std::fmt::Display,
        connector: Arc<dyn Connector>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<NewConnection>), TransportError> {
        let label = addr.to_string();
        let tcp = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind { addr: label.clone(), source })?;
        let local_addr = tcp.local_addr().ok();

        let (listener, rx) = Self::build(connector, local_addr);
        info!("👂 listening on {}", local_addr.map(|a| a.to_string()).unwrap_or(label));

        let accepting = listener.clone();
        tokio::spawn(async move { accepting.accept_loop(tcp).await });

        Ok((listener, rx))
    }

    /// A listener with no port of its own. Sockets come in through `adopt`
    /// and `dial_out` only.
    pub fn detached(connector: Arc<dyn Connector>) -> (Self, mpsc::UnboundedReceiver<NewConnection>) {
        Self::build(connector, None)
    }

    fn build(
        connector: Arc<dyn Connector>,
        local_addr: Option<SocketAddr>,
    ) -> (Self, mpsc::UnboundedReceiver<NewConnection>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = Self {
            inner: Arc::new(Inner {
                connector,
                root: CancellationToken::new(),
                new_connections: tx,
                local_addr,
            }),
        };
        (listener, rx)
    }

    async fn accept_loop(&self, tcp: TcpListener) {
        let root = self.inner.root.clone();
        loop {
            let (stream, addr) = tokio::select! {
                biased;
                _ = root.cancelled() => break,
                accepted = tcp.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        continue;
                    }
                },
            };

            let listener = self.clone();
            tokio::spawn(async move {
                match timeout(HANDSHAKE_TIMEOUT, ws::accept(stream)).await {
                    Ok(Ok(socket)) => {
                        listener.adopt(socket);
                    }
                    Ok(Err(e)) => debug!("rejected {}: {}", addr, e),
                    Err(_) => debug!("handshake with {} timed out", addr),
                }
            });
        }
        debug!("accept loop stopped");
    }

    /// Wrap an open socket as an acceptor-role connection and publish it.
    pub fn adopt(&self, socket: Socket) -> Connection {
        debug!("accepted {}", socket.peer);
        let (connection, events) = Connection::spawn_acceptor(socket, self.inner.root.child_token());
        self.publish(connection.clone(), events);
        connection
    }

    /// Create a dialer-role connection to `url` and publish it. The handle
    /// is returned immediately; connecting happens in the background.
    pub fn dial_out(&self, url: impl Into<String>) -> Connection {
        let url = url.into();
        debug!("dialing out to {}", url);
        let (connection, events) = Connection::spawn_dialer(
            url,
            self.inner.connector.clone(),
            self.inner.root.child_token(),
        );
        self.publish(connection.clone(), events);
        connection
    }

    fn publish(&self, connection: Connection, events: EventReceiver) {
        if self
            .inner
            .new_connections
            .send(NewConnection { connection: connection.clone(), events })
            .is_err()
        {
            // No consumer; don't leave an orphan running
            connection.terminate();
        }
    }

    /// Stop accepting and terminate every connection this listener made.
    pub fn shutdown(&self) {
        if !self.inner.root.is_cancelled() {
            info!("listener shutting down");
            self.inner.root.cancel();
        }
    }

    /// Bound address; `None` for a detached listener.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }
}
