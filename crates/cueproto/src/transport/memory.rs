//! In-process sockets.
//!
//! Used to run a hub and bridges inside one process, and by the tests, where
//! they make the network deterministic under a paused clock.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::debug;

use super::{Connector, Frame, Socket, TransportError};

/// Two sockets wired to each other.
pub fn pair(a: &str, b: &str) -> (Socket, Socket) {
    let (a_tx, b_rx) = fmpsc::unbounded::<Frame>();
    let (b_tx, a_rx) = fmpsc::unbounded::<Frame>();
    (half(a_tx, a_rx, b), half(b_tx, b_rx, a))
}

fn half(tx: fmpsc::UnboundedSender<Frame>, rx: fmpsc::UnboundedReceiver<Frame>, peer: &str) -> Socket {
    Socket {
        tx: Box::pin(tx.sink_map_err(|_| TransportError::Closed)),
        rx: Box::pin(rx.map(Ok)),
        peer: peer.to_string(),
    }
}

/// A connector that hands the far end of every successful dial to a channel.
///
/// While offline, or while refusals are pending, dials fail the way an
/// unreachable host would.
pub struct MemoryConnector {
    online: AtomicBool,
    refusals: AtomicUsize,
    attempts: AtomicUsize,
    peers: mpsc::UnboundedSender<(String, Socket)>,
}

impl MemoryConnector {
    /// Returns the connector and the receiver of `(url, far_end)` pairs.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(String, Socket)>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            online: AtomicBool::new(true),
            refusals: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
            peers,
        });
        (connector, rx)
    }

    /// Fail the next `count` dials, then accept again.
    pub fn refuse_next(&self, count: usize) {
        self.refusals.store(count, Ordering::SeqCst);
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Number of dials attempted so far, successful or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &str) -> Result<Socket, TransportError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;

        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused || !self.online.load(Ordering::SeqCst) {
            debug!("memory dial #{} to {} refused", attempt, url);
            return Err(TransportError::Connect {
                url: url.to_string(),
                message: "connection refused".to_string(),
            });
        }

        let (near, far) = pair(url, "memory-dialer");
        self.peers
            .send((url.to_string(), far))
            .map_err(|_| TransportError::Connect {
                url: url.to_string(),
                message: "no acceptor".to_string(),
            })?;
        Ok(near)
    }
}
