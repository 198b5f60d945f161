//! Message-oriented transport shared by the hub and the bridges.
//!
//! The socket layer is a pair of boxed halves (`Socket`): a sink of outgoing
//! frames and a stream of incoming ones. `Connection` owns one socket at a
//! time and adds liveness and reconnection on top; `Listener` produces
//! connections in both directions through one pipeline.
//!
//! ```ignore
//! let (listener, mut incoming) = Listener::bind("0.0.0.0:5400", Arc::new(WsConnector)).await?;
//! let outbound = listener.dial_out("ws://10.0.0.12:5401");
//! while let Some(NewConnection { connection, events }) = incoming.recv().await {
//!     // both accepted and dialed connections arrive here
//! }
//! ```

pub mod connection;
pub mod listener;
pub mod memory;
pub mod ws;

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Sink, Stream};
use thiserror::Error;

use crate::messages::ProtocolError;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Send attempted while the link is down.
    #[error("not connected")]
    NotConnected,

    #[error("failed to connect to {url}: {message}")]
    Connect { url: String, message: String },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("socket error: {0}")]
    Socket(String),

    #[error("socket closed")]
    Closed,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// One unit on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Ping(Bytes),
    Pong(Bytes),
    Close,
}

/// Boxed sink type for sending frames
pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = TransportError> + Send>>;

/// Boxed stream type for receiving frames
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, TransportError>> + Send>>;

/// An open socket, split into tx and rx halves.
pub struct Socket {
    pub tx: FrameSink,
    pub rx: FrameStream,
    /// Remote address or URL, for logging.
    pub peer: String,
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket").field("peer", &self.peer).finish()
    }
}

/// Opens sockets for dialer-role connections.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<Socket, TransportError>;
}
