//! WebSocket sockets via tokio-tungstenite.

use async_trait::async_trait;
use futures::{future, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::trace;

use super::{Connector, Frame, Socket, TransportError};

/// Dials `ws://` URLs.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Socket, TransportError> {
        let (stream, _response) =
            tokio_tungstenite::connect_async(url)
                .await
                .map_err(|e| TransportError::Connect {
                    url: url.to_string(),
                    message: e.to_string(),
                })?;
        Ok(split(stream, url.to_string()))
    }
}

/// Run the server side of the WebSocket handshake on an accepted stream.
pub async fn accept(stream: TcpStream) -> Result<Socket, TransportError> {
    let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| TransportError::Socket(format!("handshake with {}: {}", peer, e)))?;
    Ok(split(ws, peer))
}

/// Wrap a WebSocket stream as a frame socket.
pub fn split<S>(ws: WebSocketStream<S>, peer: String) -> Socket
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();

    let tx = sink
        .sink_map_err(|e| TransportError::Socket(e.to_string()))
        .with(|frame: Frame| future::ready(Ok::<Message, TransportError>(to_message(frame))));

    let rx = stream.filter_map(|item| {
        future::ready(match item {
            Ok(message) => from_message(message).map(Ok),
            Err(e) => Some(Err(TransportError::Socket(e.to_string()))),
        })
    });

    Socket {
        tx: Box::pin(tx),
        rx: Box::pin(rx),
        peer,
    }
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::text(text),
        Frame::Ping(payload) => Message::Ping(payload),
        Frame::Pong(payload) => Message::Pong(payload),
        Frame::Close => Message::Close(None),
    }
}

fn from_message(message: Message) -> Option<Frame> {
    match message {
        Message::Text(text) => Some(Frame::Text(text.as_str().to_owned())),
        // Some peers send JSON as binary frames
        Message::Binary(data) => match String::from_utf8(data.to_vec()) {
            Ok(text) => Some(Frame::Text(text)),
            Err(_) => {
                trace!("dropping non-utf8 binary frame ({} bytes)", data.len());
                None
            }
        },
        Message::Ping(payload) => Some(Frame::Ping(payload)),
        Message::Pong(payload) => Some(Frame::Pong(payload)),
        Message::Close(_) => Some(Frame::Close),
        Message::Frame(_) => None,
    }
}
