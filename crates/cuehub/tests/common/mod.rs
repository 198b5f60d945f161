//! Test harness: an orchestrator over in-memory sockets and scripted bridges.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, timeout};

use cuehub::{HubEvent, Orchestrator, OrchestratorHandle, ResourceDelta};
use cueproto::transport::memory;
use cueproto::{BridgeMessage, Frame, HubMessage, Listener, MemoryConnector, Socket};

const WAIT: Duration = Duration::from_secs(30);

pub struct TestHub {
    pub connector: Arc<MemoryConnector>,
    pub peers: mpsc::UnboundedReceiver<(String, Socket)>,
    pub listener: Listener,
    pub handle: OrchestratorHandle,
}

impl TestHub {
    pub fn start() -> Self {
        let (connector, peers) = MemoryConnector::new();
        let (listener, incoming) = Listener::detached(connector.clone());
        let (handle, _task) = Orchestrator::spawn(listener.clone(), incoming);
        Self {
            connector,
            peers,
            listener,
            handle,
        }
    }

    /// Wait for the hub to dial somewhere and play the bridge on that link.
    pub async fn next_dialed(&mut self) -> (String, FakeBridge) {
        let (url, socket) = timeout(WAIT, self.peers.recv())
            .await
            .expect("hub never dialed")
            .expect("connector dropped");
        (url, FakeBridge::spawn(socket))
    }

    /// A bridge dialing in to the hub.
    pub fn accept(&self) -> FakeBridge {
        let (near, far) = memory::pair("bridge", "hub");
        self.listener.adopt(near);
        FakeBridge::spawn(far)
    }

    /// Bridge ids of every live session, sorted.
    pub async fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .handle
            .sessions()
            .await
            .unwrap()
            .into_iter()
            .filter_map(|s| s.bridge_id)
            .collect();
        ids.sort();
        ids
    }
}

/// The bridge end of a link. Answers pings and decodes everything else.
pub struct FakeBridge {
    outgoing: mpsc::UnboundedSender<Frame>,
    messages: mpsc::UnboundedReceiver<HubMessage>,
}

impl FakeBridge {
    fn spawn(socket: Socket) -> Self {
        let (outgoing, mut out_rx) = mpsc::unbounded_channel::<Frame>();
        let (in_tx, messages) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let Socket { mut tx, mut rx, .. } = socket;
            loop {
                tokio::select! {
                    frame = out_rx.recv() => match frame {
                        Some(frame) => {
                            if tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    incoming = rx.next() => match incoming {
                        Some(Ok(Frame::Text(text))) => {
                            let message = HubMessage::decode(&text).expect("hub sent a bad frame");
                            let _ = in_tx.send(message);
                        }
                        Some(Ok(Frame::Ping(payload))) => {
                            if tx.send(Frame::Pong(payload)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Frame::Pong(_))) => {}
                        Some(Ok(Frame::Close)) | Some(Err(_)) | None => break,
                    },
                }
            }
        });

        Self { outgoing, messages }
    }

    pub fn send(&self, message: BridgeMessage) {
        self.outgoing
            .send(Frame::Text(message.encode().unwrap()))
            .expect("bridge link closed");
    }

    pub fn init(&self, id: &str) {
        self.send(BridgeMessage::Init {
            id: id.to_string(),
            version: "0.1.0".to_string(),
            incoming: true,
        });
    }

    /// Init as a bridge the hub dialed.
    pub fn init_dialed(&self, id: &str) {
        self.send(BridgeMessage::Init {
            id: id.to_string(),
            version: "0.1.0".to_string(),
            incoming: false,
        });
    }

    pub async fn next(&mut self) -> HubMessage {
        timeout(WAIT, self.messages.recv())
            .await
            .expect("timed out waiting for a hub message")
            .expect("bridge link closed")
    }

    /// Consume the post-handshake burst: settings, mappings, then the
    /// timeline id query. Returns the settings message.
    pub async fn expect_handshake_push(&mut self) -> HubMessage {
        let settings = self.next().await;
        assert!(matches!(settings, HubMessage::SetSettings { .. }), "got {:?}", settings);
        let mappings = self.next().await;
        assert!(matches!(mappings, HubMessage::SetMappings { .. }), "got {:?}", mappings);
        assert_eq!(self.next().await, HubMessage::GetTimelineIds);
        settings
    }

    /// Nothing more arrives once the hub has caught up.
    pub async fn assert_quiet(&mut self, hub: &OrchestratorHandle) {
        hub.sessions().await.unwrap();
        sleep(Duration::from_millis(10)).await;
        if let Ok(message) = self.messages.try_recv() {
            panic!("unexpected message from hub: {:?}", message);
        }
    }

    /// Wait until the hub closes this link.
    pub async fn closed(&mut self) {
        timeout(WAIT, async {
            while self.messages.recv().await.is_some() {}
        })
        .await
        .expect("hub never closed the link");
    }
}

pub async fn next_resources(events: &mut broadcast::Receiver<HubEvent>) -> (String, ResourceDelta) {
    timeout(WAIT, async {
        loop {
            match events.recv().await.expect("event channel closed") {
                HubEvent::ResourcesChanged { device_id, delta, .. } => return (device_id, delta),
                _ => continue,
            }
        }
    })
    .await
    .expect("no resource event")
}

pub async fn next_peripheral_status(events: &mut broadcast::Receiver<HubEvent>) -> String {
    timeout(WAIT, async {
        loop {
            if let HubEvent::PeripheralStatus { device_id, .. } =
                events.recv().await.expect("event channel closed")
            {
                return device_id;
            }
        }
    })
    .await
    .expect("no peripheral event")
}
