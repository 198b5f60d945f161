//! The bridge's side of the hub link.
//!
//! The agent owns every link to a hub, whichever side opened it, and runs
//! the bridge half of the identity handshake:
//!
//! - dialing the hub: send `init{incoming: true}` as soon as the link is up,
//!   or `initRequestId` when the bridge has no id yet
//! - dialed by the hub: wait for `setId`, adopt that id, answer with
//!   `init{incoming: false}`
//!
//! Once a link is initialized the current status of every device is sent on
//! it, and from then on it receives every device event the manager emits.
//! Pushed state goes to the device manager (settings) or the playout store
//! (mappings, timelines, key displays).

use std::collections::HashMap;

use cueproto::{
    BridgeMessage, Connection, ConnectionEvent, ConnectionId, HubMessage, Listener, NewConnection,
    Role, PROTOCOL_VERSION,
};
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamMap;
use tracing::{debug, info, warn};

use crate::manager::ManagerHandle;
use crate::playout::{PlayoutState, PlayoutStore};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("bridge agent is not running")]
    Stopped,
}

#[derive(Debug)]
enum Command {
    DialHub(String),
    Shutdown,
}

/// Cloneable front door to a running agent.
#[derive(Clone)]
pub struct AgentHandle {
    commands: mpsc::UnboundedSender<Command>,
    identity: watch::Receiver<Option<String>>,
    playout: watch::Receiver<PlayoutState>,
}

impl AgentHandle {
    /// Keep a link to the hub at `url`, redialing whenever it drops.
    pub fn dial_hub(&self, url: impl Into<String>) -> Result<(), AgentError> {
        self.commands
            .send(Command::DialHub(url.into()))
            .map_err(|_| AgentError::Stopped)
    }

    /// The id this bridge currently goes by.
    pub fn bridge_id(&self) -> Option<String> {
        self.identity.borrow().clone()
    }

    pub fn watch_identity(&self) -> watch::Receiver<Option<String>> {
        self.identity.clone()
    }

    pub fn watch_playout(&self) -> watch::Receiver<PlayoutState> {
        self.playout.clone()
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

struct Link {
    connection: Connection,
    /// `init` has gone out on the current link.
    initialized: bool,
}

pub struct BridgeAgent {
    listener: Listener,
    incoming: mpsc::UnboundedReceiver<NewConnection>,
    commands: mpsc::UnboundedReceiver<Command>,

    links: HashMap<ConnectionId, Link>,
    streams: StreamMap<ConnectionId, UnboundedReceiverStream<ConnectionEvent>>,

    identity: watch::Sender<Option<String>>,
    manager: ManagerHandle,
    device_events: mpsc::UnboundedReceiver<BridgeMessage>,
    playout: PlayoutStore,
}

impl BridgeAgent {
    pub fn new(
        listener: Listener,
        incoming: mpsc::UnboundedReceiver<NewConnection>,
        manager: ManagerHandle,
        device_events: mpsc::UnboundedReceiver<BridgeMessage>,
        bridge_id: Option<String>,
    ) -> (Self, AgentHandle) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (identity, identity_rx) = watch::channel(bridge_id);
        let playout = PlayoutStore::new();

        let handle = AgentHandle {
            commands: commands_tx,
            identity: identity_rx,
            playout: playout.subscribe(),
        };
        let agent = Self {
            listener,
            incoming,
            commands,
            links: HashMap::new(),
            streams: StreamMap::new(),
            identity,
            manager,
            device_events,
            playout,
        };
        (agent, handle)
    }

    pub fn spawn(
        listener: Listener,
        incoming: mpsc::UnboundedReceiver<NewConnection>,
        manager: ManagerHandle,
        device_events: mpsc::UnboundedReceiver<BridgeMessage>,
        bridge_id: Option<String>,
    ) -> (AgentHandle, JoinHandle<()>) {
        let (agent, handle) = Self::new(listener, incoming, manager, device_events, bridge_id);
        let task = tokio::spawn(agent.run());
        (handle, task)
    }

    pub async fn run(mut self) {
        info!("🌉 bridge agent running as {}", self.identity_label());
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::DialHub(url)) => {
                        info!("dialing hub at {}", url);
                        self.listener.dial_out(url);
                    }
                    Some(Command::Shutdown) | None => break,
                },
                Some(new) = self.incoming.recv() => self.on_new_connection(new),
                Some((id, event)) = self.streams.next() => self.on_connection_event(id, event).await,
                Some(message) = self.device_events.recv() => self.broadcast(&message),
            }
        }

        info!("bridge agent stopping, closing {} hub links", self.links.len());
        self.manager.shutdown();
        self.listener.shutdown();
    }

    fn identity_label(&self) -> String {
        self.identity
            .borrow()
            .clone()
            .unwrap_or_else(|| "(unassigned)".to_string())
    }

    fn on_new_connection(&mut self, new: NewConnection) {
        let NewConnection { connection, events } = new;
        if connection.is_terminated() {
            return;
        }
        let id = connection.id();
        debug!("{} hub link {:?}", id, connection.role());
        self.links.insert(
            id,
            Link {
                connection,
                initialized: false,
            },
        );
        self.streams.insert(id, UnboundedReceiverStream::new(events));
    }

    async fn on_connection_event(&mut self, id: ConnectionId, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => {
                let Some(link) = self.links.get(&id) else { return };
                info!("🔗 {} connected to hub", id);
                if link.connection.role() == Role::Dialer {
                    self.introduce(id).await;
                }
            }
            ConnectionEvent::Disconnected => {
                if let Some(link) = self.links.get_mut(&id) {
                    info!("{} lost the hub", id);
                    link.initialized = false;
                }
            }
            ConnectionEvent::Closed => {
                debug!("{} closed", id);
                self.links.remove(&id);
                self.streams.remove(&id);
            }
            ConnectionEvent::Message(text) => match HubMessage::decode(&text) {
                Ok(message) => self.on_hub_message(id, message).await,
                Err(e) => warn!("{} dropped frame: {}", id, e),
            },
        }
    }

    /// Dialer side of the handshake.
    async fn introduce(&mut self, id: ConnectionId) {
        let bridge_id = self.identity.borrow().clone();
        match bridge_id {
            Some(bridge_id) => self.send_init(id, bridge_id).await,
            None => {
                debug!("{} asking hub for an id", id);
                self.send(id, &BridgeMessage::InitRequestId);
            }
        }
    }

    async fn send_init(&mut self, id: ConnectionId, bridge_id: String) {
        let Some(link) = self.links.get(&id) else { return };
        let init = BridgeMessage::Init {
            id: bridge_id.clone(),
            version: PROTOCOL_VERSION.to_string(),
            incoming: link.connection.role() == Role::Dialer,
        };
        if let Err(e) = link.connection.send(&init) {
            debug!("{} init not sent: {}", id, e);
            return;
        }
        info!("👋 {} identified as {}", id, bridge_id);

        match self.manager.statuses().await {
            Ok(statuses) => {
                for status in &statuses {
                    self.send(id, status);
                }
            }
            Err(e) => warn!("no device statuses to report: {}", e),
        }
        if let Some(link) = self.links.get_mut(&id) {
            link.initialized = true;
        }
    }

    async fn on_hub_message(&mut self, id: ConnectionId, message: HubMessage) {
        debug!("{} <- {}", id, message.kind());
        match message {
            HubMessage::SetId { id: bridge_id } => {
                let changed = self.identity.borrow().as_deref() != Some(bridge_id.as_str());
                if changed {
                    debug!("hub assigned id {}", bridge_id);
                    self.identity.send_replace(Some(bridge_id.clone()));
                }
                self.send_init(id, bridge_id).await;
            }
            HubMessage::SetSettings { devices } => {
                if let Err(e) = self.manager.apply_settings(devices) {
                    warn!("settings dropped: {}", e);
                }
            }
            HubMessage::AddTimeline {
                timeline_id,
                timeline,
                current_time,
            } => self.playout.add_timeline(timeline_id, timeline, current_time),
            HubMessage::RemoveTimeline {
                timeline_id,
                current_time,
            } => self.playout.remove_timeline(&timeline_id, current_time),
            HubMessage::GetTimelineIds => {
                let timeline_ids = self.playout.timeline_ids();
                self.send(id, &BridgeMessage::TimelineIds { timeline_ids });
            }
            HubMessage::SetMappings {
                mappings,
                current_time,
            } => self.playout.set_mappings(mappings, current_time),
            HubMessage::RefreshResources { device_id } => {
                if let Err(e) = self.manager.refresh_resources(device_id) {
                    warn!("refresh dropped: {}", e);
                }
            }
            HubMessage::PeripheralSetKeyDisplay {
                device_id,
                identifier,
                key_display,
            } => self.playout.set_key_display(device_id, identifier, key_display),
        }
    }

    fn send(&self, id: ConnectionId, message: &BridgeMessage) {
        let Some(link) = self.links.get(&id) else { return };
        match link.connection.send(message) {
            Ok(()) => debug!("{} -> {}", id, message.kind()),
            Err(e) => debug!("{} {} not sent: {}", id, message.kind(), e),
        }
    }

    /// Device events go to every hub that knows who we are.
    fn broadcast(&self, message: &BridgeMessage) {
        for (id, link) in &self.links {
            if link.initialized {
                self.send(*id, message);
            }
        }
    }
}
