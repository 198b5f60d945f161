//! One logical bridge on the hub side.
//!
//! A session owns exactly one `Connection` at a time, runs the identity
//! handshake over it, and keeps push caches so that unchanged state is
//! never sent twice. The orchestrator feeds it connection events and acts
//! on what comes out of `handle`.

use std::collections::BTreeMap;

use cueproto::{
    now_millis, BridgeMessage, Connection, ConnectionEvent, DeviceSettings, HubMessage, Mappings,
    Timeline, TransportError,
};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Orchestrator-local session key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("bridge identified as '{received}' but session belongs to '{expected}'")]
    IdMismatch { expected: String, received: String },

    #[error("session has not completed the handshake")]
    NotIdentified,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl SessionError {
    /// Link down; the value will be pushed again after the next handshake.
    pub fn is_not_connected(&self) -> bool {
        matches!(self, SessionError::Transport(TransportError::NotConnected))
    }
}

/// Handshake state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Accepted link, bridge has not said who it is yet.
    Unidentified,
    /// The id is known to the hub but the bridge has not confirmed it.
    AwaitingInit { id: String },
    Identified { id: String },
}

/// What the session made of one connection event.
#[derive(Debug)]
pub enum SessionEvent {
    Connected,
    Identified { id: String },
    /// Link lost; carries the id the session held, if any.
    Disconnected { id: Option<String> },
    Closed,
    Message { id: String, message: BridgeMessage },
    Failed(SessionError),
    Ignored,
}

/// Values last sent on the current link.
#[derive(Debug, Default)]
struct PushCache {
    settings: Option<DeviceSettings>,
    mappings: Option<Mappings>,
    timelines: BTreeMap<String, Timeline>,
}

#[derive(Debug)]
pub struct BridgeSession {
    id: SessionId,
    state: SessionState,
    connection: Connection,
    /// Dial target, for sessions the hub opened.
    url: Option<String>,
    cache: PushCache,
}

impl BridgeSession {
    /// A session the hub dials for a configured bridge.
    pub fn outgoing(id: SessionId, bridge_id: impl Into<String>, url: impl Into<String>, connection: Connection) -> Self {
        Self {
            id,
            state: SessionState::AwaitingInit { id: bridge_id.into() },
            connection,
            url: Some(url.into()),
            cache: PushCache::default(),
        }
    }

    /// A session for a bridge that dialed in.
    pub fn incoming(id: SessionId, connection: Connection) -> Self {
        Self {
            id,
            state: SessionState::Unidentified,
            connection,
            url: None,
            cache: PushCache::default(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn is_outgoing(&self) -> bool {
        self.url.is_some()
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// The bridge id, once known.
    pub fn bridge_id(&self) -> Option<&str> {
        match &self.state {
            SessionState::Unidentified => None,
            SessionState::AwaitingInit { id } | SessionState::Identified { id } => Some(id),
        }
    }

    pub fn identified_as(&self) -> Option<&str> {
        match &self.state {
            SessionState::Identified { id } => Some(id),
            _ => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Swap in a new link for the same bridge. The old one is terminated and
    /// the handshake starts over.
    pub fn replace_connection(&mut self, connection: Connection, url: impl Into<String>) {
        self.connection.terminate();
        self.connection = connection;
        self.url = Some(url.into());
        self.reset_link_state();
    }

    pub fn terminate(&mut self) {
        self.connection.terminate();
        self.cache = PushCache::default();
    }

    fn reset_link_state(&mut self) {
        self.cache = PushCache::default();
        if let SessionState::Identified { id } = &self.state {
            self.state = SessionState::AwaitingInit { id: id.clone() };
        }
    }

    /// Advance the handshake with one connection event.
    ///
    /// `assign_id` is called when a bridge without an id asks for one.
    pub fn handle(&mut self, event: ConnectionEvent, assign_id: impl FnOnce() -> String) -> SessionEvent {
        match event {
            ConnectionEvent::Connected => {
                // We dialed a known bridge: tell it who it is
                if self.is_outgoing() {
                    if let SessionState::AwaitingInit { id } = &self.state {
                        let id = id.clone();
                        self.send_logged(&HubMessage::SetId { id });
                    }
                }
                SessionEvent::Connected
            }
            ConnectionEvent::Disconnected => {
                let id = self.bridge_id().map(str::to_string);
                self.reset_link_state();
                SessionEvent::Disconnected { id }
            }
            ConnectionEvent::Closed => SessionEvent::Closed,
            ConnectionEvent::Message(text) => match BridgeMessage::decode(&text) {
                Ok(message) => self.on_message(message, assign_id),
                Err(e) => {
                    warn!("{} dropped frame: {}", self.id, e);
                    SessionEvent::Ignored
                }
            },
        }
    }

    fn on_message(&mut self, message: BridgeMessage, assign_id: impl FnOnce() -> String) -> SessionEvent {
        match message {
            BridgeMessage::InitRequestId => match &self.state {
                SessionState::Unidentified => {
                    let id = assign_id();
                    info!("{} assigning id {} to bridge", self.id, id);
                    self.state = SessionState::AwaitingInit { id: id.clone() };
                    self.send_logged(&HubMessage::SetId { id });
                    SessionEvent::Ignored
                }
                SessionState::AwaitingInit { id } => {
                    let id = id.clone();
                    self.send_logged(&HubMessage::SetId { id });
                    SessionEvent::Ignored
                }
                SessionState::Identified { id } => {
                    warn!("{} bridge {} asked for an id after identifying", self.id, id);
                    SessionEvent::Ignored
                }
            },

            BridgeMessage::Init { id: received, version, incoming } => {
                let expected = self.bridge_id().map(str::to_string);
                match expected {
                    Some(expected) if expected != received => {
                        warn!(
                            "{} id mismatch: expected {}, bridge says {}",
                            self.id, expected, received
                        );
                        self.terminate();
                        SessionEvent::Failed(SessionError::IdMismatch { expected, received })
                    }
                    _ => {
                        debug!(
                            "{} init from {} (version {}, incoming {})",
                            self.id, received, version, incoming
                        );
                        // A repeated init means the bridge restarted its side
                        self.cache = PushCache::default();
                        self.state = SessionState::Identified { id: received.clone() };
                        SessionEvent::Identified { id: received }
                    }
                }
            }

            message => match &self.state {
                SessionState::Identified { id } => SessionEvent::Message {
                    id: id.clone(),
                    message,
                },
                _ => {
                    debug!("{} dropping {} before identification", self.id, message.kind());
                    SessionEvent::Ignored
                }
            },
        }
    }

    fn send(&self, message: &HubMessage) -> Result<(), SessionError> {
        self.connection.send(message)?;
        debug!("{} -> {}", self.id, message.kind());
        Ok(())
    }

    fn send_logged(&self, message: &HubMessage) {
        if let Err(e) = self.send(message) {
            debug!("{} could not send {}: {}", self.id, message.kind(), e);
        }
    }

    fn require_identified(&self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Identified { .. } => Ok(()),
            _ => Err(SessionError::NotIdentified),
        }
    }

    /// Send `setSettings` unless the bridge already has exactly these.
    /// Returns whether anything was sent.
    pub fn push_settings(&mut self, settings: &DeviceSettings) -> Result<bool, SessionError> {
        self.require_identified()?;
        if self.cache.settings.as_ref() == Some(settings) {
            return Ok(false);
        }
        self.send(&HubMessage::SetSettings {
            devices: settings.clone(),
        })?;
        self.cache.settings = Some(settings.clone());
        Ok(true)
    }

    pub fn push_mappings(&mut self, mappings: &Mappings) -> Result<bool, SessionError> {
        self.require_identified()?;
        if self.cache.mappings.as_ref() == Some(mappings) {
            return Ok(false);
        }
        self.send(&HubMessage::SetMappings {
            mappings: mappings.clone(),
            current_time: now_millis(),
        })?;
        self.cache.mappings = Some(mappings.clone());
        Ok(true)
    }

    pub fn push_timeline(&mut self, timeline_id: &str, timeline: &Timeline) -> Result<bool, SessionError> {
        self.require_identified()?;
        if self.cache.timelines.get(timeline_id) == Some(timeline) {
            return Ok(false);
        }
        self.send(&HubMessage::AddTimeline {
            timeline_id: timeline_id.to_string(),
            timeline: timeline.clone(),
            current_time: now_millis(),
        })?;
        self.cache
            .timelines
            .insert(timeline_id.to_string(), timeline.clone());
        Ok(true)
    }

    /// Send `removeTimeline` if this link has seen the timeline.
    pub fn remove_timeline(&mut self, timeline_id: &str) -> Result<bool, SessionError> {
        self.require_identified()?;
        if !self.cache.timelines.contains_key(timeline_id) {
            return Ok(false);
        }
        self.discard_timeline(timeline_id)?;
        Ok(true)
    }

    /// Send `removeTimeline` regardless of the cache, for timelines the
    /// bridge reported holding.
    pub fn discard_timeline(&mut self, timeline_id: &str) -> Result<(), SessionError> {
        self.require_identified()?;
        self.send(&HubMessage::RemoveTimeline {
            timeline_id: timeline_id.to_string(),
            current_time: now_millis(),
        })?;
        self.cache.timelines.remove(timeline_id);
        Ok(())
    }

    /// Bring the bridge's timelines in line with `desired`. Returns the
    /// number of messages sent.
    pub fn sync_timelines(&mut self, desired: &BTreeMap<String, Timeline>) -> Result<usize, SessionError> {
        let mut sent = 0;
        for (timeline_id, timeline) in desired {
            if self.push_timeline(timeline_id, timeline)? {
                sent += 1;
            }
        }
        let gone: Vec<String> = self
            .cache
            .timelines
            .keys()
            .filter(|id| !desired.contains_key(*id))
            .cloned()
            .collect();
        for timeline_id in gone {
            if self.remove_timeline(&timeline_id)? {
                sent += 1;
            }
        }
        Ok(sent)
    }

    pub fn request_timeline_ids(&self) -> Result<(), SessionError> {
        self.require_identified()?;
        self.send(&HubMessage::GetTimelineIds)
    }

    pub fn refresh_resources(&self, device_id: Option<String>) -> Result<(), SessionError> {
        self.require_identified()?;
        self.send(&HubMessage::RefreshResources { device_id })
    }

    pub fn set_key_display(&self, device_id: &str, identifier: &str, key_display: Value) -> Result<(), SessionError> {
        self.require_identified()?;
        self.send(&HubMessage::PeripheralSetKeyDisplay {
            device_id: device_id.to_string(),
            identifier: identifier.to_string(),
            key_display,
        })
    }
}
