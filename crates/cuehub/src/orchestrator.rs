//! Reconciles the desired bridge set against live sessions.
//!
//! The orchestrator is one task that owns every session, every push cache
//! and all aggregated status. Everything else talks to it through an
//! `OrchestratorHandle`:
//!
//! - commands (desired state changes) go in over an mpsc channel
//! - queries are answered over oneshot channels
//! - runtime status is published on a watch channel
//! - resource deltas and peripheral traffic go out on a broadcast channel
//!
//! ```text
//!   OrchestratorHandle ──commands──▶ ┌──────────────┐ ◀──NewConnection── Listener
//!                      ◀──status──── │ Orchestrator │ ◀──StreamMap<SessionId, events>
//!                      ◀──events──── └──────────────┘ ──send──▶ Connection (per session)
//! ```

use std::collections::{BTreeMap, HashMap};

use cueproto::{
    BridgeMessage, ConnectionEvent, ConnectionId, DeviceSettings, Listener, Mappings,
    NewConnection, Resource, Timeline, RECONNECT_INTERVAL,
};
use futures::StreamExt;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamMap;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::resources::ResourceStore;
use crate::session::{BridgeSession, SessionError, SessionEvent, SessionId};
use crate::status::{
    BridgeConfig, DeviceStatus, HubEvent, HubStatus, SessionInfo,
};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("orchestrator is not running")]
    Stopped,
}

/// Requests handled by the orchestrator task.
#[derive(Debug)]
pub enum Command {
    SetBridges(Vec<BridgeConfig>),
    SetMappings(Mappings),
    /// `None` removes the timeline.
    SetTimeline {
        timeline_id: String,
        timeline: Option<Timeline>,
    },
    RefreshResources {
        bridge_id: String,
        device_id: Option<String>,
    },
    SetKeyDisplay {
        device_id: String,
        identifier: String,
        key_display: Value,
    },
    Resources {
        device_id: String,
        reply: oneshot::Sender<Vec<Resource>>,
    },
    Sessions {
        reply: oneshot::Sender<Vec<SessionInfo>>,
    },
    Shutdown,
}

/// Cloneable front door to a running orchestrator.
#[derive(Clone)]
pub struct OrchestratorHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<HubStatus>,
    events: broadcast::Sender<HubEvent>,
}

impl OrchestratorHandle {
    fn command(&self, command: Command) -> Result<(), HubError> {
        self.commands.send(command).map_err(|_| HubError::Stopped)
    }

    /// Replace the desired bridge set.
    pub fn set_bridges(&self, bridges: Vec<BridgeConfig>) -> Result<(), HubError> {
        self.command(Command::SetBridges(bridges))
    }

    pub fn set_mappings(&self, mappings: Mappings) -> Result<(), HubError> {
        self.command(Command::SetMappings(mappings))
    }

    /// Add, replace (`Some`) or remove (`None`) one timeline.
    pub fn set_timeline(&self, timeline_id: impl Into<String>, timeline: Option<Timeline>) -> Result<(), HubError> {
        self.command(Command::SetTimeline {
            timeline_id: timeline_id.into(),
            timeline,
        })
    }

    /// Ask a bridge to rediscover resources, for one device or all of them.
    pub fn refresh_resources(&self, bridge_id: impl Into<String>, device_id: Option<String>) -> Result<(), HubError> {
        self.command(Command::RefreshResources {
            bridge_id: bridge_id.into(),
            device_id,
        })
    }

    /// Routed to the bridge that last reported the peripheral.
    pub fn set_key_display(
        &self,
        device_id: impl Into<String>,
        identifier: impl Into<String>,
        key_display: Value,
    ) -> Result<(), HubError> {
        self.command(Command::SetKeyDisplay {
            device_id: device_id.into(),
            identifier: identifier.into(),
            key_display,
        })
    }

    /// Current resource set of a device.
    pub async fn resources(&self, device_id: impl Into<String>) -> Result<Vec<Resource>, HubError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Resources {
            device_id: device_id.into(),
            reply,
        })?;
        rx.await.map_err(|_| HubError::Stopped)
    }

    /// Every live session.
    pub async fn sessions(&self) -> Result<Vec<SessionInfo>, HubError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Sessions { reply })?;
        rx.await.map_err(|_| HubError::Stopped)
    }

    /// Snapshot of every bridge's status.
    pub fn status(&self) -> HubStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<HubStatus> {
        self.status.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.events.subscribe()
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

pub struct Orchestrator {
    listener: Listener,
    incoming: mpsc::UnboundedReceiver<NewConnection>,
    commands: mpsc::UnboundedReceiver<Command>,

    sessions: HashMap<SessionId, BridgeSession>,
    streams: StreamMap<SessionId, UnboundedReceiverStream<ConnectionEvent>>,
    /// Dialed connections not yet seen on the listener pipeline.
    pending_dials: HashMap<ConnectionId, SessionId>,
    /// Outgoing sessions waiting out an id mismatch before redialing.
    redials: DelayQueue<SessionId>,
    redial_keys: HashMap<SessionId, delay_queue::Key>,
    next_session: u64,

    desired: BTreeMap<String, BridgeConfig>,
    mappings: Mappings,
    timelines: BTreeMap<String, Timeline>,

    status: HubStatus,
    resources: ResourceStore,
    /// Peripheral device id -> bridge id.
    peripherals: HashMap<String, String>,

    status_tx: watch::Sender<HubStatus>,
    events: broadcast::Sender<HubEvent>,
}

fn fresh_bridge_id() -> String {
    format!("bridge-{}", Uuid::new_v4().simple())
}

impl Orchestrator {
    /// Build an orchestrator over a listener and the listener's pipeline.
    pub fn new(listener: Listener, incoming: mpsc::UnboundedReceiver<NewConnection>) -> (Self, OrchestratorHandle) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(HubStatus::new());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let orchestrator = Self {
            listener,
            incoming,
            commands,
            sessions: HashMap::new(),
            streams: StreamMap::new(),
            pending_dials: HashMap::new(),
            redials: DelayQueue::new(),
            redial_keys: HashMap::new(),
            next_session: 1,
            desired: BTreeMap::new(),
            mappings: Mappings::new(),
            timelines: BTreeMap::new(),
            status: HubStatus::new(),
            resources: ResourceStore::default(),
            peripherals: HashMap::new(),
            status_tx,
            events: events.clone(),
        };
        let handle = OrchestratorHandle {
            commands: commands_tx,
            status: status_rx,
            events,
        };
        (orchestrator, handle)
    }

    /// Build and spawn onto the current runtime.
    pub fn spawn(listener: Listener, incoming: mpsc::UnboundedReceiver<NewConnection>) -> (OrchestratorHandle, JoinHandle<()>) {
        let (orchestrator, handle) = Self::new(listener, incoming);
        let task = tokio::spawn(orchestrator.run());
        (handle, task)
    }

    pub async fn run(mut self) {
        info!("🎛️ orchestrator running");
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.on_command(command),
                },
                Some(new) = self.incoming.recv() => self.on_new_connection(new),
                Some((session_id, event)) = self.streams.next() => {
                    self.on_connection_event(session_id, event);
                }
                Some(expired) = self.redials.next() => {
                    let session_id = expired.into_inner();
                    self.redial_keys.remove(&session_id);
                    self.redial_after_mismatch(session_id);
                }
            }
        }

        info!("orchestrator stopping, closing {} sessions", self.sessions.len());
        for session in self.sessions.values_mut() {
            session.terminate();
        }
        self.listener.shutdown();
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::SetBridges(bridges) => self.set_bridges(bridges),
            Command::SetMappings(mappings) => {
                self.mappings = mappings;
                self.push_all();
            }
            Command::SetTimeline { timeline_id, timeline } => {
                match timeline {
                    Some(timeline) => {
                        self.timelines.insert(timeline_id, timeline);
                    }
                    None => {
                        self.timelines.remove(&timeline_id);
                    }
                }
                self.push_all();
            }
            Command::RefreshResources { bridge_id, device_id } => {
                match self.identified_session(&bridge_id) {
                    Some(session) => log_push(session.id(), "refreshResources", session.refresh_resources(device_id)),
                    None => debug!("refresh for {} skipped, bridge not identified", bridge_id),
                }
            }
            Command::SetKeyDisplay { device_id, identifier, key_display } => {
                let Some(bridge_id) = self.peripherals.get(&device_id).cloned() else {
                    warn!("no bridge has reported peripheral {}", device_id);
                    return;
                };
                if let Some(session) = self.identified_session(&bridge_id) {
                    log_push(
                        session.id(),
                        "peripheralSetKeyDisplay",
                        session.set_key_display(&device_id, &identifier, key_display),
                    );
                }
            }
            Command::Resources { device_id, reply } => {
                let _ = reply.send(self.resources.get(&device_id));
            }
            Command::Sessions { reply } => {
                let sessions = self
                    .sessions
                    .values()
                    .map(|s| SessionInfo {
                        bridge_id: s.bridge_id().map(str::to_string),
                        outgoing: s.is_outgoing(),
                        identified: s.identified_as().is_some(),
                        connected: s.is_connected(),
                    })
                    .collect();
                let _ = reply.send(sessions);
            }
            Command::Shutdown => {}
        }
    }

    fn next_session_id(&mut self) -> SessionId {
        let id = SessionId(self.next_session);
        self.next_session += 1;
        id
    }

    fn outgoing_session(&self, bridge_id: &str) -> Option<SessionId> {
        self.sessions
            .values()
            .find(|s| s.is_outgoing() && s.bridge_id() == Some(bridge_id))
            .map(|s| s.id())
    }

    fn identified_session(&self, bridge_id: &str) -> Option<&BridgeSession> {
        self.sessions
            .values()
            .find(|s| s.identified_as() == Some(bridge_id))
    }

    fn settings_for(&self, bridge_id: &str) -> DeviceSettings {
        self.desired
            .get(bridge_id)
            .map(|config| config.device_settings.clone())
            .unwrap_or_default()
    }

    fn set_bridges(&mut self, bridges: Vec<BridgeConfig>) {
        let desired: BTreeMap<String, BridgeConfig> =
            bridges.into_iter().map(|b| (b.id.clone(), b)).collect();

        // Outgoing sessions whose id left the config (or stopped being outgoing)
        let orphaned: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| s.is_outgoing())
            .filter(|s| {
                s.bridge_id()
                    .and_then(|id| desired.get(id))
                    .map_or(true, |config| !config.is_outgoing)
            })
            .map(|s| s.id())
            .collect();
        for session_id in orphaned {
            self.drop_session(session_id, "removed from config");
        }

        self.desired = desired;

        let outgoing: Vec<BridgeConfig> = self
            .desired
            .values()
            .filter(|config| config.is_outgoing)
            .cloned()
            .collect();
        for config in outgoing {
            if config.url.is_empty() {
                warn!("bridge {} is outgoing but has no url, skipping", config.id);
                continue;
            }
            match self.outgoing_session(&config.id) {
                None => self.dial(&config),
                Some(session_id) => {
                    let url_changed = self
                        .sessions
                        .get(&session_id)
                        .is_some_and(|s| s.url() != Some(config.url.as_str()));
                    if url_changed {
                        self.redial(session_id, &config.url);
                    }
                }
            }
        }

        // Configured bridges always have a status entry; unconfigured ones
        // only while a session holds them
        for id in self.desired.keys() {
            self.status.entry(id.clone()).or_default();
        }
        let live: Vec<String> = self
            .sessions
            .values()
            .filter_map(|s| s.bridge_id().map(str::to_string))
            .collect();
        let desired = &self.desired;
        self.status
            .retain(|id, _| desired.contains_key(id) || live.contains(id));

        self.push_all();
        self.publish_status();
    }

    fn dial(&mut self, config: &BridgeConfig) {
        info!("📞 dialing bridge {} at {}", config.id, config.url);
        let connection = self.listener.dial_out(config.url.clone());
        let session_id = self.next_session_id();
        self.pending_dials.insert(connection.id(), session_id);
        self.sessions.insert(
            session_id,
            BridgeSession::outgoing(session_id, config.id.clone(), config.url.clone(), connection),
        );
    }

    /// New url for a known bridge: same session, new link.
    fn redial(&mut self, session_id: SessionId, url: &str) {
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return;
        };
        info!(
            "bridge {} moved to {}, redialing",
            session.bridge_id().unwrap_or("?"),
            url
        );
        let bridge_id = session.bridge_id().map(str::to_string);
        let connection = self.listener.dial_out(url.to_string());
        self.pending_dials.insert(connection.id(), session_id);
        session.replace_connection(connection, url);
        self.streams.remove(&session_id);
        self.cancel_redial(session_id);
        if let Some(bridge_id) = bridge_id {
            self.release_bridge(session_id, &bridge_id);
        }
    }

    fn schedule_redial(&mut self, session_id: SessionId) {
        self.cancel_redial(session_id);
        let key = self.redials.insert(session_id, RECONNECT_INTERVAL);
        self.redial_keys.insert(session_id, key);
    }

    fn cancel_redial(&mut self, session_id: SessionId) {
        if let Some(key) = self.redial_keys.remove(&session_id) {
            self.redials.remove(&key);
        }
    }

    /// Mark a bridge disconnected unless a session other than `session_id`
    /// is identified as it.
    fn release_bridge(&mut self, session_id: SessionId, bridge_id: &str) {
        let taken = self
            .sessions
            .values()
            .any(|s| s.id() != session_id && s.identified_as() == Some(bridge_id));
        if !taken {
            self.mark_disconnected(bridge_id);
        }
    }

    fn redial_after_mismatch(&mut self, session_id: SessionId) {
        let Some(url) = self
            .sessions
            .get(&session_id)
            .and_then(|s| s.url().map(str::to_string))
        else {
            return;
        };
        self.redial(session_id, &url);
    }

    fn drop_session(&mut self, session_id: SessionId, reason: &str) {
        let Some(mut session) = self.sessions.remove(&session_id) else {
            return;
        };
        info!(
            "dropping {} ({}): {}",
            session_id,
            session.bridge_id().unwrap_or("unidentified"),
            reason
        );
        session.terminate();
        self.streams.remove(&session_id);
        self.pending_dials.retain(|_, sid| *sid != session_id);
        self.cancel_redial(session_id);
        if let Some(bridge_id) = session.bridge_id() {
            self.release_bridge(session_id, bridge_id);
        }
    }

    fn on_new_connection(&mut self, new: NewConnection) {
        let NewConnection { connection, events } = new;
        let pending = self.pending_dials.remove(&connection.id());
        if connection.is_terminated() {
            return;
        }

        let session_id = match pending {
            Some(session_id) => session_id,
            None => {
                let session_id = self.next_session_id();
                debug!("{} accepted {}", session_id, connection.id());
                self.sessions
                    .insert(session_id, BridgeSession::incoming(session_id, connection));
                session_id
            }
        };
        self.streams
            .insert(session_id, UnboundedReceiverStream::new(events));
    }

    fn on_connection_event(&mut self, session_id: SessionId, event: ConnectionEvent) {
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return;
        };

        match session.handle(event, fresh_bridge_id) {
            SessionEvent::Connected | SessionEvent::Ignored => {}
            SessionEvent::Identified { id } => self.on_identified(session_id, id),
            SessionEvent::Disconnected { id } => {
                if let Some(id) = id {
                    self.release_bridge(session_id, &id);
                }
            }
            SessionEvent::Closed => {
                self.streams.remove(&session_id);
                let bridge_id = self
                    .sessions
                    .remove(&session_id)
                    .and_then(|s| s.bridge_id().map(str::to_string));
                if let Some(bridge_id) = bridge_id {
                    let held = self.sessions.values().any(|s| s.bridge_id() == Some(bridge_id.as_str()));
                    if !held && !self.desired.contains_key(&bridge_id) {
                        self.status.remove(&bridge_id);
                    }
                }
                self.publish_status();
            }
            SessionEvent::Message { id, message } => self.on_bridge_message(session_id, &id, message),
            SessionEvent::Failed(err) => {
                warn!("{} failed: {}", session_id, err);
                let Some(session) = self.sessions.get(&session_id) else {
                    return;
                };
                let outgoing = session.is_outgoing();
                let bridge_id = session.bridge_id().map(str::to_string);
                if outgoing {
                    // Start over on a fresh link after the usual interval
                    self.streams.remove(&session_id);
                    self.schedule_redial(session_id);
                    if let Some(bridge_id) = bridge_id {
                        self.release_bridge(session_id, &bridge_id);
                    }
                }
            }
        }
    }

    fn on_identified(&mut self, session_id: SessionId, bridge_id: String) {
        // A newer session claiming the same id wins
        let older: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| s.id() != session_id && s.identified_as() == Some(bridge_id.as_str()))
            .map(|s| s.id())
            .collect();
        for old in older {
            self.drop_session(old, "superseded by a newer session");
        }

        if !self.desired.contains_key(&bridge_id) {
            debug!("bridge {} has no config, using an empty one", bridge_id);
        }

        info!("🤝 bridge {} identified on {}", bridge_id, session_id);
        self.status.entry(bridge_id.clone()).or_default().connected = true;
        let _ = self.events.send(HubEvent::BridgeConnected {
            bridge_id: bridge_id.clone(),
        });

        self.push_session(session_id);
        if let Some(session) = self.sessions.get(&session_id) {
            log_push(session_id, "getTimelineIds", session.request_timeline_ids());
        }
        self.publish_status();
    }

    fn on_bridge_message(&mut self, session_id: SessionId, bridge_id: &str, message: BridgeMessage) {
        match message {
            BridgeMessage::Status => debug!("bridge {} status ping", bridge_id),

            BridgeMessage::DeviceStatus {
                device_id,
                ok,
                message,
                connection_epoch,
            } => {
                debug!("bridge {} device {} ok={} {}", bridge_id, device_id, ok, message);
                let devices = &mut self.status.entry(bridge_id.to_string()).or_default().devices;
                let previous = devices.insert(
                    device_id.clone(),
                    DeviceStatus {
                        ok,
                        message,
                        connection_epoch,
                    },
                );
                let epoch_changed = previous.is_some_and(|p| p.connection_epoch != connection_epoch);
                if epoch_changed {
                    debug!("device {} reconnected (epoch {}), refreshing", device_id, connection_epoch);
                    if let Some(session) = self.sessions.get(&session_id) {
                        log_push(session_id, "refreshResources", session.refresh_resources(Some(device_id)));
                    }
                }
                self.publish_status();
            }

            BridgeMessage::DeviceRemoved { device_id } => {
                info!("bridge {} removed device {}", bridge_id, device_id);
                if let Some(status) = self.status.get_mut(bridge_id) {
                    status.devices.remove(&device_id);
                }
                if self.peripherals.get(&device_id).map(String::as_str) == Some(bridge_id) {
                    self.peripherals.remove(&device_id);
                }
                if let Some(delta) = self.resources.remove(bridge_id, &device_id) {
                    let _ = self.events.send(HubEvent::ResourcesChanged {
                        bridge_id: bridge_id.to_string(),
                        device_id,
                        delta,
                    });
                }
                self.publish_status();
            }

            BridgeMessage::UpdatedResources { device_id, resources } => {
                let delta = self.resources.update(bridge_id, &device_id, resources);
                debug!(
                    "device {} resources: +{} -{}",
                    device_id,
                    delta.added.len(),
                    delta.removed.len()
                );
                let _ = self.events.send(HubEvent::ResourcesChanged {
                    bridge_id: bridge_id.to_string(),
                    device_id,
                    delta,
                });
            }

            BridgeMessage::TimelineIds { timeline_ids } => {
                let Some(session) = self.sessions.get_mut(&session_id) else {
                    return;
                };
                for timeline_id in timeline_ids {
                    if !self.timelines.contains_key(&timeline_id) {
                        debug!("bridge {} holds stale timeline {}", bridge_id, timeline_id);
                        log_push(session_id, "removeTimeline", session.discard_timeline(&timeline_id));
                    }
                }
            }

            BridgeMessage::PeripheralStatus { device_id, info, status } => {
                self.peripherals
                    .insert(device_id.clone(), bridge_id.to_string());
                let _ = self.events.send(HubEvent::PeripheralStatus {
                    bridge_id: bridge_id.to_string(),
                    device_id,
                    info,
                    status,
                });
            }

            BridgeMessage::PeripheralTrigger { device_id, trigger, identifier } => {
                let _ = self.events.send(HubEvent::PeripheralTrigger {
                    bridge_id: bridge_id.to_string(),
                    device_id,
                    trigger,
                    identifier,
                });
            }

            BridgeMessage::DeviceRefreshStatus { device_id, refreshing } => {
                let _ = self.events.send(HubEvent::DeviceRefreshStatus {
                    bridge_id: bridge_id.to_string(),
                    device_id,
                    refreshing,
                });
            }

            BridgeMessage::InitRequestId | BridgeMessage::Init { .. } => {}
        }
    }

    fn mark_disconnected(&mut self, bridge_id: &str) {
        if let Some(status) = self.status.get_mut(bridge_id) {
            if status.connected {
                info!("💔 bridge {} disconnected", bridge_id);
                let _ = self.events.send(HubEvent::BridgeDisconnected {
                    bridge_id: bridge_id.to_string(),
                });
            }
            status.mark_disconnected();
        }
        self.publish_status();
    }

    /// Push settings, mappings and timelines to one session. Unchanged
    /// values are skipped by the session's caches.
    fn push_session(&mut self, session_id: SessionId) {
        let Some(bridge_id) = self
            .sessions
            .get(&session_id)
            .and_then(|s| s.identified_as().map(str::to_string))
        else {
            return;
        };
        let settings = self.settings_for(&bridge_id);
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return;
        };

        log_push(session_id, "setSettings", session.push_settings(&settings));
        log_push(session_id, "setMappings", session.push_mappings(&self.mappings));
        log_push(session_id, "timelines", session.sync_timelines(&self.timelines));
    }

    fn push_all(&mut self) {
        let identified: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| s.identified_as().is_some())
            .map(|s| s.id())
            .collect();
        for session_id in identified {
            self.push_session(session_id);
        }
    }

    fn publish_status(&self) {
        self.status_tx.send_if_modified(|current| {
            if *current == self.status {
                false
            } else {
                *current = self.status.clone();
                true
            }
        });
    }
}

/// Pushes to a bridge whose link just dropped are expected; the caches make
/// sure the value goes out after the next handshake.
fn log_push<T>(session_id: SessionId, what: &str, result: Result<T, SessionError>) {
    match result {
        Ok(_) => {}
        Err(e) if e.is_not_connected() => debug!("{} {} deferred: not connected", session_id, what),
        Err(e) => warn!("{} {} failed: {}", session_id, what, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_ids_are_unique() {
        let a = fresh_bridge_id();
        assert!(a.starts_with("bridge-"));
        assert_ne!(a, fresh_bridge_id());
    }
}
