//! WorkerDeviceManager: reconciles live devices against pushed settings.
//!
//! One task owns the device map. Creating a device can take a while (a
//! driver may connect to hardware first), so creations run on their own
//! tasks and report back tagged with a generation. A creation whose slot was
//! replaced or removed in the meantime is closed instead of installed.
//!
//! Everything the hub should hear about (status changes, removals, resource
//! refreshes) comes out of the manager as ready-to-send `BridgeMessage`s.

use std::collections::BTreeMap;
use std::sync::Arc;

use cueproto::{BridgeMessage, DeviceOptions, DeviceSettings, Resource};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::device::{Device, DeviceError, DeviceFactory, DeviceHealth, HealthReport, HealthReporter};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("device manager is not running")]
    Stopped,
}

#[derive(Debug)]
enum Command {
    ApplySettings(DeviceSettings),
    /// `None` refreshes every device.
    Refresh(Option<String>),
    Statuses(oneshot::Sender<Vec<BridgeMessage>>),
    Shutdown,
}

/// Completions of work spawned by the manager.
enum Completion {
    Created {
        device_id: String,
        generation: u64,
        result: Result<Arc<dyn Device>, DeviceError>,
    },
    Refreshed {
        device_id: String,
        generation: u64,
        result: Result<Vec<Resource>, DeviceError>,
    },
}

/// Cloneable front door to a running manager.
#[derive(Debug, Clone)]
pub struct ManagerHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl ManagerHandle {
    fn command(&self, command: Command) -> Result<(), ManagerError> {
        self.commands.send(command).map_err(|_| ManagerError::Stopped)
    }

    /// Replace the device settings.
    pub fn apply_settings(&self, settings: DeviceSettings) -> Result<(), ManagerError> {
        self.command(Command::ApplySettings(settings))
    }

    pub fn refresh_resources(&self, device_id: Option<String>) -> Result<(), ManagerError> {
        self.command(Command::Refresh(device_id))
    }

    /// A `deviceStatus` message for every configured device.
    pub async fn statuses(&self) -> Result<Vec<BridgeMessage>, ManagerError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Statuses(reply))?;
        rx.await.map_err(|_| ManagerError::Stopped)
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

struct Slot {
    generation: u64,
    options: DeviceOptions,
    device: Option<Arc<dyn Device>>,
    health: DeviceHealth,
    epoch: u64,
    has_been_ok: bool,
    refreshing: bool,
    refresh_pending: bool,
}

pub struct DeviceManager {
    factory: Arc<dyn DeviceFactory>,
    commands: mpsc::UnboundedReceiver<Command>,
    health_tx: mpsc::UnboundedSender<HealthReport>,
    health_rx: mpsc::UnboundedReceiver<HealthReport>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    output: mpsc::UnboundedSender<BridgeMessage>,
    slots: BTreeMap<String, Slot>,
    next_generation: u64,
}

impl DeviceManager {
    /// Build a manager. Messages for the hub come out of the returned
    /// receiver.
    pub fn new(
        factory: Arc<dyn DeviceFactory>,
    ) -> (Self, ManagerHandle, mpsc::UnboundedReceiver<BridgeMessage>) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (health_tx, health_rx) = mpsc::unbounded_channel();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (output, output_rx) = mpsc::unbounded_channel();

        let manager = Self {
            factory,
            commands,
            health_tx,
            health_rx,
            completions_tx,
            completions_rx,
            output,
            slots: BTreeMap::new(),
            next_generation: 1,
        };
        let handle = ManagerHandle { commands: commands_tx };
        (manager, handle, output_rx)
    }

    pub fn spawn(
        factory: Arc<dyn DeviceFactory>,
    ) -> (ManagerHandle, mpsc::UnboundedReceiver<BridgeMessage>, JoinHandle<()>) {
        let (manager, handle, output) = Self::new(factory);
        let task = tokio::spawn(manager.run());
        (handle, output, task)
    }

    pub async fn run(mut self) {
        info!("🔌 device manager running");
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.on_command(command),
                },
                Some(report) = self.health_rx.recv() => self.on_health(report),
                Some(completion) = self.completions_rx.recv() => self.on_completion(completion),
            }
        }

        info!("device manager stopping, closing {} devices", self.slots.len());
        for (_, slot) in std::mem::take(&mut self.slots) {
            if let Some(device) = slot.device {
                device.close().await;
            }
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::ApplySettings(settings) => self.apply_settings(settings),
            Command::Refresh(Some(device_id)) => self.refresh(&device_id),
            Command::Refresh(None) => {
                let ids: Vec<String> = self.slots.keys().cloned().collect();
                for device_id in ids {
                    self.refresh(&device_id);
                }
            }
            Command::Statuses(reply) => {
                let statuses = self
                    .slots
                    .iter()
                    .map(|(device_id, slot)| status_message(device_id, slot))
                    .collect();
                let _ = reply.send(statuses);
            }
            Command::Shutdown => {}
        }
    }

    fn apply_settings(&mut self, settings: DeviceSettings) {
        let gone: Vec<String> = self
            .slots
            .keys()
            .filter(|id| !settings.contains_key(*id))
            .cloned()
            .collect();
        for device_id in gone {
            if let Some(slot) = self.slots.remove(&device_id) {
                info!("removing device {}", device_id);
                close_in_background(slot.device);
                self.emit(BridgeMessage::DeviceRemoved { device_id });
            }
        }

        for (device_id, options) in settings {
            let previous = match self.slots.get(&device_id) {
                Some(slot) if slot.options == options => continue,
                Some(_) => {
                    info!("device {} changed, recreating", device_id);
                    self.slots.remove(&device_id)
                }
                None => {
                    info!("adding device {}", device_id);
                    None
                }
            };
            self.create(device_id, options, previous);
        }
    }

    /// Start creating a device. A replaced slot hands its epoch on so the
    /// hub keeps seeing one counter per device id.
    fn create(&mut self, device_id: String, options: DeviceOptions, previous: Option<Slot>) {
        let generation = self.next_generation;
        self.next_generation += 1;

        let (epoch, has_been_ok) = match previous {
            Some(slot) => {
                close_in_background(slot.device);
                (slot.epoch, slot.has_been_ok)
            }
            None => (0, false),
        };

        let slot = Slot {
            generation,
            options: options.clone(),
            device: None,
            health: DeviceHealth::bad("Initializing"),
            epoch,
            has_been_ok,
            refreshing: false,
            refresh_pending: false,
        };
        self.emit(status_message(&device_id, &slot));
        self.slots.insert(device_id.clone(), slot);

        let factory = self.factory.clone();
        let reporter = HealthReporter::new(device_id.clone(), generation, self.health_tx.clone());
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let result = factory.create(&device_id, &options, reporter).await;
            let _ = completions.send(Completion::Created {
                device_id,
                generation,
                result,
            });
        });
    }

    fn on_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Created {
                device_id,
                generation,
                result,
            } => self.on_created(device_id, generation, result),
            Completion::Refreshed {
                device_id,
                generation,
                result,
            } => self.on_refreshed(device_id, generation, result),
        }
    }

    fn on_created(&mut self, device_id: String, generation: u64, result: Result<Arc<dyn Device>, DeviceError>) {
        let Some(slot) = self.current_slot(&device_id, generation) else {
            debug!("creation of {} superseded", device_id);
            if let Ok(device) = result {
                close_in_background(Some(device));
            }
            return;
        };

        match result {
            Ok(device) => {
                debug!("device {} created", device_id);
                slot.device = Some(device);
                if slot.refresh_pending {
                    self.refresh(&device_id);
                }
            }
            Err(e) => {
                warn!("failed to create device {}: {}", device_id, e);
                self.set_health(&device_id, DeviceHealth::bad(format!("Failed to create device: {}", e)));
            }
        }
    }

    fn on_health(&mut self, report: HealthReport) {
        if self.current_slot(&report.device_id, report.generation).is_none() {
            debug!("stale status from {}", report.device_id);
            return;
        }
        self.set_health(&report.device_id, report.health);
    }

    /// Record a health change, report it, and refresh on a bad to good flip.
    fn set_health(&mut self, device_id: &str, health: DeviceHealth) {
        let Some(slot) = self.slots.get_mut(device_id) else {
            return;
        };
        if slot.health == health {
            return;
        }

        let recovered = !slot.health.ok && health.ok;
        if recovered {
            if slot.has_been_ok {
                slot.epoch += 1;
            }
            slot.has_been_ok = true;
        }
        slot.health = health;

        let message = status_message(device_id, slot);
        self.emit(message);

        if recovered {
            self.refresh(device_id);
        }
    }

    fn refresh(&mut self, device_id: &str) {
        let Some(slot) = self.slots.get_mut(device_id) else {
            debug!("refresh for unknown device {}", device_id);
            return;
        };
        let device = match &slot.device {
            Some(device) if !slot.refreshing => device.clone(),
            _ => {
                // Runs once the device is installed or the current refresh ends
                slot.refresh_pending = true;
                return;
            }
        };
        slot.refreshing = true;
        slot.refresh_pending = false;
        let generation = slot.generation;

        self.emit(BridgeMessage::DeviceRefreshStatus {
            device_id: device_id.to_string(),
            refreshing: true,
        });

        let device_id = device_id.to_string();
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let result = device.resources().await;
            let _ = completions.send(Completion::Refreshed {
                device_id,
                generation,
                result,
            });
        });
    }

    fn on_refreshed(&mut self, device_id: String, generation: u64, result: Result<Vec<Resource>, DeviceError>) {
        let Some(slot) = self.current_slot(&device_id, generation) else {
            debug!("refresh of {} superseded", device_id);
            return;
        };
        slot.refreshing = false;
        let again = slot.refresh_pending;

        match result {
            Ok(resources) => {
                debug!("device {} has {} resources", device_id, resources.len());
                self.emit(BridgeMessage::UpdatedResources {
                    device_id: device_id.clone(),
                    resources,
                });
            }
            Err(e) => {
                warn!("resource refresh of {} failed: {}", device_id, e);
                self.set_health(&device_id, DeviceHealth::bad(format!("Resource refresh failed: {}", e)));
            }
        }
        self.emit(BridgeMessage::DeviceRefreshStatus {
            device_id: device_id.clone(),
            refreshing: false,
        });

        if again {
            self.refresh(&device_id);
        }
    }

    fn current_slot(&mut self, device_id: &str, generation: u64) -> Option<&mut Slot> {
        self.slots
            .get_mut(device_id)
            .filter(|slot| slot.generation == generation)
    }

    fn emit(&self, message: BridgeMessage) {
        if self.output.send(message).is_err() {
            debug!("no consumer for device manager output");
        }
    }
}

fn status_message(device_id: &str, slot: &Slot) -> BridgeMessage {
    BridgeMessage::DeviceStatus {
        device_id: device_id.to_string(),
        ok: slot.health.ok,
        message: slot.health.message.clone(),
        connection_epoch: slot.epoch,
    }
}

fn close_in_background(device: Option<Arc<dyn Device>>) {
    if let Some(device) = device {
        tokio::spawn(async move { device.close().await });
    }
}
