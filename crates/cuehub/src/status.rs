//! Runtime status and the events the orchestrator publishes.

use std::collections::BTreeMap;

use cueproto::{DeviceSettings, PeripheralConnection, PeripheralTriggerKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::resources::ResourceDelta;

/// Message given to devices of a bridge whose link is down.
pub const BRIDGE_NOT_CONNECTED: &str = "bridge not connected";

/// A bridge the hub should know about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    pub id: String,
    /// Dial target when `is_outgoing`; may be empty otherwise.
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub is_outgoing: bool,
    #[serde(default)]
    pub device_settings: DeviceSettings,
}

impl BridgeConfig {
    /// A bridge the hub dials.
    pub fn outgoing(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            is_outgoing: true,
            device_settings: DeviceSettings::new(),
        }
    }

    /// A bridge that dials the hub.
    pub fn incoming(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: String::new(),
            is_outgoing: false,
            device_settings: DeviceSettings::new(),
        }
    }

    pub fn with_device(mut self, device_id: impl Into<String>, options: Value) -> Self {
        self.device_settings.insert(device_id.into(), options);
        self
    }
}

impl From<&cueconf::DesiredBridgeConfig> for BridgeConfig {
    fn from(config: &cueconf::DesiredBridgeConfig) -> Self {
        Self {
            id: config.id.clone(),
            url: config.url.clone(),
            is_outgoing: config.outgoing,
            device_settings: config.devices.clone(),
        }
    }
}

/// Last reported state of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub ok: bool,
    pub message: String,
    pub connection_epoch: u64,
}

/// Transient status of one bridge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeRuntimeStatus {
    pub connected: bool,
    pub devices: BTreeMap<String, DeviceStatus>,
}

impl BridgeRuntimeStatus {
    /// Link down: every device is stale until the bridge reports again.
    /// Epochs are kept so a change across the gap is still noticed.
    pub fn mark_disconnected(&mut self) {
        self.connected = false;
        for device in self.devices.values_mut() {
            device.ok = false;
            device.message = BRIDGE_NOT_CONNECTED.to_string();
        }
    }
}

/// Status of every known bridge, keyed by bridge id.
pub type HubStatus = BTreeMap<String, BridgeRuntimeStatus>;

/// Aggregated events from all bridges.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubEvent {
    BridgeConnected {
        bridge_id: String,
    },
    BridgeDisconnected {
        bridge_id: String,
    },
    ResourcesChanged {
        bridge_id: String,
        device_id: String,
        delta: ResourceDelta,
    },
    PeripheralStatus {
        bridge_id: String,
        device_id: String,
        info: Value,
        status: PeripheralConnection,
    },
    PeripheralTrigger {
        bridge_id: String,
        device_id: String,
        trigger: PeripheralTriggerKind,
        identifier: String,
    },
    DeviceRefreshStatus {
        bridge_id: String,
        device_id: String,
        refreshing: bool,
    },
}

/// One live session, as seen from outside the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub bridge_id: Option<String>,
    pub outgoing: bool,
    pub identified: bool,
    pub connected: bool,
}
