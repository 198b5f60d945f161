//! Wire messages, one closed union per direction.
//!
//! Every frame is a standalone JSON object with a `type` discriminator.
//! Frames are decoded once at the transport boundary; everything past that
//! point matches on these enums.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::model::{
    DeviceSettings, Mappings, PeripheralConnection, PeripheralTriggerKind, Resource, Timeline,
};

/// Errors turning frames into messages and back.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Messages a bridge sends to the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BridgeMessage {
    /// The bridge has no id and asks the hub to assign one.
    InitRequestId,

    /// Self-identification, sent after connecting or after `setId`.
    Init {
        id: String,
        version: String,
        /// True when the bridge dialed the hub.
        incoming: bool,
    },

    Status,

    #[serde(rename_all = "camelCase")]
    DeviceStatus {
        device_id: String,
        ok: bool,
        message: String,
        /// Advanced by the bridge every time the device's own link reconnects.
        #[serde(default)]
        connection_epoch: u64,
    },

    #[serde(rename_all = "camelCase")]
    DeviceRemoved { device_id: String },

    #[serde(rename_all = "camelCase")]
    UpdatedResources {
        device_id: String,
        resources: Vec<Resource>,
    },

    #[serde(rename_all = "camelCase")]
    TimelineIds { timeline_ids: Vec<String> },

    #[serde(rename = "PeripheralStatus", rename_all = "camelCase")]
    PeripheralStatus {
        device_id: String,
        #[serde(default)]
        info: Value,
        status: PeripheralConnection,
    },

    #[serde(rename = "PeripheralTrigger", rename_all = "camelCase")]
    PeripheralTrigger {
        device_id: String,
        trigger: PeripheralTriggerKind,
        identifier: String,
    },

    #[serde(rename = "DeviceRefreshStatus", rename_all = "camelCase")]
    DeviceRefreshStatus { device_id: String, refreshing: bool },
}

/// Messages the hub sends to a bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HubMessage {
    SetId { id: String },

    SetSettings { devices: DeviceSettings },

    #[serde(rename_all = "camelCase")]
    AddTimeline {
        timeline_id: String,
        timeline: Timeline,
        current_time: i64,
    },

    #[serde(rename_all = "camelCase")]
    RemoveTimeline {
        timeline_id: String,
        current_time: i64,
    },

    GetTimelineIds,

    #[serde(rename_all = "camelCase")]
    SetMappings {
        mappings: Mappings,
        current_time: i64,
    },

    /// Absent `device_id` means every device on the bridge.
    #[serde(rename_all = "camelCase")]
    RefreshResources {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    PeripheralSetKeyDisplay {
        device_id: String,
        identifier: String,
        key_display: Value,
    },
}

impl BridgeMessage {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Decode)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    /// Wire name, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeMessage::InitRequestId => "initRequestId",
            BridgeMessage::Init { .. } => "init",
            BridgeMessage::Status => "status",
            BridgeMessage::DeviceStatus { .. } => "deviceStatus",
            BridgeMessage::DeviceRemoved { .. } => "deviceRemoved",
            BridgeMessage::UpdatedResources { .. } => "updatedResources",
            BridgeMessage::TimelineIds { .. } => "timelineIds",
            BridgeMessage::PeripheralStatus { .. } => "PeripheralStatus",
            BridgeMessage::PeripheralTrigger { .. } => "PeripheralTrigger",
            BridgeMessage::DeviceRefreshStatus { .. } => "DeviceRefreshStatus",
        }
    }
}

impl HubMessage {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Decode)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    /// Wire name, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            HubMessage::SetId { .. } => "setId",
            HubMessage::SetSettings { .. } => "setSettings",
            HubMessage::AddTimeline { .. } => "addTimeline",
            HubMessage::RemoveTimeline { .. } => "removeTimeline",
            HubMessage::GetTimelineIds => "getTimelineIds",
            HubMessage::SetMappings { .. } => "setMappings",
            HubMessage::RefreshResources { .. } => "refreshResources",
            HubMessage::PeripheralSetKeyDisplay { .. } => "peripheralSetKeyDisplay",
        }
    }
}
