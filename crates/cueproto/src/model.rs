//! Shared data model: device settings, mappings, timelines and resources.
//!
//! Device- and kind-specific fields are opaque JSON. Equality is deep value
//! equality, which is what the hub's push caches compare on.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Device options as configured by the editor. The `type` field selects the
/// device kind on the bridge; everything else is kind-specific.
pub type DeviceOptions = Value;

/// Device settings for one bridge, keyed by device id.
pub type DeviceSettings = BTreeMap<String, DeviceOptions>;

/// All mappings, keyed by layer id.
pub type Mappings = BTreeMap<String, Mapping>;

/// A timeline: timed objects in order.
pub type Timeline = Vec<TimelineObject>;

/// Assignment of a timing layer to a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mapping {
    pub device_id: String,
    /// Device-specific layer parameters (channel, layer number, scene...).
    #[serde(flatten)]
    pub layer_specifics: Map<String, Value>,
}

impl Mapping {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            layer_specifics: Map::new(),
        }
    }
}

/// One timed object. Resolution of `enable` into concrete instances is done
/// by an external resolver; the protocol only moves these around.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineObject {
    pub id: String,
    pub layer: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl TimelineObject {
    pub fn new(id: impl Into<String>, layer: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            layer: layer.into(),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }
}

/// A discoverable item on a device (media clip, template, scene...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub id: String,
    pub device_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Resource {
    pub fn new(
        id: impl Into<String>,
        device_id: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            device_id: device_id.into(),
            display_name: display_name.into(),
            fields: Map::new(),
        }
    }
}

/// Connectivity of a peripheral as reported by its bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PeripheralConnection {
    Connected,
    Disconnected,
}

/// A key event on a peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PeripheralTriggerKind {
    KeyDown,
    KeyUp,
}

/// Milliseconds since the Unix epoch, as carried in `currentTime`.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
