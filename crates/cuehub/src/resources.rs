//! Per-device resource sets and the deltas between reports.

use std::collections::{BTreeMap, HashSet};

use cueproto::Resource;
use serde::Serialize;

/// Change between two resource reports, compared by resource id.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResourceDelta {
    pub added: Vec<Resource>,
    pub removed: Vec<Resource>,
}

impl ResourceDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// `added = current - previous`, `removed = previous - current`, by id.
/// Order follows the input lists.
pub fn diff(previous: &[Resource], current: &[Resource]) -> ResourceDelta {
    let before: HashSet<&str> = previous.iter().map(|r| r.id.as_str()).collect();
    let after: HashSet<&str> = current.iter().map(|r| r.id.as_str()).collect();

    ResourceDelta {
        added: current
            .iter()
            .filter(|r| !before.contains(r.id.as_str()))
            .cloned()
            .collect(),
        removed: previous
            .iter()
            .filter(|r| !after.contains(r.id.as_str()))
            .cloned()
            .collect(),
    }
}

/// Latest resource set of every device, per bridge. Two bridges may use
/// the same device id; their sets are kept apart.
#[derive(Debug, Default)]
pub struct ResourceStore {
    devices: BTreeMap<(String, String), Vec<Resource>>,
}

impl ResourceStore {
    /// Replace a device's set. The first report for a device is the
    /// baseline and yields an empty delta.
    pub fn update(&mut self, bridge_id: &str, device_id: &str, resources: Vec<Resource>) -> ResourceDelta {
        let key = (bridge_id.to_string(), device_id.to_string());
        let delta = match self.devices.get(&key) {
            Some(previous) => diff(previous, &resources),
            None => ResourceDelta::default(),
        };
        self.devices.insert(key, resources);
        delta
    }

    /// Forget a bridge's device. Everything it had counts as removed.
    pub fn remove(&mut self, bridge_id: &str, device_id: &str) -> Option<ResourceDelta> {
        self.devices
            .remove(&(bridge_id.to_string(), device_id.to_string()))
            .map(|resources| ResourceDelta {
                added: Vec::new(),
                removed: resources,
            })
    }

    /// Resources of `device_id` on every bridge that reported it.
    pub fn get(&self, device_id: &str) -> Vec<Resource> {
        self.devices
            .iter()
            .filter(|((_, id), _)| id == device_id)
            .flat_map(|(_, resources)| resources.iter().cloned())
            .collect()
    }
}
