//! What the hub wants played out.
//!
//! Mappings, timelines and key displays pushed by the hub are kept here and
//! published on a watch channel. Resolving timelines into device commands is
//! the job of whatever subscribes.

use std::collections::BTreeMap;

use cueproto::{Mappings, Timeline};
use serde_json::Value;
use tokio::sync::watch;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlayoutState {
    pub mappings: Mappings,
    pub timelines: BTreeMap<String, Timeline>,
    /// Peripheral device id -> key identifier -> display.
    pub key_displays: BTreeMap<String, BTreeMap<String, Value>>,
    /// `currentTime` of the last timed push, hub clock in ms.
    pub hub_time: Option<i64>,
}

pub struct PlayoutStore {
    tx: watch::Sender<PlayoutState>,
}

impl Default for PlayoutStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PlayoutStore {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(PlayoutState::default());
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<PlayoutState> {
        self.tx.subscribe()
    }

    #[cfg(test)]
    pub fn snapshot(&self) -> PlayoutState {
        self.tx.borrow().clone()
    }

    pub fn set_mappings(&self, mappings: Mappings, current_time: i64) {
        self.tx.send_modify(|state| {
            state.mappings = mappings;
            state.hub_time = Some(current_time);
        });
    }

    pub fn add_timeline(&self, timeline_id: String, timeline: Timeline, current_time: i64) {
        self.tx.send_modify(|state| {
            state.timelines.insert(timeline_id, timeline);
            state.hub_time = Some(current_time);
        });
    }

    pub fn remove_timeline(&self, timeline_id: &str, current_time: i64) {
        self.tx.send_modify(|state| {
            state.timelines.remove(timeline_id);
            state.hub_time = Some(current_time);
        });
    }

    pub fn set_key_display(&self, device_id: String, identifier: String, key_display: Value) {
        self.tx.send_modify(|state| {
            state
                .key_displays
                .entry(device_id)
                .or_default()
                .insert(identifier, key_display);
        });
    }

    pub fn timeline_ids(&self) -> Vec<String> {
        self.tx.borrow().timelines.keys().cloned().collect()
    }
}
