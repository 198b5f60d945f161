//! Bootstrap configuration - seeds runtime state, then runtime owns it.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::ConfigError;

/// Identity of a bridge process.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct BridgeIdentityConfig {
    /// Bridge id. When unset, the bridge asks the hub to assign one.
    #[serde(default)]
    pub id: Option<String>,

    /// Hub URL to dial (e.g. "ws://hub.local:5400"). When unset, the bridge
    /// only listens and waits for the hub to dial it.
    #[serde(default)]
    pub hub_url: Option<String>,
}

/// One entry of the hub's desired bridge set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DesiredBridgeConfig {
    pub id: String,

    /// Where the hub dials this bridge. Only used when `outgoing` is set.
    #[serde(default)]
    pub url: String,

    /// The hub dials `url` when true; otherwise the bridge dials the hub.
    #[serde(default)]
    pub outgoing: bool,

    /// Device options keyed by device id. Opaque to the hub.
    #[serde(default)]
    pub devices: BTreeMap<String, serde_json::Value>,
}

/// All bootstrap configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct BootstrapConfig {
    /// Identity used when running as a bridge.
    #[serde(default)]
    pub bridge: BridgeIdentityConfig,

    /// Initial desired bridges when running as the hub.
    #[serde(default)]
    pub bridges: Vec<DesiredBridgeConfig>,
}

impl BootstrapConfig {
    /// Reject entries the orchestrator could never reconcile.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for bridge in &self.bridges {
            if bridge.id.trim().is_empty() {
                return Err(ConfigError::InvalidBridge {
                    id: bridge.id.clone(),
                    message: "id must not be empty".to_string(),
                });
            }
            if !seen.insert(bridge.id.as_str()) {
                return Err(ConfigError::InvalidBridge {
                    id: bridge.id.clone(),
                    message: "duplicate id".to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bridge(id: &str) -> DesiredBridgeConfig {
        DesiredBridgeConfig {
            id: id.to_string(),
            url: String::new(),
            outgoing: false,
            devices: BTreeMap::new(),
        }
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let config = BootstrapConfig {
            bridge: BridgeIdentityConfig::default(),
            bridges: vec![bridge("b1"), bridge("b1")],
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBridge { .. })
        ));
    }

    #[test]
    fn empty_id_is_rejected() {
        let config = BootstrapConfig {
            bridge: BridgeIdentityConfig::default(),
            bridges: vec![bridge(" ")],
        };
        assert!(config.validate().is_err());
    }
}
