//! Infrastructure configuration - things that cannot change at runtime.

use serde::{Deserialize, Serialize};

/// Network listen ports for this process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BindConfig {
    /// Port the hub listens on for bridges that dial in.
    /// Default: 5400
    #[serde(default = "BindConfig::default_hub_port")]
    pub hub_port: u16,

    /// Port a bridge listens on for a hub that dials out to it.
    /// Default: 5401
    #[serde(default = "BindConfig::default_bridge_port")]
    pub bridge_port: u16,

    /// HTTP port for the hub's read-only status endpoint. 0 disables it.
    /// Default: 5480
    #[serde(default = "BindConfig::default_http_port")]
    pub http_port: u16,
}

impl BindConfig {
    fn default_hub_port() -> u16 {
        5400
    }

    fn default_bridge_port() -> u16 {
        5401
    }

    fn default_http_port() -> u16 {
        5480
    }
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            hub_port: Self::default_hub_port(),
            bridge_port: Self::default_bridge_port(),
            http_port: Self::default_http_port(),
        }
    }
}

/// Telemetry and observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryConfig {
    /// OTLP gRPC endpoint for OpenTelemetry. Empty disables export.
    /// Default: ""
    #[serde(default)]
    pub otlp_endpoint: String,

    /// Log level or filter directive (trace, debug, info, warn, error).
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }

    /// Whether OTLP export should be set up at all.
    pub fn otlp_enabled(&self) -> bool {
        !self.otlp_endpoint.trim().is_empty()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: String::new(),
            log_level: Self::default_log_level(),
        }
    }
}

/// All infrastructure configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct InfraConfig {
    #[serde(default)]
    pub bind: BindConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}
