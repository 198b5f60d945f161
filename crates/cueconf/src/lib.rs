//! Configuration loading for the cue hub and bridge processes.
//!
//! Both binaries import this crate, so it stays free of any protocol or
//! runtime dependency.
//!
//! # Configuration Philosophy
//!
//! Configuration is split into two categories:
//!
//! - **Infrastructure** (`InfraConfig`): things that cannot change at
//!   runtime - listen ports and telemetry.
//!
//! - **Bootstrap** (`BootstrapConfig`): initial values that seed runtime
//!   state. The hub's desired bridges start here, but after startup the
//!   orchestrator is the source of truth and the editor layer mutates it.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/cue/config.toml` (system)
//! 2. `~/.config/cue/config.toml` (user)
//! 3. `./cue.toml` (local override, replaced by `--config` when given)
//! 4. Environment variables (`CUE_*`)
//!
//! # Example Config
//!
//! ```toml
//! [bind]
//! hub_port = 5400
//! bridge_port = 5401
//! http_port = 5480
//!
//! [telemetry]
//! log_level = "info"
//! otlp_endpoint = ""
//!
//! [bootstrap.bridge]
//! id = "studio-a"
//! hub_url = "ws://hub.local:5400"
//!
//! [[bootstrap.bridges]]
//! id = "studio-b"
//! url = "ws://10.0.0.12:5401"
//! outgoing = true
//!
//! [bootstrap.bridges.devices.ccg0]
//! type = "virtual"
//! ```

pub mod bootstrap;
pub mod infra;
pub mod loader;

pub use bootstrap::{BootstrapConfig, BridgeIdentityConfig, DesiredBridgeConfig};
pub use infra::{BindConfig, InfraConfig, TelemetryConfig};
pub use loader::{discover_config_files_with_override, ConfigSources};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid bridge entry '{id}': {message}")]
    InvalidBridge { id: String, message: String },
}

/// Complete configuration for either process.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CueConfig {
    /// Infrastructure - cannot change at runtime.
    #[serde(flatten)]
    pub infra: InfraConfig,

    /// Bootstrap - seeds runtime state.
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
}

impl CueConfig {
    /// Load configuration from all sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration from a specific file path, then apply env overrides.
    ///
    /// If `config_path` is provided, it takes precedence over the local
    /// `./cue.toml` override. System and user configs still load first.
    pub fn load_from(config_path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration from optional path and return information about sources.
    pub fn load_with_sources_from(
        config_path: Option<&std::path::Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut config = CueConfig::default();

        for path in loader::discover_config_files_with_override(config_path) {
            let file_config = loader::load_from_file(&path)?;
            loader::overlay(&mut config, file_config);
            sources.files.push(path);
        }

        loader::apply_env_overrides(&mut config, &mut sources);
        config.bootstrap.validate()?;

        Ok((config, sources))
    }
}
