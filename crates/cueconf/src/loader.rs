//! Config file discovery, loading, and environment variable overlay.

use crate::{BootstrapConfig, ConfigError, CueConfig};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// A single config file. Every field is optional so that a file only
/// overrides what it actually names.
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    bind: Option<FileBind>,
    #[serde(default)]
    telemetry: Option<FileTelemetry>,
    #[serde(default)]
    bootstrap: Option<FileBootstrap>,
}

#[derive(Debug, Default, Deserialize)]
struct FileBind {
    hub_port: Option<u16>,
    bridge_port: Option<u16>,
    http_port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
struct FileTelemetry {
    otlp_endpoint: Option<String>,
    log_level: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FileBootstrap {
    bridge: Option<crate::BridgeIdentityConfig>,
    bridges: Option<Vec<crate::DesiredBridgeConfig>>,
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
/// Returns paths in load order (system, user, local/cli).
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/cue/config.toml");
    if system.exists() {
        files.push(system);
    }

    // User config (XDG_CONFIG_HOME or ~/.config)
    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("cue/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("cue.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Load one config file.
pub fn load_from_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    parse_toml(&contents, path)
}

fn parse_toml(contents: &str, path: &Path) -> Result<FileConfig, ConfigError> {
    toml::from_str(contents).map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Apply a loaded file on top of `config`. Values present in the file win.
pub fn overlay(config: &mut CueConfig, file: FileConfig) {
    if let Some(bind) = file.bind {
        if let Some(v) = bind.hub_port {
            config.infra.bind.hub_port = v;
        }
        if let Some(v) = bind.bridge_port {
            config.infra.bind.bridge_port = v;
        }
        if let Some(v) = bind.http_port {
            config.infra.bind.http_port = v;
        }
    }

    if let Some(telemetry) = file.telemetry {
        if let Some(v) = telemetry.otlp_endpoint {
            config.infra.telemetry.otlp_endpoint = v;
        }
        if let Some(v) = telemetry.log_level {
            config.infra.telemetry.log_level = v;
        }
    }

    if let Some(FileBootstrap { bridge, bridges }) = file.bootstrap {
        let BootstrapConfig {
            bridge: current_bridge,
            bridges: current_bridges,
        } = &mut config.bootstrap;
        if let Some(identity) = bridge {
            if identity.id.is_some() {
                current_bridge.id = identity.id;
            }
            if identity.hub_url.is_some() {
                current_bridge.hub_url = identity.hub_url;
            }
        }
        // A later file's bridge list replaces the earlier one wholesale.
        if let Some(list) = bridges {
            *current_bridges = list;
        }
    }
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut CueConfig, sources: &mut ConfigSources) {
    apply_overrides_from(config, sources, |key| env::var(key).ok());
}

fn apply_overrides_from(
    config: &mut CueConfig,
    sources: &mut ConfigSources,
    lookup: impl Fn(&str) -> Option<String>,
) {
    let port = |key: &str, slot: &mut u16, sources: &mut ConfigSources| {
        if let Some(v) = lookup(key) {
            if let Ok(parsed) = v.parse() {
                *slot = parsed;
                sources.env_overrides.push(key.to_string());
            }
        }
    };
    port("CUE_HUB_PORT", &mut config.infra.bind.hub_port, sources);
    port("CUE_BRIDGE_PORT", &mut config.infra.bind.bridge_port, sources);
    port("CUE_HTTP_PORT", &mut config.infra.bind.http_port, sources);

    if let Some(v) = lookup("CUE_BRIDGE_ID") {
        config.bootstrap.bridge.id = Some(v);
        sources.env_overrides.push("CUE_BRIDGE_ID".to_string());
    }
    if let Some(v) = lookup("CUE_HUB_URL") {
        config.bootstrap.bridge.hub_url = Some(v);
        sources.env_overrides.push("CUE_HUB_URL".to_string());
    }

    if let Some(v) = lookup("CUE_OTLP_ENDPOINT") {
        config.infra.telemetry.otlp_endpoint = v;
        sources.env_overrides.push("CUE_OTLP_ENDPOINT".to_string());
    }
    // Also support standard OTEL env var
    if let Some(v) = lookup("OTEL_EXPORTER_OTLP_ENDPOINT") {
        config.infra.telemetry.otlp_endpoint = v;
        sources
            .env_overrides
            .push("OTEL_EXPORTER_OTLP_ENDPOINT".to_string());
    }
    if let Some(v) = lookup("CUE_LOG_LEVEL") {
        config.infra.telemetry.log_level = v;
        sources.env_overrides.push("CUE_LOG_LEVEL".to_string());
    }
    // Also support RUST_LOG
    if let Some(v) = lookup("RUST_LOG") {
        config.infra.telemetry.log_level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }
}
