//! Reachability probe for devices that speak TCP.
//!
//! Opens a TCP connection to `host:port` on an interval and reports the
//! device ok while that succeeds. Stands in for drivers whose only health
//! signal is whether the control port answers.

use std::time::Duration;

use async_trait::async_trait;
use cueproto::{DeviceOptions, Resource};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::device::{Device, DeviceError, DeviceHealth, HealthReporter};

const DEFAULT_INTERVAL_MS: u64 = 5_000;
const DEFAULT_TIMEOUT_MS: u64 = 2_000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProbeOptions {
    host: String,
    port: u16,
    #[serde(default = "default_interval")]
    interval_ms: u64,
    #[serde(default = "default_timeout")]
    timeout_ms: u64,
}

fn default_interval() -> u64 {
    DEFAULT_INTERVAL_MS
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_MS
}

pub struct TcpProbeDevice {
    cancel: CancellationToken,
}

impl TcpProbeDevice {
    /// Parse options and start probing in the background.
    pub fn start(options: &DeviceOptions, reporter: HealthReporter) -> Result<Self, DeviceError> {
        let options: ProbeOptions = serde_json::from_value(options.clone())
            .map_err(|e| DeviceError::InvalidOptions(e.to_string()))?;
        if options.interval_ms == 0 {
            return Err(DeviceError::InvalidOptions("intervalMs must be greater than zero".into()));
        }
        if options.timeout_ms == 0 {
            return Err(DeviceError::InvalidOptions("timeoutMs must be greater than zero".into()));
        }
        let cancel = CancellationToken::new();

        let token = cancel.clone();
        tokio::spawn(async move { probe_loop(options, reporter, token).await });

        Ok(Self { cancel })
    }
}

async fn probe_loop(options: ProbeOptions, reporter: HealthReporter, cancel: CancellationToken) {
    let target = format!("{}:{}", options.host, options.port);
    let connect_timeout = Duration::from_millis(options.timeout_ms);
    let mut interval = tokio::time::interval(Duration::from_millis(options.interval_ms));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last: Option<DeviceHealth> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        if reporter.is_closed() {
            break;
        }

        let health = match timeout(connect_timeout, TcpStream::connect(&target)).await {
            Ok(Ok(_stream)) => DeviceHealth::good("Connected"),
            Ok(Err(e)) => DeviceHealth::bad(format!("{} unreachable: {}", target, e)),
            Err(_) => DeviceHealth::bad(format!("{} did not answer", target)),
        };

        // Only changes go upstream
        if last.as_ref().map(|h| h.ok) != Some(health.ok) {
            debug!("probe {} -> {}", reporter.device_id(), health.message);
            reporter.report(health.clone());
        }
        last = Some(health);
    }
}

#[async_trait]
impl Device for TcpProbeDevice {
    async fn resources(&self) -> Result<Vec<Resource>, DeviceError> {
        Ok(Vec::new())
    }

    async fn close(&self) {
        self.cancel.cancel();
    }
}
