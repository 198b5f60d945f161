//! Device abstraction.
//!
//! A device is something the bridge drives: a playout server, a video
//! mixer, a lighting console. The manager only needs three things from it:
//! tell it to go away, ask it for resources, and hear about its health. Real
//! drivers live outside this crate and plug in through `DeviceFactory`.

use std::sync::Arc;

use async_trait::async_trait;
use cueproto::{DeviceOptions, Resource};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::devices::{TcpProbeDevice, VirtualDevice};

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device options have no 'type'")]
    MissingType,

    #[error("unknown device type '{0}'")]
    UnknownType(String),

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("device operation failed: {0}")]
    OperationFailed(String),
}

/// Connectivity of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHealth {
    pub ok: bool,
    pub message: String,
}

impl DeviceHealth {
    pub fn good(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
        }
    }

    pub fn bad(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }
}

/// Health report from a device, tagged with the generation it belongs to.
#[derive(Debug)]
pub struct HealthReport {
    pub device_id: String,
    pub generation: u64,
    pub health: DeviceHealth,
}

/// Hands health changes from a device back to its manager.
#[derive(Debug, Clone)]
pub struct HealthReporter {
    device_id: String,
    generation: u64,
    tx: mpsc::UnboundedSender<HealthReport>,
}

impl HealthReporter {
    pub fn new(device_id: impl Into<String>, generation: u64, tx: mpsc::UnboundedSender<HealthReport>) -> Self {
        Self {
            device_id: device_id.into(),
            generation,
            tx,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// True once the manager that owns this device has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn report(&self, health: DeviceHealth) {
        // Manager gone: the device is being torn down anyway
        let _ = self.tx.send(HealthReport {
            device_id: self.device_id.clone(),
            generation: self.generation,
            health,
        });
    }
}

#[async_trait]
pub trait Device: Send + Sync {
    /// Discoverable items on the device.
    async fn resources(&self) -> Result<Vec<Resource>, DeviceError>;

    /// Disconnect and stop any background work.
    async fn close(&self);
}

#[async_trait]
pub trait DeviceFactory: Send + Sync + 'static {
    /// Build a device from its options. The device reports health through
    /// `reporter` from then on.
    async fn create(
        &self,
        device_id: &str,
        options: &DeviceOptions,
        reporter: HealthReporter,
    ) -> Result<Arc<dyn Device>, DeviceError>;
}

/// The `type` field of device options.
pub fn device_type(options: &DeviceOptions) -> Result<&str, DeviceError> {
    options
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or(DeviceError::MissingType)
}

/// Factory for the kinds that ship with the bridge.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinFactory;

#[async_trait]
impl DeviceFactory for BuiltinFactory {
    async fn create(
        &self,
        device_id: &str,
        options: &DeviceOptions,
        reporter: HealthReporter,
    ) -> Result<Arc<dyn Device>, DeviceError> {
        match device_type(options)? {
            "virtual" => Ok(Arc::new(VirtualDevice::new(device_id, options, reporter)?)),
            "tcpProbe" => Ok(Arc::new(TcpProbeDevice::start(options, reporter)?)),
            other => Err(DeviceError::UnknownType(other.to_string())),
        }
    }
}
