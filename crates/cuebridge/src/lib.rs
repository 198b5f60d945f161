//! cuebridge - the device side of the cue bridge protocol
//!
//! A bridge runs next to the hardware. The hub pushes device settings,
//! mappings and timelines to it; the bridge keeps its devices in line with
//! those settings and reports device health and resources back.
//!
//! - `agent`: hub links and the bridge half of the handshake
//! - `manager`: the WorkerDeviceManager task
//! - `device`: the `Device` and `DeviceFactory` traits
//! - `devices`: built-in device kinds
//! - `playout`: pushed mappings and timelines, published for the resolver

pub mod agent;
pub mod device;
pub mod devices;
pub mod manager;
pub mod playout;

pub use agent::{AgentError, AgentHandle, BridgeAgent};
pub use device::{
    BuiltinFactory, Device, DeviceError, DeviceFactory, DeviceHealth, HealthReport, HealthReporter,
};
pub use manager::{DeviceManager, ManagerError, ManagerHandle};
pub use playout::{PlayoutState, PlayoutStore};
