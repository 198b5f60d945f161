//! Built-in device kinds.

mod tcp_probe;
mod virtual_device;

pub use tcp_probe::TcpProbeDevice;
pub use virtual_device::VirtualDevice;
