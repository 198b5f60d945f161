//! cuehub - the controlling side of the cue bridge protocol
//!
//! The hub holds the desired state of a show (which bridges exist, how
//! layers map to devices, which timelines are active) and keeps every bridge
//! in sync with it. Bridges report device health and discovered resources
//! back, and the hub aggregates those into one status view.
//!
//! - `session`: per-bridge handshake and deduplicating push caches
//! - `orchestrator`: the single task reconciling config against sessions
//! - `resources`: resource sets and deltas
//! - `status`: runtime status and published events
//! - `web`: read-only HTTP status endpoint

pub mod orchestrator;
pub mod resources;
pub mod session;
pub mod status;
pub mod telemetry;
pub mod web;

pub use orchestrator::{Command, HubError, Orchestrator, OrchestratorHandle};
pub use resources::{diff, ResourceDelta, ResourceStore};
pub use session::{BridgeSession, SessionError, SessionEvent, SessionId, SessionState};
pub use status::{
    BridgeConfig, BridgeRuntimeStatus, DeviceStatus, HubEvent, HubStatus, SessionInfo,
};
