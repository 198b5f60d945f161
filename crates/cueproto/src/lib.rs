//! cueproto - wire protocol and transport for hub/bridge show control
//!
//! A hub (the controlling application) keeps a fleet of bridges (device
//! drivers on remote machines) in sync with the show state. This crate holds
//! everything both sides agree on:
//!
//! - `messages`: the JSON message unions, one per direction
//! - `model`: settings, mappings, timelines and resources carried by them
//! - `transport`: sockets, the reconnecting `Connection`, and `Listener`
//!
//! ## Link semantics
//!
//! Either side may dial. A dialer pings every `PING_INTERVAL`; both sides
//! answer pings with pongs and declare the link dead after
//! `LIVENESS_TIMEOUT` without either. Dialers redial every
//! `RECONNECT_INTERVAL` forever; acceptors close for good.
//!
//! Messages are fire-and-forget JSON text frames. There are no
//! acknowledgements and nothing is replayed after a reconnect; the hub
//! re-pushes its state after every handshake instead.

pub mod messages;
pub mod model;
pub mod transport;

pub use messages::{BridgeMessage, HubMessage, ProtocolError};
pub use model::{
    now_millis, DeviceOptions, DeviceSettings, Mapping, Mappings, PeripheralConnection,
    PeripheralTriggerKind, Resource, Timeline, TimelineObject,
};
pub use transport::connection::{
    Connection, ConnectionEvent, ConnectionId, EventReceiver, Role, LIVENESS_TIMEOUT,
    PING_INTERVAL, RECONNECT_INTERVAL,
};
pub use transport::listener::{Listener, NewConnection};
pub use transport::memory::MemoryConnector;
pub use transport::ws::WsConnector;
pub use transport::{Connector, Frame, Socket, TransportError};

/// Protocol version reported in `init`.
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");
