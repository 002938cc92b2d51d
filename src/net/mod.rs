//! P2P networking layer: framing, per-peer state machines, the node
//! registry and the supervising network handler.

pub mod addrman;
pub mod connection;
pub mod handler;
pub mod message;
pub mod types;

// Re-exports
pub use addrman::{AddrMan, AddressInfo, NodeRegistry};
pub use connection::{
    Connection, ConnectionInfo, CustomCommandHandler, NetEvent, NodeContext, NodeError,
};
pub use handler::{NetworkHandler, NetworkStatus};
pub use message::{FrameError, FrameHeader, NetworkMessage, VersionPayload};
pub use types::*;
