//! Object gossip core of a Bitmessage node: a flood-fill overlay of peers
//! exchanging encrypted, proof-of-work-stamped objects, backed by a
//! deduplicating inventory of currently-valid objects.

pub mod crypto;
pub mod dispatch;
pub mod net;
pub mod object;
pub mod store;
pub mod store_sled;
pub mod types;
pub mod wire;

pub use crypto::{CryptoError, Cryptography, Keypair, Secp256k1Crypto};
pub use dispatch::{DiscardListener, Dispatcher, ObjectListener, OutboundObject};
pub use net::{
    AddrMan, ConnectionMode, ConnectionState, CustomCommandHandler, NetAddress, NetworkConfig,
    NetworkHandler, NetworkMessage, NetworkStatus, NodeRegistry,
};
pub use object::{
    Encoding, ObjectError, ObjectMessage, Payload, Plaintext, PlaintextBuilder, Status,
};
pub use store::{
    Inventory, MemoryInventory, MemoryMessageRepository, MessageRepository, StoredMessage,
};
pub use store_sled::SledInventory;
pub use types::{InventoryVector, now};
pub use wire::WireError;
