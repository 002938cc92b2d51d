//! Per-peer connection state machine: handshake, inventory exchange,
//! request tracking, proof-of-work admission and disconnect.
//!
//! A connection is exclusively owned by its network-handler task. It holds
//! shared references to the inventory, the node registry and the
//! cross-connection request map; outbound frames go through a FIFO sending
//! queue drained by the transport.

use super::addrman::NodeRegistry;
use super::message::{FrameError, NetworkMessage, VersionPayload};
use super::types::{
    ConnectionMode, ConnectionState, IV_CACHE_EXPIRY_SECS, MAX_ADDR_ENTRIES, MAX_INV_ENTRIES,
    NetAddress, NetworkConfig, REQUEST_STALE_SECS, SYNC_IDLE_MILLIS,
};
use crate::crypto::Cryptography;
use crate::dispatch::ObjectListener;
use crate::object::ObjectMessage;
use crate::store::Inventory;
use crate::types::{InventoryVector, now};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A peer sent something its connection state does not allow.
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("unexpected {command} frame in {state:?}")]
    UnexpectedFrame { command: &'static str, state: ConnectionState },

    #[error("peer is ourselves")]
    SelfConnection,

    #[error("obsolete peer protocol version {0}")]
    ObsoletePeer(u32),

    #[error("unhandled custom command")]
    CustomRejected,

    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Handler for the extensible `custom` command.
pub trait CustomCommandHandler: Send + Sync {
    /// A response frame, or `None` to reject (disconnecting the peer).
    fn handle(&self, payload: &[u8]) -> Option<Vec<u8>>;
}

/// Connection-to-handler notifications.
#[derive(Debug)]
pub enum NetEvent {
    /// An object passed admission and wants flood-fill.
    ObjectAdmitted { iv: InventoryVector, origin: u64 },
    /// A connection reached its terminal state; `outstanding` requests were
    /// released for reassignment.
    Disconnected { conn_id: u64, outstanding: Vec<InventoryVector> },
}

/// Shared dependencies handed to every connection.
pub struct NodeContext {
    pub config: NetworkConfig,
    pub crypto: Arc<dyn Cryptography>,
    pub inventory: Arc<dyn Inventory>,
    pub registry: Arc<dyn NodeRegistry>,
    pub listener: Arc<dyn ObjectListener>,
    pub custom_handler: Option<Arc<dyn CustomCommandHandler>>,
    /// Process-wide `IV → request timestamp` map de-duplicating getdata
    /// requests across connections.
    pub common_requested: Arc<DashMap<InventoryVector, u64>>,
    /// Own version nonce; a peer echoing it back is ourselves.
    pub client_nonce: u64,
    pub events: mpsc::UnboundedSender<NetEvent>,
}

/// Snapshot of a connection for status queries.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub address: SocketAddr,
    pub mode: ConnectionMode,
    pub state: ConnectionState,
    pub peer_user_agent: String,
    pub messages_in: u64,
    pub messages_out: u64,
    pub last_object_time: u64,
}

pub struct Connection {
    id: u64,
    mode: ConnectionMode,
    state: ConnectionState,
    peer_addr: SocketAddr,
    ctx: Arc<NodeContext>,

    peer_nonce: u64,
    peer_version: u32,
    peer_streams: Vec<u64>,
    peer_user_agent: String,
    verack_sent: bool,
    verack_received: bool,
    /// Streams both ends serve; fixed at activation.
    exchange_streams: Vec<u64>,

    /// IVs this peer is known to have or to have been offered.
    iv_cache: DashMap<InventoryVector, u64>,
    /// IVs awaited from this peer.
    requested_objects: HashSet<InventoryVector>,
    queue: VecDeque<NetworkMessage>,

    last_inbound: Instant,
    last_object_time: u64,
    sync_deadline: Option<Instant>,

    messages_in: u64,
    messages_out: u64,
}

impl Connection {
    pub fn new(
        id: u64,
        mode: ConnectionMode,
        peer_addr: SocketAddr,
        ctx: Arc<NodeContext>,
        sync_deadline: Option<Instant>,
    ) -> Self {
        let mut conn = Self {
            id,
            mode,
            state: ConnectionState::Connecting,
            peer_addr,
            ctx,
            peer_nonce: 0,
            peer_version: 0,
            peer_streams: Vec::new(),
            peer_user_agent: String::new(),
            verack_sent: false,
            verack_received: false,
            exchange_streams: Vec::new(),
            iv_cache: DashMap::new(),
            requested_objects: HashSet::new(),
            queue: VecDeque::new(),
            last_inbound: Instant::now(),
            last_object_time: 0,
            sync_deadline,
            messages_in: 0,
            messages_out: 0,
        };
        // Dialing sides introduce themselves immediately.
        if conn.mode != ConnectionMode::Server {
            conn.send_version();
        }
        conn
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn mode(&self) -> ConnectionMode {
        self.mode
    }

    pub fn is_active(&self) -> bool {
        self.state == ConnectionState::Active
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            address: self.peer_addr,
            mode: self.mode,
            state: self.state,
            peer_user_agent: self.peer_user_agent.clone(),
            messages_in: self.messages_in,
            messages_out: self.messages_out,
            last_object_time: self.last_object_time,
        }
    }

    fn send_version(&mut self) {
        let stream = self.ctx.config.streams.first().copied().unwrap_or(1);
        let addr_recv = NetAddress::from_socket_addr(self.peer_addr, stream);
        let version =
            VersionPayload::new(&self.ctx.config, addr_recv, self.ctx.client_nonce);
        self.queue.push_back(NetworkMessage::Version(version));
    }

    /// Dispatch one inbound frame. An error is terminal: the connection
    /// disconnects itself and the caller should drop the transport.
    pub fn handle(&mut self, msg: NetworkMessage) -> Result<(), NodeError> {
        if self.state == ConnectionState::Disconnected {
            return Ok(());
        }
        self.last_inbound = Instant::now();
        self.messages_in += 1;

        if self.state == ConnectionState::Connecting && !msg.allowed_pre_handshake() {
            let err = NodeError::UnexpectedFrame { command: msg.command(), state: self.state };
            self.disconnect();
            return Err(err);
        }

        let result = match msg {
            NetworkMessage::Version(v) => self.handle_version(v),
            NetworkMessage::Verack => self.handle_verack(),
            NetworkMessage::Addr(addrs) => self.handle_addr(addrs),
            NetworkMessage::Inv(ivs) => self.handle_inv(ivs),
            NetworkMessage::GetData(ivs) => self.handle_getdata(ivs),
            NetworkMessage::Object(object) => self.handle_object(object),
            NetworkMessage::Custom(body) => self.handle_custom(&body),
        };
        if result.is_err() {
            self.disconnect();
        }
        result
    }

    fn handle_version(&mut self, version: VersionPayload) -> Result<(), NodeError> {
        if self.state != ConnectionState::Connecting || self.peer_version != 0 {
            return Err(NodeError::UnexpectedFrame {
                command: "version",
                state: self.state,
            });
        }
        if version.nonce == self.ctx.client_nonce {
            return Err(NodeError::SelfConnection);
        }
        if version.version < self.ctx.config.min_peer_version {
            return Err(NodeError::ObsoletePeer(version.version));
        }

        self.peer_nonce = version.nonce;
        self.peer_version = version.version;
        self.peer_streams = version.streams;
        self.peer_user_agent = version.user_agent;
        debug!(
            "peer {} is {} (v{}, streams {:?})",
            self.peer_addr, self.peer_user_agent, self.peer_version, self.peer_streams
        );

        self.queue.push_back(NetworkMessage::Verack);
        self.verack_sent = true;
        // The accepting side answers with its own introduction.
        if self.mode == ConnectionMode::Server {
            self.send_version();
        }
        self.maybe_activate();
        Ok(())
    }

    fn handle_verack(&mut self) -> Result<(), NodeError> {
        if self.state != ConnectionState::Connecting || self.verack_received {
            return Err(NodeError::UnexpectedFrame { command: "verack", state: self.state });
        }
        self.verack_received = true;
        self.maybe_activate();
        Ok(())
    }

    fn maybe_activate(&mut self) {
        if !(self.verack_sent && self.verack_received) {
            return;
        }
        self.state = ConnectionState::Active;
        self.exchange_streams = self
            .ctx
            .config
            .streams
            .iter()
            .filter(|s| self.peer_streams.contains(s))
            .copied()
            .collect();
        debug!("connection {} to {} is active", self.id, self.peer_addr);

        // Fold the peer into the registry with a fresh last-seen time.
        let peer_stream = self.peer_streams.first().copied().unwrap_or(1);
        self.ctx
            .registry
            .offer_addresses(&[NetAddress::from_socket_addr(self.peer_addr, peer_stream)]);

        // A sync exchange skips the unsolicited listing; it only catches up.
        if self.mode == ConnectionMode::Sync {
            return;
        }

        let known = self
            .ctx
            .registry
            .known_addresses(MAX_ADDR_ENTRIES as usize, &self.exchange_streams);
        if !known.is_empty() {
            self.queue.push_back(NetworkMessage::Addr(known));
        }

        let inventory = self.ctx.inventory.get_inventory(&self.exchange_streams);
        let stamp = now();
        for chunk in inventory.chunks(MAX_INV_ENTRIES as usize) {
            for iv in chunk {
                self.iv_cache.insert(*iv, stamp);
            }
            self.queue.push_back(NetworkMessage::Inv(chunk.to_vec()));
        }
    }

    fn handle_addr(&mut self, addrs: Vec<NetAddress>) -> Result<(), NodeError> {
        let routable: Vec<NetAddress> =
            addrs.into_iter().filter(NetAddress::is_routable).collect();
        if !routable.is_empty() {
            self.ctx.registry.offer_addresses(&routable);
        }
        Ok(())
    }

    fn handle_inv(&mut self, offer: Vec<InventoryVector>) -> Result<(), NodeError> {
        self.evict_iv_cache();
        let stamp = now();
        for iv in &offer {
            self.iv_cache.insert(*iv, stamp);
        }

        let candidates = self.ctx.inventory.missing(&offer, &self.exchange_streams);
        let mut wanted = Vec::new();
        for iv in candidates {
            // Cross-connection de-duplication: claim the IV unless another
            // connection already holds a live claim on it.
            let claimed = match self.ctx.common_requested.entry(iv) {
                Entry::Occupied(mut entry) => {
                    if stamp.saturating_sub(*entry.get()) > REQUEST_STALE_SECS {
                        entry.insert(stamp);
                        true
                    } else {
                        false
                    }
                }
                Entry::Vacant(entry) => {
                    entry.insert(stamp);
                    true
                }
            };
            if claimed {
                self.requested_objects.insert(iv);
                wanted.push(iv);
            }
        }
        if !wanted.is_empty() {
            debug!("requesting {} of {} offered objects", wanted.len(), offer.len());
            self.queue.push_back(NetworkMessage::GetData(wanted));
        }
        Ok(())
    }

    fn handle_getdata(&mut self, ivs: Vec<InventoryVector>) -> Result<(), NodeError> {
        for iv in ivs {
            if let Some(object) = self.ctx.inventory.get_object(&iv) {
                self.queue.push_back(NetworkMessage::Object(object));
            }
        }
        Ok(())
    }

    fn handle_object(&mut self, object: Arc<ObjectMessage>) -> Result<(), NodeError> {
        let iv = object.inventory_vector(self.ctx.crypto.as_ref()).map_err(FrameError::from)?;
        self.requested_objects.remove(&iv);
        self.admit_object(iv, object);
        // Whatever the admission outcome, the IV is no longer in flight.
        self.ctx.common_requested.remove(&iv);
        Ok(())
    }

    /// Proof-of-work admission gate. Failures drop the object and keep the
    /// connection up.
    fn admit_object(&mut self, iv: InventoryVector, object: Arc<ObjectMessage>) {
        if self.ctx.inventory.get_object(&iv).is_some() {
            debug!("object {iv} already in inventory");
            return;
        }

        self.ctx.listener.receive(&object);

        let config = &self.ctx.config;
        if let Err(err) = object.check_proof_of_work(
            self.ctx.crypto.as_ref(),
            config.nonce_trials_per_byte,
            config.extra_bytes,
        ) {
            warn!("dropping object {iv} from {}: {err}", self.peer_addr);
            return;
        }

        self.ctx.inventory.store_object(iv, object);
        self.iv_cache.insert(iv, now());
        self.last_object_time = now();
        let _ = self.ctx.events.send(NetEvent::ObjectAdmitted { iv, origin: self.id });
    }

    fn handle_custom(&mut self, body: &[u8]) -> Result<(), NodeError> {
        let handler = self.ctx.custom_handler.as_ref().ok_or(NodeError::CustomRejected)?;
        let response = handler.handle(body).ok_or(NodeError::CustomRejected)?;
        self.queue.push_back(NetworkMessage::Custom(response));
        Ok(())
    }

    /// Flood-fill entry point: offer an admitted object to this peer unless
    /// it is already known to have it.
    pub fn offer(&mut self, iv: InventoryVector) {
        if !self.is_active() {
            return;
        }
        self.evict_iv_cache();
        if self.iv_cache.contains_key(&iv) {
            return;
        }
        self.iv_cache.insert(iv, now());
        self.queue.push_back(NetworkMessage::Inv(vec![iv]));
    }

    fn evict_iv_cache(&self) {
        let deadline = now().saturating_sub(IV_CACHE_EXPIRY_SECS);
        self.iv_cache.retain(|_, seen| *seen >= deadline);
    }

    /// Enqueue an arbitrary outbound frame (handler-initiated sends).
    pub fn queue_message(&mut self, msg: NetworkMessage) {
        if self.state != ConnectionState::Disconnected {
            self.queue.push_back(msg);
        }
    }

    /// Next outbound frame, FIFO.
    pub fn poll_send(&mut self) -> Option<NetworkMessage> {
        let msg = self.queue.pop_front()?;
        self.messages_out += 1;
        Some(msg)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Terminal transition. Releases outstanding requests for reassignment
    /// (removing them from the cross-connection map so later inv exchanges
    /// re-request them) and notifies the handler. Idempotent.
    pub fn disconnect(&mut self) -> Vec<InventoryVector> {
        if self.state == ConnectionState::Disconnected {
            return Vec::new();
        }
        self.state = ConnectionState::Disconnected;
        self.queue.clear();

        let outstanding: Vec<InventoryVector> = self.requested_objects.drain().collect();
        for iv in &outstanding {
            self.ctx.common_requested.remove(iv);
        }
        debug!(
            "connection {} to {} disconnected, {} requests released",
            self.id,
            self.peer_addr,
            outstanding.len()
        );
        let _ = self.ctx.events.send(NetEvent::Disconnected {
            conn_id: self.id,
            outstanding: outstanding.clone(),
        });
        outstanding
    }

    /// A sync connection is finished once its deadline passed, or once it
    /// is active with nothing left to send and a quiet read side.
    pub fn sync_finished(&self) -> bool {
        if self.mode != ConnectionMode::Sync {
            return false;
        }
        if self.state == ConnectionState::Disconnected {
            return true;
        }
        if let Some(deadline) = self.sync_deadline
            && Instant::now() >= deadline
        {
            return true;
        }
        self.is_active()
            && self.queue.is_empty()
            && self.last_inbound.elapsed() >= Duration::from_millis(SYNC_IDLE_MILLIS)
    }
}
