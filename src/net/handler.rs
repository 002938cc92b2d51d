//! Network handler: owns the live connections, the cross-connection
//! request map and the flood-fill fan-out, and drives the client, server
//! and sync entry points.

use super::addrman::NodeRegistry;
use super::connection::{
    Connection, CustomCommandHandler, NetEvent, NodeContext, NodeError,
};
use super::message::{FrameError, FrameHeader, NetworkMessage};
use super::types::{ConnectionMode, NetworkConfig, OFFER_FANOUT, SYNC_IDLE_MILLIS};
use crate::crypto::Cryptography;
use crate::dispatch::ObjectListener;
use crate::object::ObjectMessage;
use crate::store::Inventory;
use crate::types::InventoryVector;
use dashmap::DashMap;
use rand::seq::SliceRandom;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
enum RunError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Node(#[from] NodeError),
}

/// Handler-to-connection commands.
enum ConnCommand {
    Offer(InventoryVector),
    Send(NetworkMessage),
    Disconnect,
}

struct PeerHandle {
    commands: mpsc::UnboundedSender<ConnCommand>,
    address: SocketAddr,
}

/// Point-in-time view of the handler.
#[derive(Debug, Clone)]
pub struct NetworkStatus {
    pub connections: usize,
    pub streams: Vec<u64>,
    pub inventory_count: usize,
}

pub struct NetworkHandler {
    ctx: Arc<NodeContext>,
    peers: Arc<DashMap<u64, PeerHandle>>,
    next_id: AtomicU64,
}

impl NetworkHandler {
    /// Build the handler and the event stream its
    /// [`event loop`](Self::spawn_event_loop) consumes.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: NetworkConfig,
        crypto: Arc<dyn Cryptography>,
        inventory: Arc<dyn Inventory>,
        registry: Arc<dyn NodeRegistry>,
        listener: Arc<dyn ObjectListener>,
        custom_handler: Option<Arc<dyn CustomCommandHandler>>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<NetEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let client_nonce = crypto.random_nonce();
        let ctx = Arc::new(NodeContext {
            config,
            crypto,
            inventory,
            registry,
            listener,
            custom_handler,
            common_requested: Arc::new(DashMap::new()),
            client_nonce,
            events,
        });
        let handler =
            Arc::new(Self { ctx, peers: Arc::new(DashMap::new()), next_id: AtomicU64::new(0) });
        (handler, events_rx)
    }

    /// Supervisory loop: flood-fill fan-out and connection teardown.
    pub fn spawn_event_loop(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<NetEvent>,
    ) -> JoinHandle<()> {
        let handler = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                handler.handle_event(event);
            }
        })
    }

    fn handle_event(&self, event: NetEvent) {
        match event {
            NetEvent::ObjectAdmitted { iv, origin } => self.offer_from(iv, Some(origin)),
            NetEvent::Disconnected { conn_id, outstanding } => {
                // The connection already released the IVs from the request
                // map; later inv exchanges on other peers re-request them.
                if !outstanding.is_empty() {
                    debug!(
                        "connection {conn_id} released {} outstanding requests",
                        outstanding.len()
                    );
                }
                self.peers.remove(&conn_id);
            }
        }
    }

    /// Offer an object to a random subset of connections.
    pub fn offer(&self, iv: InventoryVector) {
        self.offer_from(iv, None);
    }

    fn offer_from(&self, iv: InventoryVector, exclude: Option<u64>) {
        let mut ids: Vec<u64> = self
            .peers
            .iter()
            .map(|entry| *entry.key())
            .filter(|id| Some(*id) != exclude)
            .collect();
        ids.shuffle(&mut rand::thread_rng());
        for id in ids.into_iter().take(OFFER_FANOUT) {
            if let Some(peer) = self.peers.get(&id) {
                let _ = peer.commands.send(ConnCommand::Offer(iv));
            }
        }
    }

    /// Store a locally-created object and flood-fill it.
    pub fn publish(&self, iv: InventoryVector, object: Arc<ObjectMessage>) {
        self.ctx.inventory.store_object(iv, object);
        self.offer(iv);
    }

    /// Send a frame to every live connection.
    pub fn broadcast(&self, msg: NetworkMessage) {
        for peer in self.peers.iter() {
            let _ = peer.commands.send(ConnCommand::Send(msg.clone()));
        }
    }

    pub fn disconnect_all(&self) {
        for peer in self.peers.iter() {
            let _ = peer.commands.send(ConnCommand::Disconnect);
        }
    }

    pub fn status(&self) -> NetworkStatus {
        NetworkStatus {
            connections: self.peers.len(),
            streams: self.ctx.config.streams.clone(),
            inventory_count: self.ctx.inventory.get_inventory(&self.ctx.config.streams).len(),
        }
    }

    pub fn peer_addresses(&self) -> Vec<SocketAddr> {
        self.peers.iter().map(|entry| entry.value().address).collect()
    }

    /// Server mode: accept peers on the configured port. Returns the bound
    /// address; accepting runs in the background.
    pub async fn listen(self: &Arc<Self>) -> std::io::Result<SocketAddr> {
        let listener =
            TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.ctx.config.port)).await?;
        let local = listener.local_addr()?;
        info!("listening on {local}");

        let handler = self.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        debug!("accepted connection from {addr}");
                        let h = handler.clone();
                        tokio::spawn(h.run_connection(
                            stream,
                            addr,
                            ConnectionMode::Server,
                            None,
                        ));
                    }
                    Err(err) => {
                        warn!("accept failed: {err}");
                        break;
                    }
                }
            }
        });
        Ok(local)
    }

    /// Client mode: dial a peer and keep the connection alive.
    pub async fn connect(self: &Arc<Self>, addr: SocketAddr) -> std::io::Result<()> {
        let stream = TcpStream::connect(addr).await?;
        let handler = self.clone();
        tokio::spawn(handler.run_connection(stream, addr, ConnectionMode::Client, None));
        Ok(())
    }

    /// Sync mode: exchange inventories with one peer and return once the
    /// connection is caught up and idle, or the deadline passes.
    pub async fn synchronize(
        self: &Arc<Self>,
        addr: SocketAddr,
        timeout: Duration,
    ) -> std::io::Result<()> {
        let stream = TcpStream::connect(addr).await?;
        self.clone()
            .run_connection(stream, addr, ConnectionMode::Sync, Some(Instant::now() + timeout))
            .await;
        Ok(())
    }

    async fn run_connection(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
        mode: ConnectionMode,
        sync_deadline: Option<Instant>,
    ) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        self.peers.insert(id, PeerHandle { commands: cmd_tx, address: addr });

        let mut conn = Connection::new(id, mode, addr, self.ctx.clone(), sync_deadline);
        let (reader, mut writer) = stream.into_split();

        // Dedicated reader task: frames arrive over a channel, keeping the
        // main select cancel-safe.
        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel();
        let crypto = self.ctx.crypto.clone();
        let reader_task = tokio::spawn(async move {
            let mut reader = reader;
            loop {
                let result = read_frame(&mut reader, crypto.as_ref()).await;
                let failed = result.is_err();
                if frame_tx.send(result).is_err() || failed {
                    break;
                }
            }
        });

        let result: Result<(), RunError> = async {
            loop {
                while let Some(msg) = conn.poll_send() {
                    let frame = msg.encode_frame(self.ctx.crypto.as_ref())?;
                    writer.write_all(&frame).await?;
                }
                if conn.sync_finished() {
                    break;
                }

                tokio::select! {
                    frame = frame_rx.recv() => match frame {
                        Some(frame) => conn.handle(frame?)?,
                        None => break,
                    },
                    cmd = cmd_rx.recv() => match cmd {
                        Some(ConnCommand::Offer(iv)) => conn.offer(iv),
                        Some(ConnCommand::Send(msg)) => conn.queue_message(msg),
                        Some(ConnCommand::Disconnect) | None => break,
                    },
                    _ = tokio::time::sleep(Duration::from_millis(SYNC_IDLE_MILLIS)),
                        if mode == ConnectionMode::Sync => {}
                }
            }
            Ok(())
        }
        .await;

        if let Err(err) = result {
            debug!("connection {id} to {addr} closed: {err}");
        }
        reader_task.abort();
        conn.disconnect();
        self.peers.remove(&id);
    }
}

async fn read_frame(
    reader: &mut OwnedReadHalf,
    crypto: &dyn Cryptography,
) -> Result<NetworkMessage, RunError> {
    use tokio::io::AsyncReadExt;

    let mut header_bytes = [0u8; FrameHeader::LEN];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::decode(&header_bytes)?;
    let mut payload = vec![0u8; header.length as usize];
    reader.read_exact(&mut payload).await?;
    Ok(NetworkMessage::decode_payload(&header, &payload, crypto)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Secp256k1Crypto;
    use crate::dispatch::DiscardListener;
    use crate::net::addrman::AddrMan;
    use crate::object::Payload;
    use crate::object::payload::Generic;
    use crate::store::MemoryInventory;
    use crate::types::now;

    struct TestNode {
        handler: Arc<NetworkHandler>,
        inventory: Arc<MemoryInventory>,
    }

    fn spawn_node() -> TestNode {
        let config = NetworkConfig {
            port: 0,
            nonce_trials_per_byte: 1,
            extra_bytes: 0,
            ..NetworkConfig::default()
        };
        let inventory = Arc::new(MemoryInventory::new());
        let (handler, events) = NetworkHandler::new(
            config,
            Arc::new(Secp256k1Crypto::new()),
            inventory.clone(),
            Arc::new(AddrMan::new()),
            Arc::new(DiscardListener),
            None,
        );
        handler.spawn_event_loop(events);
        TestNode { handler, inventory }
    }

    fn stamped_object(body: &[u8]) -> (crate::types::InventoryVector, Arc<ObjectMessage>) {
        let crypto = Secp256k1Crypto::new();
        let payload = Payload::Generic(Generic {
            object_type: 9,
            version: 1,
            stream: 1,
            body: body.to_vec(),
        });
        let mut obj = ObjectMessage::new(now() as i64 + 600, payload);
        obj.do_proof_of_work(&crypto, 1, 0).unwrap();
        let iv = obj.inventory_vector(&crypto).unwrap();
        (iv, Arc::new(obj))
    }

    async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test]
    async fn client_pulls_server_inventory_over_tcp() {
        let server = spawn_node();
        let (iv, obj) = stamped_object(b"replicate me");
        server.inventory.store_object(iv, obj);

        let addr = server.handler.listen().await.unwrap();
        let client = spawn_node();
        client.handler.connect(addr).await.unwrap();

        wait_for("object replication", || client.inventory.get_object(&iv).is_some()).await;
        assert_eq!(client.handler.status().connections, 1);
        assert_eq!(server.handler.status().connections, 1);
    }

    #[tokio::test]
    async fn publish_floods_to_connected_peers() {
        let server = spawn_node();
        let addr = server.handler.listen().await.unwrap();

        let client = spawn_node();
        client.handler.connect(addr).await.unwrap();
        wait_for("handshake", || {
            server.handler.status().connections == 1 && client.handler.status().connections == 1
        })
        .await;

        let (iv, obj) = stamped_object(b"hot off the press");
        client.handler.publish(iv, obj);
        wait_for("flood fill", || server.inventory.get_object(&iv).is_some()).await;
    }

    #[tokio::test]
    async fn synchronize_catches_up_and_returns() {
        let server = spawn_node();
        let (iv, obj) = stamped_object(b"catch up");
        server.inventory.store_object(iv, obj);
        let addr = server.handler.listen().await.unwrap();

        let syncer = spawn_node();
        tokio::time::timeout(
            Duration::from_secs(30),
            syncer.handler.synchronize(addr, Duration::from_secs(20)),
        )
        .await
        .expect("sync should finish before the outer timeout")
        .unwrap();

        assert!(syncer.inventory.get_object(&iv).is_some());
        // The sync connection is gone once synchronize returns.
        assert_eq!(syncer.handler.status().connections, 0);
    }

    #[tokio::test]
    async fn disconnect_all_tears_connections_down() {
        let server = spawn_node();
        let addr = server.handler.listen().await.unwrap();
        let client = spawn_node();
        client.handler.connect(addr).await.unwrap();
        wait_for("handshake", || client.handler.status().connections == 1).await;

        client.handler.disconnect_all();
        wait_for("teardown", || client.handler.status().connections == 0).await;
    }
}
