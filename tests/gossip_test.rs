//! End-to-end gossip tests over real TCP connections.
//!
//! Run with: cargo test --test gossip_test -- --nocapture

use bmnet::{
    AddrMan, DiscardListener, Dispatcher, Inventory, Keypair, MemoryInventory,
    MemoryMessageRepository, MessageRepository, NetworkConfig, NetworkHandler, ObjectMessage,
    Payload, PlaintextBuilder, Secp256k1Crypto, Status, now,
};
use bmnet::object::payload::Generic;
use std::sync::Arc;
use std::time::Duration;

struct Node {
    handler: Arc<NetworkHandler>,
    inventory: Arc<MemoryInventory>,
    dispatcher: Arc<Dispatcher>,
    repository: Arc<MemoryMessageRepository>,
    crypto: Arc<Secp256k1Crypto>,
    delivery: tokio::sync::mpsc::UnboundedReceiver<bmnet::Plaintext>,
}

/// A full node on an ephemeral port with test-grade difficulty.
fn spawn_node() -> Node {
    let config = NetworkConfig {
        port: 0,
        nonce_trials_per_byte: 1,
        extra_bytes: 0,
        ..NetworkConfig::default()
    };
    let crypto = Arc::new(Secp256k1Crypto::new());
    let inventory = Arc::new(MemoryInventory::new());
    let repository = Arc::new(MemoryMessageRepository::new());
    let (dispatcher, delivery) = Dispatcher::new(
        crypto.clone(),
        inventory.clone(),
        repository.clone(),
        config.nonce_trials_per_byte,
        config.extra_bytes,
    );
    let (handler, events) = NetworkHandler::new(
        config,
        crypto.clone(),
        inventory.clone(),
        Arc::new(AddrMan::new()),
        dispatcher.clone(),
        None,
    );
    handler.spawn_event_loop(events);
    Node { handler, inventory, dispatcher, repository, crypto, delivery }
}

/// A relay-only node without identities.
fn spawn_relay() -> (Arc<NetworkHandler>, Arc<MemoryInventory>) {
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
    (handler, inventory)
}

fn stamped_object(body: &[u8]) -> (bmnet::InventoryVector, Arc<ObjectMessage>) {
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
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn object_floods_across_two_hops() {
    let (hub, hub_inventory) = spawn_relay();
    let hub_addr = hub.listen().await.unwrap();

    let (edge_a, edge_a_inventory) = spawn_relay();
    edge_a.connect(hub_addr).await.unwrap();
    let (edge_b, edge_b_inventory) = spawn_relay();
    edge_b.connect(hub_addr).await.unwrap();

    wait_for("both edges connected", || hub.status().connections == 2).await;

    // Publish at one edge; the hub relays to the other edge.
    let (iv, obj) = stamped_object(b"two hop relay");
    edge_a.publish(iv, obj);

    wait_for("hub replication", || hub_inventory.get_object(&iv).is_some()).await;
    wait_for("far edge replication", || edge_b_inventory.get_object(&iv).is_some()).await;
    assert!(edge_a_inventory.get_object(&iv).is_some());
}

#[tokio::test]
async fn mail_travels_from_sender_to_recipient() {
    let mut recipient_node = spawn_node();
    let recipient_keys = Keypair::generate(&recipient_node.crypto);
    recipient_node.dispatcher.add_identity(recipient_keys.clone());
    let addr = recipient_node.handler.listen().await.unwrap();

    let sender_node = spawn_node();
    sender_node.handler.connect(addr).await.unwrap();
    wait_for("handshake", || sender_node.handler.status().connections == 1).await;

    // Compose, submit and offer the message.
    let sender_keys = Keypair::generate(&sender_node.crypto);
    let plaintext = PlaintextBuilder::msg()
        .from(4, 1, &sender_keys)
        .destination_ripe(recipient_keys.ripe(recipient_node.crypto.as_ref()))
        .simple("integration", "across the wire")
        .build()
        .unwrap();
    let out = sender_node
        .dispatcher
        .send_msg(&sender_keys, plaintext, &recipient_keys.encryption_public, 600)
        .unwrap();
    assert_eq!(
        sender_node.repository.get(out.message_id).unwrap().plaintext.status,
        Status::Sent
    );
    sender_node.handler.offer(out.iv);

    // The recipient admits the object and the dispatcher decrypts it.
    wait_for("object replication", || {
        recipient_node.inventory.get_object(&out.iv).is_some()
    })
    .await;
    let delivered = recipient_node.delivery.recv().await.unwrap();
    assert_eq!(delivered.message(), b"Subject:integration\nBody:across the wire");

    // Echoing the embedded ack back acknowledges the original message.
    let acks = recipient_node.dispatcher.take_pending_acks();
    assert_eq!(acks.len(), 1);
    let ack_iv = acks[0].inventory_vector(recipient_node.crypto.as_ref()).unwrap();
    recipient_node.handler.publish(ack_iv, acks[0].clone());

    wait_for("acknowledgement", || {
        sender_node.repository.get(out.message_id).unwrap().plaintext.status
            == Status::Acknowledged
    })
    .await;
}
