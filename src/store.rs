//! Persistence capabilities behind narrow interfaces: the content-addressed
//! object inventory and the message repository for locally-submitted mail.
//!
//! The in-memory implementations back tests and small nodes; see
//! [`crate::store_sled`] for the durable inventory.

use crate::object::{ObjectMessage, Plaintext, Status};
use crate::types::{InventoryVector, now};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

/// Objects stay queryable for this long past expiry so peers are not asked
/// again for something just evicted.
pub const EXPIRY_GRACE_SECS: u64 = 300;

/// Content-addressed set of unexpired objects.
///
/// For any IV returned by [`get_inventory`](Inventory::get_inventory),
/// [`get_object`](Inventory::get_object) yields a message with
/// `expires_time > now` at the moment of the query.
pub trait Inventory: Send + Sync {
    /// All unexpired IVs in the given streams.
    fn get_inventory(&self, streams: &[u64]) -> Vec<InventoryVector>;

    /// Subset of `offer` not locally known.
    fn missing(&self, offer: &[InventoryVector], streams: &[u64]) -> Vec<InventoryVector>;

    fn get_object(&self, iv: &InventoryVector) -> Option<Arc<ObjectMessage>>;

    /// Filtered listing; `None` is a wildcard.
    fn get_objects(
        &self,
        stream: Option<u64>,
        version: Option<u64>,
        object_type: Option<u32>,
    ) -> Vec<Arc<ObjectMessage>>;

    /// Idempotent insert keyed by IV; duplicates are silently ignored.
    fn store_object(&self, iv: InventoryVector, object: Arc<ObjectMessage>);

    /// Remove objects with `expires_time + EXPIRY_GRACE_SECS < now`.
    fn cleanup(&self);
}

fn is_live(object: &ObjectMessage) -> bool {
    object.expires_time() > now() as i64
}

#[derive(Default)]
pub struct MemoryInventory {
    objects: RwLock<HashMap<InventoryVector, Arc<ObjectMessage>>>,
}

impl MemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.read().expect("inventory lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Inventory for MemoryInventory {
    fn get_inventory(&self, streams: &[u64]) -> Vec<InventoryVector> {
        self.objects
            .read()
            .expect("inventory lock")
            .iter()
            .filter(|(_, o)| is_live(o) && streams.contains(&o.stream()))
            .map(|(iv, _)| *iv)
            .collect()
    }

    fn missing(&self, offer: &[InventoryVector], _streams: &[u64]) -> Vec<InventoryVector> {
        let objects = self.objects.read().expect("inventory lock");
        offer.iter().filter(|iv| !objects.contains_key(iv)).copied().collect()
    }

    fn get_object(&self, iv: &InventoryVector) -> Option<Arc<ObjectMessage>> {
        self.objects.read().expect("inventory lock").get(iv).cloned()
    }

    fn get_objects(
        &self,
        stream: Option<u64>,
        version: Option<u64>,
        object_type: Option<u32>,
    ) -> Vec<Arc<ObjectMessage>> {
        self.objects
            .read()
            .expect("inventory lock")
            .values()
            .filter(|o| is_live(o))
            .filter(|o| stream.is_none_or(|s| o.stream() == s))
            .filter(|o| version.is_none_or(|v| o.version() == v))
            .filter(|o| object_type.is_none_or(|t| o.object_type() == t))
            .cloned()
            .collect()
    }

    fn store_object(&self, iv: InventoryVector, object: Arc<ObjectMessage>) {
        self.objects.write().expect("inventory lock").entry(iv).or_insert(object);
    }

    fn cleanup(&self) {
        self.objects
            .write()
            .expect("inventory lock")
            .retain(|_, o| !o.is_expired(EXPIRY_GRACE_SECS));
    }
}

/// A locally-submitted message together with its delivery bookkeeping.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: i64,
    pub plaintext: Plaintext,
    /// Payload the recipient echoes back; matching admits an ack.
    pub ack_data: Option<[u8; 32]>,
    pub ttl: i64,
    pub retries: i32,
    pub next_try: Option<i64>,
}

/// Durable mail store. The core touches messages only through this.
pub trait MessageRepository: Send + Sync {
    /// Persist a message; returns its id.
    fn save(&self, plaintext: Plaintext, ack_data: Option<[u8; 32]>, ttl: i64) -> i64;

    fn update_status(&self, id: i64, status: Status);

    /// Bump the retry counter and schedule the next attempt.
    fn schedule_retry(&self, id: i64, next_try: i64);

    /// Match an incoming ack payload; marks the message acknowledged and
    /// returns its id.
    fn acknowledge(&self, ack_data: &[u8; 32]) -> Option<i64>;

    fn get(&self, id: i64) -> Option<StoredMessage>;
}

#[derive(Default)]
pub struct MemoryMessageRepository {
    messages: RwLock<HashMap<i64, StoredMessage>>,
    next_id: AtomicI64,
}

impl MemoryMessageRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageRepository for MemoryMessageRepository {
    fn save(&self, plaintext: Plaintext, ack_data: Option<[u8; 32]>, ttl: i64) -> i64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut plaintext = plaintext;
        plaintext.id = Some(id);
        self.messages.write().expect("repository lock").insert(
            id,
            StoredMessage { id, plaintext, ack_data, ttl, retries: 0, next_try: None },
        );
        id
    }

    fn update_status(&self, id: i64, status: Status) {
        if let Some(stored) = self.messages.write().expect("repository lock").get_mut(&id) {
            stored.plaintext.status = status;
        }
    }

    fn schedule_retry(&self, id: i64, next_try: i64) {
        if let Some(stored) = self.messages.write().expect("repository lock").get_mut(&id) {
            stored.retries += 1;
            stored.next_try = Some(next_try);
        }
    }

    fn acknowledge(&self, ack_data: &[u8; 32]) -> Option<i64> {
        let mut messages = self.messages.write().expect("repository lock");
        let id = messages
            .values()
            .find(|m| m.ack_data.as_ref() == Some(ack_data))
            .map(|m| m.id)?;
        if let Some(stored) = messages.get_mut(&id) {
            stored.plaintext.status = Status::Acknowledged;
        }
        Some(id)
    }

    fn get(&self, id: i64) -> Option<StoredMessage> {
        self.messages.read().expect("repository lock").get(&id).cloned()
    }
}
