//! Durable inventory on sled. Objects are stored under their IV in wire
//! encoding and decoded on read; undecodable or foreign rows are skipped
//! with a warning rather than poisoning the node.

use crate::object::ObjectMessage;
use crate::store::{EXPIRY_GRACE_SECS, Inventory};
use crate::types::{InventoryVector, now};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sled::Error),
}

pub struct SledInventory {
    _db: sled::Db,
    objects: sled::Tree,
}

impl SledInventory {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        let objects = db.open_tree("objects")?;
        Ok(Self { _db: db, objects })
    }

    fn decode_row(key: &[u8], value: &[u8]) -> Option<(InventoryVector, ObjectMessage)> {
        let iv = InventoryVector::from_slice(key)?;
        match ObjectMessage::decode(value) {
            Ok(object) => Some((iv, object)),
            Err(err) => {
                warn!("dropping undecodable inventory row {iv}: {err}");
                None
            }
        }
    }

    fn live_rows(&self) -> impl Iterator<Item = (InventoryVector, ObjectMessage)> + '_ {
        self.objects
            .iter()
            .flatten()
            .filter_map(|(k, v)| Self::decode_row(&k, &v))
    }
}

impl Inventory for SledInventory {
    fn get_inventory(&self, streams: &[u64]) -> Vec<InventoryVector> {
        let deadline = now() as i64;
        self.live_rows()
            .filter(|(_, o)| o.expires_time() > deadline && streams.contains(&o.stream()))
            .map(|(iv, _)| iv)
            .collect()
    }

    fn missing(&self, offer: &[InventoryVector], _streams: &[u64]) -> Vec<InventoryVector> {
        offer
            .iter()
            .filter(|iv| !matches!(self.objects.contains_key(iv.as_bytes()), Ok(true)))
            .copied()
            .collect()
    }

    fn get_object(&self, iv: &InventoryVector) -> Option<Arc<ObjectMessage>> {
        let value = self.objects.get(iv.as_bytes()).ok().flatten()?;
        Self::decode_row(iv.as_bytes(), &value).map(|(_, o)| Arc::new(o))
    }

    fn get_objects(
        &self,
        stream: Option<u64>,
        version: Option<u64>,
        object_type: Option<u32>,
    ) -> Vec<Arc<ObjectMessage>> {
        let deadline = now() as i64;
        self.live_rows()
            .filter(|(_, o)| o.expires_time() > deadline)
            .filter(|(_, o)| stream.is_none_or(|s| o.stream() == s))
            .filter(|(_, o)| version.is_none_or(|v| o.version() == v))
            .filter(|(_, o)| object_type.is_none_or(|t| o.object_type() == t))
            .map(|(_, o)| Arc::new(o))
            .collect()
    }

    fn store_object(&self, iv: InventoryVector, object: Arc<ObjectMessage>) {
        if matches!(self.objects.contains_key(iv.as_bytes()), Ok(true)) {
            return;
        }
        match object.encode_to_vec() {
            Ok(bytes) => {
                if let Err(err) = self.objects.insert(iv.as_bytes(), bytes) {
                    warn!("failed to persist object {iv}: {err}");
                }
            }
            Err(err) => warn!("refusing to persist unencodable object {iv}: {err}"),
        }
    }

    fn cleanup(&self) {
        let doomed: Vec<InventoryVector> = self
            .live_rows()
            .filter(|(_, o)| o.is_expired(EXPIRY_GRACE_SECS))
            .map(|(iv, _)| iv)
            .collect();
        for iv in doomed {
            if let Err(err) = self.objects.remove(iv.as_bytes()) {
                warn!("failed to evict expired object {iv}: {err}");
            }
        }
    }
}
