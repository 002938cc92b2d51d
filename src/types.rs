//! Shared primitive types for the object gossip core.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Stream number partitioning the object space. Peers advertise the
/// streams they serve; objects carry the stream they belong to.
pub type Stream = u64;

/// 20-byte RIPEMD-160 digest, the routable component of an address.
pub type Ripe = [u8; 20];

/// One 64-byte half of an uncompressed secp256k1 public key (X ‖ Y).
pub type PubkeyBytes = [u8; 64];

/// Seconds since the Unix epoch.
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Signed variant of [`now`] for fields that travel the wire as i64.
pub fn now_i64() -> i64 {
    now() as i64
}

/// 32-byte content hash identifying an object network-wide: the truncated
/// double-SHA-512 of `nonce ‖ payload_bytes_without_nonce`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InventoryVector(pub [u8; 32]);

impl InventoryVector {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse from a 32-byte slice, e.g. an inv frame entry.
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let arr: [u8; 32] = slice.try_into().ok()?;
        Some(Self(arr))
    }
}

impl fmt::Display for InventoryVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for InventoryVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "iv:{}", hex::encode(&self.0[..8]))
    }
}

impl AsRef<[u8]> for InventoryVector {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iv_equality_by_value() {
        let a = InventoryVector([7u8; 32]);
        let b = InventoryVector([7u8; 32]);
        let c = InventoryVector([8u8; 32]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn iv_display_is_hex() {
        let iv = InventoryVector([0xab; 32]);
        assert_eq!(iv.to_string(), "ab".repeat(32));
    }
}
