//! Known-peer registry: addresses learned from addr frames and successful
//! connections, dispensed per stream on demand.

use super::types::NetAddress;
use crate::types::now;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::RwLock;
use tracing::debug;

/// Addresses unheard-of for this long are no longer dispensed.
const HORIZON_SECS: u64 = 3 * 24 * 60 * 60;

/// Consecutive failures after which an address is parked.
const MAX_ATTEMPTS: u32 = 3;

/// Registry files above this size are rejected before deserialization.
const MAX_REGISTRY_FILE_SIZE: u64 = 16 * 1024 * 1024;

/// Set of known peer addresses, offered by peers and dispensed on demand.
///
/// Freshly-learned peers become available to subsequent
/// [`known_addresses`](NodeRegistry::known_addresses) calls.
pub trait NodeRegistry: Send + Sync {
    /// Up to `limit` dispensable peers serving any of `streams`, freshest
    /// first.
    fn known_addresses(&self, limit: usize, streams: &[u64]) -> Vec<NetAddress>;

    /// Merge newly-learned peers.
    fn offer_addresses(&self, addresses: &[NetAddress]);
}

/// Per-address connection history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressInfo {
    pub addr: NetAddress,
    pub last_attempt: u64,
    pub attempts: u32,
}

impl AddressInfo {
    fn new(addr: NetAddress) -> Self {
        Self { addr, last_attempt: 0, attempts: 0 }
    }

    /// Deprioritized: repeatedly failing, stale, or from the future.
    fn is_terrible(&self) -> bool {
        let now = now();
        if self.addr.time > now.saturating_add(600) {
            return true;
        }
        if self.attempts >= MAX_ATTEMPTS {
            return true;
        }
        self.addr.time < now.saturating_sub(HORIZON_SECS)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AddrMan {
    addrs: RwLock<HashMap<SocketAddr, AddressInfo>>,
}

impl AddrMan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from file with a size cap against malicious registry files.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let data = std::fs::read(&path)?;
        if data.len() as u64 > MAX_REGISTRY_FILE_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("registry file too large: {} bytes", data.len()),
            ));
        }
        bincode::deserialize(&data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let data = bincode::serialize(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, data)
    }

    pub fn len(&self) -> usize {
        self.addrs.read().expect("registry lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record a failed dial for backoff.
    pub fn mark_attempt(&self, addr: &SocketAddr) {
        if let Some(info) = self.addrs.write().expect("registry lock").get_mut(addr) {
            info.last_attempt = now();
            info.attempts += 1;
        }
    }

    /// Reset backoff and refresh the last-seen time.
    pub fn mark_success(&self, addr: &SocketAddr) {
        if let Some(info) = self.addrs.write().expect("registry lock").get_mut(addr) {
            info.attempts = 0;
            info.addr.time = now();
        }
    }
}

impl NodeRegistry for AddrMan {
    fn known_addresses(&self, limit: usize, streams: &[u64]) -> Vec<NetAddress> {
        let addrs = self.addrs.read().expect("registry lock");
        let mut matching: Vec<&AddressInfo> = addrs
            .values()
            .filter(|info| streams.contains(&info.addr.stream) && !info.is_terrible())
            .collect();
        matching.sort_by(|a, b| b.addr.time.cmp(&a.addr.time));
        matching.into_iter().take(limit).map(|info| info.addr.clone()).collect()
    }

    fn offer_addresses(&self, addresses: &[NetAddress]) {
        let now = now();
        let mut addrs = self.addrs.write().expect("registry lock");
        for addr in addresses {
            let mut addr = addr.clone();
            // Self-reported timestamps from the future are clamped.
            addr.time = addr.time.min(now);
            let socket = addr.socket_addr();
            addrs
                .entry(socket)
                .and_modify(|info| {
                    if addr.time > info.addr.time {
                        info.addr = addr.clone();
                    }
                })
                .or_insert_with(|| {
                    debug!("learned new peer {socket} on stream {}", addr.stream);
                    AddressInfo::new(addr)
                });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn address(last_octet: u8, stream: u64) -> NetAddress {
        NetAddress::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, last_octet)), 8444, stream)
    }

    #[test]
    fn offered_addresses_become_dispensable() {
        let registry = AddrMan::new();
        assert!(registry.known_addresses(10, &[1]).is_empty());

        registry.offer_addresses(&[address(1, 1), address(2, 1), address(3, 2)]);
        let stream1 = registry.known_addresses(10, &[1]);
        assert_eq!(stream1.len(), 2);
        assert!(stream1.iter().all(|a| a.stream == 1));

        assert_eq!(registry.known_addresses(10, &[2]).len(), 1);
        assert_eq!(registry.known_addresses(10, &[1, 2]).len(), 3);
        assert_eq!(registry.known_addresses(2, &[1, 2]).len(), 2);
    }

    #[test]
    fn repeated_offers_do_not_duplicate() {
        let registry = AddrMan::new();
        registry.offer_addresses(&[address(1, 1)]);
        registry.offer_addresses(&[address(1, 1)]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn failing_addresses_are_parked() {
        let registry = AddrMan::new();
        registry.offer_addresses(&[address(1, 1)]);
        let socket = address(1, 1).socket_addr();
        for _ in 0..MAX_ATTEMPTS {
            registry.mark_attempt(&socket);
        }
        assert!(registry.known_addresses(10, &[1]).is_empty());

        registry.mark_success(&socket);
        assert_eq!(registry.known_addresses(10, &[1]).len(), 1);
    }

    #[test]
    fn registry_survives_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("knownnodes.dat");

        let registry = AddrMan::new();
        registry.offer_addresses(&[address(1, 1), address(2, 2)]);
        registry.save(&path).unwrap();

        let loaded = AddrMan::load(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.known_addresses(10, &[2]).len(), 1);
    }
}
