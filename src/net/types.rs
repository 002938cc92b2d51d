//! Network constants and types for the object gossip protocol.
//!
//! All collections and frames have explicit size limits; a peer cannot
//! exhaust memory by sending large or many messages.

use crate::wire::{self, Reader, WireError};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

// =============================================================================
// PROTOCOL IDENTIFICATION
// =============================================================================

/// Minimum acceptable peer protocol version. Lower versions are
/// disconnected during the handshake.
pub const PROTOCOL_VERSION: u32 = 3;

/// Magic bytes prefixing every frame. Prevents cross-talk with other P2P
/// networks on the same port.
pub const PROTOCOL_MAGIC: [u8; 4] = [0xE9, 0xBE, 0xB4, 0xD9];

/// Default TCP port.
pub const DEFAULT_PORT: u16 = 8444;

// =============================================================================
// FRAME AND COLLECTION LIMITS
// =============================================================================

/// Outer limit for any frame payload.
pub const MAX_PAYLOAD_BYTES: u32 = 2 * 1024 * 1024;

/// A single object may not exceed 2^18 bytes.
pub const MAX_OBJECT_BYTES: u64 = 262_144;

/// Maximum IVs per inv/getdata frame; larger inventories are chunked.
pub const MAX_INV_ENTRIES: u64 = 50_000;

/// Maximum addresses per addr frame.
pub const MAX_ADDR_ENTRIES: u64 = 1_000;

/// Maximum streams a peer may advertise in its version frame.
pub const MAX_STREAMS: u64 = 64;

/// User agent strings are bounded at this length on decode.
pub const MAX_USER_AGENT_BYTES: u64 = 256;

// =============================================================================
// TIMING
// =============================================================================

/// Per-connection iv cache entries older than this are evicted
/// opportunistically before each update.
pub const IV_CACHE_EXPIRY_SECS: u64 = 300;

/// Entries in the cross-connection request map older than this no longer
/// suppress a re-request; a crashed peer cannot shadow an IV forever.
pub const REQUEST_STALE_SECS: u64 = 3600;

/// Read-idle window after which a drained sync connection is finished.
pub const SYNC_IDLE_MILLIS: u64 = 1000;

/// Objects are offered onward to at most this many random peers.
pub const OFFER_FANOUT: usize = 8;

// =============================================================================
// PROOF-OF-WORK DEFAULTS
// =============================================================================

/// Network-wide minimum difficulty per payload byte.
pub const NETWORK_NONCE_TRIALS_PER_BYTE: u64 = 1000;

/// Network-wide flat difficulty surcharge.
pub const NETWORK_EXTRA_BYTES: u64 = 1000;

// =============================================================================
// CONNECTION ENUMS
// =============================================================================

/// Who initiated the connection and what it is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Accepted from a listener.
    Server,
    /// Dialed out and kept alive.
    Client,
    /// Dialed out for a bounded catch-up exchange.
    Sync,
}

/// Per-peer state machine.
///
/// ```text
/// Connecting ──(version + both veracks)──► Active ──► Disconnected
///      └──────(violation / self-connect / obsolete peer)────┘
/// ```
///
/// Only `Active` connections exchange data-plane frames; a pre-handshake
/// peer cannot inject objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Active,
    Disconnected,
}

// =============================================================================
// NETWORK ADDRESS
// =============================================================================

/// A peer address with service flags and the stream it serves.
///
/// The timestamp is self-reported and untrusted; it only feeds freshness
/// heuristics in the registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct NetAddress {
    pub services: u64,
    pub ip: IpAddr,
    pub port: u16,
    pub stream: u64,
    pub time: u64,
}

impl NetAddress {
    pub fn new(ip: IpAddr, port: u16, stream: u64) -> Self {
        Self { services: 1, ip, port, stream, time: crate::types::now() }
    }

    pub fn from_socket_addr(addr: SocketAddr, stream: u64) -> Self {
        Self::new(addr.ip(), addr.port(), stream)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Filters loopback/private/link-local/unspecified addresses so the
    /// registry is not polluted with unroutable entries.
    pub fn is_routable(&self) -> bool {
        match self.ip {
            IpAddr::V4(ip) => {
                !ip.is_private()
                    && !ip.is_loopback()
                    && !ip.is_link_local()
                    && !ip.is_broadcast()
                    && !ip.is_unspecified()
            }
            IpAddr::V6(ip) => {
                if ip.is_loopback() || ip.is_unspecified() || ip.is_multicast() {
                    return false;
                }
                let segments = ip.segments();
                // fc00::/7 unique-local and fe80::/10 link-local
                (segments[0] & 0xfe00) != 0xfc00 && (segments[0] & 0xffc0) != 0xfe80
            }
        }
    }

    fn ipv6_octets(&self) -> [u8; 16] {
        match self.ip {
            IpAddr::V4(ip) => ip.to_ipv6_mapped().octets(),
            IpAddr::V6(ip) => ip.octets(),
        }
    }

    fn ip_from_octets(octets: [u8; 16]) -> IpAddr {
        let v6 = Ipv6Addr::from(octets);
        match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        }
    }

    /// Short form used inside version frames: services ‖ ip ‖ port.
    pub fn encode_short(&self, out: &mut Vec<u8>) {
        wire::write_u64(out, self.services);
        out.extend_from_slice(&self.ipv6_octets());
        wire::write_u16(out, self.port);
    }

    pub fn decode_short(r: &mut Reader<'_>, stream: u64) -> Result<Self, WireError> {
        let services = r.u64()?;
        let ip = Self::ip_from_octets(r.array()?);
        let port = r.u16()?;
        Ok(Self { services, ip, port, stream, time: crate::types::now() })
    }

    /// Long form used inside addr frames: time ‖ stream ‖ services ‖ ip ‖
    /// port.
    pub fn encode_long(&self, out: &mut Vec<u8>) {
        wire::write_u64(out, self.time);
        wire::write_u32(out, self.stream as u32);
        wire::write_u64(out, self.services);
        out.extend_from_slice(&self.ipv6_octets());
        wire::write_u16(out, self.port);
    }

    pub fn decode_long(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let time = r.u64()?;
        let stream = r.u32()? as u64;
        let services = r.u64()?;
        let ip = Self::ip_from_octets(r.array()?);
        let port = r.u16()?;
        Ok(Self { services, ip, port, stream, time })
    }
}

/// Placeholder for an unknown own address.
pub fn unspecified_address(stream: u64) -> NetAddress {
    NetAddress {
        services: 1,
        ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        port: 0,
        stream,
        time: crate::types::now(),
    }
}

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Node-wide network configuration, injected into the handler and every
/// connection.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub port: u16,
    /// Streams this node serves.
    pub streams: Vec<u64>,
    pub user_agent: String,
    pub services: u64,
    /// Admission difficulty; must match between senders and verifiers.
    pub nonce_trials_per_byte: u64,
    pub extra_bytes: u64,
    /// Peers below this protocol version are disconnected.
    pub min_peer_version: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            streams: vec![1],
            user_agent: format!("/bmnet:{}/", env!("CARGO_PKG_VERSION")),
            services: 1,
            nonce_trials_per_byte: NETWORK_NONCE_TRIALS_PER_BYTE,
            extra_bytes: NETWORK_EXTRA_BYTES,
            min_peer_version: PROTOCOL_VERSION,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_short_form_roundtrip() {
        let addr = NetAddress::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)), 8444, 1);
        let mut out = Vec::new();
        addr.encode_short(&mut out);
        assert_eq!(out.len(), 26);
        let mut r = Reader::new(&out);
        let decoded = NetAddress::decode_short(&mut r, 1).unwrap();
        assert_eq!(decoded.ip, addr.ip);
        assert_eq!(decoded.port, 8444);
        assert_eq!(decoded.stream, 1);
    }

    #[test]
    fn address_long_form_roundtrip() {
        let addr = NetAddress {
            services: 1,
            ip: "2001:4860::8888".parse().unwrap(),
            port: 8444,
            stream: 2,
            time: 1_700_000_000,
        };
        let mut out = Vec::new();
        addr.encode_long(&mut out);
        assert_eq!(out.len(), 38);
        let mut r = Reader::new(&out);
        let decoded = NetAddress::decode_long(&mut r).unwrap();
        assert_eq!(decoded, addr);
    }

    #[test]
    fn routability_filters_local_addresses() {
        assert!(!NetAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8444, 1).is_routable());
        assert!(!NetAddress::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 8444, 1).is_routable());
        assert!(NetAddress::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)), 8444, 1).is_routable());
    }
}
