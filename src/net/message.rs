//! Frame-level protocol messages.
//!
//! Every frame is `magic ‖ command(12, NUL-padded ASCII) ‖ length(u32 BE) ‖
//! checksum(first 4 bytes of double-SHA-512 of payload) ‖ payload`.

use super::types::{
    MAX_ADDR_ENTRIES, MAX_INV_ENTRIES, MAX_OBJECT_BYTES, MAX_PAYLOAD_BYTES, MAX_STREAMS,
    MAX_USER_AGENT_BYTES, NetAddress, NetworkConfig, PROTOCOL_MAGIC, PROTOCOL_VERSION,
    unspecified_address,
};
use crate::crypto::Cryptography;
use crate::object::{ObjectError, ObjectMessage};
use crate::types::{InventoryVector, now_i64};
use crate::wire::{self, Reader, WireError};
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Object(#[from] ObjectError),

    #[error("frame does not start with the protocol magic")]
    BadMagic,

    #[error("unknown command {0:?}")]
    UnknownCommand(String),

    #[error("payload checksum mismatch")]
    ChecksumMismatch,

    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(u32),
}

/// Version handshake payload.
///
/// The nonce detects self-connections; `streams` advertises which parts of
/// the object space the peer serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionPayload {
    pub version: u32,
    pub services: u64,
    pub timestamp: i64,
    pub addr_recv: NetAddress,
    pub addr_from: NetAddress,
    pub nonce: u64,
    pub user_agent: String,
    pub streams: Vec<u64>,
}

impl VersionPayload {
    pub fn new(config: &NetworkConfig, addr_recv: NetAddress, nonce: u64) -> Self {
        let own_stream = config.streams.first().copied().unwrap_or(1);
        Self {
            version: PROTOCOL_VERSION,
            services: config.services,
            timestamp: now_i64(),
            addr_recv,
            addr_from: unspecified_address(own_stream),
            nonce,
            user_agent: config.user_agent.clone(),
            streams: config.streams.clone(),
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        wire::write_u32(out, self.version);
        wire::write_u64(out, self.services);
        wire::write_i64(out, self.timestamp);
        self.addr_recv.encode_short(out);
        self.addr_from.encode_short(out);
        wire::write_u64(out, self.nonce);
        wire::write_var_str(out, &self.user_agent);
        wire::write_varint_list(out, &self.streams);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let version = r.u32()?;
        let services = r.u64()?;
        let timestamp = r.i64()?;
        let addr_recv = NetAddress::decode_short(r, 0)?;
        let addr_from = NetAddress::decode_short(r, 0)?;
        let nonce = r.u64()?;
        let user_agent = r.var_str(MAX_USER_AGENT_BYTES)?.to_string();
        let streams = r.varint_list(MAX_STREAMS)?;
        Ok(Self { version, services, timestamp, addr_recv, addr_from, nonce, user_agent, streams })
    }
}

/// All frames the core exchanges.
#[derive(Debug, Clone)]
pub enum NetworkMessage {
    Version(VersionPayload),
    Verack,
    Addr(Vec<NetAddress>),
    Inv(Vec<InventoryVector>),
    GetData(Vec<InventoryVector>),
    Object(Arc<ObjectMessage>),
    Custom(Vec<u8>),
}

impl NetworkMessage {
    pub fn command(&self) -> &'static str {
        match self {
            NetworkMessage::Version(_) => "version",
            NetworkMessage::Verack => "verack",
            NetworkMessage::Addr(_) => "addr",
            NetworkMessage::Inv(_) => "inv",
            NetworkMessage::GetData(_) => "getdata",
            NetworkMessage::Object(_) => "object",
            NetworkMessage::Custom(_) => "custom",
        }
    }

    /// Control-plane frames a connection may process before it is Active.
    pub fn allowed_pre_handshake(&self) -> bool {
        matches!(
            self,
            NetworkMessage::Version(_) | NetworkMessage::Verack | NetworkMessage::Custom(_)
        )
    }

    fn encode_payload(&self) -> Result<Vec<u8>, FrameError> {
        let mut out = Vec::new();
        match self {
            NetworkMessage::Version(v) => v.encode(&mut out),
            NetworkMessage::Verack => {}
            NetworkMessage::Addr(addrs) => {
                wire::write_varint(&mut out, addrs.len() as u64);
                for addr in addrs {
                    addr.encode_long(&mut out);
                }
            }
            NetworkMessage::Inv(ivs) | NetworkMessage::GetData(ivs) => {
                wire::write_varint(&mut out, ivs.len() as u64);
                for iv in ivs {
                    out.extend_from_slice(iv.as_bytes());
                }
            }
            NetworkMessage::Object(object) => object.encode(&mut out)?,
            NetworkMessage::Custom(body) => out.extend_from_slice(body),
        }
        Ok(out)
    }

    /// Frame this message for the wire.
    pub fn encode_frame(&self, crypto: &dyn Cryptography) -> Result<Bytes, FrameError> {
        let payload = self.encode_payload()?;
        if payload.len() as u32 > MAX_PAYLOAD_BYTES {
            return Err(FrameError::PayloadTooLarge(payload.len() as u32));
        }

        let mut command = [0u8; 12];
        let name = self.command().as_bytes();
        command[..name.len()].copy_from_slice(name);
        let checksum = &crypto.double_sha512(&payload)[..4];

        let mut frame = BytesMut::with_capacity(FrameHeader::LEN + payload.len());
        frame.put_slice(&PROTOCOL_MAGIC);
        frame.put_slice(&command);
        frame.put_u32(payload.len() as u32);
        frame.put_slice(checksum);
        frame.put_slice(&payload);
        Ok(frame.freeze())
    }

    /// Decode a payload for a validated header.
    pub fn decode_payload(
        header: &FrameHeader,
        payload: &[u8],
        crypto: &dyn Cryptography,
    ) -> Result<Self, FrameError> {
        if crypto.double_sha512(payload)[..4] != header.checksum {
            return Err(FrameError::ChecksumMismatch);
        }

        let mut r = Reader::new(payload);
        let msg = match header.command_str() {
            "version" => NetworkMessage::Version(VersionPayload::decode(&mut r)?),
            "verack" => NetworkMessage::Verack,
            "addr" => {
                let count = r.varint_count(MAX_ADDR_ENTRIES)?;
                let mut addrs = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    addrs.push(NetAddress::decode_long(&mut r)?);
                }
                NetworkMessage::Addr(addrs)
            }
            "inv" => NetworkMessage::Inv(decode_iv_list(&mut r)?),
            "getdata" => NetworkMessage::GetData(decode_iv_list(&mut r)?),
            "object" => {
                if payload.len() as u64 > MAX_OBJECT_BYTES {
                    return Err(FrameError::PayloadTooLarge(payload.len() as u32));
                }
                NetworkMessage::Object(Arc::new(ObjectMessage::decode(payload)?))
            }
            "custom" => NetworkMessage::Custom(payload.to_vec()),
            other => return Err(FrameError::UnknownCommand(other.to_string())),
        };
        Ok(msg)
    }
}

fn decode_iv_list(r: &mut Reader<'_>) -> Result<Vec<InventoryVector>, WireError> {
    let count = r.varint_count(MAX_INV_ENTRIES)?;
    let mut ivs = Vec::with_capacity(count as usize);
    for _ in 0..count {
        ivs.push(InventoryVector(r.array()?));
    }
    Ok(ivs)
}

/// Parsed frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub command: [u8; 12],
    pub length: u32,
    pub checksum: [u8; 4],
}

impl FrameHeader {
    pub const LEN: usize = 24;

    pub fn decode(bytes: &[u8; Self::LEN]) -> Result<Self, FrameError> {
        if bytes[..4] != PROTOCOL_MAGIC {
            return Err(FrameError::BadMagic);
        }
        let mut command = [0u8; 12];
        command.copy_from_slice(&bytes[4..16]);
        let length = u32::from_be_bytes(bytes[16..20].try_into().expect("4 bytes"));
        if length > MAX_PAYLOAD_BYTES {
            return Err(FrameError::PayloadTooLarge(length));
        }
        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&bytes[20..24]);
        Ok(Self { command, length, checksum })
    }

    pub fn command_str(&self) -> &str {
        let end = self.command.iter().position(|&b| b == 0).unwrap_or(12);
        std::str::from_utf8(&self.command[..end]).unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Secp256k1Crypto;
    use crate::object::Payload;
    use crate::object::payload::Generic;
    use std::net::{IpAddr, Ipv4Addr};

    fn frame_roundtrip(msg: NetworkMessage) -> NetworkMessage {
        let crypto = Secp256k1Crypto::new();
        let frame = msg.encode_frame(&crypto).unwrap();
        let header = FrameHeader::decode(&frame[..FrameHeader::LEN].try_into().unwrap()).unwrap();
        assert_eq!(header.length as usize, frame.len() - FrameHeader::LEN);
        NetworkMessage::decode_payload(&header, &frame[FrameHeader::LEN..], &crypto).unwrap()
    }

    fn sample_address() -> NetAddress {
        NetAddress::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)), 8444, 1)
    }

    #[test]
    fn version_frame_roundtrip() {
        let config = NetworkConfig { streams: vec![1, 2], ..NetworkConfig::default() };
        let version = VersionPayload::new(&config, sample_address(), 4242);
        let decoded = frame_roundtrip(NetworkMessage::Version(version.clone()));
        match decoded {
            NetworkMessage::Version(v) => {
                assert_eq!(v.nonce, 4242);
                assert_eq!(v.streams, vec![1, 2]);
                assert_eq!(v.user_agent, version.user_agent);
                assert_eq!(v.addr_recv.ip, version.addr_recv.ip);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn verack_and_addr_roundtrip() {
        assert!(matches!(frame_roundtrip(NetworkMessage::Verack), NetworkMessage::Verack));

        let addrs = vec![sample_address(), sample_address()];
        match frame_roundtrip(NetworkMessage::Addr(addrs.clone())) {
            NetworkMessage::Addr(decoded) => assert_eq!(decoded.len(), 2),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn inv_and_getdata_roundtrip() {
        let ivs = vec![InventoryVector([1u8; 32]), InventoryVector([2u8; 32])];
        match frame_roundtrip(NetworkMessage::Inv(ivs.clone())) {
            NetworkMessage::Inv(decoded) => assert_eq!(decoded, ivs),
            other => panic!("unexpected message: {other:?}"),
        }
        match frame_roundtrip(NetworkMessage::GetData(ivs.clone())) {
            NetworkMessage::GetData(decoded) => assert_eq!(decoded, ivs),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn object_frame_roundtrip() {
        let crypto = Secp256k1Crypto::new();
        let payload = Payload::Generic(Generic {
            object_type: 9,
            version: 1,
            stream: 1,
            body: b"framed".to_vec(),
        });
        let mut obj = ObjectMessage::new(crate::types::now() as i64 + 600, payload);
        obj.do_proof_of_work(&crypto, 1, 0).unwrap();
        let iv = obj.inventory_vector(&crypto).unwrap();

        match frame_roundtrip(NetworkMessage::Object(Arc::new(obj))) {
            NetworkMessage::Object(decoded) => {
                assert_eq!(decoded.inventory_vector(&crypto).unwrap(), iv);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn corrupted_payload_fails_checksum() {
        let crypto = Secp256k1Crypto::new();
        let frame =
            NetworkMessage::Custom(b"ping".to_vec()).encode_frame(&crypto).unwrap();
        let header = FrameHeader::decode(&frame[..FrameHeader::LEN].try_into().unwrap()).unwrap();
        let mut payload = frame[FrameHeader::LEN..].to_vec();
        payload[0] ^= 0xff;
        assert!(matches!(
            NetworkMessage::decode_payload(&header, &payload, &crypto),
            Err(FrameError::ChecksumMismatch)
        ));
    }

    #[test]
    fn foreign_magic_is_rejected() {
        let mut header = [0u8; FrameHeader::LEN];
        header[..4].copy_from_slice(&[0xD9, 0xB4, 0xBE, 0xF9]);
        assert!(matches!(FrameHeader::decode(&header), Err(FrameError::BadMagic)));
    }

    #[test]
    fn unknown_command_is_rejected() {
        let crypto = Secp256k1Crypto::new();
        let mut bytes = [0u8; FrameHeader::LEN];
        bytes[..4].copy_from_slice(&PROTOCOL_MAGIC);
        bytes[4..8].copy_from_slice(b"ping");
        let checksum = &crypto.double_sha512(&[])[..4];
        bytes[20..24].copy_from_slice(checksum);
        let header = FrameHeader::decode(&bytes).unwrap();
        assert!(matches!(
            NetworkMessage::decode_payload(&header, &[], &crypto),
            Err(FrameError::UnknownCommand(_))
        ));
    }

    #[test]
    fn handshake_gating_classification() {
        assert!(NetworkMessage::Verack.allowed_pre_handshake());
        assert!(NetworkMessage::Custom(Vec::new()).allowed_pre_handshake());
        assert!(!NetworkMessage::Inv(Vec::new()).allowed_pre_handshake());
        assert!(!NetworkMessage::Addr(Vec::new()).allowed_pre_handshake());
        assert!(!NetworkMessage::GetData(Vec::new()).allowed_pre_handshake());
    }
}
