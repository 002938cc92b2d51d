//! Typed object payloads: getpubkey, pubkey (v2-v4), msg, broadcast
//! (v4/v5) and the generic fallback.
//!
//! Capability predicates (`is_signed`, `is_encrypted`) are variant-level
//! functions. Encrypted variants hold a [`CryptoState`] instead of nullable
//! ciphertext/plaintext pairs; the only transitions are `encrypt` and
//! `decrypt`.

use super::plaintext::{Plaintext, PlaintextKind};
use super::{MAX_SIGNATURE_BYTES, ObjectError};
use crate::crypto::Cryptography;
use crate::types::{PubkeyBytes, Ripe};
use crate::wire::{self, Reader};
use secp256k1::SecretKey;

/// Object type discriminants on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ObjectType {
    Getpubkey = 0,
    Pubkey = 1,
    Msg = 2,
    Broadcast = 3,
}

impl ObjectType {
    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Getpubkey),
            1 => Some(Self::Pubkey),
            2 => Some(Self::Msg),
            3 => Some(Self::Broadcast),
            _ => None,
        }
    }
}

/// Ciphertext/plaintext duality of an encrypted payload body.
///
/// `Sealed` is what arrives off the wire, `Open` is what a local sender
/// builds, `Both` is reached after a successful `encrypt`/`decrypt`.
#[derive(Debug, Clone)]
pub enum CryptoState<T> {
    Sealed(Vec<u8>),
    Open(T),
    Both { cipher: Vec<u8>, plain: T },
}

impl<T> CryptoState<T> {
    pub fn is_decrypted(&self) -> bool {
        !matches!(self, CryptoState::Sealed(_))
    }

    pub fn plain(&self) -> Option<&T> {
        match self {
            CryptoState::Sealed(_) => None,
            CryptoState::Open(p) | CryptoState::Both { plain: p, .. } => Some(p),
        }
    }

    pub fn plain_mut(&mut self) -> Option<&mut T> {
        match self {
            CryptoState::Sealed(_) => None,
            CryptoState::Open(p) | CryptoState::Both { plain: p, .. } => Some(p),
        }
    }

    pub fn cipher(&self) -> Option<&[u8]> {
        match self {
            CryptoState::Open(_) => None,
            CryptoState::Sealed(c) | CryptoState::Both { cipher: c, .. } => Some(c),
        }
    }
}

/// What a getpubkey asks for: a ripe (v ≤ 3) or a tag (v4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PubkeyRequest {
    Ripe(Ripe),
    Tag([u8; 32]),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Getpubkey {
    pub version: u64,
    pub stream: u64,
    pub request: PubkeyRequest,
}

/// Key material advertised by a pubkey object. Version 2 stops after the
/// encryption key; v3 adds proof-of-work parameters and a signature.
#[derive(Debug, Clone)]
pub struct PubkeyData {
    pub behavior: u32,
    pub signing_key: PubkeyBytes,
    pub encryption_key: PubkeyBytes,
    pub nonce_trials_per_byte: u64,
    pub extra_bytes: u64,
    pub signature: Option<Vec<u8>>,
}

impl PubkeyData {
    fn decode_v2(r: &mut Reader<'_>) -> Result<Self, ObjectError> {
        Ok(Self {
            behavior: r.u32()?,
            signing_key: r.array()?,
            encryption_key: r.array()?,
            nonce_trials_per_byte: 0,
            extra_bytes: 0,
            signature: None,
        })
    }

    fn decode_v3(r: &mut Reader<'_>) -> Result<Self, ObjectError> {
        let mut data = Self::decode_v2(r)?;
        data.nonce_trials_per_byte = r.varint()?;
        data.extra_bytes = r.varint()?;
        data.signature = Some(r.var_bytes(MAX_SIGNATURE_BYTES)?.to_vec());
        Ok(data)
    }

    fn encode(&self, out: &mut Vec<u8>, version: u64, with_signature: bool) {
        wire::write_u32(out, self.behavior);
        out.extend_from_slice(&self.signing_key);
        out.extend_from_slice(&self.encryption_key);
        if version >= 3 {
            wire::write_varint(out, self.nonce_trials_per_byte);
            wire::write_varint(out, self.extra_bytes);
            if with_signature {
                wire::write_var_bytes(out, self.signature.as_deref().unwrap_or_default());
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum Pubkey {
    V2 { stream: u64, data: PubkeyData },
    V3 { stream: u64, data: PubkeyData },
    V4 { stream: u64, tag: [u8; 32], state: CryptoState<PubkeyData> },
}

impl Pubkey {
    pub fn version(&self) -> u64 {
        match self {
            Pubkey::V2 { .. } => 2,
            Pubkey::V3 { .. } => 3,
            Pubkey::V4 { .. } => 4,
        }
    }

    /// The advertised keys, if readable (v4 requires a prior decrypt).
    pub fn data(&self) -> Option<&PubkeyData> {
        match self {
            Pubkey::V2 { data, .. } | Pubkey::V3 { data, .. } => Some(data),
            Pubkey::V4 { state, .. } => state.plain(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Msg {
    pub stream: u64,
    pub state: CryptoState<Plaintext>,
}

#[derive(Debug, Clone)]
pub struct Broadcast {
    pub version: u64,
    pub stream: u64,
    /// Present from v5 on; derived from the sender address.
    pub tag: Option<[u8; 32]>,
    pub state: CryptoState<Plaintext>,
}

/// Unknown object types are carried and gossiped verbatim.
#[derive(Debug, Clone)]
pub struct Generic {
    pub object_type: u32,
    pub version: u64,
    pub stream: u64,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum Payload {
    Getpubkey(Getpubkey),
    Pubkey(Pubkey),
    Msg(Msg),
    Broadcast(Broadcast),
    Generic(Generic),
}

impl Payload {
    /// Factory: reconstruct the concrete variant from the object header
    /// fields and the remaining body bytes.
    pub fn decode(
        object_type: u32,
        version: u64,
        stream: u64,
        body: &[u8],
    ) -> Result<Self, ObjectError> {
        let mut r = Reader::new(body);
        let generic = |body: &[u8]| {
            Payload::Generic(Generic { object_type, version, stream, body: body.to_vec() })
        };
        let payload = match ObjectType::from_wire(object_type) {
            Some(ObjectType::Getpubkey) if (2..=4).contains(&version) => {
                let request = if version < 4 {
                    PubkeyRequest::Ripe(r.array()?)
                } else {
                    PubkeyRequest::Tag(r.array()?)
                };
                Payload::Getpubkey(Getpubkey { version, stream, request })
            }
            Some(ObjectType::Pubkey) => match version {
                2 => Payload::Pubkey(Pubkey::V2 { stream, data: PubkeyData::decode_v2(&mut r)? }),
                3 => Payload::Pubkey(Pubkey::V3 { stream, data: PubkeyData::decode_v3(&mut r)? }),
                4 => Payload::Pubkey(Pubkey::V4 {
                    stream,
                    tag: r.array()?,
                    state: CryptoState::Sealed(r.rest().to_vec()),
                }),
                _ => generic(body),
            },
            Some(ObjectType::Msg) if version == 1 => {
                Payload::Msg(Msg { stream, state: CryptoState::Sealed(r.rest().to_vec()) })
            }
            Some(ObjectType::Broadcast) if version == 4 || version == 5 => {
                let tag = if version >= 5 { Some(r.array()?) } else { None };
                Payload::Broadcast(Broadcast {
                    version,
                    stream,
                    tag,
                    state: CryptoState::Sealed(r.rest().to_vec()),
                })
            }
            // Unknown types and unknown versions of known types are
            // carried verbatim.
            _ => generic(body),
        };
        Ok(payload)
    }

    pub fn object_type(&self) -> u32 {
        match self {
            Payload::Getpubkey(_) => ObjectType::Getpubkey as u32,
            Payload::Pubkey(_) => ObjectType::Pubkey as u32,
            Payload::Msg(_) => ObjectType::Msg as u32,
            Payload::Broadcast(_) => ObjectType::Broadcast as u32,
            Payload::Generic(g) => g.object_type,
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            Payload::Getpubkey(g) => g.version,
            Payload::Pubkey(p) => p.version(),
            Payload::Msg(_) => 1,
            Payload::Broadcast(b) => b.version,
            Payload::Generic(g) => g.version,
        }
    }

    pub fn stream(&self) -> u64 {
        match self {
            Payload::Getpubkey(g) => g.stream,
            Payload::Pubkey(Pubkey::V2 { stream, .. })
            | Payload::Pubkey(Pubkey::V3 { stream, .. })
            | Payload::Pubkey(Pubkey::V4 { stream, .. }) => *stream,
            Payload::Msg(m) => m.stream,
            Payload::Broadcast(b) => b.stream,
            Payload::Generic(g) => g.stream,
        }
    }

    pub fn is_signed(&self) -> bool {
        match self {
            Payload::Pubkey(p) => p.version() >= 3,
            Payload::Msg(_) | Payload::Broadcast(_) => true,
            Payload::Getpubkey(_) | Payload::Generic(_) => false,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        match self {
            Payload::Pubkey(Pubkey::V4 { .. }) | Payload::Msg(_) | Payload::Broadcast(_) => true,
            _ => false,
        }
    }

    /// True unless an encrypted body is still sealed.
    pub fn is_decrypted(&self) -> bool {
        match self {
            Payload::Pubkey(Pubkey::V4 { state, .. }) => state.is_decrypted(),
            Payload::Msg(m) => m.state.is_decrypted(),
            Payload::Broadcast(b) => b.state.is_decrypted(),
            _ => true,
        }
    }

    pub fn signature(&self) -> Option<&[u8]> {
        match self {
            Payload::Pubkey(p) => p.data().and_then(|d| d.signature.as_deref()),
            Payload::Msg(m) => m.state.plain().and_then(|p| p.signature()),
            Payload::Broadcast(b) => b.state.plain().and_then(|p| p.signature()),
            _ => None,
        }
    }

    pub fn set_signature(&mut self, signature: Vec<u8>) -> Result<(), ObjectError> {
        match self {
            Payload::Pubkey(Pubkey::V3 { data, .. }) => {
                data.signature = Some(signature);
                Ok(())
            }
            Payload::Pubkey(Pubkey::V4 { state, .. }) => {
                let data = state.plain_mut().ok_or(ObjectError::NotDecrypted)?;
                data.signature = Some(signature);
                Ok(())
            }
            Payload::Msg(m) => {
                let plain = m.state.plain_mut().ok_or(ObjectError::NotDecrypted)?;
                plain.set_signature(signature);
                Ok(())
            }
            Payload::Broadcast(b) => {
                let plain = b.state.plain_mut().ok_or(ObjectError::NotDecrypted)?;
                plain.set_signature(signature);
                Ok(())
            }
            _ => Err(ObjectError::Unsigned),
        }
    }

    /// Full wire encoding of the body (everything after the object header).
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), ObjectError> {
        match self {
            Payload::Getpubkey(g) => {
                match &g.request {
                    PubkeyRequest::Ripe(ripe) => out.extend_from_slice(ripe),
                    PubkeyRequest::Tag(tag) => out.extend_from_slice(tag),
                }
                Ok(())
            }
            Payload::Pubkey(Pubkey::V2 { data, .. }) => {
                data.encode(out, 2, false);
                Ok(())
            }
            Payload::Pubkey(Pubkey::V3 { data, .. }) => {
                data.encode(out, 3, true);
                Ok(())
            }
            Payload::Pubkey(Pubkey::V4 { tag, state, .. }) => {
                out.extend_from_slice(tag);
                let cipher = state.cipher().ok_or(ObjectError::NotEncrypted)?;
                out.extend_from_slice(cipher);
                Ok(())
            }
            Payload::Msg(m) => {
                let cipher = m.state.cipher().ok_or(ObjectError::NotEncrypted)?;
                out.extend_from_slice(cipher);
                Ok(())
            }
            Payload::Broadcast(b) => {
                if let Some(tag) = &b.tag {
                    out.extend_from_slice(tag);
                }
                let cipher = b.state.cipher().ok_or(ObjectError::NotEncrypted)?;
                out.extend_from_slice(cipher);
                Ok(())
            }
            Payload::Generic(g) => {
                out.extend_from_slice(&g.body);
                Ok(())
            }
        }
    }

    /// Canonical signature pre-image contribution: the readable body with
    /// the trailing signature omitted. Requires a decrypted payload.
    pub fn write_bytes_to_sign(&self, out: &mut Vec<u8>) -> Result<(), ObjectError> {
        match self {
            Payload::Pubkey(Pubkey::V3 { data, .. }) => {
                data.encode(out, 3, false);
                Ok(())
            }
            Payload::Pubkey(Pubkey::V4 { tag, state, .. }) => {
                let data = state.plain().ok_or(ObjectError::NotDecrypted)?;
                out.extend_from_slice(tag);
                data.encode(out, 4, false);
                Ok(())
            }
            Payload::Msg(m) => {
                let plain = m.state.plain().ok_or(ObjectError::NotDecrypted)?;
                plain.write_bytes_to_sign(out);
                Ok(())
            }
            Payload::Broadcast(b) => {
                let plain = b.state.plain().ok_or(ObjectError::NotDecrypted)?;
                plain.write_bytes_to_sign(out);
                Ok(())
            }
            _ => Err(ObjectError::Unsigned),
        }
    }

    /// Seal the readable body to `recipient`. Open → Both.
    pub fn encrypt(
        &mut self,
        crypto: &dyn Cryptography,
        recipient: &PubkeyBytes,
    ) -> Result<(), ObjectError> {
        match self {
            Payload::Msg(m) => {
                let plain = m.state.plain().ok_or(ObjectError::NotDecrypted)?;
                let mut body = Vec::new();
                plain.encode(&mut body);
                let cipher = crypto.encrypt(&body, recipient)?;
                m.state = CryptoState::Both { cipher, plain: plain.clone() };
                Ok(())
            }
            Payload::Broadcast(b) => {
                let plain = b.state.plain().ok_or(ObjectError::NotDecrypted)?;
                let mut body = Vec::new();
                plain.encode(&mut body);
                let cipher = crypto.encrypt(&body, recipient)?;
                b.state = CryptoState::Both { cipher, plain: plain.clone() };
                Ok(())
            }
            Payload::Pubkey(Pubkey::V4 { state, .. }) => {
                let data = state.plain().cloned().ok_or(ObjectError::NotDecrypted)?;
                let mut body = Vec::new();
                data.encode(&mut body, 4, true);
                let cipher = crypto.encrypt(&body, recipient)?;
                *state = CryptoState::Both { cipher, plain: data };
                Ok(())
            }
            _ => Err(ObjectError::NotEncrypted),
        }
    }

    /// Open a sealed body with `secret`. Sealed → Both.
    pub fn decrypt(
        &mut self,
        crypto: &dyn Cryptography,
        secret: &SecretKey,
    ) -> Result<(), ObjectError> {
        match self {
            Payload::Msg(m) => {
                let cipher = m.state.cipher().ok_or(ObjectError::NotEncrypted)?.to_vec();
                let body = crypto.decrypt(&cipher, secret)?;
                let plain = Plaintext::decode(PlaintextKind::Msg, &body)?;
                m.state = CryptoState::Both { cipher, plain };
                Ok(())
            }
            Payload::Broadcast(b) => {
                let cipher = b.state.cipher().ok_or(ObjectError::NotEncrypted)?.to_vec();
                let body = crypto.decrypt(&cipher, secret)?;
                let plain = Plaintext::decode(PlaintextKind::Broadcast, &body)?;
                b.state = CryptoState::Both { cipher, plain };
                Ok(())
            }
            Payload::Pubkey(Pubkey::V4 { state, .. }) => {
                let cipher = state.cipher().ok_or(ObjectError::NotEncrypted)?.to_vec();
                let body = crypto.decrypt(&cipher, secret)?;
                let mut r = Reader::new(&body);
                let plain = PubkeyData::decode_v3(&mut r)?;
                *state = CryptoState::Both { cipher, plain };
                Ok(())
            }
            _ => Err(ObjectError::NotEncrypted),
        }
    }

    /// The inner envelope, when this is a readable msg/broadcast.
    pub fn plaintext(&self) -> Option<&Plaintext> {
        match self {
            Payload::Msg(m) => m.state.plain(),
            Payload::Broadcast(b) => b.state.plain(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Keypair, Secp256k1Crypto};
    use crate::object::plaintext::PlaintextBuilder;

    #[test]
    fn factory_rebuilds_getpubkey_variants() {
        let ripe = [5u8; 20];
        let p = Payload::decode(0, 3, 1, &ripe).unwrap();
        match &p {
            Payload::Getpubkey(g) => assert_eq!(g.request, PubkeyRequest::Ripe(ripe)),
            other => panic!("unexpected variant: {other:?}"),
        }

        let tag = [9u8; 32];
        let p = Payload::decode(0, 4, 1, &tag).unwrap();
        match &p {
            Payload::Getpubkey(g) => assert_eq!(g.request, PubkeyRequest::Tag(tag)),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn factory_falls_back_to_generic() {
        let p = Payload::decode(42, 1, 7, b"opaque").unwrap();
        match &p {
            Payload::Generic(g) => {
                assert_eq!(g.object_type, 42);
                assert_eq!(g.body, b"opaque");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
        assert!(!p.is_signed());
        assert!(!p.is_encrypted());
        assert!(p.is_decrypted());
    }

    #[test]
    fn pubkey_v3_roundtrip_keeps_signature_out_of_preimage() {
        let data = PubkeyData {
            behavior: 1,
            signing_key: [2u8; 64],
            encryption_key: [3u8; 64],
            nonce_trials_per_byte: 1000,
            extra_bytes: 1000,
            signature: Some(vec![0xde, 0xad]),
        };
        let payload = Payload::Pubkey(Pubkey::V3 { stream: 1, data });

        let mut full = Vec::new();
        payload.encode(&mut full).unwrap();
        let mut preimage = Vec::new();
        payload.write_bytes_to_sign(&mut preimage).unwrap();
        assert!(full.len() > preimage.len());
        assert_eq!(&full[..preimage.len()], &preimage[..]);

        let decoded = Payload::decode(1, 3, 1, &full).unwrap();
        assert_eq!(decoded.signature().unwrap(), &[0xde, 0xad]);
    }

    #[test]
    fn msg_encrypt_decrypt_transitions() {
        let crypto = Secp256k1Crypto::new();
        let keys = Keypair::generate(&crypto);
        let plain = PlaintextBuilder::msg()
            .from(4, 1, &keys)
            .destination_ripe([7u8; 20])
            .message(b"hello".to_vec())
            .build()
            .unwrap();

        let mut payload = Payload::Msg(Msg { stream: 1, state: CryptoState::Open(plain) });
        assert!(payload.is_decrypted());
        // Open body has no ciphertext to put on the wire yet.
        let mut out = Vec::new();
        assert!(matches!(payload.encode(&mut out), Err(ObjectError::NotEncrypted)));

        payload.encrypt(&crypto, &keys.encryption_public).unwrap();
        let mut out = Vec::new();
        payload.encode(&mut out).unwrap();

        let mut sealed = Payload::decode(2, 1, 1, &out).unwrap();
        assert!(!sealed.is_decrypted());
        sealed.decrypt(&crypto, &keys.encryption_secret).unwrap();
        assert_eq!(sealed.plaintext().unwrap().message(), b"hello");
    }
}
