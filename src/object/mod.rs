//! Object model: the proof-of-work-stamped, signed and/or encrypted blobs
//! gossiped across the overlay.
//!
//! An [`ObjectMessage`] pairs the object header with a typed [`Payload`].
//! The encoding without the nonce is memoized: once computed (at signing or
//! proof-of-work time) it is byte-stable for the life of the object, and
//! mutations that would invalidate it are rejected.

pub mod payload;
pub mod plaintext;

pub use payload::{
    Broadcast, CryptoState, Generic, Getpubkey, Msg, ObjectType, Payload, Pubkey, PubkeyData,
    PubkeyRequest,
};
pub use plaintext::{Encoding, Plaintext, PlaintextBuilder, PlaintextKind, Recipient, Status};

use crate::crypto::{CryptoError, Cryptography};
use crate::types::{InventoryVector, PubkeyBytes, now};
use crate::wire::{self, Reader, WireError};
use secp256k1::SecretKey;
use std::sync::OnceLock;
use thiserror::Error;

/// Decode bound for detached signatures.
pub const MAX_SIGNATURE_BYTES: u64 = 1024;
/// Decode bound for message bodies (an object tops out at 256 KiB).
pub const MAX_MESSAGE_BYTES: u64 = 262_144;
/// Decode bound for embedded ack sub-objects.
pub const MAX_ACK_BYTES: u64 = 65_536;

#[derive(Error, Debug)]
pub enum ObjectError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("payload is not decrypted")]
    NotDecrypted,

    #[error("payload carries no ciphertext")]
    NotEncrypted,

    #[error("payload type carries no signature")]
    Unsigned,

    #[error("signature missing")]
    SignatureMissing,

    #[error("object has no proof-of-work nonce")]
    MissingNonce,

    #[error("encoding is frozen; object was already signed or stamped")]
    Frozen,

    #[error("destination already resolved")]
    DestinationResolved,

    #[error("destination ripe mismatch")]
    DestinationMismatch,

    #[error("incomplete draft: {0}")]
    Draft(&'static str),
}

#[derive(Debug, Clone)]
pub struct ObjectMessage {
    nonce: Option<[u8; 8]>,
    expires_time: i64,
    object_type: u32,
    version: u64,
    stream: u64,
    payload: Payload,
    /// Encoding without the nonce, memoized on first use.
    unsigned_bytes: OnceLock<Vec<u8>>,
}

impl ObjectMessage {
    /// Construct from a payload; header fields derive from the payload.
    pub fn new(expires_time: i64, payload: Payload) -> Self {
        let stream = payload.stream();
        Self::with_stream(expires_time, payload, stream)
    }

    /// Construct with an explicit stream override.
    pub fn with_stream(expires_time: i64, payload: Payload, stream: u64) -> Self {
        Self {
            nonce: None,
            expires_time,
            object_type: payload.object_type(),
            version: payload.version(),
            stream,
            payload,
            unsigned_bytes: OnceLock::new(),
        }
    }

    /// Factory from the wire: `nonce ‖ expires ‖ type ‖ version ‖ stream ‖
    /// body`.
    pub fn decode(bytes: &[u8]) -> Result<Self, ObjectError> {
        let mut r = Reader::new(bytes);
        let nonce: [u8; 8] = r.array()?;
        let expires_time = r.i64()?;
        let object_type = r.u32()?;
        let version = r.varint()?;
        let stream = r.varint()?;
        let payload = Payload::decode(object_type, version, stream, r.rest())?;
        Ok(Self {
            nonce: Some(nonce),
            expires_time,
            object_type,
            version,
            stream,
            payload,
            unsigned_bytes: OnceLock::new(),
        })
    }

    pub fn nonce(&self) -> Option<&[u8; 8]> {
        self.nonce.as_ref()
    }

    pub fn expires_time(&self) -> i64 {
        self.expires_time
    }

    pub fn object_type(&self) -> u32 {
        self.object_type
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn stream(&self) -> u64 {
        self.stream
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn is_expired(&self, grace_secs: u64) -> bool {
        self.expires_time + (grace_secs as i64) < now() as i64
    }

    fn write_header_without_nonce(&self, out: &mut Vec<u8>) {
        wire::write_i64(out, self.expires_time);
        wire::write_u32(out, self.object_type);
        wire::write_varint(out, self.version);
        wire::write_varint(out, self.stream);
    }

    /// The object encoding minus the leading nonce; memoized and
    /// byte-stable once computed.
    pub fn payload_bytes_without_nonce(&self) -> Result<&[u8], ObjectError> {
        if let Some(bytes) = self.unsigned_bytes.get() {
            return Ok(bytes);
        }
        let mut out = Vec::new();
        self.write_header_without_nonce(&mut out);
        self.payload.encode(&mut out)?;
        let _ = self.unsigned_bytes.set(out);
        Ok(self.unsigned_bytes.get().expect("just set"))
    }

    fn is_frozen(&self) -> bool {
        self.unsigned_bytes.get().is_some()
    }

    /// Signature pre-image: header without nonce, then the payload's
    /// canonical bytes-to-sign.
    pub fn bytes_to_sign(&self) -> Result<Vec<u8>, ObjectError> {
        let mut out = Vec::new();
        self.write_header_without_nonce(&mut out);
        self.payload.write_bytes_to_sign(&mut out)?;
        Ok(out)
    }

    /// Sign the payload in place. Rejected once the encoding is frozen.
    pub fn sign(
        &mut self,
        crypto: &dyn Cryptography,
        secret: &SecretKey,
    ) -> Result<(), ObjectError> {
        if self.is_frozen() {
            return Err(ObjectError::Frozen);
        }
        let preimage = self.bytes_to_sign()?;
        let signature = crypto.sign(&preimage, secret)?;
        self.payload.set_signature(signature)
    }

    /// Verify the payload signature against its advertised signing key.
    /// Requires a decrypted payload.
    pub fn verify_signature(&self, crypto: &dyn Cryptography) -> Result<(), ObjectError> {
        if !self.payload.is_decrypted() {
            return Err(ObjectError::NotDecrypted);
        }
        let signature = self.payload.signature().ok_or(ObjectError::SignatureMissing)?;
        let key = self.signing_key().ok_or(ObjectError::SignatureMissing)?;
        let preimage = self.bytes_to_sign()?;
        crypto.verify(&preimage, signature, &key)?;
        Ok(())
    }

    fn signing_key(&self) -> Option<PubkeyBytes> {
        match &self.payload {
            Payload::Pubkey(p) => p.data().map(|d| d.signing_key),
            Payload::Msg(_) | Payload::Broadcast(_) => {
                self.payload.plaintext().map(|p| *p.sender_signing_key())
            }
            _ => None,
        }
    }

    /// Seal the payload to `recipient`. Rejected once the encoding is
    /// frozen.
    pub fn encrypt(
        &mut self,
        crypto: &dyn Cryptography,
        recipient: &PubkeyBytes,
    ) -> Result<(), ObjectError> {
        if self.is_frozen() {
            return Err(ObjectError::Frozen);
        }
        self.payload.encrypt(crypto, recipient)
    }

    /// Open a sealed payload. The ciphertext (and thus the encoding) is
    /// unchanged, so this is allowed at any time.
    pub fn decrypt(
        &mut self,
        crypto: &dyn Cryptography,
        secret: &SecretKey,
    ) -> Result<(), ObjectError> {
        self.payload.decrypt(crypto, secret)
    }

    /// Compute and attach the proof-of-work nonce. Freezes the encoding.
    pub fn do_proof_of_work(
        &mut self,
        crypto: &dyn Cryptography,
        nonce_trials_per_byte: u64,
        extra_bytes: u64,
    ) -> Result<(), ObjectError> {
        let payload = self.payload_bytes_without_nonce()?.to_vec();
        let nonce =
            crypto.do_proof_of_work(&payload, self.expires_time, nonce_trials_per_byte, extra_bytes);
        self.nonce = Some(nonce);
        Ok(())
    }

    /// Admission gate: verify the stamp under the network parameters.
    pub fn check_proof_of_work(
        &self,
        crypto: &dyn Cryptography,
        nonce_trials_per_byte: u64,
        extra_bytes: u64,
    ) -> Result<(), ObjectError> {
        let nonce = self.nonce.ok_or(ObjectError::MissingNonce)?;
        let payload = self.payload_bytes_without_nonce()?;
        if crypto.check_proof_of_work(
            &nonce,
            payload,
            self.expires_time,
            nonce_trials_per_byte,
            extra_bytes,
        ) {
            Ok(())
        } else {
            Err(CryptoError::InsufficientProofOfWork.into())
        }
    }

    /// Content address; requires the nonce.
    pub fn inventory_vector(
        &self,
        crypto: &dyn Cryptography,
    ) -> Result<InventoryVector, ObjectError> {
        let nonce = self.nonce.ok_or(ObjectError::MissingNonce)?;
        let payload = self.payload_bytes_without_nonce()?;
        Ok(crypto.inventory_vector(&nonce, payload))
    }

    /// Full wire encoding: `nonce ‖ payload_bytes_without_nonce`.
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), ObjectError> {
        let nonce = self.nonce.ok_or(ObjectError::MissingNonce)?;
        out.extend_from_slice(&nonce);
        out.extend_from_slice(self.payload_bytes_without_nonce()?);
        Ok(())
    }

    pub fn encode_to_vec(&self) -> Result<Vec<u8>, ObjectError> {
        let mut out = Vec::new();
        self.encode(&mut out)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Keypair, Secp256k1Crypto};
    use crate::object::payload::{CryptoState, Generic, Msg};

    fn generic_object(body: &[u8]) -> ObjectMessage {
        let payload = Payload::Generic(Generic {
            object_type: 9,
            version: 1,
            stream: 1,
            body: body.to_vec(),
        });
        ObjectMessage::new(now() as i64 + 600, payload)
    }

    #[test]
    fn wire_roundtrip_preserves_bytes() {
        let crypto = Secp256k1Crypto::new();
        let mut obj = generic_object(b"gossip me");
        obj.do_proof_of_work(&crypto, 1, 0).unwrap();

        let bytes = obj.encode_to_vec().unwrap();
        let decoded = ObjectMessage::decode(&bytes).unwrap();
        assert_eq!(decoded.encode_to_vec().unwrap(), bytes);
        assert_eq!(decoded.object_type(), 9);
        assert_eq!(decoded.version(), 1);
        assert_eq!(decoded.stream(), 1);
        assert_eq!(
            decoded.inventory_vector(&crypto).unwrap(),
            obj.inventory_vector(&crypto).unwrap()
        );
    }

    #[test]
    fn stream_override_sticks() {
        let payload = Payload::Generic(Generic {
            object_type: 9,
            version: 1,
            stream: 1,
            body: Vec::new(),
        });
        let obj = ObjectMessage::with_stream(now() as i64 + 60, payload, 5);
        assert_eq!(obj.stream(), 5);
        assert_eq!(obj.payload().stream(), 1);
    }

    #[test]
    fn signing_is_rejected_after_freeze() {
        let crypto = Secp256k1Crypto::new();
        let keys = Keypair::generate(&crypto);
        let plain = PlaintextBuilder::msg()
            .from(4, 1, &keys)
            .destination_ripe([1u8; 20])
            .message(b"late signature".to_vec())
            .build()
            .unwrap();
        let mut obj = ObjectMessage::new(
            now() as i64 + 600,
            Payload::Msg(Msg { stream: 1, state: CryptoState::Open(plain) }),
        );
        obj.sign(&crypto, &keys.signing_secret).unwrap();
        obj.encrypt(&crypto, &keys.encryption_public).unwrap();
        // Materialize the encoding, then try to mutate.
        obj.payload_bytes_without_nonce().unwrap();
        assert!(matches!(obj.sign(&crypto, &keys.signing_secret), Err(ObjectError::Frozen)));
        assert!(matches!(
            obj.encrypt(&crypto, &keys.encryption_public),
            Err(ObjectError::Frozen)
        ));
    }

    #[test]
    fn full_msg_pipeline_roundtrip() {
        let crypto = Secp256k1Crypto::new();
        let keys = Keypair::generate(&crypto);
        let plain = PlaintextBuilder::msg()
            .from(4, 1, &keys)
            .pow_parameters(1000, 1000)
            .destination_ripe(keys.ripe(&crypto))
            .simple("subject", "body")
            .build()
            .unwrap();
        let mut obj = ObjectMessage::new(
            now() as i64 + 600,
            Payload::Msg(Msg { stream: 1, state: CryptoState::Open(plain) }),
        );

        obj.sign(&crypto, &keys.signing_secret).unwrap();
        obj.encrypt(&crypto, &keys.encryption_public).unwrap();
        obj.do_proof_of_work(&crypto, 1, 0).unwrap();
        obj.check_proof_of_work(&crypto, 1, 0).unwrap();

        let bytes = obj.encode_to_vec().unwrap();
        let mut received = ObjectMessage::decode(&bytes).unwrap();
        assert!(!received.payload().is_decrypted());
        assert!(matches!(received.verify_signature(&crypto), Err(ObjectError::NotDecrypted)));

        received.decrypt(&crypto, &keys.encryption_secret).unwrap();
        received.verify_signature(&crypto).unwrap();
        let plain = received.payload().plaintext().unwrap();
        assert_eq!(plain.message(), b"Subject:subject\nBody:body");
    }

    #[test]
    fn missing_nonce_is_an_error() {
        let crypto = Secp256k1Crypto::new();
        let obj = generic_object(b"unstamped");
        assert!(matches!(obj.encode_to_vec(), Err(ObjectError::MissingNonce)));
        assert!(matches!(obj.inventory_vector(&crypto), Err(ObjectError::MissingNonce)));
        assert!(matches!(obj.check_proof_of_work(&crypto, 1, 0), Err(ObjectError::MissingNonce)));
    }
}
