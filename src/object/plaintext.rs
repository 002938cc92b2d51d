//! The inner envelope of msg/broadcast objects: sender keys, destination,
//! encoding, message and ack bytes, detached signature, plus the
//! application-side delivery state.

use super::{MAX_ACK_BYTES, MAX_MESSAGE_BYTES, MAX_SIGNATURE_BYTES, ObjectError};
use crate::crypto::Keypair;
use crate::types::{PubkeyBytes, Ripe};
use crate::wire::{self, Reader};
use std::collections::BTreeSet;

/// Message body interpretation tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum Encoding {
    /// Recipient should not display the body.
    Ignore = 0,
    /// Body only.
    Trivial = 1,
    /// "Subject:<s>\nBody:<b>", UTF-8.
    Simple = 2,
}

impl Encoding {
    pub fn from_wire(value: u64) -> Option<Self> {
        match value {
            0 => Some(Self::Ignore),
            1 => Some(Self::Trivial),
            2 => Some(Self::Simple),
            _ => None,
        }
    }
}

/// Delivery progress of a locally-submitted message. Failures after
/// submission surface here and in the logs, never as caller errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    PubkeyRequested,
    DoingProofOfWork,
    Sent,
    Acknowledged,
}

/// Whether the envelope travels in a msg (with destination and ack) or a
/// broadcast (without either).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaintextKind {
    Msg,
    Broadcast,
}

/// Destination address component. `version == 0` is the unresolved
/// sentinel carrying only the ripe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub version: u64,
    pub stream: u64,
    pub ripe: Ripe,
}

impl Recipient {
    pub fn unresolved(ripe: Ripe) -> Self {
        Self { version: 0, stream: 0, ripe }
    }

    pub fn is_unresolved(&self) -> bool {
        self.version == 0
    }
}

#[derive(Debug, Clone)]
pub struct Plaintext {
    kind: PlaintextKind,
    from_version: u64,
    from_stream: u64,
    behavior: u32,
    signing_key: PubkeyBytes,
    encryption_key: PubkeyBytes,
    nonce_trials_per_byte: u64,
    extra_bytes: u64,
    destination: Option<Recipient>,
    encoding: Encoding,
    message: Vec<u8>,
    ack: Vec<u8>,
    signature: Option<Vec<u8>>,

    // Application-side delivery state; never on the wire.
    pub id: Option<i64>,
    pub status: Status,
    pub sent: Option<i64>,
    pub received: Option<i64>,
    pub labels: BTreeSet<String>,
}

impl Plaintext {
    /// Decode a decrypted msg/broadcast body.
    pub fn decode(kind: PlaintextKind, body: &[u8]) -> Result<Self, ObjectError> {
        let mut r = Reader::new(body);
        let from_version = r.varint()?;
        let from_stream = r.varint()?;
        let behavior = r.u32()?;
        let signing_key: PubkeyBytes = r.array()?;
        let encryption_key: PubkeyBytes = r.array()?;
        let nonce_trials_per_byte = r.varint()?;
        let extra_bytes = r.varint()?;
        let destination = match kind {
            PlaintextKind::Msg => Some(Recipient {
                version: 0,
                stream: 0,
                ripe: r.array()?,
            }),
            PlaintextKind::Broadcast => None,
        };
        let encoding = Encoding::from_wire(r.varint()?)
            .ok_or(crate::wire::WireError::Invalid("unknown encoding"))?;
        let message = r.var_bytes(MAX_MESSAGE_BYTES)?.to_vec();
        let ack = match kind {
            PlaintextKind::Msg => r.var_bytes(MAX_ACK_BYTES)?.to_vec(),
            PlaintextKind::Broadcast => Vec::new(),
        };
        let signature =
            if r.is_empty() { None } else { Some(r.var_bytes(MAX_SIGNATURE_BYTES)?.to_vec()) };

        Ok(Self {
            kind,
            from_version,
            from_stream,
            behavior,
            signing_key,
            encryption_key,
            nonce_trials_per_byte,
            extra_bytes,
            destination,
            encoding,
            message,
            ack,
            signature,
            id: None,
            status: Status::Sent,
            sent: None,
            received: None,
            labels: BTreeSet::new(),
        })
    }

    fn write(&self, out: &mut Vec<u8>, with_signature: bool) {
        wire::write_varint(out, self.from_version);
        wire::write_varint(out, self.from_stream);
        wire::write_u32(out, self.behavior);
        out.extend_from_slice(&self.signing_key);
        out.extend_from_slice(&self.encryption_key);
        wire::write_varint(out, self.nonce_trials_per_byte);
        wire::write_varint(out, self.extra_bytes);
        if let (PlaintextKind::Msg, Some(dest)) = (self.kind, &self.destination) {
            out.extend_from_slice(&dest.ripe);
        }
        wire::write_varint(out, self.encoding as u64);
        wire::write_var_bytes(out, &self.message);
        if self.kind == PlaintextKind::Msg {
            wire::write_var_bytes(out, &self.ack);
        }
        if with_signature {
            if let Some(sig) = &self.signature {
                wire::write_var_bytes(out, sig);
            }
        }
    }

    /// Full body encoding, signature included when present.
    pub fn encode(&self, out: &mut Vec<u8>) {
        self.write(out, true);
    }

    /// Canonical pre-image: the body with the trailing signature omitted.
    pub fn write_bytes_to_sign(&self, out: &mut Vec<u8>) {
        self.write(out, false);
    }

    pub fn kind(&self) -> PlaintextKind {
        self.kind
    }

    pub fn from_version(&self) -> u64 {
        self.from_version
    }

    pub fn from_stream(&self) -> u64 {
        self.from_stream
    }

    pub fn sender_signing_key(&self) -> &PubkeyBytes {
        &self.signing_key
    }

    pub fn sender_encryption_key(&self) -> &PubkeyBytes {
        &self.encryption_key
    }

    pub fn pow_parameters(&self) -> (u64, u64) {
        (self.nonce_trials_per_byte, self.extra_bytes)
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn message(&self) -> &[u8] {
        &self.message
    }

    pub fn ack(&self) -> &[u8] {
        &self.ack
    }

    /// Attach the ack sub-object. Meaningful before signing only; the ack
    /// travels inside the signed body.
    pub fn set_ack(&mut self, ack: Vec<u8>) {
        self.ack = ack;
    }

    pub fn signature(&self) -> Option<&[u8]> {
        self.signature.as_deref()
    }

    pub fn set_signature(&mut self, signature: Vec<u8>) {
        self.signature = Some(signature);
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    pub fn destination(&self) -> Option<&Recipient> {
        self.destination.as_ref()
    }

    /// Resolve the destination from the version-0 sentinel.
    ///
    /// Accepted exactly once, and only when the resolved ripe matches the
    /// sentinel's ripe.
    pub fn resolve_destination(&mut self, resolved: Recipient) -> Result<(), ObjectError> {
        let current = self
            .destination
            .as_ref()
            .ok_or(ObjectError::Draft("plaintext has no destination"))?;
        if !current.is_unresolved() {
            return Err(ObjectError::DestinationResolved);
        }
        if current.ripe != resolved.ripe {
            return Err(ObjectError::DestinationMismatch);
        }
        self.destination = Some(resolved);
        Ok(())
    }
}

/// Draft finalized by a validating [`build`](PlaintextBuilder::build).
pub struct PlaintextBuilder {
    kind: PlaintextKind,
    from_version: u64,
    from_stream: u64,
    behavior: u32,
    signing_key: Option<PubkeyBytes>,
    encryption_key: Option<PubkeyBytes>,
    nonce_trials_per_byte: u64,
    extra_bytes: u64,
    destination: Option<Recipient>,
    encoding: Encoding,
    message: Vec<u8>,
    ack: Vec<u8>,
}

impl PlaintextBuilder {
    pub fn msg() -> Self {
        Self::new(PlaintextKind::Msg)
    }

    pub fn broadcast() -> Self {
        Self::new(PlaintextKind::Broadcast)
    }

    fn new(kind: PlaintextKind) -> Self {
        Self {
            kind,
            from_version: 0,
            from_stream: 0,
            behavior: 0,
            signing_key: None,
            encryption_key: None,
            nonce_trials_per_byte: 0,
            extra_bytes: 0,
            destination: None,
            encoding: Encoding::Trivial,
            message: Vec::new(),
            ack: Vec::new(),
        }
    }

    /// Sender address fields from a local identity.
    pub fn from(mut self, version: u64, stream: u64, keys: &Keypair) -> Self {
        self.from_version = version;
        self.from_stream = stream;
        self.signing_key = Some(keys.signing_public);
        self.encryption_key = Some(keys.encryption_public);
        self
    }

    pub fn behavior(mut self, bits: u32) -> Self {
        self.behavior = bits;
        self
    }

    pub fn pow_parameters(mut self, nonce_trials_per_byte: u64, extra_bytes: u64) -> Self {
        self.nonce_trials_per_byte = nonce_trials_per_byte;
        self.extra_bytes = extra_bytes;
        self
    }

    /// Destination as the unresolved sentinel; resolved later against the
    /// key directory.
    pub fn destination_ripe(mut self, ripe: Ripe) -> Self {
        self.destination = Some(Recipient::unresolved(ripe));
        self
    }

    pub fn encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn message(mut self, message: Vec<u8>) -> Self {
        self.message = message;
        self
    }

    /// Subject/body convenience for [`Encoding::Simple`].
    pub fn simple(mut self, subject: &str, body: &str) -> Self {
        self.encoding = Encoding::Simple;
        self.message = format!("Subject:{subject}\nBody:{body}").into_bytes();
        self
    }

    pub fn ack(mut self, ack: Vec<u8>) -> Self {
        self.ack = ack;
        self
    }

    pub fn build(self) -> Result<Plaintext, ObjectError> {
        let signing_key = self.signing_key.ok_or(ObjectError::Draft("missing sender keys"))?;
        let encryption_key =
            self.encryption_key.ok_or(ObjectError::Draft("missing sender keys"))?;
        if self.kind == PlaintextKind::Msg && self.destination.is_none() {
            return Err(ObjectError::Draft("msg requires a destination"));
        }
        if self.message.len() as u64 > MAX_MESSAGE_BYTES {
            return Err(ObjectError::Draft("message too large"));
        }
        Ok(Plaintext {
            kind: self.kind,
            from_version: self.from_version,
            from_stream: self.from_stream,
            behavior: self.behavior,
            signing_key,
            encryption_key,
            nonce_trials_per_byte: self.nonce_trials_per_byte,
            extra_bytes: self.extra_bytes,
            destination: self.destination,
            encoding: self.encoding,
            message: self.message,
            ack: self.ack,
            signature: None,
            id: None,
            status: Status::PubkeyRequested,
            sent: None,
            received: None,
            labels: BTreeSet::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Keypair, Secp256k1Crypto};

    fn sample_msg() -> Plaintext {
        let crypto = Secp256k1Crypto::new();
        let keys = Keypair::generate(&crypto);
        PlaintextBuilder::msg()
            .from(4, 1, &keys)
            .pow_parameters(1000, 1000)
            .destination_ripe([0xaa; 20])
            .simple("greetings", "hello over the overlay")
            .ack(vec![1, 2, 3])
            .build()
            .unwrap()
    }

    #[test]
    fn msg_body_roundtrip() {
        let mut plain = sample_msg();
        plain.set_signature(vec![9u8; 70]);

        let mut body = Vec::new();
        plain.encode(&mut body);
        let decoded = Plaintext::decode(PlaintextKind::Msg, &body).unwrap();

        assert_eq!(decoded.from_version(), 4);
        assert_eq!(decoded.encoding(), Encoding::Simple);
        assert_eq!(decoded.message(), plain.message());
        assert_eq!(decoded.ack(), &[1, 2, 3]);
        assert_eq!(decoded.signature(), plain.signature());
        assert_eq!(decoded.destination().unwrap().ripe, [0xaa; 20]);

        // Re-encoding the decoded form reproduces the bytes.
        let mut again = Vec::new();
        decoded.encode(&mut again);
        assert_eq!(body, again);
    }

    #[test]
    fn broadcast_body_omits_destination_and_ack() {
        let crypto = Secp256k1Crypto::new();
        let keys = Keypair::generate(&crypto);
        let plain = PlaintextBuilder::broadcast()
            .from(5, 1, &keys)
            .message(b"to all".to_vec())
            .build()
            .unwrap();

        let mut body = Vec::new();
        plain.encode(&mut body);
        let decoded = Plaintext::decode(PlaintextKind::Broadcast, &body).unwrap();
        assert!(decoded.destination().is_none());
        assert!(decoded.ack().is_empty());
        assert_eq!(decoded.message(), b"to all");
    }

    #[test]
    fn signature_is_outside_the_preimage() {
        let mut plain = sample_msg();
        let mut before = Vec::new();
        plain.write_bytes_to_sign(&mut before);
        plain.set_signature(vec![7u8; 64]);
        let mut after = Vec::new();
        plain.write_bytes_to_sign(&mut after);
        assert_eq!(before, after);
    }

    #[test]
    fn destination_resolves_once_on_matching_ripe() {
        let mut plain = sample_msg();
        assert!(plain.destination().unwrap().is_unresolved());

        // Mismatched ripe is rejected.
        let err = plain
            .resolve_destination(Recipient { version: 4, stream: 1, ripe: [0xbb; 20] })
            .unwrap_err();
        assert!(matches!(err, ObjectError::DestinationMismatch));

        // Matching ripe resolves.
        plain
            .resolve_destination(Recipient { version: 4, stream: 1, ripe: [0xaa; 20] })
            .unwrap();
        assert_eq!(plain.destination().unwrap().version, 4);

        // A second resolution is rejected even with the same ripe.
        let err = plain
            .resolve_destination(Recipient { version: 4, stream: 1, ripe: [0xaa; 20] })
            .unwrap_err();
        assert!(matches!(err, ObjectError::DestinationResolved));
    }

    #[test]
    fn msg_draft_requires_destination() {
        let crypto = Secp256k1Crypto::new();
        let keys = Keypair::generate(&crypto);
        let err = PlaintextBuilder::msg().from(4, 1, &keys).build().unwrap_err();
        assert!(matches!(err, ObjectError::Draft(_)));
    }
}
