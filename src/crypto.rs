//! Cryptography capability: hashing, ECDSA signatures, ECIES-style payload
//! encryption and the proof-of-work stamp.
//!
//! Every subsystem receives an `Arc<dyn Cryptography>` at construction so
//! tests can stub the expensive parts. [`Secp256k1Crypto`] is the
//! production implementation.

use crate::types::{InventoryVector, PubkeyBytes, Ripe, now};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use ripemd::Ripemd160;
use secp256k1::ecdh::SharedSecret;
use secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey, ecdsa};
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;

/// Length of the ephemeral-key prefix in an encrypted payload.
const ECIES_PUBKEY_LEN: usize = 65;
/// AEAD nonce length.
const ECIES_NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("insufficient proof of work")]
    InsufficientProofOfWork,
}

/// Hashing, signing, payload encryption and proof-of-work checking.
///
/// The exact curve and cipher construction live behind this trait; the core
/// only relies on digest widths and on the `(nonce_trials_per_byte,
/// extra_bytes)` parameters staying consistent between senders and
/// verifiers.
pub trait Cryptography: Send + Sync {
    fn sha512(&self, data: &[u8]) -> [u8; 64];

    fn double_sha512(&self, data: &[u8]) -> [u8; 64];

    /// RIPEMD-160 of SHA-512, the address digest.
    fn ripe160(&self, data: &[u8]) -> Ripe;

    fn random_nonce(&self) -> u64;

    /// Detached signature over `data`; format is implementation-defined.
    fn sign(&self, data: &[u8], secret: &SecretKey) -> Result<Vec<u8>, CryptoError>;

    fn verify(&self, data: &[u8], signature: &[u8], pubkey: &PubkeyBytes)
    -> Result<(), CryptoError>;

    /// Seal `plain` to the holder of the secret matching `recipient`.
    fn encrypt(&self, plain: &[u8], recipient: &PubkeyBytes) -> Result<Vec<u8>, CryptoError>;

    fn decrypt(&self, cipher: &[u8], secret: &SecretKey) -> Result<Vec<u8>, CryptoError>;

    /// Verify the proof-of-work stamp on an object.
    ///
    /// `payload` is the object encoding without the leading nonce;
    /// `expires_time` scales the target by remaining TTL.
    fn check_proof_of_work(
        &self,
        nonce: &[u8; 8],
        payload: &[u8],
        expires_time: i64,
        nonce_trials_per_byte: u64,
        extra_bytes: u64,
    ) -> bool {
        let target = pow_target(payload.len(), expires_time, nonce_trials_per_byte, extra_bytes);
        pow_trial(self, nonce, payload) <= target
    }

    /// Compute a nonce satisfying the target. Runs until found.
    fn do_proof_of_work(
        &self,
        payload: &[u8],
        expires_time: i64,
        nonce_trials_per_byte: u64,
        extra_bytes: u64,
    ) -> [u8; 8] {
        let target = pow_target(payload.len(), expires_time, nonce_trials_per_byte, extra_bytes);
        let mut nonce = 0u64;
        loop {
            let candidate = nonce.to_be_bytes();
            if pow_trial(self, &candidate, payload) <= target {
                return candidate;
            }
            nonce = nonce.wrapping_add(1);
        }
    }

    /// Content address of an object: truncated double-SHA-512 of
    /// `nonce ‖ payload_without_nonce`.
    fn inventory_vector(&self, nonce: &[u8; 8], payload: &[u8]) -> InventoryVector {
        let mut data = Vec::with_capacity(8 + payload.len());
        data.extend_from_slice(nonce);
        data.extend_from_slice(payload);
        let digest = self.double_sha512(&data);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest[..32]);
        InventoryVector(out)
    }
}

/// Difficulty target for a payload of `payload_len` bytes (without nonce)
/// expiring at `expires_time`.
pub fn pow_target(
    payload_len: usize,
    expires_time: i64,
    nonce_trials_per_byte: u64,
    extra_bytes: u64,
) -> u64 {
    let ttl = (expires_time - now() as i64).max(0) as u128;
    // The nonce itself counts toward the stamped length.
    let len = (payload_len as u128 + 8).saturating_add(extra_bytes as u128);
    let divisor = (nonce_trials_per_byte.max(1) as u128)
        .saturating_mul(len.saturating_add(ttl.saturating_mul(len) / 65536));
    u64::try_from(u128::from(u64::MAX) / divisor.max(1)).unwrap_or(0)
}

fn pow_trial(crypto: &(impl Cryptography + ?Sized), nonce: &[u8; 8], payload: &[u8]) -> u64 {
    let initial = crypto.sha512(payload);
    let mut data = [0u8; 72];
    data[..8].copy_from_slice(nonce);
    data[8..].copy_from_slice(&initial);
    let digest = crypto.double_sha512(&data);
    u64::from_be_bytes(digest[..8].try_into().expect("8-byte prefix"))
}

/// Production implementation over secp256k1 + SHA-512 + ChaCha20-Poly1305.
pub struct Secp256k1Crypto {
    secp: Secp256k1<All>,
}

impl Secp256k1Crypto {
    pub fn new() -> Self {
        Self { secp: Secp256k1::new() }
    }

    fn parse_pubkey(raw: &PubkeyBytes) -> Result<PublicKey, CryptoError> {
        let mut full = [0u8; 65];
        full[0] = 0x04;
        full[1..].copy_from_slice(raw);
        PublicKey::from_slice(&full).map_err(|_| CryptoError::InvalidPublicKey)
    }

    fn aead_key(shared: &SharedSecret) -> Key {
        let digest = Sha512::digest(shared.secret_bytes());
        *Key::from_slice(&digest[..32])
    }
}

impl Default for Secp256k1Crypto {
    fn default() -> Self {
        Self::new()
    }
}

impl Cryptography for Secp256k1Crypto {
    fn sha512(&self, data: &[u8]) -> [u8; 64] {
        let digest = Sha512::digest(data);
        let mut out = [0u8; 64];
        out.copy_from_slice(&digest);
        out
    }

    fn double_sha512(&self, data: &[u8]) -> [u8; 64] {
        self.sha512(&self.sha512(data))
    }

    fn ripe160(&self, data: &[u8]) -> Ripe {
        let digest = Ripemd160::digest(Sha512::digest(data));
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest);
        out
    }

    fn random_nonce(&self) -> u64 {
        rand::random()
    }

    fn sign(&self, data: &[u8], secret: &SecretKey) -> Result<Vec<u8>, CryptoError> {
        let digest: [u8; 32] = Sha256::digest(data).into();
        let msg = Message::from_digest(digest);
        Ok(self.secp.sign_ecdsa(&msg, secret).serialize_der().to_vec())
    }

    fn verify(
        &self,
        data: &[u8],
        signature: &[u8],
        pubkey: &PubkeyBytes,
    ) -> Result<(), CryptoError> {
        let digest: [u8; 32] = Sha256::digest(data).into();
        let msg = Message::from_digest(digest);
        let sig =
            ecdsa::Signature::from_der(signature).map_err(|_| CryptoError::InvalidSignature)?;
        let pk = Self::parse_pubkey(pubkey)?;
        self.secp
            .verify_ecdsa(&msg, &sig, &pk)
            .map_err(|_| CryptoError::InvalidSignature)
    }

    fn encrypt(&self, plain: &[u8], recipient: &PubkeyBytes) -> Result<Vec<u8>, CryptoError> {
        let recipient_pk = Self::parse_pubkey(recipient)?;
        let ephemeral = SecretKey::new(&mut rand::thread_rng());
        let ephemeral_pk = PublicKey::from_secret_key(&self.secp, &ephemeral);
        let shared = SharedSecret::new(&recipient_pk, &ephemeral);

        let mut nonce = [0u8; ECIES_NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let aead = ChaCha20Poly1305::new(&Self::aead_key(&shared));
        let sealed = aead
            .encrypt(Nonce::from_slice(&nonce), plain)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut out = Vec::with_capacity(ECIES_PUBKEY_LEN + ECIES_NONCE_LEN + sealed.len());
        out.extend_from_slice(&ephemeral_pk.serialize_uncompressed());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(&self, cipher: &[u8], secret: &SecretKey) -> Result<Vec<u8>, CryptoError> {
        if cipher.len() < ECIES_PUBKEY_LEN + ECIES_NONCE_LEN {
            return Err(CryptoError::DecryptionFailed);
        }
        let ephemeral_pk = PublicKey::from_slice(&cipher[..ECIES_PUBKEY_LEN])
            .map_err(|_| CryptoError::DecryptionFailed)?;
        let shared = SharedSecret::new(&ephemeral_pk, secret);

        let nonce = &cipher[ECIES_PUBKEY_LEN..ECIES_PUBKEY_LEN + ECIES_NONCE_LEN];
        let aead = ChaCha20Poly1305::new(&Self::aead_key(&shared));
        aead.decrypt(Nonce::from_slice(nonce), &cipher[ECIES_PUBKEY_LEN + ECIES_NONCE_LEN..])
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

/// A local identity: signing and encryption keypairs plus the derived ripe.
#[derive(Clone)]
pub struct Keypair {
    pub signing_secret: SecretKey,
    pub encryption_secret: SecretKey,
    pub signing_public: PubkeyBytes,
    pub encryption_public: PubkeyBytes,
}

impl Keypair {
    pub fn generate(crypto: &Secp256k1Crypto) -> Self {
        let signing_secret = SecretKey::new(&mut rand::thread_rng());
        let encryption_secret = SecretKey::new(&mut rand::thread_rng());
        Self {
            signing_public: raw_pubkey(&crypto.secp, &signing_secret),
            encryption_public: raw_pubkey(&crypto.secp, &encryption_secret),
            signing_secret,
            encryption_secret,
        }
    }

    /// Address digest over the concatenated public key halves.
    pub fn ripe(&self, crypto: &dyn Cryptography) -> Ripe {
        let mut keys = [0u8; 128];
        keys[..64].copy_from_slice(&self.signing_public);
        keys[64..].copy_from_slice(&self.encryption_public);
        crypto.ripe160(&keys)
    }
}

fn raw_pubkey(secp: &Secp256k1<All>, secret: &SecretKey) -> PubkeyBytes {
    let full = PublicKey::from_secret_key(secp, secret).serialize_uncompressed();
    let mut out = [0u8; 64];
    out.copy_from_slice(&full[1..]);
    out
}
