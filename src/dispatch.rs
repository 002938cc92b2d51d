//! Delivery seam between the gossip core and the application: admitted
//! objects come in through [`ObjectListener`], locally-composed mail goes
//! out through [`Dispatcher`] as signed, encrypted, proof-of-work-stamped
//! objects.

use crate::crypto::{Cryptography, Keypair};
use crate::object::payload::{CryptoState, Generic, Msg, Payload};
use crate::object::{ObjectError, ObjectMessage, Plaintext, Status};
use crate::store::{Inventory, MessageRepository};
use crate::types::{InventoryVector, now};
use rand::RngCore;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Receives every object that passed proof-of-work admission.
pub trait ObjectListener: Send + Sync {
    fn receive(&self, object: &ObjectMessage);
}

/// Listener for nodes that only relay.
pub struct DiscardListener;

impl ObjectListener for DiscardListener {
    fn receive(&self, _object: &ObjectMessage) {}
}

/// An object ready for flood-fill, with its repository bookkeeping.
pub struct OutboundObject {
    pub iv: InventoryVector,
    pub object: Arc<ObjectMessage>,
    pub message_id: i64,
}

/// Applies local identities to inbound objects and drives the outbound
/// sign → encrypt → stamp pipeline.
///
/// After submission, failures surface through [`Status`] and logs, never
/// through errors to the caller.
pub struct Dispatcher {
    crypto: Arc<dyn Cryptography>,
    inventory: Arc<dyn Inventory>,
    repository: Arc<dyn MessageRepository>,
    identities: RwLock<Vec<Keypair>>,
    inbox: mpsc::UnboundedSender<Plaintext>,
    /// Decoded ack objects awaiting re-broadcast.
    pending_acks: Mutex<Vec<Arc<ObjectMessage>>>,
    nonce_trials_per_byte: u64,
    extra_bytes: u64,
}

impl Dispatcher {
    pub fn new(
        crypto: Arc<dyn Cryptography>,
        inventory: Arc<dyn Inventory>,
        repository: Arc<dyn MessageRepository>,
        nonce_trials_per_byte: u64,
        extra_bytes: u64,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Plaintext>) {
        let (inbox, delivery) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(Self {
            crypto,
            inventory,
            repository,
            identities: RwLock::new(Vec::new()),
            inbox,
            pending_acks: Mutex::new(Vec::new()),
            nonce_trials_per_byte,
            extra_bytes,
        });
        (dispatcher, delivery)
    }

    pub fn add_identity(&self, keys: Keypair) {
        self.identities.write().expect("identity lock").push(keys);
    }

    /// Build, stamp and encode the ack sub-object embedded in outbound
    /// mail. Returns the wire bytes and the IV the repository will match
    /// on.
    fn build_ack(&self, stream: u64, ttl_secs: u64) -> Result<(Vec<u8>, InventoryVector), ObjectError> {
        let mut body = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut body);
        let payload = Payload::Generic(Generic { object_type: 2, version: 1, stream, body });
        let mut ack = ObjectMessage::with_stream(now() as i64 + ttl_secs as i64, payload, stream);
        ack.do_proof_of_work(
            self.crypto.as_ref(),
            self.nonce_trials_per_byte,
            self.extra_bytes,
        )?;
        let iv = ack.inventory_vector(self.crypto.as_ref())?;
        Ok((ack.encode_to_vec()?, iv))
    }

    /// Submit a msg for delivery: persist it, embed an ack, sign, encrypt
    /// to the recipient, stamp and store. The returned object still needs
    /// offering to the network.
    pub fn send_msg(
        &self,
        sender: &Keypair,
        mut plaintext: Plaintext,
        recipient_encryption_key: &crate::types::PubkeyBytes,
        ttl_secs: u64,
    ) -> Result<OutboundObject, ObjectError> {
        let stream = plaintext
            .destination()
            .map(|d| d.stream)
            .filter(|s| *s != 0)
            .unwrap_or_else(|| plaintext.from_stream().max(1));

        let (ack_bytes, ack_iv) = self.build_ack(stream, ttl_secs)?;
        plaintext.set_ack(ack_bytes);

        let message_id =
            self.repository.save(plaintext.clone(), Some(ack_iv.0), ttl_secs as i64);
        self.repository.update_status(message_id, Status::DoingProofOfWork);

        let payload = Payload::Msg(Msg { stream, state: CryptoState::Open(plaintext) });
        let mut object =
            ObjectMessage::with_stream(now() as i64 + ttl_secs as i64, payload, stream);
        object.sign(self.crypto.as_ref(), &sender.signing_secret)?;
        object.encrypt(self.crypto.as_ref(), recipient_encryption_key)?;
        object.do_proof_of_work(
            self.crypto.as_ref(),
            self.nonce_trials_per_byte,
            self.extra_bytes,
        )?;

        let iv = object.inventory_vector(self.crypto.as_ref())?;
        let object = Arc::new(object);
        self.inventory.store_object(iv, object.clone());
        self.repository.update_status(message_id, Status::Sent);
        info!("message {message_id} sent as {iv}");
        Ok(OutboundObject { iv, object, message_id })
    }

    /// Ack objects decoded from delivered mail, to be stored and offered.
    pub fn take_pending_acks(&self) -> Vec<Arc<ObjectMessage>> {
        std::mem::take(&mut *self.pending_acks.lock().expect("ack lock"))
    }

    fn try_deliver(&self, object: &ObjectMessage) {
        let identities = self.identities.read().expect("identity lock");
        for keys in identities.iter() {
            let mut opened = object.clone();
            if opened.decrypt(self.crypto.as_ref(), &keys.encryption_secret).is_err() {
                continue;
            }
            if let Err(err) = opened.verify_signature(self.crypto.as_ref()) {
                warn!("discarding decryptable object with bad signature: {err}");
                return;
            }
            let Some(plaintext) = opened.payload().plaintext() else {
                return;
            };
            let mut plaintext = plaintext.clone();
            plaintext.received = Some(now() as i64);

            // The sender asked for a receipt: put their ack back on the
            // network.
            if !plaintext.ack().is_empty() {
                match ObjectMessage::decode(plaintext.ack()) {
                    Ok(ack) => {
                        self.pending_acks.lock().expect("ack lock").push(Arc::new(ack));
                    }
                    Err(err) => debug!("ignoring undecodable ack: {err}"),
                }
            }

            let _ = self.inbox.send(plaintext);
            return;
        }
    }
}

impl ObjectListener for Dispatcher {
    fn receive(&self, object: &ObjectMessage) {
        // Any admitted object may be the echo of an ack we sent out.
        if let Ok(iv) = object.inventory_vector(self.crypto.as_ref())
            && let Some(id) = self.repository.acknowledge(&iv.0)
        {
            info!("message {id} acknowledged by {iv}");
            return;
        }

        if matches!(object.payload(), Payload::Msg(_) | Payload::Broadcast(_)) {
            self.try_deliver(object);
        }
    }
}
