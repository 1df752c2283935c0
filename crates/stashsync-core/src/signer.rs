//! External signer collaborators
//!
//! The engine never holds signing keys itself in the general case; it talks
//! to a [`Signer`]: something that can produce signed events for the owner's
//! identity and may additionally offer a self-encryption capability.
//!
//! Absence of the encryption capability is a first-class condition, not an
//! error to suppress: the encryption gateway probes [`Signer::can_encrypt`]
//! and fails closed when policy demands encryption that the signer cannot
//! provide.
//!
//! Two implementations live here:
//!
//! - [`LocalSigner`] — in-process Ed25519 keys derived from a 32-byte seed,
//!   with the self-encryption capability.
//! - [`RemoteSigner`] — an out-of-process signer (hardware key, platform
//!   keystore, companion app) reached through an explicit request/response
//!   correlation table ([`RequestBroker`]) with an expiry window.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ed25519_dalek::{Signer as _, SigningKey, Verifier, VerifyingKey};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use ulid::Ulid;

use crate::crypto::SelfCrypto;
use crate::error::{StashError, StashResult};
use crate::event::{Event, EventDraft};

/// Default expiry window for pending remote-signer requests
pub const DEFAULT_REQUEST_TTL: Duration = Duration::from_secs(30);

/// A signing identity the engine delegates to.
///
/// `sign_event` consumes a draft and returns the completed signed event;
/// `encrypt`/`decrypt` are the optional self-encryption capability.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Owner public key (hex)
    fn public_key(&self) -> String;

    /// Sign a draft, producing a complete event with id and signature
    async fn sign_event(&self, draft: EventDraft) -> StashResult<Event>;

    /// Whether this signer offers the self-encryption capability
    fn can_encrypt(&self) -> bool {
        false
    }

    /// Encrypt a payload to the owner's own identity
    async fn encrypt(&self, _plaintext: &str) -> StashResult<String> {
        Err(StashError::EncryptionUnavailable(
            "signer has no encryption capability".to_string(),
        ))
    }

    /// Decrypt a payload previously encrypted to the owner's identity
    async fn decrypt(&self, _ciphertext: &str) -> StashResult<String> {
        Err(StashError::EncryptionUnavailable(
            "signer has no encryption capability".to_string(),
        ))
    }
}

/// Verify an event's signature against its author key and content-derived id
pub fn verify_event(event: &Event) -> StashResult<()> {
    let draft = EventDraft {
        kind: event.kind,
        created_at: event.created_at,
        tags: event.tags.clone(),
        content: event.content.clone(),
    };
    let expected_id = draft.canonical_id(&event.author)?;
    if expected_id != event.id {
        return Err(StashError::MalformedRecord(format!(
            "event id does not match content: expected {}, got {}",
            expected_id, event.id
        )));
    }

    let key_bytes: [u8; 32] = hex::decode(&event.author)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| StashError::MalformedRecord("author key is not 32 hex bytes".to_string()))?;
    let key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| StashError::MalformedRecord(format!("bad author key: {}", e)))?;

    let sig_bytes: [u8; 64] = hex::decode(&event.signature)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| StashError::MalformedRecord("signature is not 64 hex bytes".to_string()))?;
    let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes);

    let digest =
        hex::decode(&event.id).map_err(|e| StashError::MalformedRecord(e.to_string()))?;
    key.verify(&digest, &signature)
        .map_err(|e| StashError::MalformedRecord(format!("signature invalid: {}", e)))
}

/// In-process signer holding Ed25519 keys and the self-encryption capability.
///
/// Deterministic from its 32-byte seed, so two devices initialized from the
/// same seed share one identity and can decrypt each other's payloads.
pub struct LocalSigner {
    signing_key: SigningKey,
    public_key_hex: String,
    crypto: SelfCrypto,
}

impl LocalSigner {
    /// Build a signer from a 32-byte identity seed
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        let public_key_hex = hex::encode(signing_key.verifying_key().as_bytes());
        Self {
            signing_key,
            public_key_hex,
            crypto: SelfCrypto::from_seed(seed),
        }
    }

    /// Generate a signer with a fresh random seed
    pub fn generate() -> Self {
        // Use getrandom directly to avoid rand version conflicts
        let mut seed = [0u8; 32];
        getrandom::getrandom(&mut seed).expect("Failed to get random bytes");
        Self::from_seed(&seed)
    }
}

#[async_trait]
impl Signer for LocalSigner {
    fn public_key(&self) -> String {
        self.public_key_hex.clone()
    }

    async fn sign_event(&self, draft: EventDraft) -> StashResult<Event> {
        let id = draft.canonical_id(&self.public_key_hex)?;
        let digest = hex::decode(&id).map_err(|e| StashError::Serialization(e.to_string()))?;
        let signature = self.signing_key.sign(&digest);
        Ok(Event {
            id,
            kind: draft.kind,
            author: self.public_key_hex.clone(),
            created_at: draft.created_at,
            tags: draft.tags,
            content: draft.content,
            signature: hex::encode(signature.to_bytes()),
        })
    }

    fn can_encrypt(&self) -> bool {
        true
    }

    async fn encrypt(&self, plaintext: &str) -> StashResult<String> {
        self.crypto.encrypt_text(plaintext)
    }

    async fn decrypt(&self, ciphertext: &str) -> StashResult<String> {
        self.crypto.decrypt_text(ciphertext)
    }
}

/// A request on its way to an out-of-process signer
#[derive(Debug)]
pub struct SignerRequest {
    /// Correlation id; the response must carry it back
    pub id: String,
    pub body: SignerRequestBody,
}

/// What the out-of-process signer is being asked to do
#[derive(Debug)]
pub enum SignerRequestBody {
    Sign(EventDraft),
    Encrypt(String),
    Decrypt(String),
}

/// A response correlated back through the broker
#[derive(Debug)]
pub enum SignerResponse {
    Event(Event),
    Text(String),
    Rejected(String),
}

struct PendingEntry {
    tx: oneshot::Sender<SignerResponse>,
    expires_at: Instant,
}

/// Explicit request/response correlation table for out-of-process signers.
///
/// Each outbound request registers a pending entry (ulid -> response
/// channel) with an expiry window; whatever transport carries the signer's
/// reply calls [`resolve`](Self::resolve) with the correlation id. Expired
/// entries are dropped by [`sweep_expired`](Self::sweep_expired), which makes
/// the waiting caller observe a timeout.
pub struct RequestBroker {
    pending: Mutex<HashMap<String, PendingEntry>>,
    ttl: Duration,
}

impl RequestBroker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// The expiry window applied to every pending request
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Register a new pending request; returns its correlation id and the
    /// channel the response will arrive on
    pub fn register(&self) -> (String, oneshot::Receiver<SignerResponse>) {
        let id = Ulid::new().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(
            id.clone(),
            PendingEntry {
                tx,
                expires_at: Instant::now() + self.ttl,
            },
        );
        (id, rx)
    }

    /// Deliver a response for a pending request.
    ///
    /// Returns false when the id is unknown (already resolved, expired, or
    /// never issued).
    pub fn resolve(&self, id: &str, response: SignerResponse) -> bool {
        match self.pending.lock().remove(id) {
            Some(entry) => entry.tx.send(response).is_ok(),
            None => {
                debug!(request_id = %id, "signer response for unknown request");
                false
            }
        }
    }

    /// Drop a pending request without a response (caller gave up)
    pub fn cancel(&self, id: &str) {
        self.pending.lock().remove(id);
    }

    /// Remove entries past their expiry window; returns how many were dropped
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|_, entry| entry.expires_at > now);
        before - pending.len()
    }

    /// Number of requests currently awaiting a response
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Signer backed by an out-of-process implementation.
///
/// Outbound requests go through an mpsc transport supplied by the embedding
/// application (IPC, deep link, websocket — not this crate's concern);
/// responses come back through the [`RequestBroker`].
pub struct RemoteSigner {
    public_key_hex: String,
    encryption_capable: bool,
    broker: Arc<RequestBroker>,
    outbound: mpsc::UnboundedSender<SignerRequest>,
}

impl RemoteSigner {
    pub fn new(
        public_key_hex: String,
        encryption_capable: bool,
        broker: Arc<RequestBroker>,
        outbound: mpsc::UnboundedSender<SignerRequest>,
    ) -> Self {
        Self {
            public_key_hex,
            encryption_capable,
            broker,
            outbound,
        }
    }

    async fn request(&self, body: SignerRequestBody) -> StashResult<SignerResponse> {
        let (id, rx) = self.broker.register();
        self.outbound
            .send(SignerRequest {
                id: id.clone(),
                body,
            })
            .map_err(|_| StashError::Signer("signer transport closed".to_string()))?;

        match tokio::time::timeout(self.broker.ttl(), rx).await {
            Err(_) => {
                self.broker.cancel(&id);
                Err(StashError::Timeout(self.broker.ttl()))
            }
            // Sender dropped by an expiry sweep
            Ok(Err(_)) => Err(StashError::Timeout(self.broker.ttl())),
            Ok(Ok(SignerResponse::Rejected(reason))) => Err(StashError::Signer(reason)),
            Ok(Ok(response)) => Ok(response),
        }
    }
}

#[async_trait]
impl Signer for RemoteSigner {
    fn public_key(&self) -> String {
        self.public_key_hex.clone()
    }

    async fn sign_event(&self, draft: EventDraft) -> StashResult<Event> {
        match self.request(SignerRequestBody::Sign(draft)).await? {
            SignerResponse::Event(event) => Ok(event),
            other => Err(StashError::Signer(format!(
                "unexpected signer response: {:?}",
                other
            ))),
        }
    }

    fn can_encrypt(&self) -> bool {
        self.encryption_capable
    }

    async fn encrypt(&self, plaintext: &str) -> StashResult<String> {
        if !self.encryption_capable {
            return Err(StashError::EncryptionUnavailable(
                "remote signer has no encryption capability".to_string(),
            ));
        }
        match self
            .request(SignerRequestBody::Encrypt(plaintext.to_string()))
            .await?
        {
            SignerResponse::Text(ciphertext) => Ok(ciphertext),
            other => Err(StashError::Signer(format!(
                "unexpected signer response: {:?}",
                other
            ))),
        }
    }

    async fn decrypt(&self, ciphertext: &str) -> StashResult<String> {
        if !self.encryption_capable {
            return Err(StashError::EncryptionUnavailable(
                "remote signer has no encryption capability".to_string(),
            ));
        }
        match self
            .request(SignerRequestBody::Decrypt(ciphertext.to_string()))
            .await?
        {
            SignerResponse::Text(plaintext) => Ok(plaintext),
            other => Err(StashError::Signer(format!(
                "unexpected signer response: {:?}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Tag;

    fn draft() -> EventDraft {
        EventDraft {
            kind: 30001,
            created_at: 1_700_000_000,
            tags: vec![Tag::pair("d", "x1")],
            content: r#"{"category":"pets","name":"Fido"}"#.to_string(),
        }
    }

    #[tokio::test]
    async fn test_local_signer_produces_verifiable_events() {
        let signer = LocalSigner::from_seed(&[3u8; 32]);
        let event = signer.sign_event(draft()).await.unwrap();
        assert_eq!(event.author, signer.public_key());
        assert!(event.validate().is_ok());
        verify_event(&event).unwrap();
    }

    #[tokio::test]
    async fn test_tampered_event_fails_verification() {
        let signer = LocalSigner::from_seed(&[3u8; 32]);
        let mut event = signer.sign_event(draft()).await.unwrap();
        event.content = "tampered".to_string();
        assert!(verify_event(&event).is_err());
    }

    #[test]
    fn test_seed_determines_identity() {
        let a = LocalSigner::from_seed(&[5u8; 32]);
        let b = LocalSigner::from_seed(&[5u8; 32]);
        let c = LocalSigner::from_seed(&[6u8; 32]);
        assert_eq!(a.public_key(), b.public_key());
        assert_ne!(a.public_key(), c.public_key());
    }

    #[tokio::test]
    async fn test_local_signer_encrypt_round_trip() {
        let signer = LocalSigner::from_seed(&[4u8; 32]);
        assert!(signer.can_encrypt());
        let ciphertext = signer.encrypt("payload").await.unwrap();
        assert_eq!(signer.decrypt(&ciphertext).await.unwrap(), "payload");
    }

    #[tokio::test]
    async fn test_broker_resolves_in_flight_request() {
        let broker = Arc::new(RequestBroker::new(Duration::from_secs(5)));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let key_signer = LocalSigner::from_seed(&[8u8; 32]);
        let remote = RemoteSigner::new(key_signer.public_key(), false, broker.clone(), tx);

        // Fake out-of-process signer servicing the transport.
        let responder_broker = broker.clone();
        let responder = tokio::spawn(async move {
            let request = rx.recv().await.unwrap();
            let SignerRequestBody::Sign(draft) = request.body else {
                panic!("expected sign request");
            };
            let event = key_signer.sign_event(draft).await.unwrap();
            assert!(responder_broker.resolve(&request.id, SignerResponse::Event(event)));
        });

        let event = remote.sign_event(draft()).await.unwrap();
        verify_event(&event).unwrap();
        responder.await.unwrap();
        assert_eq!(broker.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_broker_expiry_sweep_times_out_caller() {
        let broker = Arc::new(RequestBroker::new(Duration::from_millis(10)));
        let (id, rx) = broker.register();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(broker.sweep_expired(), 1);
        assert!(rx.await.is_err());
        // A late response for the swept id goes nowhere.
        assert!(!broker.resolve(&id, SignerResponse::Text("late".to_string())));
    }

    #[tokio::test]
    async fn test_remote_signer_without_capability_fails_closed() {
        let broker = Arc::new(RequestBroker::new(Duration::from_secs(1)));
        let (tx, _rx) = mpsc::unbounded_channel();
        let remote = RemoteSigner::new("aa".repeat(32), false, broker, tx);
        assert!(!remote.can_encrypt());
        assert!(matches!(
            remote.encrypt("data").await,
            Err(StashError::EncryptionUnavailable(_))
        ));
    }
}
