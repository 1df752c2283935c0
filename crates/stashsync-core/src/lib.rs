//! Stashsync Core Library
//!
//! Local-first synchronization and encryption engine for a private, durable
//! copy of a user's records, replicated across untrusted append-only event
//! relays with selective end-to-end encryption and cooperative tombstone
//! deletion.
//!
//! ## Overview
//!
//! Records are immutable signed events. The engine keeps an embedded local
//! cache, encrypts selected categories "to self" before they reach untrusted
//! relays, dual-publishes plaintext to a trusted relay group, and heals the
//! trusted group from the untrusted one when a device was offline.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  LocalStore      durable event cache (redb), logical-key upsert │
//! │  EncryptionGateway   category policy + marker-tagged ciphertext │
//! │  Publisher       sign, tag, dual-publish to relay groups        │
//! │  DeletionResolver    sibling discovery + tombstone emission     │
//! │  BackfillSynchronizer   public -> private reconciliation        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Principles
//!
//! - **Local-first**: reads come from the local store; sync when connected
//! - **Fail-closed encryption**: a category that must be encrypted is never
//!   silently stored as plaintext
//! - **Plaintext wins**: deduplicating sibling copies of one logical record
//!   always prefers the plaintext copy
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use stashsync_core::{
//!     BackfillConfig, BackfillSynchronizer, CategoryPayload, EncryptionGateway,
//!     EncryptionPolicy, LocalSigner, LocalStore, Publisher, RelayGroups,
//! };
//!
//! let signer = Arc::new(LocalSigner::generate());
//! let store = Arc::new(LocalStore::new("~/.stashsync/cache.redb")?);
//! let gateway = Arc::new(EncryptionGateway::new(
//!     signer.clone(),
//!     EncryptionPolicy::encrypt_all(),
//! ));
//! let publisher = Publisher::new(signer.clone(), gateway.clone(), store.clone(), "stashsync");
//!
//! let groups = RelayGroups::new(public_group, Some(private_group));
//! let payload = CategoryPayload::Pets {
//!     name: "Fido".into(),
//!     species: Some("dog".into()),
//!     breed: None,
//! };
//! publisher
//!     .dual_publish(&payload, "pet-fido", vec![], &groups, Duration::from_secs(5))
//!     .await?;
//! ```

pub mod backfill;
pub mod category;
pub mod crypto;
pub mod deletion;
pub mod error;
pub mod event;
pub mod gateway;
pub mod publisher;
pub mod relay;
pub mod signer;
pub mod store;

// Re-exports
pub use backfill::{BackfillConfig, BackfillReport, BackfillState, BackfillSynchronizer};
pub use category::{Category, CategoryPayload, EncryptionPolicy};
pub use crypto::SelfCrypto;
pub use deletion::{DeletionResolver, DeletionTarget, DEFAULT_RESOLVE_TIMEOUT};
pub use error::{StashError, StashResult};
pub use event::{
    dedupe_by_logical_key, format_address, Event, EventDraft, LogicalKey, Tag, KIND_TOMBSTONE,
};
pub use gateway::{is_encrypted, EncryptionGateway, ENCRYPTED_MARKER};
pub use publisher::{DualPublishOutcome, Publisher, DEFAULT_PUBLISH_TIMEOUT};
pub use relay::{Filter, GroupTrust, RelayGroup, RelayGroups};
pub use signer::{
    verify_event, LocalSigner, RemoteSigner, RequestBroker, Signer, SignerRequest,
    SignerRequestBody, SignerResponse,
};
pub use store::LocalStore;
