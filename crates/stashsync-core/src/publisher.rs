//! Event publishing with dual-publish orchestration
//!
//! The publisher normalizes provenance tags, enforces per-operation
//! timeouts, and orchestrates dual publish: for an encryption-enabled
//! category the ciphertext form goes to the public (untrusted) relay group
//! while a plaintext sibling of the same logical record goes to the private
//! (trusted) group, so private relays can serve fast plaintext reads and
//! public relays never observe cleartext.
//!
//! Publish failures propagate to the caller; there is no retry at this layer
//! (the backfill synchronizer applies its own policy).

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::category::CategoryPayload;
use crate::error::{StashError, StashResult};
use crate::event::{Event, EventDraft, Tag};
use crate::gateway::EncryptionGateway;
use crate::relay::{RelayGroup, RelayGroups};
use crate::signer::Signer;
use crate::store::LocalStore;

/// Default timeout for a single publish operation
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Tag name carrying the authoring client's provenance
const CLIENT_TAG: &str = "client";

/// Result of a dual publish: the physical siblings that were produced
#[derive(Debug, Clone)]
pub struct DualPublishOutcome {
    /// Event sent to the public group (ciphertext for encrypted categories)
    pub public_event: Event,
    /// Plaintext sibling sent to the private group, when one is configured
    pub private_event: Option<Event>,
}

/// Signs and transmits events to relay groups
pub struct Publisher {
    signer: Arc<dyn Signer>,
    gateway: Arc<EncryptionGateway>,
    store: Arc<LocalStore>,
    client_name: String,
}

impl Publisher {
    pub fn new(
        signer: Arc<dyn Signer>,
        gateway: Arc<EncryptionGateway>,
        store: Arc<LocalStore>,
        client_name: impl Into<String>,
    ) -> Self {
        Self {
            signer,
            gateway,
            store,
            client_name: client_name.into(),
        }
    }

    /// Sign a draft and transmit it to one relay group.
    ///
    /// A `client` provenance tag is attached before signing if the draft
    /// does not already carry one. The signed event is upserted into the
    /// local store as soon as the relay group accepts it.
    pub async fn publish(
        &self,
        mut draft: EventDraft,
        group: &dyn RelayGroup,
        timeout: Duration,
    ) -> StashResult<Event> {
        if !draft.tags.iter().any(|t| t.name() == Some(CLIENT_TAG)) {
            draft.tags.push(Tag::pair(CLIENT_TAG, &self.client_name));
        }

        let event = self.signer.sign_event(draft).await?;
        let cancel = CancellationToken::new();

        let sent = tokio::select! {
            result = group.publish(&event, &cancel) => result,
            _ = tokio::time::sleep(timeout) => {
                cancel.cancel();
                Err(StashError::Timeout(timeout))
            }
        };
        match sent {
            Ok(()) => {
                debug!(group = group.name(), id = %event.id, "published event");
                self.store.put(std::slice::from_ref(&event));
                Ok(event)
            }
            Err(e) => {
                warn!(group = group.name(), id = %event.id, error = %e, "publish failed");
                Err(e)
            }
        }
    }

    /// Publish one logical record to both relay groups per its category's
    /// policy.
    ///
    /// Encrypted category: ciphertext to the public group, then a plaintext
    /// sibling to the private group when configured (published second so the
    /// plaintext copy wins the local cache upsert). Failure to encrypt
    /// aborts the whole operation before anything is transmitted — there is
    /// no plaintext fallback.
    ///
    /// Plaintext category: the same plaintext content goes to both groups.
    pub async fn dual_publish(
        &self,
        payload: &CategoryPayload,
        d_tag: &str,
        extra_tags: Vec<Tag>,
        groups: &RelayGroups,
        timeout: Duration,
    ) -> StashResult<DualPublishOutcome> {
        let category = payload.category();
        let kind = category.kind();
        let created_at = chrono::Utc::now().timestamp() as u64;

        let mut tags = vec![Tag::pair("d", d_tag)];
        tags.extend(extra_tags);

        let encrypted = self.gateway.policy().should_encrypt(category);
        // Fail-closed: this errors before any network transmission when the
        // signer cannot encrypt a category that requires it.
        let public_content = self.gateway.encrypt_for_category(payload).await?;

        let public_event = self
            .publish(
                EventDraft {
                    kind,
                    created_at,
                    tags: tags.clone(),
                    content: public_content,
                },
                groups.public.as_ref(),
                timeout,
            )
            .await?;

        let private_event = match &groups.private {
            Some(private) if encrypted => {
                let plaintext = payload.to_json()?;
                Some(
                    self.publish(
                        EventDraft {
                            kind,
                            created_at,
                            tags: tags.clone(),
                            content: plaintext,
                        },
                        private.as_ref(),
                        timeout,
                    )
                    .await?,
                )
            }
            Some(private) => {
                // Plaintext category: mirror the same content to the trusted
                // group so both sets converge.
                Some(
                    self.publish(
                        EventDraft {
                            kind,
                            created_at,
                            tags: tags.clone(),
                            content: payload.to_json()?,
                        },
                        private.as_ref(),
                        timeout,
                    )
                    .await?,
                )
            }
            None => None,
        };

        Ok(DualPublishOutcome {
            public_event,
            private_event,
        })
    }
}
