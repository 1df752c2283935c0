//! Cooperative tombstone deletion across relay groups
//!
//! Dual publish and multi-device use leave several physical events sharing
//! one logical key across both relay groups, and not every relay honors
//! address-based deletion. The resolver therefore discovers every physical
//! sibling first and emits one tombstone referencing all of them by explicit
//! id (plus the logical address), so relays that only delete by id still
//! clean up their copy.
//!
//! Deletion is an instruction, not a state mutation: the local store records
//! the exclusion and filters reads; relays may or may not ever erase the
//! referenced events.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{StashError, StashResult};
use crate::event::{format_address, Event, EventDraft, Tag, KIND_TOMBSTONE};
use crate::publisher::Publisher;
use crate::relay::{Filter, RelayGroup, RelayGroups};
use crate::store::LocalStore;

/// Default timeout for sibling-discovery queries
pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

/// What the caller wants deleted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeletionTarget {
    /// An addressable logical record: every sibling under (kind, author,
    /// d-tag) goes
    Address {
        kind: u32,
        author: String,
        d_tag: String,
    },
    /// A single regular event by id
    Id(String),
}

/// Discovers sibling events and emits tombstones
pub struct DeletionResolver {
    publisher: Arc<Publisher>,
    store: Arc<LocalStore>,
}

impl DeletionResolver {
    pub fn new(publisher: Arc<Publisher>, store: Arc<LocalStore>) -> Self {
        Self { publisher, store }
    }

    /// Query all configured relay groups for physical copies of the target
    /// and collect the union of their ids.
    ///
    /// Lookup timeouts and transport failures degrade per group (logged,
    /// skipped); when nothing is discovered the caller's known id stands in
    /// so the tombstone is still emitted — degraded, never blocked.
    pub async fn resolve_deletion_targets(
        &self,
        target: &DeletionTarget,
        known_id: &str,
        groups: &RelayGroups,
        timeout: Duration,
    ) -> HashSet<String> {
        let filter = match target {
            DeletionTarget::Address { kind, author, .. } => Filter {
                kinds: vec![*kind],
                authors: vec![author.clone()],
                ..Default::default()
            },
            DeletionTarget::Id(id) => Filter {
                ids: vec![id.clone()],
                ..Default::default()
            },
        };

        let mut ids = HashSet::new();
        for group in groups.all() {
            match query_with_timeout(group.as_ref(), &filter, timeout).await {
                Ok(events) => {
                    for event in events {
                        if matches_target(&event, target) {
                            ids.insert(event.id);
                        }
                    }
                }
                Err(e) => {
                    warn!(group = group.name(), error = %e, "sibling lookup failed, continuing");
                }
            }
        }

        if ids.is_empty() {
            debug!(known_id, "no siblings discovered, falling back to known id");
            ids.insert(known_id.to_string());
        }
        ids
    }

    /// Resolve siblings, emit a tombstone referencing all of them, and
    /// remove the local cached record immediately.
    ///
    /// The local store is updated before the relay round trip completes; a
    /// publish failure on one group is logged and tolerated as long as at
    /// least one group accepted the tombstone.
    pub async fn delete(
        &self,
        target: &DeletionTarget,
        known_id: &str,
        groups: &RelayGroups,
        timeout: Duration,
    ) -> StashResult<Event> {
        let ids = self
            .resolve_deletion_targets(target, known_id, groups, timeout)
            .await;

        let mut tags: Vec<Tag> = Vec::new();
        let mut sorted_ids: Vec<&String> = ids.iter().collect();
        sorted_ids.sort();
        for id in sorted_ids {
            tags.push(Tag::pair("e", id));
        }
        if let DeletionTarget::Address {
            kind,
            author,
            d_tag,
        } = target
        {
            tags.push(Tag::pair("a", &format_address(*kind, author, d_tag)));
        }

        let draft = EventDraft {
            kind: KIND_TOMBSTONE,
            created_at: chrono::Utc::now().timestamp() as u64,
            tags,
            content: String::new(),
        };

        // Local removal does not wait for the network: drop the cached
        // record and record the exclusion by storing the tombstone.
        match target {
            DeletionTarget::Address {
                kind,
                author,
                d_tag,
            } => self.store.delete_by_address(*kind, author, d_tag),
            DeletionTarget::Id(id) => self.store.delete_by_id(id),
        }

        let mut tombstone = None;
        let mut last_err = None;
        for group in groups.all() {
            match self
                .publisher
                .publish(draft.clone(), group.as_ref(), timeout)
                .await
            {
                Ok(event) => tombstone = Some(event),
                Err(e) => {
                    warn!(group = group.name(), error = %e, "tombstone publish failed");
                    last_err = Some(e);
                }
            }
        }

        tombstone.ok_or_else(|| {
            last_err.unwrap_or_else(|| {
                StashError::Transport("no relay group accepted the tombstone".to_string())
            })
        })
    }
}

fn matches_target(event: &Event, target: &DeletionTarget) -> bool {
    match target {
        DeletionTarget::Address {
            kind,
            author,
            d_tag,
        } => event.kind == *kind && event.author == *author && event.d_tag() == d_tag,
        DeletionTarget::Id(id) => &event.id == id,
    }
}

async fn query_with_timeout(
    group: &dyn RelayGroup,
    filter: &Filter,
    timeout: Duration,
) -> StashResult<Vec<Event>> {
    let cancel = CancellationToken::new();
    tokio::select! {
        result = group.query(std::slice::from_ref(filter), &cancel) => result,
        _ = tokio::time::sleep(timeout) => {
            cancel.cancel();
            Err(StashError::Timeout(timeout))
        }
    }
}
