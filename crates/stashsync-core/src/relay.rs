//! Relay-group collaborator seam
//!
//! A relay group is a named set of append-only event relays with a trust
//! classification. Transport and connection management stay outside this
//! crate; the engine only needs to query for events and submit signed ones,
//! with caller-controlled cancellation.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  RelayGroups                                                    │
//! │  ├── public: untrusted, holds only ciphertext for encrypted     │
//! │  │           categories                                         │
//! │  └── private: trusted, may hold plaintext for fast local reads  │
//! │              (optional; engine degrades without it)             │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::StashResult;
use crate::event::Event;

/// Trust classification of a relay group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupTrust {
    /// Trusted; may hold plaintext
    Private,
    /// Untrusted; must never observe cleartext for encrypted categories
    Public,
}

/// Event selection predicate for relay queries.
///
/// Empty `kinds`/`authors`/`ids` mean "any".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub kinds: Vec<u32>,
    pub authors: Vec<String>,
    pub ids: Vec<String>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    pub limit: Option<usize>,
}

impl Filter {
    /// Whether an event matches this filter
    pub fn matches(&self, event: &Event) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind) {
            return false;
        }
        if !self.authors.is_empty() && !self.authors.contains(&event.author) {
            return false;
        }
        if !self.ids.is_empty() && !self.ids.contains(&event.id) {
            return false;
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }
        true
    }
}

/// A named set of relay endpoints, queried and published to as one unit.
///
/// Implementations own fan-out, retry-at-transport-level and connection
/// management; a returned error means the group as a whole was unreachable
/// or rejected the operation.
#[async_trait]
pub trait RelayGroup: Send + Sync {
    /// Group name, for logging
    fn name(&self) -> &str;

    /// Trust classification
    fn trust(&self) -> GroupTrust;

    /// Fetch events matching any of the filters
    async fn query(&self, filters: &[Filter], cancel: &CancellationToken)
        -> StashResult<Vec<Event>>;

    /// Submit a signed event to every relay in the group
    async fn publish(&self, event: &Event, cancel: &CancellationToken) -> StashResult<()>;
}

/// The dual-group configuration the engine operates against
#[derive(Clone)]
pub struct RelayGroups {
    /// Untrusted group; always configured
    pub public: Arc<dyn RelayGroup>,
    /// Trusted group; optional
    pub private: Option<Arc<dyn RelayGroup>>,
}

impl RelayGroups {
    pub fn new(public: Arc<dyn RelayGroup>, private: Option<Arc<dyn RelayGroup>>) -> Self {
        Self { public, private }
    }

    /// All configured groups, public first
    pub fn all(&self) -> Vec<Arc<dyn RelayGroup>> {
        let mut groups: Vec<Arc<dyn RelayGroup>> = vec![self.public.clone()];
        if let Some(private) = &self.private {
            groups.push(private.clone());
        }
        groups
    }

    /// Whether dual publish is possible
    pub fn has_private(&self) -> bool {
        self.private.is_some()
    }
}
