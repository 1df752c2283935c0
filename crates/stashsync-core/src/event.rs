//! Event model and logical-key derivation
//!
//! Events are immutable signed records; "updates" are new events. The kind
//! number decides how an event is deduplicated and replaced:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Logical Key derivation by kind                                 │
//! │  ├── Addressable (kind >= 30000): (kind, author, d-tag)         │
//! │  ├── Replaceable (10000..20000):  (kind, author)                │
//! │  └── Regular (everything else):   event id                      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Dual publish and multi-device use produce several physical events sharing
//! one logical key ("siblings"). [`dedupe_by_logical_key`] collapses them,
//! always preferring a plaintext copy over a ciphertext-marked one.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{StashError, StashResult};
use crate::gateway::ENCRYPTED_MARKER;

/// Reserved kind for tombstone (deletion-instruction) events
pub const KIND_TOMBSTONE: u32 = 5;

/// Lower bound of the replaceable kind range
pub const KIND_REPLACEABLE_MIN: u32 = 10000;
/// Upper bound (exclusive) of the replaceable kind range
pub const KIND_REPLACEABLE_MAX: u32 = 20000;
/// Lower bound of the addressable kind range
pub const KIND_ADDRESSABLE_MIN: u32 = 30000;

/// A tag expressed as an array of strings.
///
/// The first element denotes the tag name, the rest hold data. The ones this
/// engine cares about:
///
/// - `d` – identifier of an addressable event
/// - `e` – reference to another event id (tombstone targets)
/// - `a` – reference to a logical address `kind:author:d-tag`
/// - `client` – provenance of the authoring client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Build a tag from a name and a single value
    pub fn pair(name: &str, value: &str) -> Self {
        Tag(vec![name.to_string(), value.to_string()])
    }

    /// Tag name (first element), if present
    pub fn name(&self) -> Option<&str> {
        self.0.first().map(|s| s.as_str())
    }

    /// Tag value (second element), if present
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(|s| s.as_str())
    }
}

/// An immutable signed record, as it travels over the wire and sits in the
/// local store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    /// Content-derived identifier (hex SHA-256 of the canonical form)
    pub id: String,
    /// Integer category tag
    pub kind: u32,
    /// Author public key (hex)
    pub author: String,
    /// Unix timestamp of creation (seconds)
    pub created_at: u64,
    /// Ordered list of string-array tags
    pub tags: Vec<Tag>,
    /// Content body; ciphertext when prefixed with the encryption marker
    pub content: String,
    /// Signature over the id (hex)
    pub signature: String,
}

/// Unsigned event, handed to the signer to become an [`Event`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventDraft {
    pub kind: u32,
    pub created_at: u64,
    pub tags: Vec<Tag>,
    pub content: String,
}

impl EventDraft {
    /// Canonical serialization hashed to produce the event id.
    ///
    /// The canonical form is the JSON array
    /// `[0, author, created_at, kind, tags, content]` with no whitespace.
    pub fn canonical_id(&self, author: &str) -> StashResult<String> {
        let canonical = serde_json::to_string(&(
            0u8,
            author,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        ))
        .map_err(|e| StashError::Serialization(e.to_string()))?;
        let digest = Sha256::digest(canonical.as_bytes());
        Ok(hex::encode(digest))
    }
}

/// Deduplication/replacement identity derived from an event's kind
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LogicalKey {
    /// kind >= 30000: identified by (kind, author, d-tag)
    Addressable {
        kind: u32,
        author: String,
        d_tag: String,
    },
    /// 10000 <= kind < 20000: identified by (kind, author)
    Replaceable { kind: u32, author: String },
    /// Everything else (including tombstones): identified by the event id
    Regular { id: String },
}

impl Event {
    /// First `d` tag value, or empty string when absent
    pub fn d_tag(&self) -> &str {
        self.tags
            .iter()
            .find(|t| t.name() == Some("d"))
            .and_then(|t| t.value())
            .unwrap_or("")
    }

    /// Derive the logical key for this event (pure, deterministic)
    pub fn logical_key(&self) -> LogicalKey {
        if self.kind >= KIND_ADDRESSABLE_MIN {
            LogicalKey::Addressable {
                kind: self.kind,
                author: self.author.clone(),
                d_tag: self.d_tag().to_string(),
            }
        } else if (KIND_REPLACEABLE_MIN..KIND_REPLACEABLE_MAX).contains(&self.kind) {
            LogicalKey::Replaceable {
                kind: self.kind,
                author: self.author.clone(),
            }
        } else {
            LogicalKey::Regular {
                id: self.id.clone(),
            }
        }
    }

    /// Storage key derived from the logical key.
    ///
    /// Addressable: `kind:author:d-tag`, replaceable: `kind:author`,
    /// regular: the event id.
    pub fn cache_key(&self) -> String {
        match self.logical_key() {
            LogicalKey::Addressable {
                kind,
                author,
                d_tag,
            } => format!("{}:{}:{}", kind, author, d_tag),
            LogicalKey::Replaceable { kind, author } => format!("{}:{}", kind, author),
            LogicalKey::Regular { id } => id,
        }
    }

    /// Whether the content carries the fixed ciphertext marker
    pub fn is_ciphertext(&self) -> bool {
        self.content.starts_with(ENCRYPTED_MARKER)
    }

    /// Whether this is a tombstone (deletion-instruction) event
    pub fn is_tombstone(&self) -> bool {
        self.kind == KIND_TOMBSTONE
    }

    /// Required-field validation.
    ///
    /// Checks that id, author and signature are present and hex, and that
    /// every tag has at least a name. Failures are [`StashError::MalformedRecord`].
    pub fn validate(&self) -> StashResult<()> {
        if self.id.is_empty() || hex::decode(&self.id).is_err() {
            return Err(StashError::MalformedRecord(format!(
                "invalid event id: {:?}",
                self.id
            )));
        }
        if self.author.is_empty() || hex::decode(&self.author).is_err() {
            return Err(StashError::MalformedRecord(format!(
                "invalid author key: {:?}",
                self.author
            )));
        }
        if self.signature.is_empty() || hex::decode(&self.signature).is_err() {
            return Err(StashError::MalformedRecord(
                "missing or non-hex signature".to_string(),
            ));
        }
        if self.tags.iter().any(|t| t.0.is_empty()) {
            return Err(StashError::MalformedRecord("empty tag entry".to_string()));
        }
        Ok(())
    }

    /// Logical addresses (`a` tags) and explicit ids (`e` tags) referenced by
    /// a tombstone. Returns `(addresses, ids)`; both may be empty for
    /// non-tombstone events.
    pub fn tombstone_targets(&self) -> (Vec<String>, Vec<String>) {
        let mut addresses = Vec::new();
        let mut ids = Vec::new();
        if !self.is_tombstone() {
            return (addresses, ids);
        }
        for tag in &self.tags {
            match (tag.name(), tag.value()) {
                (Some("a"), Some(addr)) => addresses.push(addr.to_string()),
                (Some("e"), Some(id)) => ids.push(id.to_string()),
                _ => {}
            }
        }
        (addresses, ids)
    }
}

/// Collapse a set of sibling events down to one physical event per logical
/// key.
///
/// Preference order within one logical key:
/// 1. plaintext beats ciphertext-marked, irrespective of timestamps
/// 2. newer `created_at` beats older
/// 3. lower id breaks remaining ties (keeps the result order-independent)
///
/// The operation is idempotent: `dedupe(dedupe(s)) == dedupe(s)`.
pub fn dedupe_by_logical_key(events: Vec<Event>) -> Vec<Event> {
    let mut best: std::collections::HashMap<String, Event> = std::collections::HashMap::new();
    for event in events {
        let key = event.cache_key();
        match best.get(&key) {
            Some(current) if !prefers(&event, current) => {}
            _ => {
                best.insert(key, event);
            }
        }
    }
    let mut result: Vec<Event> = best.into_values().collect();
    result.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
    result
}

/// True when `candidate` should replace `current` under the dedup preference
fn prefers(candidate: &Event, current: &Event) -> bool {
    match (candidate.is_ciphertext(), current.is_ciphertext()) {
        (false, true) => true,
        (true, false) => false,
        _ => match candidate.created_at.cmp(&current.created_at) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => candidate.id < current.id,
        },
    }
}

/// Format a logical address string `kind:author:d-tag` for `a` tag references
pub fn format_address(kind: u32, author: &str, d_tag: &str) -> String {
    format!("{}:{}:{}", kind, author, d_tag)
}

/// Build an unsigned-but-shaped event for unit tests
#[cfg(test)]
pub(crate) fn test_event(kind: u32, author: &str, d_tag: &str, content: &str) -> Event {
    let tags = if d_tag.is_empty() {
        vec![]
    } else {
        vec![Tag::pair("d", d_tag)]
    };
    let draft = EventDraft {
        kind,
        created_at: 1_700_000_000,
        tags: tags.clone(),
        content: content.to_string(),
    };
    let id = draft.canonical_id(author).unwrap();
    Event {
        id,
        kind,
        author: author.to_string(),
        created_at: 1_700_000_000,
        tags,
        content: content.to_string(),
        signature: "00".repeat(64),
    }
}
