//! Durable local event cache using redb
//!
//! One cached record per logical key: `put` always upserts at the derived
//! cache key, never appends duplicates. Reads are served purely from local
//! state; there is no network fallback on this path.
//!
//! ## Tables
//!
//! - `events`: cache key -> postcard-serialized [`Event`]
//! - `event_index`: `author/kind/cache_key` composite -> cache key, range
//!   scanned for (kind, author) and author-only lookups
//! - `tombstones`: excluded cache key or event id -> observed-at seconds
//! - `meta`: sync scope id -> last-synced checkpoint seconds
//!
//! ## Failure semantics
//!
//! If the underlying handle fails (e.g. invalidated by another process), the
//! store reopens the database from its path and retries the operation exactly
//! once. Errors that survive the retry are logged and degrade: reads return
//! empty, writes become no-ops. The system prefers silently stale data over
//! a hard failure on this path.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use tracing::{debug, warn};

use crate::error::{StashError, StashResult};
use crate::event::Event;

/// Cached events by cache key
const EVENTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("events");
/// Composite author/kind index (value: cache key)
const INDEX_TABLE: TableDefinition<&str, &str> = TableDefinition::new("event_index");
/// Logical keys and ids permanently excluded by observed tombstones
const TOMBSTONES_TABLE: TableDefinition<&str, u64> = TableDefinition::new("tombstones");
/// Per-scope sync checkpoints
const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Durable, owner-scoped event cache.
///
/// Cloneable; clones share the same database handle.
#[derive(Clone)]
pub struct LocalStore {
    path: PathBuf,
    // `None` only transiently while a failed handle is being reopened
    db: Arc<RwLock<Option<Database>>>,
    #[cfg(test)]
    faults: Arc<std::sync::atomic::AtomicUsize>,
    #[cfg(test)]
    reopens: Arc<std::sync::atomic::AtomicUsize>,
}

/// Composite index key: zero-padded kind keeps range bounds simple
fn index_key(author: &str, kind: u32, cache_key: &str) -> String {
    format!("{}/{:0>10}/{}", author, kind, cache_key)
}

/// Parse a logical address `kind:author:d-tag` into its parts
fn parse_address(address: &str) -> Option<(u32, String, String)> {
    let mut parts = address.splitn(3, ':');
    let kind = parts.next()?.parse().ok()?;
    let author = parts.next()?.to_string();
    let d_tag = parts.next().unwrap_or("").to_string();
    Some((kind, author, d_tag))
}

impl LocalStore {
    /// Open (or create) the store at the given path
    pub fn new(path: impl AsRef<Path>) -> StashResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(&path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(EVENTS_TABLE)?;
            let _ = write_txn.open_table(INDEX_TABLE)?;
            let _ = write_txn.open_table(TOMBSTONES_TABLE)?;
            let _ = write_txn.open_table(META_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            path,
            db: Arc::new(RwLock::new(Some(db))),
            #[cfg(test)]
            faults: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
            #[cfg(test)]
            reopens: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
        })
    }

    /// Make the next `n` handle accesses fail as if the handle were
    /// invalidated by another process
    #[cfg(test)]
    fn inject_faults(&self, n: usize) {
        self.faults.store(n, std::sync::atomic::Ordering::SeqCst);
    }

    /// How many times the handle has been reopened after a fault
    #[cfg(test)]
    fn reopen_count(&self) -> usize {
        self.reopens.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn attempt<T>(&self, f: &impl Fn(&Database) -> StashResult<T>) -> StashResult<T> {
        #[cfg(test)]
        {
            use std::sync::atomic::Ordering;
            if self
                .faults
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StashError::StorageUnavailable(
                    "handle invalidated".to_string(),
                ));
            }
        }
        let guard = self.db.read();
        match guard.as_ref() {
            Some(db) => f(db),
            None => Err(StashError::StorageUnavailable(
                "handle closed".to_string(),
            )),
        }
    }

    /// Run an operation against the handle, reopening and retrying exactly
    /// once on failure. Returns `None` when the retry also failed.
    fn try_twice<T>(&self, op: &str, f: impl Fn(&Database) -> StashResult<T>) -> Option<T> {
        let err = match self.attempt(&f) {
            Ok(value) => return Some(value),
            Err(e) => e,
        };
        warn!(op, error = %err, "storage operation failed, reopening handle");

        {
            let mut guard = self.db.write();
            // Drop the stale handle before reopening; redb keeps an
            // exclusive file lock for each open database.
            guard.take();
            match Database::create(&self.path) {
                Ok(fresh) => {
                    *guard = Some(fresh);
                    #[cfg(test)]
                    self.reopens
                        .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                }
                Err(e) => {
                    warn!(op, error = %e, "storage handle could not be reopened");
                    return None;
                }
            }
        }

        match self.attempt(&f) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(op, error = %e, "storage operation failed after reopen, degrading");
                None
            }
        }
    }

    /// Upsert events at their derived cache keys; returns how many were
    /// stored.
    ///
    /// Tombstone events additionally record permanent exclusions for every
    /// logical key or id they reference and evict matching cached records.
    /// Malformed events and events under an observed tombstone are dropped
    /// with a log line. Each event is written in its own transaction, so a
    /// cancelled caller never leaves a half-written record.
    pub fn put(&self, events: &[Event]) -> usize {
        let mut stored = 0;
        for event in events {
            if let Err(e) = event.validate() {
                warn!(error = %e, "dropping malformed event on put");
                continue;
            }
            let outcome = self.try_twice("put", |db| self.put_one(db, event));
            if outcome == Some(true) {
                stored += 1;
            }
        }
        stored
    }

    fn put_one(&self, db: &Database, event: &Event) -> StashResult<bool> {
        let cache_key = event.cache_key();
        let write_txn = db.begin_write()?;
        let mut written = false;
        {
            let mut events = write_txn.open_table(EVENTS_TABLE)?;
            let mut index = write_txn.open_table(INDEX_TABLE)?;
            let mut tombstones = write_txn.open_table(TOMBSTONES_TABLE)?;

            if event.is_tombstone() {
                let (addresses, ids) = event.tombstone_targets();
                for address in addresses {
                    tombstones.insert(address.as_str(), event.created_at)?;
                    if let Some((kind, author, _)) = parse_address(&address) {
                        if events.remove(address.as_str())?.is_some() {
                            index.remove(index_key(&author, kind, &address).as_str())?;
                        }
                    }
                }
                for id in ids {
                    tombstones.insert(id.as_str(), event.created_at)?;
                    // Regular events are keyed by id; addressable siblings
                    // referenced by id need a scan.
                    let removed_bytes =
                        events.remove(id.as_str())?.map(|guard| guard.value().to_vec());
                    if let Some(bytes) = removed_bytes {
                        let removed: Event = postcard::from_bytes(&bytes)
                            .map_err(|e| StashError::Serialization(e.to_string()))?;
                        index.remove(
                            index_key(&removed.author, removed.kind, &id).as_str(),
                        )?;
                    } else if let Some((key, author, kind)) = find_by_id(&events, &id)? {
                        events.remove(key.as_str())?;
                        index.remove(index_key(&author, kind, &key).as_str())?;
                    }
                }
            }

            let excluded = tombstones.get(cache_key.as_str())?.is_some()
                || tombstones.get(event.id.as_str())?.is_some();
            if excluded {
                debug!(cache_key, "skipping event under observed tombstone");
            } else {
                let bytes = postcard::to_allocvec(event)
                    .map_err(|e| StashError::Serialization(e.to_string()))?;
                events.insert(cache_key.as_str(), bytes.as_slice())?;
                index.insert(
                    index_key(&event.author, event.kind, &cache_key).as_str(),
                    cache_key.as_str(),
                )?;
                written = true;
            }
        }
        write_txn.commit()?;
        Ok(written)
    }

    /// Events of the given kinds by one author, newest first.
    ///
    /// Records excluded by observed tombstones never appear.
    pub fn get_by_kinds_and_author(&self, kinds: &[u32], author: &str) -> Vec<Event> {
        self.try_twice("get_by_kinds_and_author", |db| {
            let read_txn = db.begin_read()?;
            let events = read_txn.open_table(EVENTS_TABLE)?;
            let index = read_txn.open_table(INDEX_TABLE)?;
            let tombstones = read_txn.open_table(TOMBSTONES_TABLE)?;

            let mut result = Vec::new();
            for &kind in kinds {
                let start = format!("{}/{:0>10}/", author, kind);
                let end = format!("{}/{:0>10}0", author, kind);
                for entry in index.range(start.as_str()..end.as_str())? {
                    let (_, cache_key) = entry?;
                    if let Some(event) =
                        load_visible(&events, &tombstones, cache_key.value())?
                    {
                        result.push(event);
                    }
                }
            }
            result.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
            Ok(result)
        })
        .unwrap_or_default()
    }

    /// All cached events by one author, newest first
    pub fn get_by_author(&self, author: &str) -> Vec<Event> {
        self.try_twice("get_by_author", |db| {
            let read_txn = db.begin_read()?;
            let events = read_txn.open_table(EVENTS_TABLE)?;
            let index = read_txn.open_table(INDEX_TABLE)?;
            let tombstones = read_txn.open_table(TOMBSTONES_TABLE)?;

            let start = format!("{}/", author);
            let end = format!("{}0", author);
            let mut result = Vec::new();
            for entry in index.range(start.as_str()..end.as_str())? {
                let (_, cache_key) = entry?;
                if let Some(event) = load_visible(&events, &tombstones, cache_key.value())? {
                    result.push(event);
                }
            }
            result.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
            Ok(result)
        })
        .unwrap_or_default()
    }

    /// Remove the cached record at an addressable logical key
    pub fn delete_by_address(&self, kind: u32, author: &str, d_tag: &str) {
        let cache_key = format!("{}:{}:{}", kind, author, d_tag);
        self.try_twice("delete_by_address", |db| {
            let write_txn = db.begin_write()?;
            {
                let mut events = write_txn.open_table(EVENTS_TABLE)?;
                let mut index = write_txn.open_table(INDEX_TABLE)?;
                if events.remove(cache_key.as_str())?.is_some() {
                    index.remove(index_key(author, kind, &cache_key).as_str())?;
                }
            }
            write_txn.commit()?;
            Ok(())
        });
    }

    /// Remove a cached record by its event id, whatever its kind class
    pub fn delete_by_id(&self, id: &str) {
        self.try_twice("delete_by_id", |db| {
            let write_txn = db.begin_write()?;
            {
                let mut events = write_txn.open_table(EVENTS_TABLE)?;
                let mut index = write_txn.open_table(INDEX_TABLE)?;
                let removed_bytes =
                    events.remove(id)?.map(|guard| guard.value().to_vec());
                if let Some(bytes) = removed_bytes {
                    let removed: Event = postcard::from_bytes(&bytes)
                        .map_err(|e| StashError::Serialization(e.to_string()))?;
                    index.remove(index_key(&removed.author, removed.kind, id).as_str())?;
                } else if let Some((key, author, kind)) = find_by_id(&events, id)? {
                    events.remove(key.as_str())?;
                    index.remove(index_key(&author, kind, &key).as_str())?;
                }
            }
            write_txn.commit()?;
            Ok(())
        });
    }

    /// Remove every cached record authored by `author`
    pub fn clear_for_author(&self, author: &str) {
        self.try_twice("clear_for_author", |db| {
            let write_txn = db.begin_write()?;
            {
                let mut events = write_txn.open_table(EVENTS_TABLE)?;
                let mut index = write_txn.open_table(INDEX_TABLE)?;

                let start = format!("{}/", author);
                let end = format!("{}0", author);
                let mut doomed = Vec::new();
                for entry in index.range(start.as_str()..end.as_str())? {
                    let (index_key, cache_key) = entry?;
                    doomed.push((
                        index_key.value().to_string(),
                        cache_key.value().to_string(),
                    ));
                }
                for (index_key, cache_key) in doomed {
                    events.remove(cache_key.as_str())?;
                    index.remove(index_key.as_str())?;
                }
            }
            write_txn.commit()?;
            Ok(())
        });
    }

    /// Wipe the store entirely (logout), including tombstone exclusions and
    /// checkpoints
    pub fn clear_all(&self) {
        self.try_twice("clear_all", |db| {
            let write_txn = db.begin_write()?;
            {
                write_txn.delete_table(EVENTS_TABLE)?;
                write_txn.delete_table(INDEX_TABLE)?;
                write_txn.delete_table(TOMBSTONES_TABLE)?;
                write_txn.delete_table(META_TABLE)?;
                // Recreate empty tables so later operations find them.
                let _ = write_txn.open_table(EVENTS_TABLE)?;
                let _ = write_txn.open_table(INDEX_TABLE)?;
                let _ = write_txn.open_table(TOMBSTONES_TABLE)?;
                let _ = write_txn.open_table(META_TABLE)?;
            }
            write_txn.commit()?;
            Ok(())
        });
    }

    /// Last-synced checkpoint for a sync scope, if any
    pub fn checkpoint(&self, scope: &str) -> Option<u64> {
        self.try_twice("checkpoint", |db| {
            let read_txn = db.begin_read()?;
            let meta = read_txn.open_table(META_TABLE)?;
            Ok(meta.get(scope)?.map(|g| g.value()))
        })
        .flatten()
    }

    /// Persist the checkpoint for a sync scope
    pub fn set_checkpoint(&self, scope: &str, timestamp: u64) {
        self.try_twice("set_checkpoint", |db| {
            let write_txn = db.begin_write()?;
            {
                let mut meta = write_txn.open_table(META_TABLE)?;
                meta.insert(scope, timestamp)?;
            }
            write_txn.commit()?;
            Ok(())
        });
    }
}

/// Load an event by cache key unless a tombstone excludes it
fn load_visible(
    events: &impl ReadableTable<&'static str, &'static [u8]>,
    tombstones: &impl ReadableTable<&'static str, u64>,
    cache_key: &str,
) -> StashResult<Option<Event>> {
    let Some(guard) = events.get(cache_key)? else {
        return Ok(None);
    };
    let event: Event = postcard::from_bytes(guard.value())
        .map_err(|e| StashError::Serialization(e.to_string()))?;
    if tombstones.get(cache_key)?.is_some() || tombstones.get(event.id.as_str())?.is_some() {
        return Ok(None);
    }
    Ok(Some(event))
}

/// Scan for an event stored under a non-id cache key but matching this id.
/// Returns `(cache_key, author, kind)`.
fn find_by_id(
    events: &impl ReadableTable<&'static str, &'static [u8]>,
    id: &str,
) -> StashResult<Option<(String, String, u32)>> {
    for entry in events.iter()? {
        let (key, value) = entry?;
        let event: Event = postcard::from_bytes(value.value())
            .map_err(|e| StashError::Serialization(e.to_string()))?;
        if event.id == id {
            return Ok(Some((key.value().to_string(), event.author, event.kind)));
        }
    }
    Ok(None)
}
