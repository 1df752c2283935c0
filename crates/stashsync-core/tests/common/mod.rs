//! Shared test fixtures: an in-memory relay group and engine wiring

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use stashsync_core::{
    Event, EventDraft, Filter, GroupTrust, RelayGroup, StashError, StashResult, Tag,
};

/// Install the fmt subscriber once so test log output is visible with
/// `--nocapture`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt::try_init();
}

/// In-memory relay group double.
///
/// Stores events with relay-style replacement semantics (one event per
/// logical key for addressable/replaceable kinds), supports injected
/// failures and artificial latency, and tracks the maximum number of
/// concurrent publishes it has seen.
pub struct MemoryRelayGroup {
    name: String,
    trust: GroupTrust,
    events: Mutex<Vec<Event>>,
    publish_delay: Mutex<Option<Duration>>,
    fail_queries: AtomicBool,
    fail_publishes: AtomicBool,
    publish_count: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MemoryRelayGroup {
    pub fn new(name: &str, trust: GroupTrust) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            trust,
            events: Mutex::new(Vec::new()),
            publish_delay: Mutex::new(None),
            fail_queries: AtomicBool::new(false),
            fail_publishes: AtomicBool::new(false),
            publish_count: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    /// Seed an event directly, bypassing publish bookkeeping
    pub fn seed(&self, event: Event) {
        self.insert(event);
    }

    pub fn all_events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn publish_count(&self) -> usize {
        self.publish_count.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn set_publish_delay(&self, delay: Duration) {
        *self.publish_delay.lock() = Some(delay);
    }

    pub fn set_fail_queries(&self, fail: bool) {
        self.fail_queries.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    fn insert(&self, event: Event) {
        let mut events = self.events.lock();
        let key = event.cache_key();
        events.retain(|e| e.cache_key() != key);
        events.push(event);
    }
}

#[async_trait]
impl RelayGroup for MemoryRelayGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn trust(&self) -> GroupTrust {
        self.trust
    }

    async fn query(
        &self,
        filters: &[Filter],
        cancel: &CancellationToken,
    ) -> StashResult<Vec<Event>> {
        if cancel.is_cancelled() {
            return Err(StashError::Cancelled);
        }
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(StashError::Transport(format!("{} unreachable", self.name)));
        }
        let events = self.events.lock();
        Ok(events
            .iter()
            .filter(|e| filters.iter().any(|f| f.matches(e)))
            .cloned()
            .collect())
    }

    async fn publish(&self, event: &Event, cancel: &CancellationToken) -> StashResult<()> {
        if cancel.is_cancelled() {
            return Err(StashError::Cancelled);
        }
        if self.fail_publishes.load(Ordering::SeqCst) {
            return Err(StashError::Transport(format!(
                "{} rejected event",
                self.name
            )));
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.publish_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.publish_count.fetch_add(1, Ordering::SeqCst);
        self.insert(event.clone());
        Ok(())
    }
}

/// Sign a complete event through a signer, for seeding relay fixtures
pub async fn signed_event(
    signer: &dyn stashsync_core::Signer,
    kind: u32,
    d_tag: &str,
    content: &str,
    created_at: u64,
) -> Event {
    let tags = if d_tag.is_empty() {
        vec![]
    } else {
        vec![Tag::pair("d", d_tag)]
    };
    signer
        .sign_event(EventDraft {
            kind,
            created_at,
            tags,
            content: content.to_string(),
        })
        .await
        .unwrap()
}
