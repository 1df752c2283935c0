//! Backfill synchronizer integration tests

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{init_tracing, signed_event, MemoryRelayGroup};
use stashsync_core::{
    is_encrypted, verify_event, BackfillConfig, BackfillState, BackfillSynchronizer, Category,
    CategoryPayload, EncryptionGateway, EncryptionPolicy, GroupTrust, LocalSigner, LocalStore,
    RelayGroups, Signer, StashError, Tag, KIND_TOMBSTONE,
};
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

struct Env {
    sync: BackfillSynchronizer,
    signer: Arc<LocalSigner>,
    gateway: Arc<EncryptionGateway>,
    public: Arc<MemoryRelayGroup>,
    private: Arc<MemoryRelayGroup>,
    _dir: tempfile::TempDir,
}

fn env_with_config(config: BackfillConfig) -> Env {
    init_tracing();
    let dir = tempdir().unwrap();
    let signer = Arc::new(LocalSigner::from_seed(&[41u8; 32]));
    let store = Arc::new(LocalStore::new(dir.path().join("stash.redb")).unwrap());
    let gateway = Arc::new(EncryptionGateway::new(
        signer.clone(),
        EncryptionPolicy::encrypt_all(),
    ));
    let public = MemoryRelayGroup::new("public", GroupTrust::Public);
    let private = MemoryRelayGroup::new("private", GroupTrust::Private);
    let groups = RelayGroups::new(public.clone(), Some(private.clone()));
    let sync = BackfillSynchronizer::new(
        signer.clone(),
        gateway.clone(),
        store,
        groups,
        config,
    );
    Env {
        sync,
        signer,
        gateway,
        public,
        private,
        _dir: dir,
    }
}

fn env() -> Env {
    env_with_config(BackfillConfig::default())
}

fn now() -> u64 {
    chrono::Utc::now().timestamp() as u64
}

fn pet(name: &str) -> CategoryPayload {
    CategoryPayload::Pets {
        name: name.to_string(),
        species: None,
        breed: None,
    }
}

/// Seed a ciphertext record on the public group, as dual publish would
async fn seed_encrypted(env: &Env, d_tag: &str, name: &str, created_at: u64) {
    let content = env.gateway.encrypt_for_category(&pet(name)).await.unwrap();
    let event = signed_event(
        env.signer.as_ref(),
        Category::Pets.kind(),
        d_tag,
        &content,
        created_at,
    )
    .await;
    env.public.seed(event);
}

#[tokio::test]
async fn backfill_heals_missing_records() {
    let env = env();
    let t = now() - 600;

    // Three candidates on public; one already present on private.
    seed_encrypted(&env, "pet-1", "Fido", t).await;
    seed_encrypted(&env, "pet-2", "Rex", t + 1).await;
    seed_encrypted(&env, "pet-3", "Bella", t + 2).await;
    let already = signed_event(
        env.signer.as_ref(),
        Category::Pets.kind(),
        "pet-3",
        &pet("Bella").to_json().unwrap(),
        t + 2,
    )
    .await;
    env.private.seed(already);

    let cancel = CancellationToken::new();
    let report = env.sync.run(&cancel).await.unwrap();
    assert_eq!(report.candidates, 2);
    assert_eq!(report.published, 2);
    assert_eq!(report.skipped, 0);
    assert_eq!(env.sync.state().await, BackfillState::Idle);

    // The healed copies are plaintext, verifiable, and keep kind/tags/
    // created_at from the source events.
    let healed: Vec<_> = env
        .private
        .all_events()
        .into_iter()
        .filter(|e| e.d_tag() == "pet-1" || e.d_tag() == "pet-2")
        .collect();
    assert_eq!(healed.len(), 2);
    for event in &healed {
        assert!(!is_encrypted(&event.content));
        verify_event(event).unwrap();
        assert_eq!(event.kind, Category::Pets.kind());
        assert!(event.created_at == t || event.created_at == t + 1);
    }
}

#[tokio::test]
async fn backfill_converges_on_second_run() {
    let env = env();
    seed_encrypted(&env, "pet-1", "Fido", now() - 600).await;
    seed_encrypted(&env, "pet-2", "Rex", now() - 500).await;

    let cancel = CancellationToken::new();
    let first = env.sync.run(&cancel).await.unwrap();
    assert_eq!(first.published, 2);

    let second = env.sync.run(&cancel).await.unwrap();
    assert_eq!(second.published, 0);
    assert_eq!(env.private.publish_count(), 2);
}

#[tokio::test]
async fn backfill_republishes_tombstones_unchanged() {
    let env = env();
    let author = env.signer.public_key();
    let mut draft_tags = vec![Tag::pair(
        "a",
        &format!("{}:{}:pet-1", Category::Pets.kind(), author),
    )];
    draft_tags.push(Tag::pair("client", "stashsync-tests"));
    let tombstone = env
        .signer
        .sign_event(stashsync_core::EventDraft {
            kind: KIND_TOMBSTONE,
            created_at: now() - 300,
            tags: draft_tags,
            content: String::new(),
        })
        .await
        .unwrap();
    env.public.seed(tombstone.clone());

    let cancel = CancellationToken::new();
    let report = env.sync.run(&cancel).await.unwrap();
    assert_eq!(report.published, 1);

    // Same physical event: no decryption, no re-signing.
    let on_private = env.private.all_events();
    assert_eq!(on_private.len(), 1);
    assert_eq!(on_private[0].id, tombstone.id);
}

#[tokio::test]
async fn backfill_prefers_plaintext_sibling_to_avoid_decrypt() {
    let env = env();
    let t = now() - 600;

    // Both a ciphertext and a plaintext sibling made it to public.
    seed_encrypted(&env, "pet-1", "Fido", t).await;
    let plain = signed_event(
        env.signer.as_ref(),
        Category::Pets.kind(),
        "pet-1",
        &pet("Fido").to_json().unwrap(),
        t - 50, // older, but plaintext still wins
    )
    .await;
    env.public.seed(plain.clone());

    let cancel = CancellationToken::new();
    let report = env.sync.run(&cancel).await.unwrap();
    assert_eq!(report.published, 1);

    let on_private = env.private.all_events();
    assert_eq!(on_private.len(), 1);
    // The plaintext copy was republished as-is.
    assert_eq!(on_private[0].id, plain.id);
}

#[tokio::test]
async fn backfill_aborts_on_bulk_query_failure() {
    let env = env();
    seed_encrypted(&env, "pet-1", "Fido", now() - 600).await;
    env.public.set_fail_queries(true);

    let cancel = CancellationToken::new();
    let err = env.sync.run(&cancel).await.unwrap_err();
    assert!(matches!(err, StashError::Transport(_)));
    assert!(matches!(env.sync.state().await, BackfillState::Error(_)));

    // Checkpoint untouched: a later run still sees the record.
    env.public.set_fail_queries(false);
    let report = env.sync.run(&cancel).await.unwrap();
    assert_eq!(report.published, 1);
}

#[tokio::test]
async fn backfill_isolates_per_record_failures() {
    let env = env();
    let t = now() - 600;
    seed_encrypted(&env, "pet-1", "Fido", t).await;

    // Garbage ciphertext that will fail decryption.
    let broken = signed_event(
        env.signer.as_ref(),
        Category::Pets.kind(),
        "pet-2",
        "stash1:not-real-ciphertext",
        t + 1,
    )
    .await;
    env.public.seed(broken);

    let cancel = CancellationToken::new();
    let report = env.sync.run(&cancel).await.unwrap();
    assert_eq!(report.candidates, 2);
    assert_eq!(report.published, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(env.sync.state().await, BackfillState::Idle);
}

#[tokio::test]
async fn backfill_bounds_concurrent_work() {
    let mut config = BackfillConfig::default();
    config.concurrency = 4;
    let env = env_with_config(config);
    env.private.set_publish_delay(Duration::from_millis(30));

    let t = now() - 600;
    for i in 0..12 {
        seed_encrypted(&env, &format!("pet-{}", i), "Fido", t + i).await;
    }

    let cancel = CancellationToken::new();
    let report = env.sync.run(&cancel).await.unwrap();
    assert_eq!(report.published, 12);
    assert!(
        env.private.max_in_flight() <= 4,
        "saw {} concurrent publishes",
        env.private.max_in_flight()
    );
}

#[tokio::test]
async fn backfill_requires_private_group() {
    let env = env();
    let groups = RelayGroups::new(env.public.clone(), None);
    let store = Arc::new(LocalStore::new(env._dir.path().join("other.redb")).unwrap());
    let sync = BackfillSynchronizer::new(
        env.signer.clone(),
        env.gateway.clone(),
        store,
        groups,
        BackfillConfig::default(),
    );
    assert!(!sync.preconditions_met());

    let cancel = CancellationToken::new();
    let err = sync.run(&cancel).await.unwrap_err();
    assert!(matches!(err, StashError::InvalidOperation(_)));
}

#[tokio::test]
async fn backfill_cancellation_propagates() {
    let env = env();
    seed_encrypted(&env, "pet-1", "Fido", now() - 600).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = env.sync.run(&cancel).await.unwrap_err();
    assert!(matches!(err, StashError::Cancelled));
}

#[tokio::test]
async fn pending_sync_count_diffs_and_caches() {
    let env = env();
    let t = now() - 600;
    seed_encrypted(&env, "pet-1", "Fido", t).await;
    seed_encrypted(&env, "pet-2", "Rex", t + 1).await;
    let present = signed_event(
        env.signer.as_ref(),
        Category::Pets.kind(),
        "pet-2",
        &pet("Rex").to_json().unwrap(),
        t + 1,
    )
    .await;
    env.private.seed(present);

    let cancel = CancellationToken::new();
    assert_eq!(env.sync.pending_sync_count(&cancel).await.unwrap(), 1);

    // Within the cache TTL the estimate does not hit the relays again.
    seed_encrypted(&env, "pet-3", "Bella", t + 2).await;
    assert_eq!(env.sync.pending_sync_count(&cancel).await.unwrap(), 1);
}

#[tokio::test]
async fn periodic_trigger_stops_on_cancel() {
    let mut config = BackfillConfig::default();
    config.interval = Duration::from_millis(20);
    let env = env_with_config(config);
    seed_encrypted(&env, "pet-1", "Fido", now() - 600).await;

    let cancel = CancellationToken::new();
    let handle = env.sync.spawn_periodic(cancel.clone());

    // Give the trigger a few intervals to fire.
    tokio::time::sleep(Duration::from_millis(120)).await;
    cancel.cancel();
    handle.await.unwrap();

    assert!(env.private.publish_count() >= 1);
}
