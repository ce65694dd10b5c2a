mod common;

use std::sync::Arc;

use brookdb::recovery::BrookRecovery;
use brookdb::repository::BrookRepository;
use brookdb::store::memory::MemoryStore;
use brookdb::{BrookDb, BrookStoreConfig};
use common::{events, order_key, pos, read_all};

/// A facade plus a repository over the same backend, so tests can fabricate
/// the document states a crash would leave behind.
fn crash_fixture() -> (Arc<MemoryStore>, BrookRepository, BrookDb) {
    let store = Arc::new(MemoryStore::new());
    let config = BrookStoreConfig::default();
    let repository = BrookRepository::new(store.clone(), config.clone());
    let db = BrookDb::new(store.clone(), store.clone(), config);
    (store, repository, db)
}

#[tokio::test]
async fn next_append_finishes_an_interrupted_commit() {
    let (_, repository, db) = crash_fixture();
    let key = order_key();

    // The crashed writer staged 0 -> 3 and landed every event, but died
    // before moving the head.
    repository
        .create_pending_head(&key, pos(0), pos(3))
        .await
        .unwrap();
    repository
        .append_event_batch(&key, &events("crashed", 3), pos(0))
        .await
        .unwrap();

    // The interrupted batch only becomes visible once a writer touches the
    // brook; reads alone never repair.
    assert_eq!(db.cursor_position(&key).await.unwrap(), pos(0));
    assert!(read_all(&db, &key, 0, 10).await.is_empty());

    let head = db
        .append_events(&key, &events("next", 1), None)
        .await
        .unwrap();
    assert_eq!(head, pos(4));
    assert_eq!(
        common::event_ids(&read_all(&db, &key, 0, 4).await),
        vec!["crashed-0", "crashed-1", "crashed-2", "next-0"]
    );
}

#[tokio::test]
async fn next_append_rolls_back_a_partial_batch() {
    let (store, repository, db) = crash_fixture();
    let key = order_key();

    // The crashed writer staged 0 -> 3 but landed only two events.
    repository
        .create_pending_head(&key, pos(0), pos(3))
        .await
        .unwrap();
    repository
        .append_event_batch(&key, &events("crashed", 3)[..2], pos(0))
        .await
        .unwrap();

    // A conditional append at 0 succeeds: recovery erased the fragments.
    let head = db
        .append_events(&key, &events("fresh", 2), Some(pos(0)))
        .await
        .unwrap();
    assert_eq!(head, pos(2));
    assert_eq!(
        common::event_ids(&read_all(&db, &key, 0, 2).await),
        vec!["fresh-0", "fresh-1"]
    );

    // Head plus two events; no orphaned documents from the crashed batch.
    assert_eq!(store.partition_len(&key.to_string()), 3);
}

#[tokio::test]
async fn readers_never_see_a_half_written_batch() {
    let (_, repository, db) = crash_fixture();
    let key = order_key();

    db.append_events(&key, &events("committed", 2), Some(pos(0)))
        .await
        .unwrap();

    // A writer is (or died) mid-append past the committed head.
    repository
        .create_pending_head(&key, pos(2), pos(4))
        .await
        .unwrap();
    repository
        .append_event_batch(&key, &events("staged", 1), pos(2))
        .await
        .unwrap();

    let got = read_all(&db, &key, 0, 10).await;
    assert_eq!(common::event_ids(&got), vec!["committed-0", "committed-1"]);
    assert_eq!(db.cursor_position(&key).await.unwrap(), pos(2));
}

#[tokio::test]
async fn repair_is_idempotent() {
    let (_, repository, db) = crash_fixture();
    let key = order_key();

    repository
        .create_pending_head(&key, pos(0), pos(3))
        .await
        .unwrap();
    repository
        .append_event_batch(&key, &events("crashed", 3)[..1], pos(0))
        .await
        .unwrap();

    // Run repair twice; the second pass finds a clean brook and does the
    // same thing a fresh read of it would.
    let recovery = BrookRecovery::new(repository.clone());
    assert_eq!(recovery.get_or_recover_position(&key).await.unwrap(), pos(0));
    assert_eq!(recovery.get_or_recover_position(&key).await.unwrap(), pos(0));

    let head = db
        .append_events(&key, &events("after", 1), Some(pos(0)))
        .await
        .unwrap();
    assert_eq!(head, pos(1));
}

#[tokio::test]
async fn stale_marker_behind_the_head_is_cleared_without_damage() {
    let (store, repository, db) = crash_fixture();
    let key = order_key();

    // Crash between the head upsert and the marker delete: the append's
    // batch committed, only the cleanup is missing.
    repository
        .create_pending_head(&key, pos(0), pos(2))
        .await
        .unwrap();
    repository
        .execute_transactional_batch(&key, &events("done", 2), pos(0), pos(2))
        .await
        .unwrap();

    let head = db
        .append_events(&key, &events("next", 1), Some(pos(2)))
        .await
        .unwrap();
    assert_eq!(head, pos(3));
    assert_eq!(
        common::event_ids(&read_all(&db, &key, 0, 3).await),
        vec!["done-0", "done-1", "next-0"]
    );
    assert_eq!(store.partition_len(&key.to_string()), 4);
}
