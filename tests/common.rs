#![allow(dead_code)]

use std::path::PathBuf;

use brookdb::{BrookDb, BrookEvent, BrookKey, BrookPosition, BrookRangeKey, BrookStoreConfig};
use futures::StreamExt;

pub fn memory_db() -> BrookDb {
    BrookDb::in_memory(BrookStoreConfig::default())
}

pub fn create_temp_db_file(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    (dir, path)
}

pub fn pos(value: u64) -> BrookPosition {
    BrookPosition::from_raw(value)
}

pub fn key(stream_type: &str, entity_id: &str) -> BrookKey {
    BrookKey::new(stream_type, entity_id).expect("valid brook key")
}

pub fn order_key() -> BrookKey {
    key("order", "abc-123")
}

/// Events with ids `{prefix}-0` .. `{prefix}-{n-1}`.
pub fn events(prefix: &str, n: usize) -> Vec<BrookEvent> {
    (0..n)
        .map(|i| {
            BrookEvent::new(
                format!("{prefix}-{i}"),
                "checkout",
                "OrderPlaced",
                format!("{prefix}-payload-{i}").into_bytes(),
            )
        })
        .collect()
}

pub fn range(key: &BrookKey, from: u64, to: u64) -> BrookRangeKey {
    BrookRangeKey::new(key.clone(), pos(from), pos(to)).expect("valid range")
}

pub async fn read_all(db: &BrookDb, key: &BrookKey, from: u64, to: u64) -> Vec<BrookEvent> {
    db.read_events(range(key, from, to))
        .map(|item| item.expect("read event"))
        .collect()
        .await
}

pub fn event_ids(events: &[BrookEvent]) -> Vec<String> {
    events.iter().map(|e| e.id.clone()).collect()
}
