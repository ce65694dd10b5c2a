//! In-process backing store.
//!
//! Documents live in a `BTreeMap` so range queries come out in id order for
//! free. Leases use the tokio clock, which makes expiry testable under a
//! paused runtime. Tests can inject throttling to exercise the retry paths
//! above the store seam.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::Bound;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rand::{thread_rng, Rng};
use serde_json::Value;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::store::{
    AcquireOutcome, BatchOperation, BatchOutcome, CreateOutcome, DeleteOutcome, DocumentStore,
    Etag, LeaseStore, QueryPage, ReleaseOutcome, RenewOutcome, StoredDocument,
};

/// In-memory [`DocumentStore`] and [`LeaseStore`].
///
/// A single instance can be shared as both seams, which mirrors production
/// deployments where the document store and lease service live in the same
/// account. All state sits behind one mutex; nothing is held across awaits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    /// (partition, doc id) -> document. Tuple keys keep each partition's
    /// documents contiguous and id-ordered.
    documents: BTreeMap<(String, String), StoredDocument>,
    /// Lock objects by name. `holder` is `None` when the lease is free.
    leases: HashMap<String, LeaseSlot>,
    /// Scripted throttle responses, consumed front to back.
    throttled_creates: VecDeque<Option<Duration>>,
    throttled_batches: VecDeque<Option<Duration>>,
}

#[derive(Debug)]
struct LeaseSlot {
    holder: Option<(String, Instant)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Fault Injection (test support)
    // =========================================================================

    /// The next `count` creates fail throttled, each carrying `retry_after`
    /// as the store's hint.
    pub fn throttle_next_creates(&self, count: usize, retry_after: Option<Duration>) {
        let mut inner = self.inner.lock().unwrap();
        for _ in 0..count {
            inner.throttled_creates.push_back(retry_after);
        }
    }

    /// The next `count` atomic batches fail throttled.
    pub fn throttle_next_batches(&self, count: usize, retry_after: Option<Duration>) {
        let mut inner = self.inner.lock().unwrap();
        for _ in 0..count {
            inner.throttled_batches.push_back(retry_after);
        }
    }

    // =========================================================================
    // Introspection (test support)
    // =========================================================================

    /// True while some holder's lease on `name` is unexpired.
    pub fn lease_is_held(&self, name: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        match inner.leases.get(name).and_then(|slot| slot.holder.as_ref()) {
            Some((_, expires_at)) => Instant::now() < *expires_at,
            None => false,
        }
    }

    /// Number of documents stored under `partition`.
    pub fn partition_len(&self, partition: &str) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .documents
            .range(partition_bounds(partition))
            .count()
    }
}

fn partition_bounds(
    partition: &str,
) -> (
    Bound<(String, String)>,
    Bound<(String, String)>,
) {
    (
        Bound::Included((partition.to_string(), String::new())),
        // '\u{10FFFF}' sorts after every valid document id.
        Bound::Excluded((partition.to_string(), "\u{10FFFF}".to_string())),
    )
}

fn new_lease_id() -> String {
    format!("{:032x}", thread_rng().gen::<u128>())
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn read(&self, partition: &str, id: &str) -> Result<Option<StoredDocument>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .documents
            .get(&(partition.to_string(), id.to_string()))
            .cloned())
    }

    async fn create(&self, partition: &str, id: &str, body: Value) -> Result<CreateOutcome> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(retry_after) = inner.throttled_creates.pop_front() {
            return Err(Error::Throttled {
                retry_after: retry_after.map(|d| d.as_millis() as u64),
            });
        }
        let key = (partition.to_string(), id.to_string());
        if inner.documents.contains_key(&key) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        let etag: Etag = 1;
        inner.documents.insert(
            key,
            StoredDocument {
                id: id.to_string(),
                etag,
                body,
            },
        );
        Ok(CreateOutcome::Created(etag))
    }

    async fn upsert(&self, partition: &str, id: &str, body: Value) -> Result<Etag> {
        let mut inner = self.inner.lock().unwrap();
        let key = (partition.to_string(), id.to_string());
        let etag = inner.documents.get(&key).map(|doc| doc.etag + 1).unwrap_or(1);
        inner.documents.insert(
            key,
            StoredDocument {
                id: id.to_string(),
                etag,
                body,
            },
        );
        Ok(etag)
    }

    async fn delete(&self, partition: &str, id: &str) -> Result<DeleteOutcome> {
        let mut inner = self.inner.lock().unwrap();
        let key = (partition.to_string(), id.to_string());
        Ok(match inner.documents.remove(&key) {
            Some(_) => DeleteOutcome::Deleted,
            None => DeleteOutcome::NotFound,
        })
    }

    async fn execute_batch(
        &self,
        partition: &str,
        ops: Vec<BatchOperation>,
    ) -> Result<BatchOutcome> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(retry_after) = inner.throttled_batches.pop_front() {
            return Ok(BatchOutcome::Throttled { retry_after });
        }

        // Validate every precondition before touching anything, so a failed
        // batch leaves the partition untouched.
        for (op_index, op) in ops.iter().enumerate() {
            let key = (partition.to_string(), op.id().to_string());
            let existing = inner.documents.get(&key);
            let ok = match op {
                BatchOperation::Create { .. } => existing.is_none(),
                BatchOperation::Replace { if_etag, .. } => {
                    existing.map(|doc| doc.etag == *if_etag).unwrap_or(false)
                }
            };
            if !ok {
                return Ok(BatchOutcome::Conflict { op_index });
            }
        }

        for op in ops {
            let key = (partition.to_string(), op.id().to_string());
            match op {
                BatchOperation::Create { id, body } => {
                    inner.documents.insert(
                        key,
                        StoredDocument { id, etag: 1, body },
                    );
                }
                BatchOperation::Replace { id, body, if_etag } => {
                    inner.documents.insert(
                        key,
                        StoredDocument {
                            id,
                            etag: if_etag + 1,
                            body,
                        },
                    );
                }
            }
        }
        Ok(BatchOutcome::Applied)
    }

    async fn query_page(
        &self,
        partition: &str,
        from_id: &str,
        to_id: &str,
        continuation: Option<String>,
        page_size: usize,
    ) -> Result<QueryPage> {
        let inner = self.inner.lock().unwrap();
        let page_size = page_size.max(1);

        let lower = match continuation {
            // Resume strictly after the last document of the previous page.
            Some(last_id) => Bound::Excluded((partition.to_string(), last_id)),
            None => Bound::Included((partition.to_string(), from_id.to_string())),
        };
        let upper = Bound::Excluded((partition.to_string(), to_id.to_string()));

        let documents: Vec<StoredDocument> = inner
            .documents
            .range((lower, upper))
            .take(page_size)
            .map(|(_, doc)| doc.clone())
            .collect();

        let continuation = if documents.len() == page_size {
            documents.last().map(|doc| doc.id.clone())
        } else {
            None
        };
        Ok(QueryPage {
            documents,
            continuation,
        })
    }

    fn format(&self) -> &'static str {
        "memory"
    }
}

#[async_trait]
impl LeaseStore for MemoryStore {
    async fn ensure_object(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .leases
            .entry(name.to_string())
            .or_insert(LeaseSlot { holder: None });
        Ok(())
    }

    async fn acquire(&self, name: &str, duration: Duration) -> Result<AcquireOutcome> {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner.leases.get_mut(name).ok_or_else(|| {
            Error::Backend(format!("lock object '{name}' does not exist"))
        })?;

        let now = Instant::now();
        if let Some((_, expires_at)) = &slot.holder {
            if now < *expires_at {
                return Ok(AcquireOutcome::Held);
            }
        }
        let lease_id = new_lease_id();
        slot.holder = Some((lease_id.clone(), now + duration));
        Ok(AcquireOutcome::Acquired { lease_id })
    }

    async fn renew(
        &self,
        name: &str,
        lease_id: &str,
        duration: Duration,
    ) -> Result<RenewOutcome> {
        let mut inner = self.inner.lock().unwrap();
        // A vanished lock object means exclusivity is gone too.
        let Some(slot) = inner.leases.get_mut(name) else {
            return Ok(RenewOutcome::Lost);
        };
        match &mut slot.holder {
            // Renewal succeeds as long as nobody re-acquired in between,
            // even if the lease technically lapsed.
            Some((held_id, expires_at)) if held_id == lease_id => {
                *expires_at = Instant::now() + duration;
                Ok(RenewOutcome::Renewed)
            }
            _ => Ok(RenewOutcome::Lost),
        }
    }

    async fn release(&self, name: &str, lease_id: &str) -> Result<ReleaseOutcome> {
        let mut inner = self.inner.lock().unwrap();
        let Some(slot) = inner.leases.get_mut(name) else {
            return Ok(ReleaseOutcome::NotHeld);
        };
        match &slot.holder {
            Some((held_id, _)) if held_id == lease_id => {
                slot.holder = None;
                Ok(ReleaseOutcome::Released)
            }
            _ => Ok(ReleaseOutcome::NotHeld),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_create_then_read() {
        let store = MemoryStore::new();
        let outcome = store
            .create("p", "doc-1", json!({"value": 1}))
            .await
            .unwrap();
        assert_eq!(outcome, CreateOutcome::Created(1));

        let doc = store.read("p", "doc-1").await.unwrap().unwrap();
        assert_eq!(doc.id, "doc-1");
        assert_eq!(doc.etag, 1);
        assert_eq!(doc.body, json!({"value": 1}));

        // Same id again is a clean AlreadyExists, not an error.
        let again = store.create("p", "doc-1", json!({})).await.unwrap();
        assert_eq!(again, CreateOutcome::AlreadyExists);
    }

    #[tokio::test]
    async fn test_partitions_are_isolated() {
        let store = MemoryStore::new();
        store.create("p1", "doc", json!(1)).await.unwrap();
        assert!(store.read("p2", "doc").await.unwrap().is_none());
        assert_eq!(store.partition_len("p1"), 1);
        assert_eq!(store.partition_len("p2"), 0);
    }

    #[tokio::test]
    async fn test_upsert_bumps_etag() {
        let store = MemoryStore::new();
        assert_eq!(store.upsert("p", "doc", json!(1)).await.unwrap(), 1);
        assert_eq!(store.upsert("p", "doc", json!(2)).await.unwrap(), 2);
        let doc = store.read("p", "doc").await.unwrap().unwrap();
        assert_eq!(doc.body, json!(2));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = MemoryStore::new();
        store.create("p", "doc", json!(1)).await.unwrap();
        assert_eq!(store.delete("p", "doc").await.unwrap(), DeleteOutcome::Deleted);
        assert_eq!(store.delete("p", "doc").await.unwrap(), DeleteOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_batch_applies_all_or_nothing() {
        let store = MemoryStore::new();
        let etag = store.upsert("p", "a", json!("old")).await.unwrap();

        // Second op's precondition fails: "b" already exists.
        store.create("p", "b", json!("existing")).await.unwrap();
        let outcome = store
            .execute_batch(
                "p",
                vec![
                    BatchOperation::Replace {
                        id: "a".into(),
                        body: json!("new"),
                        if_etag: etag,
                    },
                    BatchOperation::Create {
                        id: "b".into(),
                        body: json!("clobber"),
                    },
                ],
            )
            .await
            .unwrap();
        assert_eq!(outcome, BatchOutcome::Conflict { op_index: 1 });

        // The replace of "a" must not have applied.
        let a = store.read("p", "a").await.unwrap().unwrap();
        assert_eq!(a.body, json!("old"));

        let outcome = store
            .execute_batch(
                "p",
                vec![
                    BatchOperation::Replace {
                        id: "a".into(),
                        body: json!("new"),
                        if_etag: etag,
                    },
                    BatchOperation::Create {
                        id: "c".into(),
                        body: json!("fresh"),
                    },
                ],
            )
            .await
            .unwrap();
        assert_eq!(outcome, BatchOutcome::Applied);
        assert_eq!(
            store.read("p", "a").await.unwrap().unwrap().body,
            json!("new")
        );
    }

    #[tokio::test]
    async fn test_batch_replace_detects_stale_etag() {
        let store = MemoryStore::new();
        let stale = store.upsert("p", "a", json!(1)).await.unwrap();
        store.upsert("p", "a", json!(2)).await.unwrap();

        let outcome = store
            .execute_batch(
                "p",
                vec![BatchOperation::Replace {
                    id: "a".into(),
                    body: json!(3),
                    if_etag: stale,
                }],
            )
            .await
            .unwrap();
        assert_eq!(outcome, BatchOutcome::Conflict { op_index: 0 });
    }

    #[tokio::test]
    async fn test_query_pages_in_id_order() {
        let store = MemoryStore::new();
        for i in [3u32, 1, 4, 0, 2] {
            store
                .create("p", &format!("doc-{i}"), json!(i))
                .await
                .unwrap();
        }

        let page = store
            .query_page("p", "doc-0", "doc-5", None, 2)
            .await
            .unwrap();
        assert_eq!(
            page.documents.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(),
            vec!["doc-0", "doc-1"]
        );
        let cont = page.continuation.expect("full page has continuation");

        let page = store
            .query_page("p", "doc-0", "doc-5", Some(cont), 2)
            .await
            .unwrap();
        assert_eq!(
            page.documents.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(),
            vec!["doc-2", "doc-3"]
        );

        let page = store
            .query_page("p", "doc-0", "doc-5", page.continuation, 2)
            .await
            .unwrap();
        assert_eq!(
            page.documents.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(),
            vec!["doc-4"]
        );
        assert!(page.continuation.is_none());
    }

    #[tokio::test]
    async fn test_query_respects_upper_bound() {
        let store = MemoryStore::new();
        for i in 0..4u32 {
            store
                .create("p", &format!("doc-{i}"), json!(i))
                .await
                .unwrap();
        }
        let page = store
            .query_page("p", "doc-1", "doc-3", None, 10)
            .await
            .unwrap();
        assert_eq!(
            page.documents.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(),
            vec!["doc-1", "doc-2"]
        );
    }

    #[tokio::test]
    async fn test_injected_throttle_on_create() {
        let store = MemoryStore::new();
        store.throttle_next_creates(1, Some(Duration::from_millis(25)));

        let err = store.create("p", "doc", json!(1)).await.unwrap_err();
        assert!(matches!(err, Error::Throttled { retry_after: Some(25) }));

        // The next create goes through.
        assert_eq!(
            store.create("p", "doc", json!(1)).await.unwrap(),
            CreateOutcome::Created(1)
        );
    }

    #[tokio::test]
    async fn test_injected_throttle_on_batch() {
        let store = MemoryStore::new();
        store.throttle_next_batches(1, None);
        let outcome = store
            .execute_batch(
                "p",
                vec![BatchOperation::Create {
                    id: "doc".into(),
                    body: json!(1),
                }],
            )
            .await
            .unwrap();
        assert_eq!(outcome, BatchOutcome::Throttled { retry_after: None });
        // Nothing applied.
        assert!(store.read("p", "doc").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_lifecycle() {
        let store = MemoryStore::new();
        let name = "locks/order|abc";
        store.ensure_object(name).await.unwrap();
        // ensure is idempotent.
        store.ensure_object(name).await.unwrap();

        let lease_id = match store.acquire(name, Duration::from_secs(60)).await.unwrap() {
            AcquireOutcome::Acquired { lease_id } => lease_id,
            other => panic!("expected acquisition, got {other:?}"),
        };
        assert!(store.lease_is_held(name));

        // Second acquirer is refused while the lease is live.
        assert_eq!(
            store.acquire(name, Duration::from_secs(60)).await.unwrap(),
            AcquireOutcome::Held
        );

        assert_eq!(
            store
                .renew(name, &lease_id, Duration::from_secs(60))
                .await
                .unwrap(),
            RenewOutcome::Renewed
        );

        assert_eq!(
            store.release(name, &lease_id).await.unwrap(),
            ReleaseOutcome::Released
        );
        assert!(!store.lease_is_held(name));

        // Double release reports NotHeld.
        assert_eq!(
            store.release(name, &lease_id).await.unwrap(),
            ReleaseOutcome::NotHeld
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expiry_frees_the_lock() {
        let store = MemoryStore::new();
        let name = "locks/order|abc";
        store.ensure_object(name).await.unwrap();

        let first = match store.acquire(name, Duration::from_secs(5)).await.unwrap() {
            AcquireOutcome::Acquired { lease_id } => lease_id,
            other => panic!("expected acquisition, got {other:?}"),
        };

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!store.lease_is_held(name));

        // Expired lease falls to the next acquirer.
        let second = match store.acquire(name, Duration::from_secs(5)).await.unwrap() {
            AcquireOutcome::Acquired { lease_id } => lease_id,
            other => panic!("expected acquisition, got {other:?}"),
        };
        assert_ne!(first, second);

        // The evicted holder's renewal reports the lease as lost.
        assert_eq!(
            store
                .renew(name, &first, Duration::from_secs(5))
                .await
                .unwrap(),
            RenewOutcome::Lost
        );
    }

    #[tokio::test]
    async fn test_acquire_without_object_is_an_error() {
        let store = MemoryStore::new();
        let err = store
            .acquire("locks/missing", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Backend(_)));
    }

    #[tokio::test]
    async fn test_renew_with_missing_object_is_lost() {
        let store = MemoryStore::new();
        assert_eq!(
            store
                .renew("locks/missing", "some-id", Duration::from_secs(5))
                .await
                .unwrap(),
            RenewOutcome::Lost
        );
    }
}
