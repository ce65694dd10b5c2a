//! # Appender
//!
//! The write path of a brook. One append is a fixed sequence under the
//! brook's writer lock:
//!
//! ```text
//! acquire lock
//!   ├─ 1. recover        repair any interrupted append, learn the tail
//!   ├─ 2. expected check caller's tail vs the real one
//!   ├─ 3. stage          create pending-head { tail, tail + n }
//!   ├─ 4. batch          events + head CAS, atomically
//!   └─ 5. finish         delete pending-head
//! release lock
//! ```
//!
//! A crash after step 3 leaves the pending marker for the next append's
//! recovery pass, which either finishes the commit (step 4 was durable) or
//! rolls the fragments back. Failures other than throttling propagate
//! without touching the marker for the same reason.
//!
//! Throttled batches are retried here with backoff, renewing the writer
//! lease across waits so a long throttle spell cannot silently lose
//! exclusivity.

use std::time::Duration;

use log::debug;

use crate::error::{Error, Result};
use crate::lock::{DistributedLock, LockManager};
use crate::recovery::BrookRecovery;
use crate::repository::BrookRepository;
use crate::retry::RetryPolicy;
use crate::types::{BrookEvent, BrookKey, BrookPosition};

/// Backoff for throttled transactional batches. Store hints override the
/// computed delay when present.
fn batch_retry_policy() -> RetryPolicy {
    RetryPolicy::exponential(4, Duration::from_millis(100)).with_max_delay(Duration::from_secs(2))
}

/// Serialized writer for brook tails.
#[derive(Clone)]
pub struct BrookAppender {
    repository: BrookRepository,
    recovery: BrookRecovery,
    locks: LockManager,
    batch_retry: RetryPolicy,
}

impl BrookAppender {
    pub fn new(repository: BrookRepository, recovery: BrookRecovery, locks: LockManager) -> Self {
        Self {
            repository,
            recovery,
            locks,
            batch_retry: batch_retry_policy(),
        }
    }

    /// Appends `events` to the tail of `key`'s brook, returning the new
    /// head position.
    ///
    /// With `expected` set, the append commits only if the brook's true
    /// tail (after recovery) equals it; a mismatch is [`Error::Conflict`]
    /// carrying the actual tail so the caller can reload and retry. With
    /// `expected` unset the append lands at whatever the tail is.
    pub async fn append_events(
        &self,
        key: &BrookKey,
        events: &[BrookEvent],
        expected: Option<BrookPosition>,
    ) -> Result<BrookPosition> {
        if events.is_empty() {
            return Err(Error::EmptyAppend);
        }
        let max = self.repository.config().max_events_per_append;
        if events.len() > max {
            return Err(Error::BatchTooLarge {
                count: events.len(),
                max,
            });
        }

        let mut lock = self.locks.acquire(key).await?;
        let result = self.append_under_lock(key, events, expected, &mut lock).await;
        lock.release().await;
        result
    }

    async fn append_under_lock(
        &self,
        key: &BrookKey,
        events: &[BrookEvent],
        expected: Option<BrookPosition>,
        lock: &mut DistributedLock,
    ) -> Result<BrookPosition> {
        let tail = self.recovery.get_or_recover_position(key).await?;

        if let Some(expected) = expected {
            if expected != tail {
                return Err(Error::Conflict {
                    key: key.to_string(),
                    expected: expected.as_raw(),
                    actual: tail.as_raw(),
                });
            }
        }

        let target = tail.add(events.len() as u64);
        debug!(
            "appending {} events to '{key}': {tail} -> {target}",
            events.len()
        );

        self.repository.create_pending_head(key, tail, target).await?;
        lock.renew_if_needed().await?;

        let mut retry = self.batch_retry.handle();
        loop {
            match self
                .repository
                .execute_transactional_batch(key, events, tail, target)
                .await
            {
                Ok(()) => break,
                Err(Error::Throttled { retry_after }) => {
                    let hint = retry_after.map(Duration::from_millis);
                    match retry.next_delay_with_hint(hint) {
                        Some(delay) => {
                            debug!(
                                "batch for '{key}' throttled; retrying in {}ms",
                                delay.as_millis()
                            );
                            tokio::time::sleep(delay).await;
                            lock.renew_if_needed().await?;
                        }
                        // Budget spent. The pending marker stays behind for
                        // the next append's recovery pass.
                        None => return Err(Error::Throttled { retry_after }),
                    }
                }
                Err(e) => return Err(e),
            }
        }

        self.repository.delete_pending_head(key).await?;
        Ok(target)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrookStoreConfig;
    use crate::metrics::LockMetrics;
    use crate::store::memory::MemoryStore;
    use std::sync::Arc;

    fn pos(value: u64) -> BrookPosition {
        BrookPosition::from_raw(value)
    }

    fn test_key() -> BrookKey {
        BrookKey::new("order", "abc-123").unwrap()
    }

    fn test_events(n: usize) -> Vec<BrookEvent> {
        (0..n)
            .map(|i| BrookEvent::new(format!("evt-{i}"), "checkout", "OrderPlaced", vec![i as u8]))
            .collect()
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        repository: BrookRepository,
        appender: BrookAppender,
        metrics: Arc<LockMetrics>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let config = BrookStoreConfig::default();
        let metrics = Arc::new(LockMetrics::new());
        let repository = BrookRepository::new(store.clone(), config.clone());
        let recovery = BrookRecovery::new(repository.clone());
        let locks = LockManager::new(store.clone(), config, metrics.clone());
        let appender = BrookAppender::new(repository.clone(), recovery, locks);
        Fixture {
            store,
            repository,
            appender,
            metrics,
        }
    }

    #[tokio::test]
    async fn test_first_append_lands_at_zero() {
        let f = fixture();
        let key = test_key();

        let head = f
            .appender
            .append_events(&key, &test_events(3), Some(pos(0)))
            .await
            .unwrap();
        assert_eq!(head, pos(3));
        assert_eq!(f.repository.head_position(&key).await.unwrap(), pos(3));

        // No staging leftovers, no held lease.
        assert!(f
            .repository
            .get_pending_head_document(&key)
            .await
            .unwrap()
            .is_none());
        assert!(!f.store.lease_is_held("brook-locks/order|abc-123"));
    }

    #[tokio::test]
    async fn test_appends_chain_without_expectation() {
        let f = fixture();
        let key = test_key();

        assert_eq!(
            f.appender.append_events(&key, &test_events(2), None).await.unwrap(),
            pos(2)
        );
        assert_eq!(
            f.appender.append_events(&key, &test_events(2), None).await.unwrap(),
            pos(4)
        );
        assert_eq!(f.repository.head_position(&key).await.unwrap(), pos(4));
    }

    #[tokio::test]
    async fn test_stale_expectation_conflicts_and_releases_lock() {
        let f = fixture();
        let key = test_key();

        f.appender
            .append_events(&key, &test_events(2), Some(pos(0)))
            .await
            .unwrap();

        let err = f
            .appender
            .append_events(&key, &test_events(1), Some(pos(0)))
            .await
            .unwrap_err();
        match err {
            Error::Conflict { expected, actual, .. } => {
                assert_eq!(expected, 0);
                assert_eq!(actual, 2);
            }
            other => panic!("expected conflict, got {other}"),
        }
        assert!(!f.store.lease_is_held("brook-locks/order|abc-123"));
    }

    #[tokio::test]
    async fn test_rejects_empty_batch_before_locking() {
        let f = fixture();
        let err = f
            .appender
            .append_events(&test_key(), &[], Some(pos(0)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmptyAppend));
        assert_eq!(f.metrics.attempts("brook-locks/order"), 0);
    }

    #[tokio::test]
    async fn test_rejects_oversized_batch() {
        let f = fixture();
        let err = f
            .appender
            .append_events(&test_key(), &test_events(100), None)
            .await
            .unwrap_err();
        match err {
            Error::BatchTooLarge { count, max } => {
                assert_eq!(count, 100);
                assert_eq!(max, 99);
            }
            other => panic!("expected BatchTooLarge, got {other}"),
        }
        assert_eq!(f.metrics.attempts("brook-locks/order"), 0);
    }

    #[tokio::test]
    async fn test_recovers_rollback_then_appends() {
        let f = fixture();
        let key = test_key();

        // A previous writer died after landing one of its three events.
        f.repository
            .create_pending_head(&key, pos(0), pos(3))
            .await
            .unwrap();
        f.repository
            .append_event_batch(&key, &test_events(3)[..1], pos(0))
            .await
            .unwrap();

        // The fragments roll back, so the tail is still 0 and the append
        // with expected 0 goes through.
        let events = vec![
            BrookEvent::new("fresh-0", "checkout", "OrderPlaced", b"a".to_vec()),
            BrookEvent::new("fresh-1", "checkout", "OrderPlaced", b"b".to_vec()),
        ];
        let head = f
            .appender
            .append_events(&key, &events, Some(pos(0)))
            .await
            .unwrap();
        assert_eq!(head, pos(2));

        let positions = f
            .repository
            .get_existing_event_positions(&key, pos(0), pos(10))
            .await
            .unwrap();
        assert_eq!(positions.len(), 2);
    }

    #[tokio::test]
    async fn test_recovered_commit_turns_stale_expectation_into_conflict() {
        let f = fixture();
        let key = test_key();

        // A previous writer died with every event durable but the head
        // commit missing. Recovery finishes it, moving the tail to 3.
        f.repository
            .create_pending_head(&key, pos(0), pos(3))
            .await
            .unwrap();
        f.repository
            .append_event_batch(&key, &test_events(3), pos(0))
            .await
            .unwrap();

        let err = f
            .appender
            .append_events(&key, &test_events(1), Some(pos(0)))
            .await
            .unwrap_err();
        match err {
            Error::Conflict { expected, actual, .. } => {
                assert_eq!(expected, 0);
                assert_eq!(actual, 3);
            }
            other => panic!("expected conflict, got {other}"),
        }
        assert_eq!(f.repository.head_position(&key).await.unwrap(), pos(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rides_out_throttled_batches() {
        let f = fixture();
        let key = test_key();
        f.store
            .throttle_next_batches(2, Some(Duration::from_millis(10)));

        let head = f
            .appender
            .append_events(&key, &test_events(2), Some(pos(0)))
            .await
            .unwrap();
        assert_eq!(head, pos(2));
        assert!(f
            .repository
            .get_pending_head_document(&key)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_budget_spent_leaves_marker_for_recovery() {
        let f = fixture();
        let key = test_key();
        // Exactly as many throttles as the appender has batch attempts.
        f.store.throttle_next_batches(4, None);

        let err = f
            .appender
            .append_events(&key, &test_events(1), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Throttled { .. }));

        // The marker survives the failure; the next append recovers through
        // it (nothing landed, so it just clears) and commits normally.
        assert!(f
            .repository
            .get_pending_head_document(&key)
            .await
            .unwrap()
            .is_some());

        let head = f
            .appender
            .append_events(&key, &test_events(1), None)
            .await
            .unwrap();
        assert_eq!(head, pos(1));
    }
}
