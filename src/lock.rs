//! # Writer Lock
//!
//! One writer per brook, enforced with a renewable lease.
//!
//! The appender holds the lock for the whole recover-stage-commit sequence,
//! so the optimistic head check inside the batch is a backstop rather than
//! the primary guard. Acquisition retries through contention with bounded
//! exponential backoff and jitter:
//!
//! ```text
//! acquire ──► try lease ──► acquired ──────────────► DistributedLock
//!                │
//!                └─ held ──► backoff budget left?
//!                               │ yes: sleep 100ms·2ⁿ (cap 2s) + jitter, retry
//!                               │ no:  LockUnavailable
//! ```
//!
//! Every attempt, contention wait, failure, acquisition wait, and hold
//! duration lands in [`LockMetrics`], labeled by namespace and stream type
//! so one hot stream type is visible without per-entity label cardinality.
//!
//! Holding is time-boxed: the lease expires on its own if the process dies.
//! Long appends call [`DistributedLock::renew_if_needed`] between store
//! round trips; a renewal that comes back [`RenewOutcome::Lost`] aborts the
//! append, because continuing without exclusivity could interleave two
//! writers' batches.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::time::Instant;

use crate::config::BrookStoreConfig;
use crate::error::{Error, Result};
use crate::metrics::LockMetrics;
use crate::retry::RetryPolicy;
use crate::store::{AcquireOutcome, LeaseStore, RenewOutcome};
use crate::types::BrookKey;

// =============================================================================
// Manager
// =============================================================================

/// Backoff for contended acquisition: 100ms, 200ms, 400ms, 800ms, capped at
/// 2s, each plus up to 100ms of jitter so stampeding writers spread out.
fn acquire_policy() -> RetryPolicy {
    RetryPolicy::exponential(5, Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(2))
        .with_jitter(Duration::from_millis(100))
}

/// Hands out per-brook writer locks backed by a [`LeaseStore`].
#[derive(Clone)]
pub struct LockManager {
    leases: Arc<dyn LeaseStore>,
    config: BrookStoreConfig,
    metrics: Arc<LockMetrics>,
    policy: RetryPolicy,
}

impl LockManager {
    pub fn new(
        leases: Arc<dyn LeaseStore>,
        config: BrookStoreConfig,
        metrics: Arc<LockMetrics>,
    ) -> Self {
        Self {
            leases,
            config,
            metrics,
            policy: acquire_policy(),
        }
    }

    /// Full lock-object name: one per brook, namespaced per store.
    fn lock_name(&self, key: &BrookKey) -> String {
        format!("{}/{key}", self.config.lock_namespace)
    }

    /// Metric label: per stream type, not per entity.
    fn metric_scope(&self, key: &BrookKey) -> String {
        format!("{}/{}", self.config.lock_namespace, key.stream_type())
    }

    /// Takes the writer lock for `key`, waiting out contention.
    ///
    /// Tries up to five times. Gives up with [`Error::LockUnavailable`] once
    /// the backoff budget is spent; the brook is then presumed busy and the
    /// caller decides whether to come back.
    ///
    /// The contention-wait counter counts attempts that found the lease
    /// held, including the final one when no backoff budget remains.
    pub async fn acquire(&self, key: &BrookKey) -> Result<DistributedLock> {
        let name = self.lock_name(key);
        let scope = self.metric_scope(key);

        self.leases.ensure_object(&name).await?;

        let started = Instant::now();
        let mut retry = self.policy.handle();
        loop {
            self.metrics.record_attempt(&scope);
            match self.leases.acquire(&name, self.config.lease_duration).await? {
                AcquireOutcome::Acquired { lease_id } => {
                    let retries = retry.attempts();
                    self.metrics.record_acquired(&scope, started.elapsed(), retries);
                    debug!("acquired lock '{name}' (retries: {retries})");
                    let now = Instant::now();
                    return Ok(DistributedLock {
                        leases: Arc::clone(&self.leases),
                        metrics: Arc::clone(&self.metrics),
                        name,
                        scope,
                        key: key.to_string(),
                        lease_id,
                        duration: self.config.lease_duration,
                        renewal_margin: self.config.renewal_margin(),
                        acquired_at: now,
                        last_renewal: now,
                        released: false,
                    });
                }
                AcquireOutcome::Held => {
                    self.metrics.record_contention_wait(&scope);
                    match retry.next_delay() {
                        Some(delay) => {
                            debug!(
                                "lock '{name}' held elsewhere; retrying in {}ms",
                                delay.as_millis()
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            self.metrics.record_failure(&scope);
                            return Err(Error::LockUnavailable {
                                key: key.to_string(),
                                attempts: self.policy.max_attempts() as u32,
                            });
                        }
                    }
                }
            }
        }
    }
}

// =============================================================================
// Held Lock
// =============================================================================

/// An acquired writer lock.
///
/// Dropping it without [`DistributedLock::release`] records the hold and
/// fires a best-effort release in the background, so an error path that
/// bubbles out with `?` does not leave the brook locked for the full lease
/// duration.
pub struct DistributedLock {
    leases: Arc<dyn LeaseStore>,
    metrics: Arc<LockMetrics>,
    name: String,
    scope: String,
    key: String,
    lease_id: String,
    duration: Duration,
    renewal_margin: Duration,
    acquired_at: Instant,
    last_renewal: Instant,
    released: bool,
}

impl DistributedLock {
    pub fn lease_id(&self) -> &str {
        &self.lease_id
    }

    /// Renews the lease once enough of it has elapsed, otherwise does
    /// nothing. Cheap to call between every store round trip.
    ///
    /// [`Error::LeaseLost`] here is fatal to the operation in progress:
    /// another writer may already own the brook.
    pub async fn renew_if_needed(&mut self) -> Result<()> {
        if self.last_renewal.elapsed() < self.renewal_margin {
            return Ok(());
        }
        match self
            .leases
            .renew(&self.name, &self.lease_id, self.duration)
            .await?
        {
            RenewOutcome::Renewed => {
                // The interval restarts when the renewal lands, not when it
                // was decided. A slow round trip must not shorten the next
                // interval.
                self.last_renewal = Instant::now();
                debug!("renewed lease on lock '{}'", self.name);
                Ok(())
            }
            RenewOutcome::Lost => Err(Error::LeaseLost {
                key: self.key.clone(),
            }),
        }
    }

    /// Gives the lock up. Release failures are logged and swallowed: the
    /// lease expires on its own, and the caller's result should reflect the
    /// work, not the cleanup.
    pub async fn release(mut self) {
        self.released = true;
        match self.leases.release(&self.name, &self.lease_id).await {
            Ok(_) => debug!("released lock '{}'", self.name),
            Err(e) => warn!("releasing lock '{}' failed: {e}", self.name),
        }
    }
}

impl Drop for DistributedLock {
    fn drop(&mut self) {
        // Runs on both paths (release() consumes self too), so the hold
        // duration is recorded exactly once.
        self.metrics.record_held(&self.scope, self.acquired_at.elapsed());
        if self.released {
            return;
        }
        let leases = Arc::clone(&self.leases);
        let name = std::mem::take(&mut self.name);
        let lease_id = std::mem::take(&mut self.lease_id);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = leases.release(&name, &lease_id).await {
                    warn!("best-effort release of dropped lock '{name}' failed: {e}");
                }
            });
        } else {
            warn!("lock '{name}' dropped outside a runtime; lease will expire on its own");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
