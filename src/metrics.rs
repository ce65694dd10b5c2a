//! Prometheus metrics for the distributed lock subsystem.
//!
//! Labels carry the lock scope (`namespace/stream_type`), never the entity
//! id, which keeps label cardinality bounded no matter how many brooks
//! exist.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, linear_buckets, Histogram};
use prometheus_client::registry::Registry;

use std::time::Duration;

/// Labels for lock metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct LockScope {
    /// `namespace/stream_type`, e.g. `"brook-locks/order"`.
    pub scope: String,
}

/// Container for all lock metrics.
pub struct LockMetrics {
    registry: Registry,

    /// Lease acquisition attempts, including retries.
    lock_acquire_attempts_total: Family<LockScope, Counter>,

    /// Acquisitions abandoned with the retry budget spent.
    lock_acquire_failures_total: Family<LockScope, Counter>,

    /// Acquisition attempts that found the lease held elsewhere.
    lock_contention_waits_total: Family<LockScope, Counter>,

    /// Wall time from first attempt to successful acquisition.
    lock_acquire_wait_seconds: Family<LockScope, Histogram>,

    /// Retries needed per successful acquisition (0 = first try).
    lock_acquire_retries: Family<LockScope, Histogram>,

    /// How long locks were held, acquisition to disposal.
    lock_held_seconds: Family<LockScope, Histogram>,
}

impl Default for LockMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl LockMetrics {
    /// Create a new metrics registry with all metrics registered.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let lock_acquire_attempts_total = Family::<LockScope, Counter>::default();
        registry.register(
            "brookdb_lock_acquire_attempts_total",
            "Total lease acquisition attempts, including retries",
            lock_acquire_attempts_total.clone(),
        );

        let lock_acquire_failures_total = Family::<LockScope, Counter>::default();
        registry.register(
            "brookdb_lock_acquire_failures_total",
            "Acquisitions abandoned after exhausting the retry budget",
            lock_acquire_failures_total.clone(),
        );

        let lock_contention_waits_total = Family::<LockScope, Counter>::default();
        registry.register(
            "brookdb_lock_contention_waits_total",
            "Acquisition attempts that found the lease already held elsewhere",
            lock_contention_waits_total.clone(),
        );

        let lock_acquire_wait_seconds = Family::<LockScope, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(0.01, 2.0, 12))
        });
        registry.register(
            "brookdb_lock_acquire_wait_seconds",
            "Wall time from first attempt to successful acquisition",
            lock_acquire_wait_seconds.clone(),
        );

        let lock_acquire_retries = Family::<LockScope, Histogram>::new_with_constructor(|| {
            Histogram::new(linear_buckets(0.0, 1.0, 6))
        });
        registry.register(
            "brookdb_lock_acquire_retries",
            "Retries needed per successful acquisition",
            lock_acquire_retries.clone(),
        );

        let lock_held_seconds = Family::<LockScope, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(0.01, 2.0, 14))
        });
        registry.register(
            "brookdb_lock_held_seconds",
            "How long locks were held, acquisition to disposal",
            lock_held_seconds.clone(),
        );

        Self {
            registry,
            lock_acquire_attempts_total,
            lock_acquire_failures_total,
            lock_contention_waits_total,
            lock_acquire_wait_seconds,
            lock_acquire_retries,
            lock_held_seconds,
        }
    }

    fn labels(scope: &str) -> LockScope {
        LockScope {
            scope: scope.to_string(),
        }
    }

    pub fn record_attempt(&self, scope: &str) {
        self.lock_acquire_attempts_total
            .get_or_create(&Self::labels(scope))
            .inc();
    }

    pub fn record_contention_wait(&self, scope: &str) {
        self.lock_contention_waits_total
            .get_or_create(&Self::labels(scope))
            .inc();
    }

    pub fn record_failure(&self, scope: &str) {
        self.lock_acquire_failures_total
            .get_or_create(&Self::labels(scope))
            .inc();
    }

    pub fn record_acquired(&self, scope: &str, waited: Duration, retries: usize) {
        self.lock_acquire_wait_seconds
            .get_or_create(&Self::labels(scope))
            .observe(waited.as_secs_f64());
        self.lock_acquire_retries
            .get_or_create(&Self::labels(scope))
            .observe(retries as f64);
    }

    pub fn record_held(&self, scope: &str, held: Duration) {
        self.lock_held_seconds
            .get_or_create(&Self::labels(scope))
            .observe(held.as_secs_f64());
    }

    // =========================================================================
    // Counter reads (assertions and dashboards-in-tests)
    // =========================================================================

    pub fn attempts(&self, scope: &str) -> u64 {
        self.lock_acquire_attempts_total
            .get_or_create(&Self::labels(scope))
            .get()
    }

    pub fn contention_waits(&self, scope: &str) -> u64 {
        self.lock_contention_waits_total
            .get_or_create(&Self::labels(scope))
            .get()
    }

    pub fn failures(&self, scope: &str) -> u64 {
        self.lock_acquire_failures_total
            .get_or_create(&Self::labels(scope))
            .get()
    }

    /// Encode all metrics to Prometheus text format.
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.registry)
            .expect("encoding metrics should not fail");
        buffer
    }
}
