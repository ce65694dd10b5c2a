//! # Engine Configuration
//!
//! Tunables for the brook store: container addressing, batch ceilings, page
//! sizes, and the lease timing that drives the writer lock.
//!
//! Defaults are chosen for the stores we target. The batch ceiling mirrors
//! the 100-operation atomic-batch limit common to partitioned document
//! stores, and the request-size ceiling mirrors their 2 MiB request cap.

use std::time::Duration;

/// Default number of documents fetched per query page.
pub const DEFAULT_QUERY_PAGE_SIZE: usize = 128;

/// Default ceiling on events per append batch.
///
/// One event document plus the head write must fit in a single atomic batch,
/// and the stores we target cap batches at 100 operations.
pub const DEFAULT_MAX_EVENTS_PER_APPEND: usize = 99;

/// Default lease duration for the per-brook writer lock.
pub const DEFAULT_LEASE_DURATION_SECS: u64 = 60;

/// Default threshold subtracted from the lease duration when computing the
/// renewal margin. See [`BrookStoreConfig::renewal_margin`].
pub const DEFAULT_LEASE_RENEWAL_THRESHOLD_SECS: u64 = 20;

/// Default request-size ceiling, in bytes.
pub const DEFAULT_MAX_REQUEST_SIZE_BYTES: usize = 2 * 1024 * 1024;

/// Configuration for a brook store.
///
/// # Example
///
/// ```rust
/// use brookdb::config::BrookStoreConfig;
///
/// let config = BrookStoreConfig {
///     database_id: "orders-db".to_string(),
///     ..Default::default()
/// };
/// assert_eq!(config.query_page_size, 128);
/// ```
#[derive(Debug, Clone)]
pub struct BrookStoreConfig {
    /// Logical database holding the brook containers.
    pub database_id: String,

    /// Container (table) holding head, pending-head, and event documents.
    pub container_id: String,

    /// Namespace prefixed to every writer-lock name, so several stores can
    /// share one lease backend without colliding.
    pub lock_namespace: String,

    /// Documents per page when scanning event ranges.
    pub query_page_size: usize,

    /// Ceiling on events in one append batch.
    pub max_events_per_append: usize,

    /// How long an acquired writer lease lasts before it expires on its own.
    pub lease_duration: Duration,

    /// How far before expiry a renewal should land.
    pub lease_renewal_threshold: Duration,

    /// Request-size ceiling of the backing store. The engine does not enforce
    /// it; embedding callers use it to pre-size batches before appending.
    pub max_request_size_bytes: usize,
}

impl Default for BrookStoreConfig {
    fn default() -> Self {
        Self {
            database_id: "brookdb".to_string(),
            container_id: "brooks".to_string(),
            lock_namespace: "brook-locks".to_string(),
            query_page_size: DEFAULT_QUERY_PAGE_SIZE,
            max_events_per_append: DEFAULT_MAX_EVENTS_PER_APPEND,
            lease_duration: Duration::from_secs(DEFAULT_LEASE_DURATION_SECS),
            lease_renewal_threshold: Duration::from_secs(DEFAULT_LEASE_RENEWAL_THRESHOLD_SECS),
            max_request_size_bytes: DEFAULT_MAX_REQUEST_SIZE_BYTES,
        }
    }
}

impl BrookStoreConfig {
    /// Elapsed hold time after which the next renewal check actually renews.
    ///
    /// The margin is `max(1, lease_duration - renewal_threshold - 1)` whole
    /// seconds. Renewing earlier would be wasted round trips on every check;
    /// renewing later risks the lease expiring while a slow store call is in
    /// flight. The threshold leaves that headroom, and the extra second
    /// absorbs clock truncation on stores that count lease TTLs in whole
    /// seconds.
    ///
    /// Degenerate configurations (threshold >= duration) clamp to one second
    /// rather than disabling renewal.
    pub fn renewal_margin(&self) -> Duration {
        let margin = self
            .lease_duration
            .as_secs()
            .saturating_sub(self.lease_renewal_threshold.as_secs())
            .saturating_sub(1)
            .max(1);
        Duration::from_secs(margin)
    }
}
