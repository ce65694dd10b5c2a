//! # Backing Store Abstractions
//!
//! BrookDB talks to its backing services through two narrow seams:
//!
//! - [`DocumentStore`]: per-item conditional reads/writes, one atomic
//!   multi-item batch scoped to a single partition, and paged range queries
//! - [`LeaseStore`]: acquire/renew/release of a time-bounded exclusive claim
//!   on a named object
//!
//! Everything above these traits (concurrency control, recovery, the lock
//! retry/backoff/metrics policy) is backend-agnostic. Everything below them
//! is an adapter.
//!
//! Implementations:
//! - [`MemoryStore`](memory::MemoryStore): in-process, with fault injection
//!   hooks for tests
//! - [`SqliteStore`](sqlite::SqliteStore): embedded single-node backend
//!
//! ## Conditional Writes
//!
//! Every stored document carries an opaque [`Etag`] that changes on each
//! write. Replaces are conditional on the etag observed at read time; creates
//! are conditional on absence. The atomic batch applies all operations or
//! none, and reports which operation broke a precondition.
//!
//! ## Throttling
//!
//! A store that sheds load fails the call with [`Error::Throttled`] carrying
//! an optional retry-after hint in milliseconds. Write paths above the seam
//! retry with backoff; the error only escapes when the budget is spent.
//!
//! [`Error::Throttled`]: crate::error::Error::Throttled

pub mod memory;
pub mod sqlite;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

// =============================================================================
// Documents
// =============================================================================

/// Opaque version stamp of a stored document. Changes on every write.
pub type Etag = u64;

/// A document as returned by reads and range queries.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    /// Id of the document within its partition.
    pub id: String,
    /// Version stamp to use for conditional replaces.
    pub etag: Etag,
    /// JSON body.
    pub body: Value,
}

/// One page of a range query, plus the token to fetch the next page.
///
/// A `None` continuation means the range is exhausted. The token is opaque
/// to callers; they feed it back unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPage {
    pub documents: Vec<StoredDocument>,
    pub continuation: Option<String>,
}

// =============================================================================
// Batch Operations
// =============================================================================

/// One operation inside an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOperation {
    /// Insert a document that must not exist yet.
    Create { id: String, body: Value },
    /// Overwrite a document, conditional on its current etag.
    Replace { id: String, body: Value, if_etag: Etag },
}

impl BatchOperation {
    pub fn id(&self) -> &str {
        match self {
            BatchOperation::Create { id, .. } => id,
            BatchOperation::Replace { id, .. } => id,
        }
    }
}

/// Result of an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    /// Every operation applied.
    Applied,
    /// A precondition failed; nothing was applied. `op_index` points at the
    /// first operation the store rejected.
    Conflict { op_index: usize },
    /// The store shed load; nothing was applied. Retry after the hint.
    Throttled { retry_after: Option<Duration> },
}

// =============================================================================
// Single-Item Outcomes
// =============================================================================

/// Result of a conditional create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    /// The document was inserted; here is its first etag.
    Created(Etag),
    /// A document with that id already exists. Nothing was written.
    AlreadyExists,
}

/// Result of a delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// No such document. Deletes are idempotent, so callers usually treat
    /// this the same as `Deleted`.
    NotFound,
}

// =============================================================================
// Document Store Seam
// =============================================================================

/// Minimal contract BrookDB needs from a document store.
///
/// All operations are scoped to a `partition`; the atomic batch is only
/// atomic within one partition, which is why a brook's documents all share
/// the brook key as their partition.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Point-read one document. `Ok(None)` when it does not exist.
    async fn read(&self, partition: &str, id: &str) -> Result<Option<StoredDocument>>;

    /// Insert a document that must not exist yet.
    async fn create(&self, partition: &str, id: &str, body: Value) -> Result<CreateOutcome>;

    /// Insert or overwrite unconditionally, returning the new etag.
    async fn upsert(&self, partition: &str, id: &str, body: Value) -> Result<Etag>;

    /// Delete one document.
    async fn delete(&self, partition: &str, id: &str) -> Result<DeleteOutcome>;

    /// Apply all operations atomically, or none of them.
    async fn execute_batch(&self, partition: &str, ops: Vec<BatchOperation>)
        -> Result<BatchOutcome>;

    /// One page of documents with `from_id <= id < to_id`, ordered by id
    /// bytewise ascending. A continuation token from a previous page resumes
    /// strictly after the last document of that page.
    async fn query_page(
        &self,
        partition: &str,
        from_id: &str,
        to_id: &str,
        continuation: Option<String>,
        page_size: usize,
    ) -> Result<QueryPage>;

    /// Short backend name for diagnostics, e.g. `"memory"` or `"sqlite"`.
    fn format(&self) -> &'static str;
}

// =============================================================================
// Lease Store Seam
// =============================================================================

/// Result of a lease acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The lease is ours; `lease_id` proves it on renew/release.
    Acquired { lease_id: String },
    /// Someone else holds an unexpired lease.
    Held,
}

/// Result of a lease renewal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewOutcome {
    Renewed,
    /// The lease is no longer ours: expired and re-acquired, released, or
    /// the lock object itself is gone. Either way exclusivity is over.
    Lost,
}

/// Result of a lease release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// We did not hold the lease anymore. Harmless on the release path.
    NotHeld,
}

/// Lease primitive behind the distributed lock.
///
/// The retry/backoff/jitter policy and all metrics live in the lock manager
/// above this trait; adapters only translate the four verbs. That keeps a
/// cloud blob lease, a database row, or a consensus service interchangeable.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Create the named lock object if it does not exist. Idempotent.
    async fn ensure_object(&self, name: &str) -> Result<()>;

    /// Try to take the lease for `duration`.
    async fn acquire(&self, name: &str, duration: Duration) -> Result<AcquireOutcome>;

    /// Extend a held lease by `duration` from now.
    async fn renew(&self, name: &str, lease_id: &str, duration: Duration)
        -> Result<RenewOutcome>;

    /// Give the lease up early.
    async fn release(&self, name: &str, lease_id: &str) -> Result<ReleaseOutcome>;
}
