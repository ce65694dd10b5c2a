//! # BrookDB - Event Brook Engine
//!
//! BrookDB persists per-entity event streams ("brooks") on top of a
//! partitioned document store. It provides:
//!
//! - **Event sourcing primitives**: typed keys, dense positions, ordered reads
//! - **Optimistic concurrency**: appends conditional on the expected tail
//! - **Crash safety**: interrupted appends are repaired deterministically
//! - **Writer exclusivity**: lease-based locks with contention metrics
//! - **Pluggable backends**: in-memory and SQLite out of the box
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       BrookDb (facade)                          │
//! │                (append, read, cursor, metrics)                  │
//! └───────────────┬───────────────────────────────┬─────────────────┘
//!                 │ writes                        │ reads
//!                 ▼                               ▼
//! ┌───────────────────────────────┐  ┌───────────────────────────────┐
//! │          Appender             │  │           Reader              │
//! │  lock → recover → stage →     │  │  clamp range to head →        │
//! │  batch commit → unstage       │  │  stream pages lazily          │
//! └──────┬──────────────┬─────────┘  └──────────────┬────────────────┘
//!        │              │                           │
//!        ▼              ▼                           ▼
//! ┌─────────────┐  ┌─────────────────────────────────────────────────┐
//! │ LockManager │  │                 Repository                      │
//! │ (LeaseStore)│  │    head / pending-head / event documents        │
//! └─────────────┘  └───────────────────────┬─────────────────────────┘
//!                                          ▼
//!                          ┌─────────────────────────────┐
//!                          │        DocumentStore        │
//!                          │      (memory, SQLite)       │
//!                          └─────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! These hold across crashes and are enforced throughout the codebase:
//!
//! 1. **Dense positions**: events of a brook occupy 0, 1, 2, ... without gaps
//! 2. **Head is the count**: the committed head equals the number of
//!    committed events and never decreases
//! 3. **One writer**: at most one append per brook is in flight at a time
//! 4. **Committed reads**: readers serve only positions below the head
//! 5. **Convergent repair**: an interrupted append is either completed or
//!    fully rolled back, and repair is idempotent
//!
//! ## Module Organization
//!
//! - [`types`]: Domain types (BrookKey, BrookPosition, BrookEvent, ranges)
//! - [`error`]: Single error enum for every failure mode
//! - [`config`]: Store configuration and derived timings
//! - [`store`]: DocumentStore / LeaseStore seams and their backends
//! - [`repository`]: Typed document operations and the atomic append batch
//! - [`recovery`]: Pending-head reconciliation after crashes
//! - [`lock`]: Lease-backed writer locks with backoff and metrics
//! - [`appender`]: The serialized write path
//! - [`reader`]: Committed-only streaming reads
//! - [`provider`]: The [`BrookDb`] facade wiring it all together

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for brook operations.
///
/// A single enum covers validation, concurrency, locking, and backend
/// failures, so callers match on one type.
pub mod error;

/// Domain types for event brooks.
///
/// Keys, positions, events, and ranges, all newtypes with validation at
/// construction.
pub mod types;

/// Store configuration: ids, batch ceilings, lease timings.
pub mod config;

/// Retry policies with bounded backoff and jitter.
pub mod retry;

/// Storage seams and backends.
///
/// [`store::DocumentStore`] is the partitioned document contract,
/// [`store::LeaseStore`] the lock-object contract. Ships an in-memory
/// backend and a SQLite backend.
pub mod store;

/// Typed operations over a brook's documents.
///
/// The document model (head, pending-head, events), conditional writes,
/// the atomic event-batch-plus-head-commit primitive, and paged queries.
pub mod repository;

/// Crash recovery for interrupted appends.
///
/// Turns a pending-head marker plus the observed event documents into a
/// deterministic repair plan, and applies it.
pub mod recovery;

/// Lease-based writer locks.
///
/// Bounded, jittered backoff on contention; renewal while held; Prometheus
/// metrics for attempts, waits, failures, and hold times.
pub mod lock;

/// The write path: lock, recover, check, stage, commit.
pub mod appender;

/// The read path: lazy ordered streams over committed events.
pub mod reader;

/// Writer-lock metrics in a Prometheus registry.
pub mod metrics;

/// The assembled store facade.
///
/// The main entry point is [`BrookDb`](provider::BrookDb).
pub mod provider;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{Error, Result};
pub use provider::BrookDb;

pub use config::BrookStoreConfig;
pub use types::{BrookEvent, BrookKey, BrookPosition, BrookRangeKey};

pub use metrics::LockMetrics;
pub use store::{DocumentStore, LeaseStore};
