//! # Error Handling for BrookDB
//!
//! This module defines the error types used throughout BrookDB. We use a single
//! error enum ([`Error`]) to represent all possible failure modes, which simplifies
//! error handling for library users.
//!
//! ## Why a Single Error Type?
//!
//! Most operations fail in similar ways (store errors, conflicts, lock
//! trouble), and callers typically branch on a handful of categories rather
//! than on per-module types. One enum keeps signatures short and matching
//! exhaustive.
//!
//! ## Error Categories
//!
//! | Category | Examples | Typical Response |
//! |----------|----------|------------------|
//! | Conflict | Head moved, pending append in flight | Reload state and retry |
//! | Contention | Lock unavailable after retries | Back off, retry later |
//! | Transient | Store throttling | Retried internally; surfaced when budget runs out |
//! | Fatal | Lease lost mid-write | Abort; a competing writer may exist |
//! | Caller bug | Empty batch, oversized batch, bad key | Fix the call site |
//! | Internal | SQLite error, undecodable document | Log and investigate |

use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in BrookDB operations.
///
/// Each variant is a distinct failure mode; the `#[error(...)]` attribute is
/// the message callers see in logs.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Conflict Errors (reload state, then retry)
    // =========================================================================
    /// Optimistic concurrency conflict: the brook's head moved since the
    /// caller last observed it.
    ///
    /// # Recovery
    ///
    /// 1. Re-read the brook to get the current head
    /// 2. Re-apply business logic against the fresh state
    /// 3. Retry the append with the new expected position
    #[error("conflict on brook '{key}': expected head {expected}, but found {actual}")]
    Conflict {
        /// The brook where the conflict occurred
        key: String,
        /// The head position the caller expected
        expected: u64,
        /// The actual head position
        actual: u64,
    },

    /// Another append already staged a pending marker for this brook.
    ///
    /// Appends funnel through a per-brook lock, so under normal operation
    /// this is unreachable. Seeing it means a writer bypassed the lock or a
    /// crashed append has not been recovered yet.
    #[error("append already in flight on brook '{key}': pending marker exists")]
    PendingAppendInFlight {
        /// The brook with the live pending marker
        key: String,
    },

    // =========================================================================
    // Contention and Transience
    // =========================================================================
    /// The per-brook writer lock could not be acquired within the retry budget.
    ///
    /// Another writer held the lock through every attempt. The operation was
    /// never started, so retrying later is always safe.
    #[error("lock on '{key}' unavailable after {attempts} attempts")]
    LockUnavailable {
        /// The lock that stayed contended
        key: String,
        /// How many acquisition attempts were made
        attempts: u32,
    },

    /// The backing store throttled the operation and the retry budget ran out.
    ///
    /// Throttling is retried internally with backoff; this surfaces only when
    /// every attempt was rejected. `retry_after` carries the store's last
    /// hint, if it gave one.
    #[error("backing store throttled the operation")]
    Throttled {
        /// Store-provided backoff hint from the final rejection, milliseconds
        retry_after: Option<u64>,
    },

    // =========================================================================
    // Fatal (stop writing immediately)
    // =========================================================================
    /// The writer's lease expired or was taken over mid-operation.
    ///
    /// The operation is aborted to prevent data corruption: once the lease is
    /// gone, a competing writer may already be appending to the same brook,
    /// and continuing could interleave two half-finished appends.
    #[error("lease on '{key}' lost mid-operation; aborted to prevent data corruption")]
    LeaseLost {
        /// The lock whose lease was lost
        key: String,
    },

    // =========================================================================
    // Caller Errors (fix the call site)
    // =========================================================================
    /// An append was called with no events.
    #[error("append requires at least one event")]
    EmptyAppend,

    /// An append batch exceeds the per-batch ceiling.
    ///
    /// The ceiling mirrors the atomic-batch limit of the backing store; a
    /// larger batch could never commit atomically.
    #[error("append batch of {count} events exceeds the limit of {max}")]
    BatchTooLarge {
        /// Events in the rejected batch
        count: usize,
        /// Configured per-batch ceiling
        max: usize,
    },

    /// A brook key failed validation.
    #[error("invalid brook key: {0}")]
    InvalidKey(String),

    /// A read window with `from > to`.
    #[error("invalid read range: from {from} exceeds to {to}")]
    InvalidRange {
        /// Requested lower bound
        from: u64,
        /// Requested upper bound
        to: u64,
    },

    // =========================================================================
    // Internal Errors (investigate)
    // =========================================================================
    /// Recovery found an event at a pending position whose id differs from
    /// the one being re-appended.
    ///
    /// The stored event belongs to some other write, so silently overwriting
    /// or skipping it would corrupt the brook.
    #[error("event id mismatch on brook '{key}' at position {position}")]
    EventIdMismatch {
        /// The brook being recovered
        key: String,
        /// The position holding the foreign event
        position: u64,
    },

    /// A stored document could not be decoded into its expected shape.
    #[error("corrupted document: {0}")]
    Corrupted(String),

    /// SQLite operation failed (embedded backend only).
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON encode/decode of a document body failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Any other backend failure without a more precise variant.
    #[error("store backend error: {0}")]
    Backend(String),
}

impl Error {
    /// True for errors that resolve themselves with time and a retry:
    /// contention on the writer lock and store throttling.
    ///
    /// [`Error::Conflict`] is deliberately not in this set. Retrying a
    /// conflicted append without reloading state would just conflict again;
    /// the caller has to re-read first.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::LockUnavailable { .. } | Error::Throttled { .. }
        )
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Error messages appear in logs and operator output; keep them readable
    /// and make sure they carry the identifying fields.
    #[test]
    fn test_error_display() {
        let conflict = Error::Conflict {
            key: "order|abc".to_string(),
            expected: 5,
            actual: 7,
        };
        assert_eq!(
            conflict.to_string(),
            "conflict on brook 'order|abc': expected head 5, but found 7"
        );

        let unavailable = Error::LockUnavailable {
            key: "brook-locks/order|abc".to_string(),
            attempts: 5,
        };
        assert_eq!(
            unavailable.to_string(),
            "lock on 'brook-locks/order|abc' unavailable after 5 attempts"
        );

        let lost = Error::LeaseLost {
            key: "brook-locks/order|abc".to_string(),
        };
        assert!(lost.to_string().contains("prevent data corruption"));

        let too_large = Error::BatchTooLarge {
            count: 150,
            max: 100,
        };
        assert_eq!(
            too_large.to_string(),
            "append batch of 150 events exceeds the limit of 100"
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::LockUnavailable {
            key: "k".into(),
            attempts: 5
        }
        .is_retryable());
        assert!(Error::Throttled { retry_after: None }.is_retryable());

        assert!(!Error::Conflict {
            key: "k".into(),
            expected: 1,
            actual: 2
        }
        .is_retryable());
        assert!(!Error::LeaseLost { key: "k".into() }.is_retryable());
        assert!(!Error::EmptyAppend.is_retryable());
    }

    /// The `#[from]` impls let `?` convert backend errors automatically.
    #[test]
    fn test_source_error_conversions() {
        let sqlite_err = rusqlite::Error::InvalidParameterName("test".to_string());
        let our_err: Error = sqlite_err.into();
        assert!(matches!(our_err, Error::Sqlite(_)));

        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let our_err: Error = json_err.into();
        assert!(matches!(our_err, Error::Serialization(_)));
    }
}
