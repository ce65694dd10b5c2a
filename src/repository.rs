//! # Document Repository
//!
//! Thin, typed operations over the backing document store: the document
//! model of a brook, conditional single-item reads/writes, the atomic
//! event-batch-plus-head-commit primitive, and paged range queries.
//!
//! ## Document Layout
//!
//! All documents of one brook share its key as their partition, so the
//! store's single-partition atomic batch covers them:
//!
//! ```text
//! partition "order|abc-123"
//! ├── "head"                    { position }           last committed position
//! ├── "pending-head"            { original, target }   exists only mid-append
//! ├── "event-00000000000000000000"  { position, event }
//! ├── "event-00000000000000000001"  { position, event }
//! └── ...
//! ```
//!
//! Event document ids embed the position zero-padded to 20 digits, so the
//! store's bytewise id order *is* position order and range scans need no
//! sorting. Ids are deterministic: re-attempting a half-failed batch
//! recreates the same ids, which is what makes recovery's idempotency check
//! possible.
//!
//! ## Who Calls What
//!
//! The appender writes through [`BrookRepository::execute_transactional_batch`],
//! recovery reads and repairs through the point operations, and the reader
//! consumes [`BrookRepository::query_events`]. Nothing here takes the
//! writer lock; callers own that.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_stream::try_stream;
use futures::Stream;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::BrookStoreConfig;
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::store::{BatchOperation, BatchOutcome, CreateOutcome, DocumentStore, Etag};
use crate::types::{BrookEvent, BrookKey, BrookPosition, BrookRangeKey};

// =============================================================================
// Document Bodies
// =============================================================================

/// Id of the per-brook head document.
pub const HEAD_DOC_ID: &str = "head";

/// Id of the per-brook pending-head marker.
pub const PENDING_HEAD_DOC_ID: &str = "pending-head";

/// Document id for the event at `position`.
///
/// Zero-padding to 20 digits (the width of `u64::MAX`) keeps bytewise id
/// order identical to numeric position order.
pub fn event_doc_id(position: BrookPosition) -> String {
    format!("event-{:020}", position.as_raw())
}

/// The last committed position of a brook. Mutated only by a successful
/// commit; its value never decreases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadDocument {
    pub position: BrookPosition,
}

/// Marker persisted for the duration of one append.
///
/// `original` is the committed head when the append started, `target` what
/// the head will be once it commits. Found after a crash, it tells recovery
/// exactly which position range to inspect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingHeadDocument {
    pub original: BrookPosition,
    pub target: BrookPosition,
}

/// One persisted event, wrapped with its position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDocument {
    pub position: BrookPosition,
    pub event: BrookEvent,
}

/// Decodes a stored body, tagging failures with the document's address so a
/// damaged brook can be located from the error alone.
fn decode_document<T: serde::de::DeserializeOwned>(
    partition: &str,
    id: &str,
    body: serde_json::Value,
) -> Result<T> {
    serde_json::from_value(body).map_err(|e| Error::Corrupted(format!("'{partition}/{id}': {e}")))
}

// =============================================================================
// Repository
// =============================================================================

/// Default retry policy for throttled single-item creates. Linear is
/// enough here: the store's retry-after hint overrides the computed delay
/// whenever one is given.
fn default_create_retry() -> RetryPolicy {
    RetryPolicy::linear(4, Duration::from_millis(100)).with_max_delay(Duration::from_secs(1))
}

/// Typed access to one container of brook documents.
///
/// Cheap to clone; clones share the backing store handle.
#[derive(Clone)]
pub struct BrookRepository {
    store: Arc<dyn DocumentStore>,
    config: BrookStoreConfig,
    create_retry: RetryPolicy,
}

impl BrookRepository {
    pub fn new(store: Arc<dyn DocumentStore>, config: BrookStoreConfig) -> Self {
        Self {
            store,
            config,
            create_retry: default_create_retry(),
        }
    }

    /// Overrides the throttle-retry policy for single-item creates.
    pub fn with_create_retry(mut self, policy: RetryPolicy) -> Self {
        self.create_retry = policy;
        self
    }

    pub fn config(&self) -> &BrookStoreConfig {
        &self.config
    }

    /// Backend tag of the underlying store.
    pub fn store_format(&self) -> &'static str {
        self.store.format()
    }

    /// The partition holding all of `key`'s documents.
    pub fn partition(&self, key: &BrookKey) -> String {
        key.to_string()
    }

    // =========================================================================
    // Head / Pending-Head
    // =========================================================================

    pub async fn get_head_document(&self, key: &BrookKey) -> Result<Option<HeadDocument>> {
        Ok(self.read_head_raw(key).await?.map(|(head, _)| head))
    }

    /// Committed head, [`BrookPosition::ZERO`] when the brook is empty.
    pub async fn head_position(&self, key: &BrookKey) -> Result<BrookPosition> {
        Ok(self
            .get_head_document(key)
            .await?
            .map(|head| head.position)
            .unwrap_or(BrookPosition::ZERO))
    }

    async fn read_head_raw(&self, key: &BrookKey) -> Result<Option<(HeadDocument, Etag)>> {
        let partition = self.partition(key);
        match self.store.read(&partition, HEAD_DOC_ID).await? {
            Some(doc) => {
                let head: HeadDocument = decode_document(&partition, HEAD_DOC_ID, doc.body)?;
                Ok(Some((head, doc.etag)))
            }
            None => Ok(None),
        }
    }

    pub async fn get_pending_head_document(
        &self,
        key: &BrookKey,
    ) -> Result<Option<PendingHeadDocument>> {
        let partition = self.partition(key);
        match self.store.read(&partition, PENDING_HEAD_DOC_ID).await? {
            Some(doc) => Ok(Some(decode_document(&partition, PENDING_HEAD_DOC_ID, doc.body)?)),
            None => Ok(None),
        }
    }

    /// Stages the pending marker for an append moving `[original, target)`.
    ///
    /// The conditional create doubles as a guard: only one append can be in
    /// flight per brook, even if a writer somewhere bypassed the lock.
    pub async fn create_pending_head(
        &self,
        key: &BrookKey,
        original: BrookPosition,
        target: BrookPosition,
    ) -> Result<()> {
        let partition = self.partition(key);
        let body = serde_json::to_value(PendingHeadDocument { original, target })?;
        match self.store.create(&partition, PENDING_HEAD_DOC_ID, body).await? {
            CreateOutcome::Created(_) => Ok(()),
            CreateOutcome::AlreadyExists => Err(Error::PendingAppendInFlight {
                key: key.to_string(),
            }),
        }
    }

    /// Upserts the head to `new_position`, then clears the pending marker.
    ///
    /// The two steps need not be atomic: if the process dies between them,
    /// the next recovery pass sees head == target and just repeats the
    /// cleanup.
    pub async fn commit_head_position(
        &self,
        key: &BrookKey,
        new_position: BrookPosition,
    ) -> Result<()> {
        let partition = self.partition(key);
        let body = serde_json::to_value(HeadDocument {
            position: new_position,
        })?;
        self.store.upsert(&partition, HEAD_DOC_ID, body).await?;
        self.delete_pending_head(key).await
    }

    pub async fn delete_pending_head(&self, key: &BrookKey) -> Result<()> {
        let partition = self.partition(key);
        // NotFound is already-clean state.
        self.store.delete(&partition, PENDING_HEAD_DOC_ID).await?;
        Ok(())
    }

    // =========================================================================
    // Events
    // =========================================================================

    pub async fn event_exists(&self, key: &BrookKey, position: BrookPosition) -> Result<bool> {
        let partition = self.partition(key);
        Ok(self
            .store
            .read(&partition, &event_doc_id(position))
            .await?
            .is_some())
    }

    async fn read_event_document(
        &self,
        key: &BrookKey,
        position: BrookPosition,
    ) -> Result<Option<EventDocument>> {
        let partition = self.partition(key);
        let id = event_doc_id(position);
        match self.store.read(&partition, &id).await? {
            Some(doc) => Ok(Some(decode_document(&partition, &id, doc.body)?)),
            None => Ok(None),
        }
    }

    /// Which positions in `[from, to)` actually hold an event document.
    ///
    /// Recovery uses this to learn how far a half-written batch got; the
    /// result can have gaps, unlike a committed range.
    pub async fn get_existing_event_positions(
        &self,
        key: &BrookKey,
        from: BrookPosition,
        to: BrookPosition,
    ) -> Result<BTreeSet<BrookPosition>> {
        let partition = self.partition(key);
        let from_id = event_doc_id(from);
        let to_id = event_doc_id(to);

        let mut positions = BTreeSet::new();
        let mut continuation: Option<String> = None;
        loop {
            let page = self
                .store
                .query_page(
                    &partition,
                    &from_id,
                    &to_id,
                    continuation,
                    self.config.query_page_size,
                )
                .await?;
            for doc in page.documents {
                let event_doc: EventDocument = decode_document(&partition, &doc.id, doc.body)?;
                positions.insert(event_doc.position);
            }
            match page.continuation {
                Some(token) => continuation = Some(token),
                None => return Ok(positions),
            }
        }
    }

    pub async fn delete_event(&self, key: &BrookKey, position: BrookPosition) -> Result<()> {
        let partition = self.partition(key);
        // NotFound is already-clean state.
        self.store.delete(&partition, &event_doc_id(position)).await?;
        Ok(())
    }

    // =========================================================================
    // Append Primitives
    // =========================================================================

    /// Creates event documents one by one at `start + index`.
    ///
    /// For pure appends that do not need a head CAS (replay, backfill) and
    /// for re-driving a batch recovery rolled back. Throttles are retried
    /// per the repository's create policy; an existing document with the
    /// same event id counts as success, which makes re-driving idempotent.
    ///
    /// Returns the position after the last event.
    pub async fn append_event_batch(
        &self,
        key: &BrookKey,
        events: &[BrookEvent],
        start: BrookPosition,
    ) -> Result<BrookPosition> {
        let partition = self.partition(key);
        let mut retry = self.create_retry.handle();

        for (index, event) in events.iter().enumerate() {
            let position = start.add(index as u64);
            let doc_id = event_doc_id(position);
            let body = serde_json::to_value(EventDocument {
                position,
                event: event.clone(),
            })?;

            loop {
                match self.store.create(&partition, &doc_id, body.clone()).await {
                    Ok(CreateOutcome::Created(_)) => break,
                    Ok(CreateOutcome::AlreadyExists) => {
                        match self.read_event_document(key, position).await? {
                            Some(existing) if existing.event.id == event.id => {
                                // Already landed in a previous attempt.
                                break;
                            }
                            Some(_) => {
                                return Err(Error::EventIdMismatch {
                                    key: key.to_string(),
                                    position: position.as_raw(),
                                })
                            }
                            None => {
                                return Err(Error::Backend(format!(
                                    "event document {doc_id} vanished during idempotency check"
                                )))
                            }
                        }
                    }
                    Err(Error::Throttled { retry_after }) => {
                        let hint = retry_after.map(Duration::from_millis);
                        match retry.next_delay_with_hint(hint) {
                            Some(delay) => {
                                debug!(
                                    "create of {doc_id} throttled; retrying in {}ms",
                                    delay.as_millis()
                                );
                                tokio::time::sleep(delay).await;
                            }
                            None => return Err(Error::Throttled { retry_after }),
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(start.add(events.len() as u64))
    }

    /// The core durability primitive: one atomic batch that creates every
    /// event document and moves the head from `expected_head` to `new_head`.
    ///
    /// The head condition is a value CAS expressed through the store's etag:
    /// the head is read first, its position compared to `expected_head`, and
    /// the batch replace conditioned on the etag just observed. A missing
    /// head with `expected_head == 0` is the first-ever write and turns the
    /// replace into a create.
    ///
    /// Throttle responses surface as [`Error::Throttled`] untouched; the
    /// appender owns that retry loop and its backoff.
    pub async fn execute_transactional_batch(
        &self,
        key: &BrookKey,
        events: &[BrookEvent],
        expected_head: BrookPosition,
        new_head: BrookPosition,
    ) -> Result<()> {
        if events.is_empty() {
            return Err(Error::EmptyAppend);
        }
        let partition = self.partition(key);

        let head_body = serde_json::to_value(HeadDocument { position: new_head })?;
        let head_op = match self.read_head_raw(key).await? {
            None if expected_head == BrookPosition::ZERO => BatchOperation::Create {
                id: HEAD_DOC_ID.to_string(),
                body: head_body,
            },
            None => {
                return Err(Error::Conflict {
                    key: key.to_string(),
                    expected: expected_head.as_raw(),
                    actual: 0,
                })
            }
            Some((head, _)) if head.position != expected_head => {
                return Err(Error::Conflict {
                    key: key.to_string(),
                    expected: expected_head.as_raw(),
                    actual: head.position.as_raw(),
                })
            }
            Some((_, etag)) => BatchOperation::Replace {
                id: HEAD_DOC_ID.to_string(),
                body: head_body,
                if_etag: etag,
            },
        };

        let mut ops = Vec::with_capacity(events.len() + 1);
        for (index, event) in events.iter().enumerate() {
            let position = expected_head.add(index as u64);
            ops.push(BatchOperation::Create {
                id: event_doc_id(position),
                body: serde_json::to_value(EventDocument {
                    position,
                    event: event.clone(),
                })?,
            });
        }
        ops.push(head_op);

        match self.store.execute_batch(&partition, ops).await? {
            BatchOutcome::Applied => Ok(()),
            BatchOutcome::Conflict { op_index } => {
                debug!(
                    "transactional batch on '{key}' conflicted at operation {op_index}"
                );
                // Someone moved the head (or left an event) between our read
                // and the batch. Report the fresh head as the actual value.
                let actual = self.head_position(key).await?;
                Err(Error::Conflict {
                    key: key.to_string(),
                    expected: expected_head.as_raw(),
                    actual: actual.as_raw(),
                })
            }
            BatchOutcome::Throttled { retry_after } => Err(Error::Throttled {
                retry_after: retry_after.map(|d| d.as_millis() as u64),
            }),
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Lazy page-by-page scan of `range`, yielding event documents strictly
    /// ordered by position.
    ///
    /// Pages are fetched as the stream is polled; dropping the stream
    /// between pages abandons the scan without further store calls.
    pub fn query_events(
        &self,
        range: BrookRangeKey,
        page_size: usize,
    ) -> impl Stream<Item = Result<EventDocument>> + Send + 'static {
        let repo = self.clone();
        try_stream! {
            if range.is_empty() {
                return;
            }
            let partition = repo.partition(range.key());
            let from_id = event_doc_id(range.from());
            let to_id = event_doc_id(range.to());

            let mut continuation: Option<String> = None;
            loop {
                let page = repo
                    .store
                    .query_page(&partition, &from_id, &to_id, continuation.clone(), page_size)
                    .await?;
                for doc in page.documents {
                    let event_doc: EventDocument = decode_document(&partition, &doc.id, doc.body)?;
                    yield event_doc;
                }
                match page.continuation {
                    Some(token) => continuation = Some(token),
                    None => break,
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
