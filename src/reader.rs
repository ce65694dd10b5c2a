//! # Event Reader
//!
//! Read side of a brook: a lazy, ordered stream over a position range.
//!
//! Reads never take the writer lock. Isolation comes from the commit
//! protocol instead: an event is visible only once the head covers it, so
//! the reader clamps every range to the committed head before scanning.
//! Event documents a half-finished append may have left beyond the head are
//! simply outside the clamped range, whether or not recovery has run yet.
//!
//! ```text
//! requested  [from ──────────────── to)
//! committed  [0 ────────── head)
//! served     [from ─────── min(to, head))
//! ```
//!
//! The stream fetches one page per poll cycle and decodes as it goes;
//! dropping it abandons the scan with no further store calls.

use async_stream::try_stream;
use futures::{pin_mut, Stream, StreamExt};

use crate::error::Result;
use crate::repository::BrookRepository;
use crate::types::{BrookEvent, BrookKey, BrookPosition, BrookRangeKey};

/// Streaming reads over committed events.
#[derive(Clone)]
pub struct BrookReader {
    repository: BrookRepository,
}

impl BrookReader {
    pub fn new(repository: BrookRepository) -> Self {
        Self { repository }
    }

    /// The brook's committed head: the position the next event would take,
    /// and the exclusive upper bound of what [`BrookReader::read_events`]
    /// can serve. Zero for a brook that has never committed.
    pub async fn cursor_position(&self, key: &BrookKey) -> Result<BrookPosition> {
        self.repository.head_position(key).await
    }

    /// Streams the events of `range` in position order.
    ///
    /// The range is clamped to the committed head at the time the stream is
    /// first polled; positions beyond it yield nothing rather than an
    /// error. Re-reading the same fully-committed range returns the same
    /// sequence.
    pub fn read_events(
        &self,
        range: BrookRangeKey,
    ) -> impl Stream<Item = Result<BrookEvent>> + Send + 'static {
        let repository = self.repository.clone();
        try_stream! {
            let head = repository.head_position(range.key()).await?;
            let to = range.to().min(head);
            if range.from() >= to {
                return;
            }
            let clamped = BrookRangeKey::new(range.key().clone(), range.from(), to)?;

            let page_size = repository.config().query_page_size;
            let documents = repository.query_events(clamped, page_size);
            pin_mut!(documents);
            while let Some(document) = documents.next().await {
                yield document?.event;
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
