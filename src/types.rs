//! # Domain Types for BrookDB
//!
//! The vocabulary of the persistence layer: brooks (per-entity event
//! streams), positions within a brook, events, and read windows.
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! Every domain quantity gets its own single-field wrapper rather than a
//! bare primitive:
//!
//! - A raw `u64` cannot land where a `BrookPosition` is expected, nor a
//!   bare string where a validated `BrookKey` is required
//! - Signatures say what they take without a doc lookup
//! - Validation happens once, at construction, never in the write path
//!
//! ## Invariants
//!
//! - [`BrookKey`]: Neither component is empty, neither contains `|`, and the
//!   joined form fits in [`MAX_KEY_BYTES`] bytes
//! - [`BrookPosition`]: Dense, starts at 0, never skips; the head of a brook
//!   equals the count of committed events
//! - [`BrookRangeKey`]: `from <= to`, half-open `[from, to)`

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Separator between the stream-type and entity-id components of a key.
///
/// Chosen because it is rare in natural identifiers and safe in the document
/// stores we target (unlike `/`, which several stores reserve).
pub const KEY_SEPARATOR: char = '|';

/// Maximum byte length of the joined `type|id` form of a [`BrookKey`].
///
/// Document stores bound the length of partition keys and document ids; 255
/// bytes is the tightest common limit, so we enforce it at construction
/// rather than letting a long key fail deep inside a write path.
pub const MAX_KEY_BYTES: usize = 255;

// =============================================================================
// Brook Identification
// =============================================================================

/// Identity of a brook: a `(stream_type, entity_id)` pair.
///
/// # What is a Brook?
///
/// A brook is the event stream of a single entity. The stream type groups
/// entities of the same kind, the entity id picks one out:
///
/// - `("order", "abc-123")` - the order abc-123
/// - `("account", "checking-999")` - checking account 999
///
/// The joined form `type|id` doubles as the partition key in the backing
/// document store, which is what makes per-brook batches atomic: stores
/// guarantee multi-item atomicity only within one partition.
///
/// # Why Validate at Construction?
///
/// A key containing the separator would be ambiguous when parsed back, and
/// an oversized key would be rejected by the store mid-append, after the
/// pending marker was already written. Failing in [`BrookKey::new`] keeps
/// both problems out of the write path entirely.
///
/// # Example
///
/// ```rust
/// use brookdb::types::BrookKey;
///
/// let key = BrookKey::new("order", "abc-123").unwrap();
/// assert_eq!(key.to_string(), "order|abc-123");
///
/// let parsed: BrookKey = "order|abc-123".parse().unwrap();
/// assert_eq!(parsed, key);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BrookKey {
    stream_type: String,
    entity_id: String,
}

impl BrookKey {
    /// Creates a key from its two components, validating both.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKey`] if either component is empty, contains
    /// the `|` separator, or the joined form exceeds [`MAX_KEY_BYTES`] bytes.
    pub fn new(stream_type: impl Into<String>, entity_id: impl Into<String>) -> Result<Self> {
        let stream_type = stream_type.into();
        let entity_id = entity_id.into();

        if stream_type.is_empty() {
            return Err(Error::InvalidKey("stream type is empty".into()));
        }
        if entity_id.is_empty() {
            return Err(Error::InvalidKey("entity id is empty".into()));
        }
        if stream_type.contains(KEY_SEPARATOR) {
            return Err(Error::InvalidKey(format!(
                "stream type '{stream_type}' contains reserved separator '{KEY_SEPARATOR}'"
            )));
        }
        if entity_id.contains(KEY_SEPARATOR) {
            return Err(Error::InvalidKey(format!(
                "entity id '{entity_id}' contains reserved separator '{KEY_SEPARATOR}'"
            )));
        }
        // +1 for the separator itself.
        let joined_len = stream_type.len() + 1 + entity_id.len();
        if joined_len > MAX_KEY_BYTES {
            return Err(Error::InvalidKey(format!(
                "joined key is {joined_len} bytes, limit is {MAX_KEY_BYTES}"
            )));
        }

        Ok(Self {
            stream_type,
            entity_id,
        })
    }

    /// The kind of entity this brook belongs to (`"order"`, `"account"`, ...).
    pub fn stream_type(&self) -> &str {
        &self.stream_type
    }

    /// The identifier of the entity within its stream type.
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }
}

impl fmt::Display for BrookKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.stream_type, KEY_SEPARATOR, self.entity_id)
    }
}

impl FromStr for BrookKey {
    type Err = Error;

    /// Parses the joined `type|id` form. Splits on the first separator, so
    /// the same validation rules apply as in [`BrookKey::new`].
    fn from_str(s: &str) -> Result<Self> {
        match s.split_once(KEY_SEPARATOR) {
            Some((stream_type, entity_id)) => Self::new(stream_type, entity_id),
            None => Err(Error::InvalidKey(format!(
                "key '{s}' is missing the '{KEY_SEPARATOR}' separator"
            ))),
        }
    }
}

// =============================================================================
// Positions
// =============================================================================

/// A position within a single brook.
///
/// # Invariants
///
/// - Positions are dense: the first event of a brook is at 0, the next at 1,
///   and so on with no gaps in the committed range
/// - The committed head of a brook equals the number of committed events,
///   i.e. the position the *next* event will take
/// - An empty brook has head [`BrookPosition::ZERO`]
///
/// # Use Cases
///
/// - Optimistic concurrency: "append only if the head is still at X"
/// - Read windows: "give me events in `[from, to)`"
/// - Recovery: "which positions in the pending range actually landed?"
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct BrookPosition(u64);

impl BrookPosition {
    /// The head of a brook with no committed events.
    pub const ZERO: BrookPosition = BrookPosition(0);

    /// Creates a position from a raw value.
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw u64 value for storage and arithmetic at the edges.
    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// Returns the position immediately after this one.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Adds an offset, e.g. the head after appending `count` events.
    pub fn add(&self, count: u64) -> Self {
        Self(self.0 + count)
    }

    /// Distance from `other` up to this position. Saturates at zero rather
    /// than panicking when `other` is ahead.
    pub fn distance_from(&self, other: BrookPosition) -> u64 {
        self.0.saturating_sub(other.0)
    }
}

impl fmt::Display for BrookPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Events
// =============================================================================

/// A single event carried by a brook.
///
/// The payload is opaque bytes; BrookDB does not interpret it. The envelope
/// fields exist so that consumers can route and de-duplicate without
/// deserializing the payload:
///
/// - `id`: caller-supplied identity, also the anchor of the idempotency check
///   during crash recovery (a re-appended event with the same id at the same
///   position is recognized as already landed)
/// - `source`: which producer emitted the event
/// - `event_type`: classification (e.g. `"OrderPlaced"`)
/// - `time_ms`: producer wall-clock time in Unix milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrookEvent {
    /// Caller-supplied unique id for this event.
    pub id: String,

    /// The producer that emitted this event.
    pub source: String,

    /// Classification of the event, for filtering and routing.
    pub event_type: String,

    /// The event payload. BrookDB is payload-agnostic: JSON, protobuf,
    /// whatever the producer chose.
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,

    /// Producer timestamp, Unix milliseconds.
    pub time_ms: u64,
}

impl BrookEvent {
    /// Creates an event stamped with the current wall-clock time.
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        event_type: impl Into<String>,
        data: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            event_type: event_type.into(),
            data: data.into(),
            time_ms: current_time_ms(),
        }
    }

    /// Overrides the timestamp (builder pattern), mainly for replays where
    /// the original production time should be preserved.
    pub fn with_time_ms(mut self, time_ms: u64) -> Self {
        self.time_ms = time_ms;
        self
    }
}

/// Payloads are opaque bytes but document bodies are JSON, so the payload
/// travels base64-encoded inside the stored document.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Current wall-clock time as Unix milliseconds.
pub(crate) fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// =============================================================================
// Read Windows
// =============================================================================

/// A contiguous read window over one brook: positions `[from, to)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrookRangeKey {
    key: BrookKey,
    from: BrookPosition,
    to: BrookPosition,
}

impl BrookRangeKey {
    /// Creates a read window. `from` must not exceed `to`.
    pub fn new(key: BrookKey, from: BrookPosition, to: BrookPosition) -> Result<Self> {
        if from > to {
            return Err(Error::InvalidRange {
                from: from.as_raw(),
                to: to.as_raw(),
            });
        }
        Ok(Self { key, from, to })
    }

    /// Convenience for "everything committed so far": `[0, to)`.
    pub fn from_start(key: BrookKey, to: BrookPosition) -> Self {
        Self {
            key,
            from: BrookPosition::ZERO,
            to,
        }
    }

    pub fn key(&self) -> &BrookKey {
        &self.key
    }

    /// Inclusive lower bound.
    pub fn from(&self) -> BrookPosition {
        self.from
    }

    /// Exclusive upper bound.
    pub fn to(&self) -> BrookPosition {
        self.to
    }

    /// Number of positions covered by the window.
    pub fn len(&self) -> u64 {
        self.to.distance_from(self.from)
    }

    pub fn is_empty(&self) -> bool {
        self.from == self.to
    }
}

impl fmt::Display for BrookRangeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}..{})", self.key, self.from, self.to)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_roundtrip() {
        let key = BrookKey::new("order", "abc-123").unwrap();
        assert_eq!(key.stream_type(), "order");
        assert_eq!(key.entity_id(), "abc-123");
        assert_eq!(key.to_string(), "order|abc-123");

        let parsed: BrookKey = "order|abc-123".parse().unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_key_rejects_empty_components() {
        assert!(BrookKey::new("", "abc").is_err());
        assert!(BrookKey::new("order", "").is_err());
    }

    #[test]
    fn test_key_rejects_separator_in_components() {
        assert!(BrookKey::new("or|der", "abc").is_err());
        assert!(BrookKey::new("order", "a|bc").is_err());
    }

    #[test]
    fn test_key_rejects_oversized_joined_form() {
        // 127 + 1 + 127 = 255 bytes: exactly at the limit, accepted.
        let ok = BrookKey::new("t".repeat(127), "i".repeat(127));
        assert!(ok.is_ok());

        // One more byte pushes the joined form to 256, rejected.
        let too_long = BrookKey::new("t".repeat(127), "i".repeat(128));
        assert!(matches!(too_long, Err(Error::InvalidKey(_))));
    }

    #[test]
    fn test_key_parse_requires_separator() {
        assert!("no-separator-here".parse::<BrookKey>().is_err());
    }

    #[test]
    fn test_key_parse_splits_on_first_separator() {
        // A second separator lands in the entity id, which rejects it.
        assert!("a|b|c".parse::<BrookKey>().is_err());
    }

    #[test]
    fn test_position_arithmetic() {
        let pos = BrookPosition::ZERO;
        assert_eq!(pos.next(), BrookPosition::from_raw(1));
        assert_eq!(pos.add(5), BrookPosition::from_raw(5));
        assert_eq!(BrookPosition::from_raw(7).distance_from(pos), 7);
        assert_eq!(pos.distance_from(BrookPosition::from_raw(7)), 0);
    }

    #[test]
    fn test_position_ordering() {
        assert!(BrookPosition::ZERO < BrookPosition::from_raw(1));
        assert_eq!(BrookPosition::ZERO, BrookPosition::default());
    }

    #[test]
    fn test_position_serde_transparent() {
        let pos = BrookPosition::from_raw(42);
        let json = serde_json::to_string(&pos).unwrap();
        assert_eq!(json, "42");
        let back: BrookPosition = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pos);
    }

    #[test]
    fn test_event_roundtrips_through_json() {
        let event = BrookEvent::new("evt-1", "checkout", "OrderPlaced", b"\x00\x01payload".to_vec())
            .with_time_ms(1_700_000_000_000);
        let value = serde_json::to_value(&event).unwrap();
        let back: BrookEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_event_payload_is_base64_in_json() {
        let event =
            BrookEvent::new("evt-1", "checkout", "OrderPlaced", b"foo".to_vec()).with_time_ms(0);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["data"], serde_json::json!("Zm9v"));
    }

    #[test]
    fn test_range_key_bounds() {
        let key = BrookKey::new("order", "abc").unwrap();
        let range = BrookRangeKey::new(
            key.clone(),
            BrookPosition::from_raw(2),
            BrookPosition::from_raw(5),
        )
        .unwrap();
        assert_eq!(range.len(), 3);
        assert!(!range.is_empty());
        assert_eq!(range.to_string(), "order|abc[2..5)");

        let inverted = BrookRangeKey::new(
            key.clone(),
            BrookPosition::from_raw(5),
            BrookPosition::from_raw(2),
        );
        assert!(matches!(inverted, Err(Error::InvalidRange { .. })));

        let empty = BrookRangeKey::from_start(key, BrookPosition::ZERO);
        assert!(empty.is_empty());
    }
}
