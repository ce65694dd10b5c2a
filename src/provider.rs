//! # Store Facade
//!
//! [`BrookDb`] assembles the engine and is the one type embedders touch:
//!
//! ```text
//! BrookDb
//! ├── appender ── LockManager ──► LeaseStore      (writer exclusivity)
//! │        └───── BrookRecovery ─┐
//! ├── reader ──── BrookRepository ──► DocumentStore
//! └── lock metrics (Prometheus registry)
//! ```
//!
//! Both stores are trait objects, so a facade over the in-memory backend
//! and one over SQLite behave identically; the suite of backends can grow
//! without touching the engine. Clones share every handle and are the way
//! to use one store from many tasks.

use std::path::Path;
use std::sync::Arc;

use futures::Stream;
use log::info;

use crate::appender::BrookAppender;
use crate::config::BrookStoreConfig;
use crate::error::{Error, Result};
use crate::lock::LockManager;
use crate::metrics::LockMetrics;
use crate::reader::BrookReader;
use crate::recovery::BrookRecovery;
use crate::repository::BrookRepository;
use crate::store::memory::MemoryStore;
use crate::store::sqlite::SqliteStore;
use crate::store::{DocumentStore, LeaseStore};
use crate::types::{BrookEvent, BrookKey, BrookPosition, BrookRangeKey};

/// An event brook store over a document backend.
#[derive(Clone)]
pub struct BrookDb {
    repository: BrookRepository,
    appender: BrookAppender,
    reader: BrookReader,
    metrics: Arc<LockMetrics>,
}

impl BrookDb {
    /// Assembles a store from explicit document and lease backends.
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        leases: Arc<dyn LeaseStore>,
        config: BrookStoreConfig,
    ) -> Self {
        let metrics = Arc::new(LockMetrics::new());
        let repository = BrookRepository::new(documents, config.clone());
        let recovery = BrookRecovery::new(repository.clone());
        let locks = LockManager::new(leases, config, metrics.clone());
        let appender = BrookAppender::new(repository.clone(), recovery, locks);
        let reader = BrookReader::new(repository.clone());
        info!(
            "brook store ready: format={}, database={}, container={}",
            repository.store_format(),
            repository.config().database_id,
            repository.config().container_id
        );
        Self {
            repository,
            appender,
            reader,
            metrics,
        }
    }

    /// Volatile store for tests and embedding without persistence. One
    /// in-memory backend serves both documents and leases.
    pub fn in_memory(config: BrookStoreConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::new(store.clone(), store, config)
    }

    /// Durable store in a SQLite file, created on first open.
    pub fn open_sqlite(path: impl AsRef<Path>, config: BrookStoreConfig) -> Result<Self> {
        let store = Arc::new(SqliteStore::open(path)?);
        Ok(Self::new(store.clone(), store, config))
    }

    /// The committed head of `key`'s brook: next position to be written,
    /// exclusive upper bound of what reads can see.
    pub async fn cursor_position(&self, key: &BrookKey) -> Result<BrookPosition> {
        self.reader.cursor_position(key).await
    }

    /// Streams committed events of `range` in position order. See
    /// [`BrookReader::read_events`].
    pub fn read_events(
        &self,
        range: BrookRangeKey,
    ) -> impl Stream<Item = Result<BrookEvent>> + Send + 'static {
        self.reader.read_events(range)
    }

    /// Appends `events` at the tail of `key`'s brook and returns the new
    /// head. `expected` makes the append conditional on the current tail.
    /// See [`BrookAppender::append_events`].
    pub async fn append_events(
        &self,
        key: &BrookKey,
        events: &[BrookEvent],
        expected: Option<BrookPosition>,
    ) -> Result<BrookPosition> {
        if events.is_empty() {
            return Err(Error::EmptyAppend);
        }
        self.appender.append_events(key, events, expected).await
    }

    /// Tag of the backing document store ("memory", "sqlite").
    pub fn format(&self) -> &'static str {
        self.repository.store_format()
    }

    pub fn config(&self) -> &BrookStoreConfig {
        self.repository.config()
    }

    /// Writer-lock metrics, ready to expose on a scrape endpoint via
    /// [`LockMetrics::encode`].
    pub fn lock_metrics(&self) -> &LockMetrics {
        &self.metrics
    }
}

// =============================================================================
// Tests
// =============================================================================
