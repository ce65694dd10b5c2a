//! # Embedded SQLite Backing Store
//!
//! Single-node backend implementing both store seams over one SQLite file.
//! Useful for development, tests, and deployments that do not need a shared
//! remote store.
//!
//! ## Schema Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  documents                      leases                       │
//! │  ┌────────────────────┐         ┌────────────────────┐       │
//! │  │ partition_key (PK) │         │ name (PK)          │       │
//! │  │ doc_id        (PK) │         │ lease_id           │       │
//! │  │ etag               │         │ expires_ms         │       │
//! │  │ body (JSON text)   │         └────────────────────┘       │
//! │  └────────────────────┘                                      │
//! │                                                              │
//! │  brookdb_metadata: key/value, holds the schema version       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Threading Model
//!
//! `rusqlite::Connection` is `Send` but not `Sync`, so a dedicated OS thread
//! owns the connection and services requests sequentially:
//!
//! ```text
//! async callers ──mpsc──► owner thread (blocking_recv) ──► SQLite
//!        ▲                                   │
//!        └────────────── oneshot ◄───────────┘
//! ```
//!
//! The thread exits when every handle has been dropped and the request
//! channel closes. Sequential execution orders one handle's requests, but
//! several handles on one file are several owner threads, so the lease
//! verbs claim and renew with single conditional UPDATEs that the database
//! itself arbitrates.
//!
//! ## Clock
//!
//! Lease expiry uses wall-clock Unix milliseconds, not a monotonic clock:
//! leases must stay meaningful across process restarts, and a monotonic
//! reading does not survive one.

use std::path::Path;

use log::{debug, error};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::store::{
    AcquireOutcome, BatchOperation, BatchOutcome, CreateOutcome, DeleteOutcome, DocumentStore,
    Etag, LeaseStore, QueryPage, ReleaseOutcome, RenewOutcome, StoredDocument,
};
use crate::types::current_time_ms;

// =============================================================================
// Schema
// =============================================================================

/// Current schema version. Increment on breaking schema changes.
///
/// There is no migration support yet; a version mismatch is an error so that
/// an old binary cannot quietly misread a newer layout.
const SCHEMA_VERSION: i32 = 1;

/// Documents, one row per `(partition, id)` pair.
///
/// The composite primary key makes creates conditional for free: inserting
/// an existing pair violates the key. `etag` starts at 1 and bumps on every
/// write; conditional replaces compare it in the WHERE clause and check the
/// affected-row count.
const CREATE_DOCUMENTS: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    partition_key TEXT NOT NULL,
    doc_id        TEXT NOT NULL,
    etag          INTEGER NOT NULL,
    body          TEXT NOT NULL,
    PRIMARY KEY (partition_key, doc_id)
)
"#;

/// Lock objects for the lease seam.
///
/// A row exists per ensured lock object. `lease_id` is NULL while free;
/// `expires_ms` is wall-clock Unix milliseconds.
const CREATE_LEASES: &str = r#"
CREATE TABLE IF NOT EXISTS leases (
    name       TEXT PRIMARY KEY,
    lease_id   TEXT,
    expires_ms INTEGER NOT NULL DEFAULT 0
)
"#;

/// Metadata table for schema versioning.
const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS brookdb_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

// =============================================================================
// Database Wrapper
// =============================================================================

/// A SQLite connection with the BrookDB schema applied.
#[derive(Debug)]
struct Database {
    conn: Connection,
}

impl Database {
    fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    fn initialize(&mut self) -> Result<()> {
        // WAL keeps readers unblocked while the owner thread writes, which
        // matters when several store handles share one database file.
        self.conn.execute_batch("PRAGMA journal_mode = WAL")?;
        // Sync the WAL on commit, not on every write.
        self.conn.execute_batch("PRAGMA synchronous = NORMAL")?;
        // Another handle's write waits for the file lock instead of
        // surfacing SQLITE_BUSY.
        self.conn.execute_batch("PRAGMA busy_timeout = 5000")?;

        self.conn.execute_batch(CREATE_METADATA)?;
        self.conn.execute_batch(CREATE_DOCUMENTS)?;
        self.conn.execute_batch(CREATE_LEASES)?;

        self.verify_or_set_version()
    }

    fn verify_or_set_version(&mut self) -> Result<()> {
        let existing: Option<i32> = self
            .conn
            .query_row(
                "SELECT value FROM brookdb_metadata WHERE key = 'schema_version'",
                [],
                |row| {
                    let s: String = row.get(0)?;
                    Ok(s.parse().unwrap_or(0))
                },
            )
            .optional()?;

        match existing {
            None => {
                self.conn.execute(
                    "INSERT INTO brookdb_metadata (key, value) VALUES ('schema_version', ?1)",
                    [SCHEMA_VERSION.to_string()],
                )?;
                Ok(())
            }
            Some(v) if v == SCHEMA_VERSION => Ok(()),
            Some(v) => Err(Error::Backend(format!(
                "schema version mismatch: database has version {v}, this build requires {SCHEMA_VERSION}"
            ))),
        }
    }
}

// =============================================================================
// Requests
// =============================================================================

type Reply<T> = oneshot::Sender<Result<T>>;

enum StoreRequest {
    Read {
        partition: String,
        id: String,
        reply: Reply<Option<StoredDocument>>,
    },
    Create {
        partition: String,
        id: String,
        body: Value,
        reply: Reply<CreateOutcome>,
    },
    Upsert {
        partition: String,
        id: String,
        body: Value,
        reply: Reply<Etag>,
    },
    Delete {
        partition: String,
        id: String,
        reply: Reply<DeleteOutcome>,
    },
    Batch {
        partition: String,
        ops: Vec<BatchOperation>,
        reply: Reply<BatchOutcome>,
    },
    Query {
        partition: String,
        from_id: String,
        to_id: String,
        continuation: Option<String>,
        page_size: usize,
        reply: Reply<QueryPage>,
    },
    EnsureLock {
        name: String,
        reply: Reply<()>,
    },
    AcquireLease {
        name: String,
        duration_ms: u64,
        reply: Reply<AcquireOutcome>,
    },
    RenewLease {
        name: String,
        lease_id: String,
        duration_ms: u64,
        reply: Reply<RenewOutcome>,
    },
    ReleaseLease {
        name: String,
        lease_id: String,
        reply: Reply<ReleaseOutcome>,
    },
}

/// Requests queued while the owner thread works through earlier ones.
const REQUEST_QUEUE_DEPTH: usize = 1024;

// =============================================================================
// Store Handle
// =============================================================================

/// Handle to the embedded store. Cheap to clone; all clones feed the same
/// owner thread.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    tx: mpsc::Sender<StoreRequest>,
}

impl SqliteStore {
    /// Opens (creating if necessary) a database file and starts the owner
    /// thread.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::open(path)?;
        Ok(Self::start(db))
    }

    /// Fresh private in-memory database. Contents vanish when the last
    /// handle drops.
    pub fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory()?;
        Ok(Self::start(db))
    }

    fn start(db: Database) -> Self {
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        std::thread::Builder::new()
            .name("brookdb-sqlite".to_string())
            .spawn(move || run_store_loop(db, rx))
            .expect("failed to spawn sqlite owner thread");
        Self { tx }
    }

    async fn call<T>(&self, request: StoreRequest, rx: oneshot::Receiver<Result<T>>) -> Result<T> {
        self.tx
            .send(request)
            .await
            .map_err(|_| Error::Backend("sqlite store has shut down".to_string()))?;
        rx.await
            .map_err(|_| Error::Backend("sqlite store dropped the request".to_string()))?
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn read(&self, partition: &str, id: &str) -> Result<Option<StoredDocument>> {
        let (reply, rx) = oneshot::channel();
        self.call(
            StoreRequest::Read {
                partition: partition.to_string(),
                id: id.to_string(),
                reply,
            },
            rx,
        )
        .await
    }

    async fn create(&self, partition: &str, id: &str, body: Value) -> Result<CreateOutcome> {
        let (reply, rx) = oneshot::channel();
        self.call(
            StoreRequest::Create {
                partition: partition.to_string(),
                id: id.to_string(),
                body,
                reply,
            },
            rx,
        )
        .await
    }

    async fn upsert(&self, partition: &str, id: &str, body: Value) -> Result<Etag> {
        let (reply, rx) = oneshot::channel();
        self.call(
            StoreRequest::Upsert {
                partition: partition.to_string(),
                id: id.to_string(),
                body,
                reply,
            },
            rx,
        )
        .await
    }

    async fn delete(&self, partition: &str, id: &str) -> Result<DeleteOutcome> {
        let (reply, rx) = oneshot::channel();
        self.call(
            StoreRequest::Delete {
                partition: partition.to_string(),
                id: id.to_string(),
                reply,
            },
            rx,
        )
        .await
    }

    async fn execute_batch(
        &self,
        partition: &str,
        ops: Vec<BatchOperation>,
    ) -> Result<BatchOutcome> {
        let (reply, rx) = oneshot::channel();
        self.call(
            StoreRequest::Batch {
                partition: partition.to_string(),
                ops,
                reply,
            },
            rx,
        )
        .await
    }

    async fn query_page(
        &self,
        partition: &str,
        from_id: &str,
        to_id: &str,
        continuation: Option<String>,
        page_size: usize,
    ) -> Result<QueryPage> {
        let (reply, rx) = oneshot::channel();
        self.call(
            StoreRequest::Query {
                partition: partition.to_string(),
                from_id: from_id.to_string(),
                to_id: to_id.to_string(),
                continuation,
                page_size,
                reply,
            },
            rx,
        )
        .await
    }

    fn format(&self) -> &'static str {
        "sqlite"
    }
}

#[async_trait]
impl LeaseStore for SqliteStore {
    async fn ensure_object(&self, name: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.call(
            StoreRequest::EnsureLock {
                name: name.to_string(),
                reply,
            },
            rx,
        )
        .await
    }

    async fn acquire(&self, name: &str, duration: std::time::Duration) -> Result<AcquireOutcome> {
        let (reply, rx) = oneshot::channel();
        self.call(
            StoreRequest::AcquireLease {
                name: name.to_string(),
                duration_ms: duration.as_millis() as u64,
                reply,
            },
            rx,
        )
        .await
    }

    async fn renew(
        &self,
        name: &str,
        lease_id: &str,
        duration: std::time::Duration,
    ) -> Result<RenewOutcome> {
        let (reply, rx) = oneshot::channel();
        self.call(
            StoreRequest::RenewLease {
                name: name.to_string(),
                lease_id: lease_id.to_string(),
                duration_ms: duration.as_millis() as u64,
                reply,
            },
            rx,
        )
        .await
    }

    async fn release(&self, name: &str, lease_id: &str) -> Result<ReleaseOutcome> {
        let (reply, rx) = oneshot::channel();
        self.call(
            StoreRequest::ReleaseLease {
                name: name.to_string(),
                lease_id: lease_id.to_string(),
                reply,
            },
            rx,
        )
        .await
    }
}

// =============================================================================
// Owner Thread
// =============================================================================

fn run_store_loop(db: Database, mut rx: mpsc::Receiver<StoreRequest>) {
    debug!("sqlite owner thread started");
    while let Some(request) = rx.blocking_recv() {
        dispatch(&db.conn, request);
    }
    debug!("sqlite owner thread exiting: all handles dropped");
}

fn dispatch(conn: &Connection, request: StoreRequest) {
    match request {
        StoreRequest::Read {
            partition,
            id,
            reply,
        } => {
            let _ = reply.send(read_document(conn, &partition, &id));
        }
        StoreRequest::Create {
            partition,
            id,
            body,
            reply,
        } => {
            let _ = reply.send(create_document(conn, &partition, &id, &body));
        }
        StoreRequest::Upsert {
            partition,
            id,
            body,
            reply,
        } => {
            let _ = reply.send(upsert_document(conn, &partition, &id, &body));
        }
        StoreRequest::Delete {
            partition,
            id,
            reply,
        } => {
            let _ = reply.send(delete_document(conn, &partition, &id));
        }
        StoreRequest::Batch {
            partition,
            ops,
            reply,
        } => {
            let _ = reply.send(execute_batch_inner(conn, &partition, &ops));
        }
        StoreRequest::Query {
            partition,
            from_id,
            to_id,
            continuation,
            page_size,
            reply,
        } => {
            let _ = reply.send(query_page_inner(
                conn,
                &partition,
                &from_id,
                &to_id,
                continuation,
                page_size,
            ));
        }
        StoreRequest::EnsureLock { name, reply } => {
            let _ = reply.send(ensure_lock(conn, &name));
        }
        StoreRequest::AcquireLease {
            name,
            duration_ms,
            reply,
        } => {
            let _ = reply.send(acquire_lease(conn, &name, duration_ms));
        }
        StoreRequest::RenewLease {
            name,
            lease_id,
            duration_ms,
            reply,
        } => {
            let _ = reply.send(renew_lease(conn, &name, &lease_id, duration_ms));
        }
        StoreRequest::ReleaseLease {
            name,
            lease_id,
            reply,
        } => {
            let _ = reply.send(release_lease(conn, &name, &lease_id));
        }
    }
}

// =============================================================================
// Document Operations
// =============================================================================

fn read_document(conn: &Connection, partition: &str, id: &str) -> Result<Option<StoredDocument>> {
    let row = conn
        .query_row(
            "SELECT etag, body FROM documents WHERE partition_key = ?1 AND doc_id = ?2",
            params![partition, id],
            |row| {
                let etag: i64 = row.get(0)?;
                let body: String = row.get(1)?;
                Ok((etag, body))
            },
        )
        .optional()?;

    match row {
        Some((etag, body)) => Ok(Some(StoredDocument {
            id: id.to_string(),
            etag: etag as Etag,
            body: serde_json::from_str(&body)?,
        })),
        None => Ok(None),
    }
}

fn create_document(conn: &Connection, partition: &str, id: &str, body: &Value) -> Result<CreateOutcome> {
    let encoded = serde_json::to_string(body)?;
    match conn.execute(
        "INSERT INTO documents (partition_key, doc_id, etag, body) VALUES (?1, ?2, 1, ?3)",
        params![partition, id, encoded],
    ) {
        Ok(_) => Ok(CreateOutcome::Created(1)),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Ok(CreateOutcome::AlreadyExists)
        }
        Err(e) => Err(e.into()),
    }
}

fn upsert_document(conn: &Connection, partition: &str, id: &str, body: &Value) -> Result<Etag> {
    let encoded = serde_json::to_string(body)?;
    let existing: Option<i64> = conn
        .query_row(
            "SELECT etag FROM documents WHERE partition_key = ?1 AND doc_id = ?2",
            params![partition, id],
            |row| row.get(0),
        )
        .optional()?;
    let new_etag = existing.unwrap_or(0) + 1;
    conn.execute(
        "INSERT INTO documents (partition_key, doc_id, etag, body) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(partition_key, doc_id) DO UPDATE SET etag = excluded.etag, body = excluded.body",
        params![partition, id, new_etag, encoded],
    )?;
    Ok(new_etag as Etag)
}

fn delete_document(conn: &Connection, partition: &str, id: &str) -> Result<DeleteOutcome> {
    let changed = conn.execute(
        "DELETE FROM documents WHERE partition_key = ?1 AND doc_id = ?2",
        params![partition, id],
    )?;
    Ok(if changed > 0 {
        DeleteOutcome::Deleted
    } else {
        DeleteOutcome::NotFound
    })
}

/// Applies the batch inside one transaction; the first precondition failure
/// rolls everything back and reports its index.
fn execute_batch_inner(
    conn: &Connection,
    partition: &str,
    ops: &[BatchOperation],
) -> Result<BatchOutcome> {
    conn.execute_batch("BEGIN IMMEDIATE")?;

    for (op_index, op) in ops.iter().enumerate() {
        let applied = match apply_batch_op(conn, partition, op) {
            Ok(applied) => applied,
            Err(e) => {
                rollback(conn);
                return Err(e);
            }
        };
        if !applied {
            rollback(conn);
            return Ok(BatchOutcome::Conflict { op_index });
        }
    }

    conn.execute_batch("COMMIT")?;
    Ok(BatchOutcome::Applied)
}

/// Returns `Ok(false)` when the operation's precondition failed.
fn apply_batch_op(conn: &Connection, partition: &str, op: &BatchOperation) -> Result<bool> {
    match op {
        BatchOperation::Create { id, body } => {
            let encoded = serde_json::to_string(body)?;
            match conn.execute(
                "INSERT INTO documents (partition_key, doc_id, etag, body) VALUES (?1, ?2, 1, ?3)",
                params![partition, id, encoded],
            ) {
                Ok(_) => Ok(true),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Ok(false)
                }
                Err(e) => Err(e.into()),
            }
        }
        BatchOperation::Replace { id, body, if_etag } => {
            let encoded = serde_json::to_string(body)?;
            let changed = conn.execute(
                "UPDATE documents SET body = ?1, etag = etag + 1
                 WHERE partition_key = ?2 AND doc_id = ?3 AND etag = ?4",
                params![encoded, partition, id, *if_etag as i64],
            )?;
            Ok(changed == 1)
        }
    }
}

fn rollback(conn: &Connection) {
    if let Err(e) = conn.execute_batch("ROLLBACK") {
        error!("rollback failed: {e}");
    }
}

fn query_page_inner(
    conn: &Connection,
    partition: &str,
    from_id: &str,
    to_id: &str,
    continuation: Option<String>,
    page_size: usize,
) -> Result<QueryPage> {
    let page_size = page_size.max(1);
    let mut stmt = conn.prepare(
        "SELECT doc_id, etag, body FROM documents
         WHERE partition_key = ?1 AND doc_id >= ?2 AND doc_id < ?3
           AND (?4 IS NULL OR doc_id > ?4)
         ORDER BY doc_id ASC
         LIMIT ?5",
    )?;

    let rows = stmt.query_map(
        params![partition, from_id, to_id, continuation, page_size as i64],
        |row| {
            let id: String = row.get(0)?;
            let etag: i64 = row.get(1)?;
            let body: String = row.get(2)?;
            Ok((id, etag, body))
        },
    )?;

    let mut documents = Vec::new();
    for row in rows {
        let (id, etag, body) = row?;
        documents.push(StoredDocument {
            id,
            etag: etag as Etag,
            body: serde_json::from_str(&body)?,
        });
    }

    let continuation = if documents.len() == page_size {
        documents.last().map(|doc| doc.id.clone())
    } else {
        None
    };
    Ok(QueryPage {
        documents,
        continuation,
    })
}

// =============================================================================
// Lease Operations
// =============================================================================

fn ensure_lock(conn: &Connection, name: &str) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO leases (name, lease_id, expires_ms) VALUES (?1, NULL, 0)",
        params![name],
    )?;
    Ok(())
}

fn acquire_lease(conn: &Connection, name: &str, duration_ms: u64) -> Result<AcquireOutcome> {
    let now = current_time_ms();
    let lease_id = format!("{:032x}", rand::random::<u128>());

    // Checking the lease is free and claiming it must be one statement:
    // another handle's owner thread may race this call on the same file.
    let changed = conn.execute(
        "UPDATE leases SET lease_id = ?1, expires_ms = ?2
         WHERE name = ?3 AND (lease_id IS NULL OR expires_ms <= ?4)",
        params![lease_id, (now + duration_ms) as i64, name, now as i64],
    )?;
    if changed > 0 {
        return Ok(AcquireOutcome::Acquired { lease_id });
    }

    // Zero rows: a live lease, or a name nobody ensured.
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM leases WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    match exists {
        Some(_) => Ok(AcquireOutcome::Held),
        None => Err(Error::Backend(format!("lock object '{name}' does not exist"))),
    }
}

fn renew_lease(
    conn: &Connection,
    name: &str,
    lease_id: &str,
    duration_ms: u64,
) -> Result<RenewOutcome> {
    let expires = current_time_ms() + duration_ms;
    // Conditioned on the holder still being this lease. Zero rows means the
    // lock object vanished or another writer took the lease over; either
    // way exclusivity is gone. A lapsed lease nobody re-acquired renews.
    let changed = conn.execute(
        "UPDATE leases SET expires_ms = ?1 WHERE name = ?2 AND lease_id = ?3",
        params![expires as i64, name, lease_id],
    )?;
    Ok(if changed > 0 {
        RenewOutcome::Renewed
    } else {
        RenewOutcome::Lost
    })
}

fn release_lease(conn: &Connection, name: &str, lease_id: &str) -> Result<ReleaseOutcome> {
    let changed = conn.execute(
        "UPDATE leases SET lease_id = NULL, expires_ms = 0 WHERE name = ?1 AND lease_id = ?2",
        params![name, lease_id],
    )?;
    Ok(if changed > 0 {
        ReleaseOutcome::Released
    } else {
        ReleaseOutcome::NotHeld
    })
}

// =============================================================================
// Tests
// =============================================================================
