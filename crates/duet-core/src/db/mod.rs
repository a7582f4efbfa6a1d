//! Database access layer with connection pooling and migrations
//!
//! This module is organized by domain:
//! - `merchants` - Canonical merchant lookup and atomic check-then-create
//! - `transactions` - Transaction creation, lookups and enrichment results
//! - `metadata` - Match state, pending candidates, match claims and absorbed
//!   submissions
//! - `jobs` - Enrichment job queue (enqueue/merge, lease, ack, fail)

use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rust_decimal::Decimal;
use tracing::info;

use crate::error::Result;

mod jobs;
mod merchants;
mod metadata;
mod transactions;

#[cfg(test)]
mod tests;

pub use jobs::{job_key, EnqueueOutcome, FailOutcome};
pub use metadata::PendingCandidate;

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConn = PooledConnection<SqliteConnectionManager>;

/// Fixed-width UTC layout; lexical order equals time order
const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// How long a connection waits on a locked database before giving up
const BUSY_TIMEOUT_MS: u32 = 5000;

/// Format a timestamp for storage
pub(crate) fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.format(DATETIME_FORMAT).to_string()
}

/// Parse a stored timestamp into a DateTime<Utc>
pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(s, DATETIME_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S"))
        .map(|dt| dt.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

/// Parse a stored decimal column, surfacing corruption as a row error
pub(crate) fn parse_decimal(idx: usize, s: &str) -> rusqlite::Result<Decimal> {
    Decimal::from_str(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Parse a stored enum column (as written by its `as_str`)
pub(crate) fn parse_enum<T: FromStr<Err = String>>(idx: usize, s: &str) -> rusqlite::Result<T> {
    s.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

/// Database wrapper with connection pooling
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
    /// Path to the database file
    db_path: String,
}

impl Database {
    /// Open (or create) the database at `path` and run migrations
    pub fn new(path: &str) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            // Per-connection settings; they do not persist in the file
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS.into()))
        });

        let pool = Pool::builder().max_size(10).build(manager)?;

        let db = Self {
            pool,
            db_path: path.to_string(),
        };
        db.run_migrations()?;

        info!(path, "Database ready");
        Ok(db)
    }

    /// Get the path to the database file
    pub fn path(&self) -> &str {
        &self.db_path
    }

    /// Create a throwaway database (for testing)
    ///
    /// Uses a temporary file rather than `:memory:` so every pooled
    /// connection sees the same data.
    pub fn in_memory() -> Result<Self> {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);

        let id = COUNTER.fetch_add(1, Ordering::SeqCst);
        let path = std::env::temp_dir().join(format!("duet_test_{}_{}.db", std::process::id(), id));
        let path = path.to_string_lossy().into_owned();

        // Remove any leftovers from an earlier run
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{}", path, suffix));
        }

        Self::new(&path)
    }

    /// Get a connection from the pool
    pub fn conn(&self) -> Result<DbConn> {
        Ok(self.pool.get()?)
    }

    /// Run database migrations
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            -- WAL mode: readers don't block the single writer
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;

            -- Merchants (canonical counterparties)
            CREATE TABLE IF NOT EXISTS merchants (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                normalized_key TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_merchants_name ON merchants(name COLLATE NOCASE);

            -- Transactions (one per purchase per first-seen channel)
            CREATE TABLE IF NOT EXISTS transactions (
                id INTEGER PRIMARY KEY,
                user_id TEXT NOT NULL,
                raw_text TEXT NOT NULL,
                amount TEXT NOT NULL,                      -- exact decimal
                currency TEXT NOT NULL DEFAULT 'INR',
                merchant_id INTEGER NOT NULL REFERENCES merchants(id),
                channel TEXT NOT NULL CHECK (channel IN ('fast', 'slow')),
                sender_info TEXT,
                transaction_date TEXT NOT NULL,
                processed INTEGER NOT NULL DEFAULT 0,
                category TEXT,
                fingerprint TEXT,
                anchor_signature TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_transactions_dedup
                ON transactions(user_id, merchant_id, channel, transaction_date);
            CREATE INDEX IF NOT EXISTS idx_transactions_match
                ON transactions(user_id, channel, transaction_date);

            -- Matching and enrichment state (one-to-one with transactions)
            CREATE TABLE IF NOT EXISTS transaction_metadata (
                transaction_id INTEGER PRIMARY KEY REFERENCES transactions(id),
                match_status TEXT NOT NULL DEFAULT 'PENDING'
                    CHECK (match_status IN ('PENDING', 'MATCHED')),
                match_expires_at TEXT,                     -- only while PENDING
                product_details TEXT,
                direction TEXT NOT NULL DEFAULT 'UNKNOWN',
                payment_mode TEXT NOT NULL DEFAULT 'UNKNOWN',
                -- Set when a late match folded this record into an earlier one
                absorbed_into INTEGER REFERENCES transactions(id),
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_metadata_pending
                ON transaction_metadata(match_status, match_expires_at);

            -- Matched submissions that were merged into an existing record
            -- instead of being stored as one
            CREATE TABLE IF NOT EXISTS absorbed_submissions (
                id INTEGER PRIMARY KEY,
                transaction_id INTEGER NOT NULL REFERENCES transactions(id),
                user_id TEXT NOT NULL,
                merchant_id INTEGER NOT NULL REFERENCES merchants(id),
                channel TEXT NOT NULL CHECK (channel IN ('fast', 'slow')),
                amount TEXT NOT NULL,
                raw_text TEXT NOT NULL,
                observed_at TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_absorbed_dedup
                ON absorbed_submissions(user_id, merchant_id, channel, observed_at);
            CREATE INDEX IF NOT EXISTS idx_absorbed_transaction
                ON absorbed_submissions(transaction_id);

            -- Enrichment job queue
            CREATE TABLE IF NOT EXISTS enrichment_jobs (
                id INTEGER PRIMARY KEY,
                job_key TEXT NOT NULL,
                kind TEXT NOT NULL,                        -- enrich, retry_match
                transaction_id INTEGER NOT NULL REFERENCES transactions(id),
                payload TEXT NOT NULL,                     -- JSON snapshot
                status TEXT NOT NULL DEFAULT 'queued',     -- queued, running, succeeded, failed
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                backoff_ms INTEGER NOT NULL,
                not_before TEXT NOT NULL,
                leased_until TEXT,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- At most one live job per key
            CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_live_key
                ON enrichment_jobs(job_key) WHERE status IN ('queued', 'running');
            CREATE INDEX IF NOT EXISTS idx_jobs_ready ON enrichment_jobs(status, not_before);
            CREATE INDEX IF NOT EXISTS idx_jobs_transaction ON enrichment_jobs(transaction_id);
            "#,
        )?;

        Ok(())
    }
}
