//! SQLite-backed pipeline store.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, Transaction, TransactionBehavior};

use super::{RetryPolicy, StoreError};

/// SQLite-backed store shared by the acquisition, scheduling and upload daemons.
///
/// Every read and write goes through [`SqliteStore::transaction`], which
/// retries lock contention according to the configured [`RetryPolicy`].
pub struct SqliteStore {
    conn: Mutex<Connection>,
    retry: RetryPolicy,
}

impl SqliteStore {
    /// Open (or create) the database file with the default retry policy.
    pub fn new(path: &Path) -> Result<Self, StoreError> {
        Self::open(path, RetryPolicy::default())
    }

    /// Open (or create) the database file.
    pub fn open(path: &Path, retry: RetryPolicy) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        // Contention is retried by `transaction`, not inside SQLite.
        conn.busy_timeout(Duration::ZERO)?;
        let store = Self {
            conn: Mutex::new(conn),
            retry,
        };
        store.retry.run(|| {
            let conn = store.conn.lock().map_err(|_| StoreError::Poisoned)?;
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                row.get::<_, String>(0)
            })?;
            Ok(())
        })?;
        store.initialize_schema()?;
        Ok(store)
    }

    /// Create an in-memory store (useful for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
            retry: RetryPolicy::default(),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<(), StoreError> {
        self.transaction(|tx| {
            tx.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS restores (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    guid TEXT NOT NULL UNIQUE,
                    status TEXT NOT NULL,
                    size INTEGER NOT NULL DEFAULT 0,
                    listed_at TEXT,
                    details TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS files (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    restore_id INTEGER REFERENCES restores(id),
                    remote_name TEXT NOT NULL,
                    local_path TEXT NOT NULL UNIQUE,
                    size INTEGER,
                    status TEXT NOT NULL,
                    details TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS download_attempts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    file_id INTEGER NOT NULL REFERENCES files(id),
                    status TEXT NOT NULL,
                    details TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS jobs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    status TEXT NOT NULL,
                    details TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS job_files (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    job_id INTEGER NOT NULL REFERENCES jobs(id),
                    file_id INTEGER NOT NULL UNIQUE REFERENCES files(id),
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS job_submits (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    job_id INTEGER NOT NULL REFERENCES jobs(id),
                    queue_id TEXT,
                    output_dir TEXT NOT NULL,
                    status TEXT NOT NULL,
                    details TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_files_status ON files(status);
                CREATE INDEX IF NOT EXISTS idx_files_restore ON files(restore_id);
                CREATE INDEX IF NOT EXISTS idx_attempts_file ON download_attempts(file_id);
                CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
                CREATE INDEX IF NOT EXISTS idx_job_files_job ON job_files(job_id);
                CREATE INDEX IF NOT EXISTS idx_job_submits_job ON job_submits(job_id);
                CREATE INDEX IF NOT EXISTS idx_job_submits_status ON job_submits(status);
                "#,
            )?;
            Ok(())
        })
    }

    /// Run `f` inside one immediate transaction.
    ///
    /// The transaction is rolled back and `f` re-run whenever SQLite reports
    /// the database busy or locked, up to the retry budget. `f` may therefore
    /// run more than once and must not have side effects outside `tx`.
    pub fn transaction<T, F>(&self, mut f: F) -> Result<T, StoreError>
    where
        F: FnMut(&Transaction<'_>) -> Result<T, StoreError>,
    {
        self.retry.run(|| {
            let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
    }

    /// Retry policy in effect.
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }
}

/// Current time in the format stored in `*_at` columns.
pub(crate) fn now_text() -> String {
    Utc::now().to_rfc3339()
}

/// Parse a stored RFC 3339 timestamp.
pub(crate) fn parse_time(text: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp '{}': {}", text, e)))
}

/// Map a decode failure into a rusqlite error so it can surface from row mappers.
pub(crate) fn decode_err(e: StoreError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
}
