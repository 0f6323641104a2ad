use crate::error::{AppError, Result};
use parking_lot::Mutex;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::Arc;

/// Database wrapper for thread-safe access.
///
/// The connection mutex is only held for the duration of a single statement or
/// transaction and never across an `.await`.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Create parent directories if needed
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| AppError::Internal(format!("Failed to open database: {}", e)))?;

        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })
        .map_err(|e| AppError::Internal(format!("Failed to enable WAL: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_schema()?;
        Ok(db)
    }

    /// Open in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| AppError::Internal(format!("Failed to open database: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_schema()?;
        Ok(db)
    }

    /// Initialize database schema.
    fn initialize_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.pragma_update(None, "foreign_keys", true)
            .map_err(|e| AppError::Internal(format!("Failed to enable foreign keys: {}", e)))?;

        conn.execute_batch(
            r#"
            -- Library-wide revision sequence (single row)
            CREATE TABLE IF NOT EXISTS library_revision (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                value INTEGER NOT NULL
            );
            INSERT OR IGNORE INTO library_revision (id, value) VALUES (1, 0);

            -- Books table
            CREATE TABLE IF NOT EXISTS books (
                id TEXT PRIMARY KEY,
                content_hash TEXT NOT NULL,
                file_size INTEGER NOT NULL,
                primary_path TEXT NOT NULL,
                converted_path TEXT,
                format TEXT NOT NULL,
                title TEXT,
                author TEXT,
                series TEXT,
                series_index REAL,
                isbn TEXT,
                cover_ref TEXT,
                description TEXT,
                publisher TEXT,
                language TEXT,
                published TEXT,
                revision INTEGER NOT NULL,
                created_revision INTEGER NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            -- Jobs table
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                job_type TEXT NOT NULL,
                target_key TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                last_error TEXT,
                lease_expires_at INTEGER,
                -- Set when the target changed while leased; completion re-arms the job
                rerun INTEGER NOT NULL DEFAULT 0,
                run_after INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            -- Reading state table
            CREATE TABLE IF NOT EXISTS reading_states (
                book_id TEXT PRIMARY KEY,
                status TEXT NOT NULL DEFAULT 'Unread',
                progress_percent REAL NOT NULL DEFAULT 0,
                location_value TEXT,
                location_type TEXT,
                location_source TEXT,
                spent_reading_minutes INTEGER NOT NULL DEFAULT 0,
                remaining_time_minutes INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL,
                FOREIGN KEY (book_id) REFERENCES books(id) ON DELETE CASCADE
            );

            -- Indexes
            CREATE INDEX IF NOT EXISTS idx_books_hash ON books(content_hash);
            CREATE INDEX IF NOT EXISTS idx_books_path ON books(primary_path);
            CREATE INDEX IF NOT EXISTS idx_books_revision ON books(revision);
            CREATE INDEX IF NOT EXISTS idx_jobs_due ON jobs(state, run_after);
            -- At most one non-terminal job per (type, target)
            CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_active
                ON jobs(job_type, target_key) WHERE state IN ('pending', 'leased');
            "#,
        )
        .map_err(|e| AppError::Internal(format!("Failed to initialize schema: {}", e)))?;

        Ok(())
    }

    /// Run `f` inside an immediate (write-locking) transaction.
    pub(crate) fn write<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Run `f` inside a deferred transaction, giving it a consistent snapshot.
    pub(crate) fn read<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Cheap round-trip used by the readiness check.
    pub fn ping(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }
}
