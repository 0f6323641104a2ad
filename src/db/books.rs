//! Book catalog operations.
//!
//! Every mutation runs in one immediate transaction that reads the row, applies the
//! change and, when a device-visible attribute changed, draws the next value from the
//! library-wide revision sequence.

use super::schema::Database;
use super::{Book, BookStatus, now_timestamp};
use crate::config::BookFormat;
use crate::error::Result;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::{Path, PathBuf};

const BOOK_COLUMNS: &str = "id, content_hash, file_size, primary_path, converted_path, format,
    title, author, series, series_index, isbn, cover_ref, description, publisher, language,
    published, revision, created_revision, status, created_at, updated_at";

/// A hashed file about to be recorded.
#[derive(Debug, Clone)]
pub struct NewFile {
    /// Absolute path of the file.
    pub path: PathBuf,
    /// Content hash.
    pub content_hash: String,
    /// File size in bytes.
    pub file_size: i64,
    /// Detected format.
    pub format: BookFormat,
}

/// What an ingest did to the catalog.
#[derive(Debug, Clone)]
pub enum IngestOutcome {
    /// A new record was created.
    Created(Book),
    /// Known bytes seen at a new path; the record now points there.
    Moved {
        /// Updated record.
        book: Book,
        /// Previous primary path.
        from: PathBuf,
    },
    /// A removed record with the same bytes was brought back.
    Revived(Book),
    /// The file at a known path was rewritten with different bytes.
    ContentChanged(Book),
    /// Same bytes at the same path; nothing changed.
    Unchanged(Book),
}

impl IngestOutcome {
    /// The record affected by the ingest.
    pub fn book(&self) -> &Book {
        match self {
            IngestOutcome::Created(b)
            | IngestOutcome::Revived(b)
            | IngestOutcome::ContentChanged(b)
            | IngestOutcome::Unchanged(b) => b,
            IngestOutcome::Moved { book, .. } => book,
        }
    }

    /// Whether follow-up enrichment and conversion should be scheduled.
    pub fn needs_processing(&self) -> bool {
        matches!(
            self,
            IngestOutcome::Created(_) | IngestOutcome::ContentChanged(_)
        )
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn row_to_book(row: &Row<'_>) -> rusqlite::Result<Book> {
    let format: String = row.get(5)?;
    let status: String = row.get(18)?;
    Ok(Book {
        id: row.get(0)?,
        content_hash: row.get(1)?,
        file_size: row.get(2)?,
        primary_path: PathBuf::from(row.get::<_, String>(3)?),
        converted_path: row.get::<_, Option<String>>(4)?.map(PathBuf::from),
        format: BookFormat::parse(&format).unwrap_or(BookFormat::Epub),
        title: row.get(6)?,
        author: row.get(7)?,
        series: row.get(8)?,
        series_index: row.get(9)?,
        isbn: row.get(10)?,
        cover_ref: row.get(11)?,
        description: row.get(12)?,
        publisher: row.get(13)?,
        language: row.get(14)?,
        published: row.get(15)?,
        revision: row.get(16)?,
        created_revision: row.get(17)?,
        status: BookStatus::parse(&status).unwrap_or(BookStatus::Ingested),
        created_at: row.get(19)?,
        updated_at: row.get(20)?,
    })
}

fn next_revision(conn: &Connection) -> Result<i64> {
    conn.execute(
        "UPDATE library_revision SET value = value + 1 WHERE id = 1",
        [],
    )?;
    let value = conn.query_row(
        "SELECT value FROM library_revision WHERE id = 1",
        [],
        |row| row.get(0),
    )?;
    Ok(value)
}

fn find_one(conn: &Connection, filter: &str, args: impl rusqlite::Params) -> Result<Option<Book>> {
    let sql = format!("SELECT {} FROM books WHERE {} LIMIT 1", BOOK_COLUMNS, filter);
    Ok(conn.query_row(&sql, args, row_to_book).optional()?)
}

fn insert_book(conn: &Connection, book: &Book) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO books ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11,
             ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)",
            BOOK_COLUMNS
        ),
        params![
            book.id,
            book.content_hash,
            book.file_size,
            path_str(&book.primary_path),
            book.converted_path.as_deref().map(path_str),
            book.format.as_str(),
            book.title,
            book.author,
            book.series,
            book.series_index,
            book.isbn,
            book.cover_ref,
            book.description,
            book.publisher,
            book.language,
            book.published,
            book.revision,
            book.created_revision,
            book.status.as_str(),
            book.created_at,
            book.updated_at,
        ],
    )?;
    Ok(())
}

fn update_row(conn: &Connection, book: &Book) -> Result<()> {
    conn.execute(
        "UPDATE books SET
            content_hash = ?2, file_size = ?3, primary_path = ?4, converted_path = ?5,
            format = ?6, title = ?7, author = ?8, series = ?9, series_index = ?10,
            isbn = ?11, cover_ref = ?12, description = ?13, publisher = ?14,
            language = ?15, published = ?16, revision = ?17, status = ?18, updated_at = ?19
         WHERE id = ?1",
        params![
            book.id,
            book.content_hash,
            book.file_size,
            path_str(&book.primary_path),
            book.converted_path.as_deref().map(path_str),
            book.format.as_str(),
            book.title,
            book.author,
            book.series,
            book.series_index,
            book.isbn,
            book.cover_ref,
            book.description,
            book.publisher,
            book.language,
            book.published,
            book.revision,
            book.status.as_str(),
            book.updated_at,
        ],
    )?;
    Ok(())
}

/// Persist `after`, bumping the revision when a device-visible field changed.
fn commit_change(conn: &Connection, before: &Book, mut after: Book) -> Result<Book> {
    if after == *before {
        return Ok(after);
    }
    if after.visible_differs(before) {
        after.revision = next_revision(conn)?;
    } else {
        after.revision = before.revision;
    }
    after.updated_at = now_timestamp();
    update_row(conn, &after)?;
    Ok(after)
}

/// Soft-delete the live book at `path` unless it is `except_id`.
fn evict_path_holder(conn: &Connection, path: &str, except_id: &str) -> Result<()> {
    if let Some(holder) = find_one(
        conn,
        "primary_path = ?1 AND status != 'removed' AND id != ?2",
        params![path, except_id],
    )? {
        let mut removed = holder.clone();
        removed.status = BookStatus::Removed;
        let removed = commit_change(conn, &holder, removed)?;
        tracing::info!(
            book_id = %removed.id,
            path = %path,
            revision = removed.revision,
            "Book replaced on disk by another book's content"
        );
    }
    Ok(())
}

impl Book {
    /// Record for a hashed file that is not stored yet.
    pub fn discovered(file: &NewFile) -> Self {
        let now = now_timestamp();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            content_hash: file.content_hash.clone(),
            file_size: file.file_size,
            primary_path: file.path.clone(),
            converted_path: None,
            format: file.format,
            title: None,
            author: None,
            series: None,
            series_index: None,
            isbn: None,
            cover_ref: None,
            description: None,
            publisher: None,
            language: None,
            published: None,
            revision: 0,
            created_revision: 0,
            status: BookStatus::Discovered,
            created_at: now,
            updated_at: now,
        }
    }

    /// First stored state of a discovered record.
    fn ingested_at(mut self, revision: i64) -> Self {
        self.revision = revision;
        self.created_revision = revision;
        self.status = BookStatus::Ingested;
        self
    }
}

impl Database {
    /// Current value of the library revision sequence.
    pub fn current_revision(&self) -> Result<i64> {
        self.read(|tx| {
            Ok(tx.query_row(
                "SELECT value FROM library_revision WHERE id = 1",
                [],
                |row| row.get(0),
            )?)
        })
    }

    /// Record a hashed file, deduplicating by content.
    ///
    /// Known bytes at a new path move the record there, so the most recent ingest wins.
    pub fn ingest_file(&self, file: &NewFile) -> Result<IngestOutcome> {
        let path = path_str(&file.path);

        self.write(|tx| {
            // Known bytes, live record
            if let Some(live) = find_one(
                tx,
                "content_hash = ?1 AND file_size = ?2 AND status != 'removed'
                 ORDER BY revision DESC",
                params![file.content_hash, file.file_size],
            )? {
                if live.primary_path == file.path {
                    return Ok(IngestOutcome::Unchanged(live));
                }

                evict_path_holder(tx, &path, &live.id)?;
                let from = live.primary_path.clone();
                let mut moved = live.clone();
                moved.primary_path = file.path.clone();
                let book = commit_change(tx, &live, moved)?;
                return Ok(IngestOutcome::Moved { book, from });
            }

            if let Some(other) = find_one(
                tx,
                "content_hash = ?1 AND status != 'removed'",
                params![file.content_hash],
            )? {
                tracing::warn!(
                    book_id = %other.id,
                    hash = %file.content_hash,
                    stored_size = other.file_size,
                    file_size = file.file_size,
                    path = %path,
                    "Content hash matches a book with a different size, recording separately"
                );
            }

            // Known bytes, removed record
            if let Some(removed) = find_one(
                tx,
                "content_hash = ?1 AND file_size = ?2 AND status = 'removed'
                 ORDER BY revision DESC",
                params![file.content_hash, file.file_size],
            )? {
                evict_path_holder(tx, &path, &removed.id)?;
                let mut revived = removed.clone();
                revived.primary_path = file.path.clone();
                revived.status = if revived.title.is_some() {
                    BookStatus::Ready
                } else {
                    BookStatus::Ingested
                };
                let book = commit_change(tx, &removed, revived)?;
                return Ok(IngestOutcome::Revived(book));
            }

            // Known path, new bytes
            if let Some(existing) = find_one(
                tx,
                "primary_path = ?1 AND status != 'removed'",
                params![path],
            )? {
                let mut changed = existing.clone();
                changed.content_hash = file.content_hash.clone();
                changed.file_size = file.file_size;
                changed.format = file.format;
                changed.converted_path = None;
                let book = commit_change(tx, &existing, changed)?;
                return Ok(IngestOutcome::ContentChanged(book));
            }

            let book = Book::discovered(file).ingested_at(next_revision(tx)?);
            insert_book(tx, &book)?;
            Ok(IngestOutcome::Created(book))
        })
    }

    /// Soft-delete the live book whose primary file is `path`.
    pub fn mark_removed_at_path(&self, path: &Path) -> Result<Option<Book>> {
        let path = path_str(path);
        self.write(|tx| {
            let Some(book) = find_one(
                tx,
                "primary_path = ?1 AND status != 'removed'",
                params![path],
            )?
            else {
                return Ok(None);
            };
            let mut removed = book.clone();
            removed.status = BookStatus::Removed;
            Ok(Some(commit_change(tx, &book, removed)?))
        })
    }

    /// Atomic read-modify-write of one book.
    ///
    /// Returns `None` when the book does not exist.
    pub fn update_book(&self, id: &str, f: impl FnOnce(&mut Book)) -> Result<Option<Book>> {
        self.write(|tx| {
            let Some(book) = find_one(tx, "id = ?1", params![id])? else {
                return Ok(None);
            };
            let mut updated = book.clone();
            f(&mut updated);
            updated.id = book.id.clone();
            updated.created_revision = book.created_revision;
            updated.created_at = book.created_at;
            Ok(Some(commit_change(tx, &book, updated)?))
        })
    }

    /// Get book by ID.
    pub fn get_book(&self, id: &str) -> Result<Option<Book>> {
        self.read(|tx| find_one(tx, "id = ?1", params![id]))
    }

    /// Get the live book with the given primary path.
    pub fn get_book_by_path(&self, path: &Path) -> Result<Option<Book>> {
        let path = path_str(path);
        self.read(|tx| {
            find_one(
                tx,
                "primary_path = ?1 AND status != 'removed'",
                params![path],
            )
        })
    }

    /// All books, removed ones included, in revision order.
    pub fn list_books(&self) -> Result<Vec<Book>> {
        self.read(|tx| {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM books ORDER BY revision, id",
                BOOK_COLUMNS
            ))?;
            let books = stmt
                .query_map([], row_to_book)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(books)
        })
    }

    /// Primary paths of every live book.
    pub fn live_paths(&self) -> Result<Vec<PathBuf>> {
        self.read(|tx| {
            let mut stmt =
                tx.prepare("SELECT primary_path FROM books WHERE status != 'removed'")?;
            let paths = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .map(|r| r.map(PathBuf::from))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(paths)
        })
    }

    /// Primary path and recorded size of every live book.
    pub fn live_files(&self) -> Result<Vec<(PathBuf, i64)>> {
        self.read(|tx| {
            let mut stmt =
                tx.prepare("SELECT primary_path, file_size FROM books WHERE status != 'removed'")?;
            let files = stmt
                .query_map([], |row| {
                    Ok((PathBuf::from(row.get::<_, String>(0)?), row.get::<_, i64>(1)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(files)
        })
    }

    /// Books changed after `baseline`, ordered by revision then id.
    ///
    /// Reads at most `limit` rows from one snapshot.
    pub fn changes_since(&self, baseline: i64, limit: usize) -> Result<Vec<Book>> {
        self.read(|tx| {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM books WHERE revision > ?1 ORDER BY revision, id LIMIT ?2",
                BOOK_COLUMNS
            ))?;
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let books = stmt
                .query_map(params![baseline, limit], row_to_book)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(books)
        })
    }

    /// Number of live books.
    pub fn count_live_books(&self) -> Result<i64> {
        self.read(|tx| {
            Ok(tx.query_row(
                "SELECT COUNT(*) FROM books WHERE status != 'removed'",
                [],
                |row| row.get(0),
            )?)
        })
    }
}
