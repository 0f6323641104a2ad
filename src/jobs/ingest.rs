use super::Pipeline;
use crate::config::BookFormat;
use crate::db::{Book, IngestOutcome, JobType, NewFile};
use crate::error::{AppError, Result};
use crate::hashing;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Size and modification time, compared around hashing.
#[derive(Debug, PartialEq, Eq)]
struct FileStamp {
    len: u64,
    modified: Option<SystemTime>,
}

impl FileStamp {
    async fn read(path: &Path) -> Result<Self> {
        let meta = tokio::fs::metadata(path).await?;
        Ok(Self {
            len: meta.len(),
            modified: meta.modified().ok(),
        })
    }
}

impl Pipeline {
    /// INGEST: reconcile the catalog with whatever is at `target` right now.
    pub(crate) async fn ingest(&self, target: &str) -> Result<()> {
        let path = PathBuf::from(target);
        let db = self.queue.db();

        if !tokio::fs::try_exists(&path).await? {
            if let Some(book) = db.mark_removed_at_path(&path)? {
                tracing::info!(
                    book_id = %book.id,
                    path = %path.display(),
                    revision = book.revision,
                    "Book removed"
                );
            } else {
                tracing::debug!(path = %path.display(), "Missing file was not a known book");
            }
            return Ok(());
        }

        let Some(format) = BookFormat::from_path(&path) else {
            tracing::debug!(path = %path.display(), "Ignoring unsupported file");
            return Ok(());
        };
        if self.is_artifact(&path) {
            tracing::debug!(path = %path.display(), "Ignoring converted artifact");
            return Ok(());
        }

        // A copy still in progress must not be recorded; the retry hashes the final bytes
        let before = FileStamp::read(&path).await?;
        let hash_path = path.clone();
        let id = tokio::task::spawn_blocking(move || hashing::identify_file(&hash_path))
            .await
            .map_err(|e| AppError::Internal(format!("hash task failed: {}", e)))??;
        let after = FileStamp::read(&path).await?;
        if before != after || after.len != id.size {
            return Err(AppError::FileChanged(path.display().to_string()));
        }

        let file = NewFile {
            path: path.clone(),
            content_hash: id.hash,
            file_size: i64::try_from(id.size)
                .map_err(|_| AppError::InvalidFormat("file too large".into()))?,
            format,
        };
        let outcome = db.ingest_file(&file)?;

        match &outcome {
            IngestOutcome::Created(book) => {
                tracing::info!(book_id = %book.id, path = %path.display(), revision = book.revision, "Book created");
            }
            IngestOutcome::Moved { book, from } => {
                tracing::info!(
                    book_id = %book.id,
                    from = %from.display(),
                    to = %path.display(),
                    revision = book.revision,
                    "Book moved"
                );
            }
            IngestOutcome::Revived(book) => {
                tracing::info!(book_id = %book.id, path = %path.display(), revision = book.revision, "Book revived");
            }
            IngestOutcome::ContentChanged(book) => {
                tracing::info!(book_id = %book.id, path = %path.display(), revision = book.revision, "Book content changed");
            }
            IngestOutcome::Unchanged(book) => {
                tracing::debug!(book_id = %book.id, path = %path.display(), "Book unchanged");
            }
        }

        if outcome.needs_processing() {
            self.schedule_processing(outcome.book(), true)?;
        } else if let IngestOutcome::Revived(book) = &outcome {
            self.schedule_processing(book, book.title.is_none())?;
        }
        Ok(())
    }

    /// Enqueue enrichment (when asked) and any conversion the book still lacks.
    fn schedule_processing(&self, book: &Book, enrich: bool) -> Result<()> {
        if enrich {
            self.queue.enqueue(JobType::Metadata, &book.id)?;
        }
        let converted = book.converted_path.as_deref().is_some_and(Path::exists);
        if self.conversion.enabled && book.format.is_convertible() && !converted {
            self.queue.enqueue(JobType::Convert, &book.id)?;
        }
        Ok(())
    }

    /// Whether a path lives in the converted-artifact directory.
    fn is_artifact(&self, path: &Path) -> bool {
        path.starts_with(self.library.kepub_dir())
    }
}
