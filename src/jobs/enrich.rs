use super::Pipeline;
use crate::db::BookStatus;
use crate::error::{AppError, Result};
use crate::metadata::LookupCriteria;

impl Pipeline {
    /// METADATA: run the waterfall for a book and merge the result.
    ///
    /// Running out of providers is not an error; the book keeps whatever was found.
    pub(crate) async fn enrich(&self, book_id: &str) -> Result<()> {
        let db = self.queue.db();
        let Some(book) = db.get_book(book_id)? else {
            tracing::debug!(book_id = %book_id, "Book no longer exists, skipping enrichment");
            return Ok(());
        };
        if book.is_removed() {
            tracing::debug!(book_id = %book_id, "Book removed, skipping enrichment");
            return Ok(());
        }

        db.update_book(book_id, |b| {
            if !b.is_removed() {
                b.status = BookStatus::Enriching;
            }
        })?;

        let started_hash = book.content_hash.clone();
        let outcome = self.waterfall.run(LookupCriteria::for_book(&book)).await;

        let mut stale = false;
        let updated = db.update_book(book_id, |b| {
            if b.is_removed() {
                return;
            }
            if b.content_hash != started_hash {
                stale = true;
                return;
            }
            outcome.metadata.apply_to(b);
            b.status = BookStatus::Ready;
        })?;

        if stale {
            return Err(AppError::Internal(
                "book content changed during enrichment".into(),
            ));
        }
        if let Some(book) = updated {
            tracing::info!(
                book_id = %book.id,
                title = %book.display_title(),
                sources = ?outcome.contributors,
                failed = ?outcome.failed,
                revision = book.revision,
                "Metadata enriched"
            );
        }
        Ok(())
    }
}
