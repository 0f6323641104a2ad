use super::Pipeline;
use crate::convert::kepub_output_path;
use crate::error::{AppError, Result};

impl Pipeline {
    /// CONVERT: produce the kepub artifact for a book.
    pub(crate) async fn convert(&self, book_id: &str) -> Result<()> {
        let db = self.queue.db();
        let Some(book) = db.get_book(book_id)? else {
            return Ok(());
        };
        if book.is_removed() {
            tracing::debug!(book_id = %book_id, "Book removed, skipping conversion");
            return Ok(());
        }
        if !self.conversion.enabled || !book.format.is_convertible() {
            tracing::debug!(book_id = %book_id, format = book.format.as_str(), "Conversion not applicable");
            return Ok(());
        }

        let source = book.primary_path.clone();
        let output = kepub_output_path(&self.library.kepub_dir(), &book.id);
        let written = self.converter.convert(&source, &output).await?;

        let mut stale = false;
        let delete_original = self.conversion.delete_original && source != written;
        let updated = db.update_book(book_id, |b| {
            if b.is_removed() || b.content_hash != book.content_hash || b.primary_path != source {
                stale = true;
                return;
            }
            b.converted_path = Some(written.clone());
            if delete_original {
                b.primary_path = written.clone();
            }
        })?;

        if stale {
            if let Err(e) = tokio::fs::remove_file(&written).await {
                tracing::debug!(path = %written.display(), error = %e, "Failed to remove stale kepub");
            }
            return Err(AppError::Conversion(
                "book changed while converting".into(),
            ));
        }

        if delete_original {
            match tokio::fs::remove_file(&source).await {
                Ok(()) => tracing::info!(path = %source.display(), "Deleted original after conversion"),
                Err(e) => tracing::warn!(path = %source.display(), error = %e, "Failed to delete original"),
            }
        }

        if let Some(book) = updated {
            tracing::info!(
                book_id = %book.id,
                output = %written.display(),
                revision = book.revision,
                "Book converted"
            );
        }
        Ok(())
    }
}
