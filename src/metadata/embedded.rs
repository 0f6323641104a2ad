use super::{BookMetadata, LookupCriteria, MetadataProvider};
use crate::error::{AppError, Result};
use crate::formats;
use async_trait::async_trait;

/// Reads metadata stored inside the book file. No network access.
pub struct EmbeddedProvider;

#[async_trait]
impl MetadataProvider for EmbeddedProvider {
    fn name(&self) -> &'static str {
        "embedded"
    }

    fn is_remote(&self) -> bool {
        false
    }

    async fn lookup(&self, criteria: &LookupCriteria) -> Result<Option<BookMetadata>> {
        let path = criteria.path.clone();
        let format = criteria.format;
        let meta = tokio::task::spawn_blocking(move || {
            formats::get_handler(format).extract_metadata(&path)
        })
        .await
        .map_err(|e| AppError::Internal(format!("metadata task failed: {}", e)))??;

        Ok((!meta.is_empty()).then_some(meta))
    }
}
