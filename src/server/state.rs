//! Application state shared across handlers.

use crate::config::Config;
use crate::db::{Book, Database};
use crate::error::{AppError, Result};
use crate::formats::{self, CoverImage, EMBEDDED_COVER_PREFIX};
use crate::jobs::JobQueue;
use crate::server::proxy::StoreProxy;
use crate::sync::SyncReconciler;
use axum::http::{HeaderMap, header};
use std::path::PathBuf;
use std::sync::Arc;

/// Where a cover comes from.
#[derive(Debug, Clone)]
pub enum CoverSource {
    /// Remote image the device should fetch itself.
    Remote(String),
    /// Image bytes served directly.
    Image(CoverImage),
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<Config>,
    /// Database connection.
    pub db: Database,
    /// Job queue (operator API and rescans).
    pub queue: JobQueue,
    /// Device sync reconciler.
    pub sync: SyncReconciler,
    /// Kobo store client; `None` when passthrough is disabled.
    pub store: Option<StoreProxy>,
    /// Watched library roots.
    roots: Arc<Vec<PathBuf>>,
}

impl AppState {
    /// Create application state.
    pub fn new(config: Config, queue: JobQueue, roots: Vec<PathBuf>) -> Result<Self> {
        let db = queue.db().clone();
        let sync = SyncReconciler::new(
            db.clone(),
            config.auth.token.clone().unwrap_or_default(),
            config.sync.page_size,
        );
        let store = if config.store.enabled {
            tracing::info!(url = %config.store.api_url, "Kobo store passthrough enabled");
            Some(StoreProxy::new(&config.store)?)
        } else {
            None
        };
        Ok(Self {
            config: Arc::new(config),
            db,
            queue,
            sync,
            store,
            roots: Arc::new(roots),
        })
    }

    /// Watched library roots.
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Base URL for generated links: `server.public_url`, else the request `Host`.
    pub fn base_url(&self, headers: &HeaderMap) -> String {
        if let Some(url) = &self.config.server.public_url {
            return url.trim_end_matches('/').to_string();
        }
        let host = headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| self.config.server.bind.to_string());
        format!("http://{}", host)
    }

    /// Check the operator bearer token.
    pub fn authorize_operator(&self, headers: &HeaderMap) -> Result<()> {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(AppError::Unauthorized)?;
        self.sync.authenticate(token.trim())
    }

    /// Live book by id.
    pub fn live_book(&self, id: &str) -> Result<Book> {
        self.db
            .get_book(id)?
            .filter(|b| !b.is_removed())
            .ok_or_else(|| AppError::NotFound(format!("Book not found: {}", id)))
    }

    /// Get path to cached cover file, keyed by content so a rewritten file misses.
    fn cover_cache_path(&self, book: &Book) -> PathBuf {
        let short_hash = book.content_hash.get(..16).unwrap_or(&book.content_hash);
        self.config
            .library
            .covers_dir()
            .join(format!("{}-{}", book.id, short_hash))
    }

    /// Resolve the cover for a book, extracting and caching embedded images.
    pub async fn cover(&self, book: &Book) -> Result<Option<CoverSource>> {
        let Some(cover_ref) = book.cover_ref.clone() else {
            return Ok(None);
        };

        let Some(href) = cover_ref.strip_prefix(EMBEDDED_COVER_PREFIX) else {
            if cover_ref.starts_with("http://") || cover_ref.starts_with("https://") {
                return Ok(Some(CoverSource::Remote(cover_ref)));
            }
            tracing::debug!(book_id = %book.id, cover = %cover_ref, "Unrecognized cover reference");
            return Ok(None);
        };

        let cache_path = self.cover_cache_path(book);
        let href = href.to_string();
        let source = book.primary_path.clone();
        let format = book.format;

        let image = tokio::task::spawn_blocking(move || -> Result<Option<CoverImage>> {
            if let Ok(data) = std::fs::read(&cache_path) {
                return Ok(Some(CoverImage::from_bytes(data)));
            }

            let Some(cover) = formats::get_handler(format).extract_cover(&source, &href)? else {
                return Ok(None);
            };

            if let Some(parent) = cache_path.parent()
                && let Err(e) = std::fs::create_dir_all(parent)
            {
                tracing::debug!(path = %parent.display(), error = %e, "Failed to create cover cache");
            } else if let Err(e) = std::fs::write(&cache_path, &cover.data) {
                tracing::debug!(path = %cache_path.display(), error = %e, "Failed to cache cover");
            }
            Ok(Some(cover))
        })
        .await
        .map_err(|e| AppError::Internal(format!("cover task failed: {}", e)))??;

        Ok(image.map(CoverSource::Image))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BookFormat, WorkerConfig};
    use crate::db::NewFile;
    use std::io::Write;

    const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10];

    fn epub_with_cover(path: &std::path::Path) {
        let mut zip = zip::ZipWriter::new(std::fs::File::create(path).unwrap());
        zip.start_file("OEBPS/cover.jpg", zip::write::SimpleFileOptions::default())
            .unwrap();
        zip.write_all(JPEG).unwrap();
        zip.finish().unwrap();
    }

    fn state_with_data_dir(data_dir: PathBuf) -> AppState {
        let mut config = Config::default();
        config.store.enabled = false;
        config.library.data_dir = data_dir;
        let queue = JobQueue::new(Database::open_memory().unwrap(), WorkerConfig::default());
        AppState::new(config, queue, Vec::new()).unwrap()
    }

    fn book_at(path: PathBuf) -> Book {
        let mut book = Book::discovered(&NewFile {
            path,
            content_hash: "0123456789abcdef0123".into(),
            file_size: 1,
            format: BookFormat::Epub,
        });
        book.cover_ref = Some(format!("{}OEBPS/cover.jpg", EMBEDDED_COVER_PREFIX));
        book
    }

    #[tokio::test]
    async fn embedded_cover_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        let epub = dir.path().join("book.epub");
        epub_with_cover(&epub);
        let state = state_with_data_dir(dir.path().join("data"));
        let book = book_at(epub);

        let Some(CoverSource::Image(image)) = state.cover(&book).await.unwrap() else {
            panic!("expected an embedded cover");
        };
        assert_eq!(image.data, JPEG);
        assert_eq!(image.mime_type, "image/jpeg");
        assert!(state.cover_cache_path(&book).exists());
    }

    #[tokio::test]
    async fn cover_is_served_when_cache_is_unwritable() {
        let dir = tempfile::tempdir().unwrap();
        let epub = dir.path().join("book.epub");
        epub_with_cover(&epub);
        // A file where the data directory should be
        let blocked = dir.path().join("data");
        std::fs::write(&blocked, b"not a directory").unwrap();
        let state = state_with_data_dir(blocked);
        let book = book_at(epub);

        let Some(CoverSource::Image(image)) = state.cover(&book).await.unwrap() else {
            panic!("expected an embedded cover");
        };
        assert_eq!(image.data, JPEG);
        assert!(!state.cover_cache_path(&book).exists());
    }
}
