mod epub;
mod pdf;

pub use epub::EpubHandler;
pub use pdf::PdfHandler;

use crate::config::BookFormat;
use crate::error::Result;
use crate::metadata::BookMetadata;
use std::path::Path;

/// Prefix of cover references that point inside the book file itself.
pub const EMBEDDED_COVER_PREFIX: &str = "embedded:";

/// Cover image bytes with their MIME type.
#[derive(Debug, Clone)]
pub struct CoverImage {
    /// Raw image bytes.
    pub data: Vec<u8>,
    /// MIME type sniffed from the bytes.
    pub mime_type: &'static str,
}

impl CoverImage {
    /// Wrap raw bytes, sniffing JPEG, PNG and GIF signatures.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        let mime_type = if data.starts_with(&[0x89, b'P', b'N', b'G']) {
            "image/png"
        } else if data.starts_with(b"GIF8") {
            "image/gif"
        } else {
            "image/jpeg"
        };
        Self { data, mime_type }
    }
}

/// Trait for format-specific metadata readers.
pub trait FormatHandler: Send + Sync {
    /// Read the metadata stored inside the file.
    fn extract_metadata(&self, path: &Path) -> Result<BookMetadata>;

    /// Extract the cover named by an `embedded:` reference.
    fn extract_cover(&self, path: &Path, href: &str) -> Result<Option<CoverImage>>;
}

/// Get the appropriate handler for a book format.
pub fn get_handler(format: BookFormat) -> Box<dyn FormatHandler> {
    match format {
        BookFormat::Epub | BookFormat::Kepub => Box::new(EpubHandler),
        BookFormat::Pdf => Box::new(PdfHandler),
        _ => Box::new(MinimalHandler),
    }
}

/// Handler for formats without embedded metadata support.
struct MinimalHandler;

impl FormatHandler for MinimalHandler {
    fn extract_metadata(&self, _path: &Path) -> Result<BookMetadata> {
        Ok(BookMetadata::default())
    }

    fn extract_cover(&self, _path: &Path, _href: &str) -> Result<Option<CoverImage>> {
        Ok(None)
    }
}
