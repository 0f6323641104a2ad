use super::{CoverImage, FormatHandler};
use crate::error::{AppError, Result};
use crate::metadata::BookMetadata;
use lopdf::Document;
use std::path::Path;

/// Handler for PDF files.
pub struct PdfHandler;

impl PdfHandler {
    /// Extract text content from a PDF info dictionary value.
    fn extract_text(obj: &lopdf::Object) -> Option<String> {
        let text = match obj {
            lopdf::Object::String(bytes, _) => {
                if bytes.starts_with(&[0xFE, 0xFF]) {
                    let utf16: Vec<u16> = bytes[2..]
                        .chunks(2)
                        .map(|chunk| {
                            u16::from_be_bytes([chunk[0], chunk.get(1).copied().unwrap_or(0)])
                        })
                        .collect();
                    String::from_utf16(&utf16).ok()
                } else {
                    // UTF-8, else Latin-1
                    Some(
                        String::from_utf8(bytes.clone())
                            .unwrap_or_else(|_| bytes.iter().map(|&b| b as char).collect()),
                    )
                }
            }
            lopdf::Object::Name(name) => String::from_utf8(name.clone()).ok(),
            _ => None,
        }?;
        let trimmed = text.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }

    fn info_field(info: &lopdf::Dictionary, key: &[u8]) -> Option<String> {
        info.get(key).ok().and_then(Self::extract_text)
    }
}

impl FormatHandler for PdfHandler {
    fn extract_metadata(&self, path: &Path) -> Result<BookMetadata> {
        let doc = Document::load(path).map_err(|e| AppError::Pdf(e.to_string()))?;
        let mut meta = BookMetadata::default();

        if let Ok(info_ref) = doc.trailer.get(b"Info").and_then(|o| o.as_reference())
            && let Ok(info) = doc.get_dictionary(info_ref)
        {
            meta.title = Self::info_field(info, b"Title");
            meta.author = Self::info_field(info, b"Author");
            meta.description = Self::info_field(info, b"Subject");
        }

        Ok(meta)
    }

    fn extract_cover(&self, _path: &Path, _href: &str) -> Result<Option<CoverImage>> {
        // Covers are never recorded as embedded for PDFs
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::Object;

    #[test]
    fn decodes_utf16_info_strings() {
        let obj = Object::String(
            vec![0xFE, 0xFF, 0x00, b'H', 0x00, b'i'],
            lopdf::StringFormat::Literal,
        );
        assert_eq!(PdfHandler::extract_text(&obj).as_deref(), Some("Hi"));
    }

    #[test]
    fn blank_info_strings_are_absent() {
        let obj = Object::String(b"   ".to_vec(), lopdf::StringFormat::Literal);
        assert!(PdfHandler::extract_text(&obj).is_none());
    }

    #[test]
    fn latin1_fallback() {
        let mut bytes = vec![b'C', 0xE9];
        bytes.extend_from_slice(b"line");
        let obj = Object::String(bytes, lopdf::StringFormat::Literal);
        assert_eq!(PdfHandler::extract_text(&obj).as_deref(), Some("Céline"));
    }
}
