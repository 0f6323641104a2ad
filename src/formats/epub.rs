//! EPUB format handler.

use super::{CoverImage, EMBEDDED_COVER_PREFIX, FormatHandler};
use crate::error::{AppError, Result};
use crate::metadata::{BookMetadata, looks_like_isbn, normalize_isbn};
use roxmltree::Document;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use zip::ZipArchive;

/// Handler for EPUB and kepub files.
pub struct EpubHandler;

fn node_text(node: roxmltree::Node<'_, '_>) -> Option<String> {
    node.text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
}

/// Join an OPF-relative href onto the OPF's directory inside the archive.
fn archive_path(opf_dir: &str, href: &str) -> String {
    let href = urlencoding::decode(href)
        .map(|h| h.into_owned())
        .unwrap_or_else(|_| href.to_string());
    if opf_dir.is_empty() {
        href
    } else {
        format!("{}/{}", opf_dir.trim_end_matches('/'), href)
    }
}

impl EpubHandler {
    /// Find the OPF file path from container.xml.
    fn find_opf_path(archive: &mut ZipArchive<File>) -> Result<String> {
        let mut container = archive.by_name("META-INF/container.xml")?;
        let mut content = String::new();
        container.read_to_string(&mut content)?;

        let doc = Document::parse(&content)?;

        doc.descendants()
            .find(|n| n.has_tag_name("rootfile"))
            .and_then(|n| n.attribute("full-path"))
            .map(String::from)
            .ok_or_else(|| AppError::InvalidFormat("No rootfile in container.xml".into()))
    }

    /// Parse OPF metadata. The cover, if any, is returned as an archive-relative path.
    fn parse_opf(content: &str, opf_dir: &str) -> Result<BookMetadata> {
        let doc = Document::parse(content)?;
        let mut meta = BookMetadata::default();
        let mut cover_id: Option<String> = None;

        for node in doc.descendants() {
            match node.tag_name().name() {
                "title" if meta.title.is_none() => meta.title = node_text(node),
                "creator" if meta.author.is_none() => meta.author = node_text(node),
                "description" if meta.description.is_none() => {
                    meta.description = node_text(node)
                }
                "publisher" if meta.publisher.is_none() => meta.publisher = node_text(node),
                "language" if meta.language.is_none() => meta.language = node_text(node),
                "date" if meta.published.is_none() => meta.published = node_text(node),
                "identifier" if meta.isbn.is_none() => {
                    let scheme_isbn = node
                        .attributes()
                        .any(|a| a.name() == "scheme" && a.value().eq_ignore_ascii_case("isbn"));
                    if let Some(text) = node_text(node)
                        && (scheme_isbn || looks_like_isbn(&text))
                    {
                        meta.isbn = Some(normalize_isbn(&text));
                    }
                }
                "meta" => match node.attribute("name") {
                    Some("cover") => cover_id = node.attribute("content").map(String::from),
                    Some("calibre:series") => {
                        meta.series = node.attribute("content").map(String::from)
                    }
                    Some("calibre:series_index") => {
                        meta.series_index = node.attribute("content").and_then(|i| i.parse().ok())
                    }
                    _ => {}
                },
                _ => {}
            }
        }

        let items: Vec<_> = doc
            .descendants()
            .filter(|n| n.tag_name().name() == "item")
            .collect();

        // EPUB 2 cover meta, then EPUB 3 cover-image property, then a name guess
        let cover_href = cover_id
            .as_deref()
            .and_then(|id| items.iter().find(|n| n.attribute("id") == Some(id)))
            .or_else(|| {
                items.iter().find(|n| {
                    n.attribute("properties")
                        .is_some_and(|p| p.split_whitespace().any(|p| p == "cover-image"))
                })
            })
            .or_else(|| {
                items.iter().find(|n| {
                    n.attribute("href").is_some_and(|href| {
                        let lower = href.to_lowercase();
                        lower.contains("cover")
                            && (lower.ends_with(".jpg")
                                || lower.ends_with(".jpeg")
                                || lower.ends_with(".png"))
                    })
                })
            })
            .and_then(|n| n.attribute("href"));

        meta.cover_ref =
            cover_href.map(|href| format!("{}{}", EMBEDDED_COVER_PREFIX, archive_path(opf_dir, href)));

        Ok(meta.normalized())
    }
}

impl FormatHandler for EpubHandler {
    fn extract_metadata(&self, path: &Path) -> Result<BookMetadata> {
        let file = File::open(path)?;
        let mut archive = ZipArchive::new(file)?;

        let opf_path = Self::find_opf_path(&mut archive)?;
        let opf_dir = opf_path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");

        let mut opf_content = String::new();
        archive
            .by_name(&opf_path)?
            .read_to_string(&mut opf_content)?;

        Self::parse_opf(&opf_content, opf_dir)
    }

    fn extract_cover(&self, path: &Path, href: &str) -> Result<Option<CoverImage>> {
        let file = File::open(path)?;
        let mut archive = ZipArchive::new(file)?;

        let mut entry = match archive.by_name(href) {
            Ok(entry) => entry,
            Err(zip::result::ZipError::FileNotFound) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;

        Ok(Some(CoverImage::from_bytes(data)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OPF: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="2.0">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/" xmlns:opf="http://www.idpf.org/2007/opf">
    <dc:title>Ancillary Justice</dc:title>
    <dc:creator>Ann Leckie</dc:creator>
    <dc:identifier opf:scheme="uuid">urn:uuid:0d7b9a6e</dc:identifier>
    <dc:identifier opf:scheme="ISBN">978-0-316-24662-0</dc:identifier>
    <dc:language>en</dc:language>
    <meta name="calibre:series" content="Imperial Radch"/>
    <meta name="calibre:series_index" content="1.0"/>
    <meta name="cover" content="cover-img"/>
  </metadata>
  <manifest>
    <item id="cover-img" href="images/cover%20art.jpg" media-type="image/jpeg"/>
  </manifest>
</package>"#;

    #[test]
    fn parses_opf_fields() {
        let meta = EpubHandler::parse_opf(OPF, "OEBPS").unwrap();
        assert_eq!(meta.title.as_deref(), Some("Ancillary Justice"));
        assert_eq!(meta.author.as_deref(), Some("Ann Leckie"));
        assert_eq!(meta.isbn.as_deref(), Some("9780316246620"));
        assert_eq!(meta.language.as_deref(), Some("en"));
        assert_eq!(meta.series.as_deref(), Some("Imperial Radch"));
        assert_eq!(meta.series_index, Some(1.0));
        assert_eq!(
            meta.cover_ref.as_deref(),
            Some("embedded:OEBPS/images/cover art.jpg")
        );
    }

    #[test]
    fn opf_without_cover_meta_uses_cover_image_property() {
        let opf = r#"<package xmlns="http://www.idpf.org/2007/opf" version="3.0">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/"><dc:title>T</dc:title></metadata>
  <manifest><item id="c" href="c.png" properties="cover-image" media-type="image/png"/></manifest>
</package>"#;
        let meta = EpubHandler::parse_opf(opf, "").unwrap();
        assert_eq!(meta.cover_ref.as_deref(), Some("embedded:c.png"));
        assert!(meta.author.is_none());
    }
}
