use super::{BookMetadata, LookupCriteria, MetadataProvider};
use crate::error::Result;
use async_trait::async_trait;
use std::path::Path;

/// Last-resort provider that splits the file name into author and title.
pub struct FilenameProvider;

impl FilenameProvider {
    /// Parse `Author - Title`, `Title_Author`, or fall back to the whole stem as title.
    pub fn parse(path: &Path) -> BookMetadata {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        let split = name.len().saturating_sub(".kepub.epub".len());
        let stem = match (name.get(..split), name.get(split..)) {
            (Some(stem), Some(ext)) if ext.eq_ignore_ascii_case(".kepub.epub") => stem,
            _ => path.file_stem().and_then(|s| s.to_str()).unwrap_or(name),
        };

        if let Some((author, title)) = stem.split_once(" - ")
            && !author.trim().is_empty()
            && !title.trim().is_empty()
        {
            return BookMetadata {
                title: Some(title.trim().to_string()),
                author: Some(author.trim().to_string()),
                ..Default::default()
            }
            .normalized();
        }

        if !stem.contains(' ')
            && let Some((title, author)) = stem.split_once('_')
            && !title.is_empty()
            && !author.is_empty()
        {
            return BookMetadata {
                title: Some(title.replace('_', " ")),
                author: Some(author.replace('_', " ")),
                ..Default::default()
            }
            .normalized();
        }

        BookMetadata {
            title: Some(stem.to_string()),
            ..Default::default()
        }
        .normalized()
    }
}

#[async_trait]
impl MetadataProvider for FilenameProvider {
    fn name(&self) -> &'static str {
        "filename"
    }

    fn is_remote(&self) -> bool {
        false
    }

    async fn lookup(&self, criteria: &LookupCriteria) -> Result<Option<BookMetadata>> {
        let meta = Self::parse(&criteria.path);
        Ok((!meta.is_empty()).then_some(meta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn author_dash_title() {
        let meta = FilenameProvider::parse(Path::new("/books/Ann Leckie - Ancillary Justice.epub"));
        assert_eq!(meta.author.as_deref(), Some("Ann Leckie"));
        assert_eq!(meta.title.as_deref(), Some("Ancillary Justice"));
    }

    #[test]
    fn title_underscore_author() {
        let meta = FilenameProvider::parse(Path::new("/books/Dune_Herbert.pdf"));
        assert_eq!(meta.title.as_deref(), Some("Dune"));
        assert_eq!(meta.author.as_deref(), Some("Herbert"));
    }

    #[test]
    fn kepub_suffix_is_stripped() {
        let meta = FilenameProvider::parse(Path::new("/books/Some Book.kepub.epub"));
        assert_eq!(meta.title.as_deref(), Some("Some Book"));
        assert!(meta.author.is_none());
    }

    #[test]
    fn never_empty() {
        let meta = FilenameProvider::parse(Path::new("/books/x.epub"));
        assert_eq!(meta.title.as_deref(), Some("x"));
    }
}
