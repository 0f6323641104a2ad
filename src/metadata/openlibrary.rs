//! Open Library provider.
//!
//! ISBN lookups use the books API (`jscmd=data`), which resolves author names and cover
//! URLs in a single request. Without an ISBN the search API is queried by title and
//! author and the top hit is taken.

use super::{BookMetadata, LookupCriteria, MetadataProvider, RemoteClient, normalize_isbn};
use crate::config::MetadataConfig;
use crate::error::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;

const COVERS_URL: &str = "https://covers.openlibrary.org/b/id";

#[derive(Debug, Deserialize)]
struct Named {
    name: String,
}

#[derive(Debug, Deserialize)]
struct CoverLinks {
    large: Option<String>,
    medium: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BookData {
    title: Option<String>,
    #[serde(default)]
    authors: Vec<Named>,
    #[serde(default)]
    publishers: Vec<Named>,
    publish_date: Option<String>,
    cover: Option<CoverLinks>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    docs: Vec<SearchDoc>,
}

#[derive(Debug, Deserialize)]
struct SearchDoc {
    title: Option<String>,
    #[serde(default)]
    author_name: Vec<String>,
    #[serde(default)]
    isbn: Vec<String>,
    #[serde(default)]
    publisher: Vec<String>,
    #[serde(default)]
    language: Vec<String>,
    first_publish_year: Option<i32>,
    cover_i: Option<i64>,
}

impl From<BookData> for BookMetadata {
    fn from(data: BookData) -> Self {
        BookMetadata {
            title: data.title,
            author: data.authors.into_iter().next().map(|a| a.name),
            publisher: data.publishers.into_iter().next().map(|p| p.name),
            published: data.publish_date,
            cover_ref: data.cover.and_then(|c| c.large.or(c.medium)),
            ..Default::default()
        }
    }
}

impl From<SearchDoc> for BookMetadata {
    fn from(doc: SearchDoc) -> Self {
        BookMetadata {
            title: doc.title,
            author: doc.author_name.into_iter().next(),
            isbn: doc
                .isbn
                .iter()
                .find(|i| i.len() == 13)
                .or(doc.isbn.first())
                .cloned(),
            publisher: doc.publisher.into_iter().next(),
            language: doc.language.into_iter().next(),
            published: doc.first_publish_year.map(|y| y.to_string()),
            cover_ref: doc.cover_i.map(|id| format!("{}/{}-L.jpg", COVERS_URL, id)),
            ..Default::default()
        }
    }
}

/// Provider A: Open Library.
pub struct OpenLibraryProvider {
    client: RemoteClient,
    base_url: String,
}

impl OpenLibraryProvider {
    /// Create a provider from the metadata settings.
    pub fn new(config: &MetadataConfig) -> Result<Self> {
        Ok(Self {
            client: RemoteClient::new(config.timeout(), config.min_request_interval())?,
            base_url: config.open_library_url.trim_end_matches('/').to_string(),
        })
    }

    async fn by_isbn(&self, isbn: &str) -> Result<Option<BookMetadata>> {
        let key = format!("ISBN:{}", normalize_isbn(isbn));
        let url = format!("{}/api/books", self.base_url);
        let response: Option<HashMap<String, BookData>> = self
            .client
            .get_json(
                &url,
                &[("bibkeys", key.as_str()), ("format", "json"), ("jscmd", "data")],
            )
            .await?;

        Ok(response
            .and_then(|mut books| books.remove(&key))
            .map(|data| {
                let mut meta = BookMetadata::from(data);
                meta.isbn = Some(normalize_isbn(isbn));
                meta.normalized()
            }))
    }

    async fn by_search(&self, title: &str, author: Option<&str>) -> Result<Option<BookMetadata>> {
        let url = format!("{}/search.json", self.base_url);
        let mut query = vec![("title", title), ("limit", "1")];
        if let Some(author) = author {
            query.push(("author", author));
        }
        let response: Option<SearchResponse> = self.client.get_json(&url, &query).await?;

        Ok(response
            .and_then(|r| r.docs.into_iter().next())
            .map(|doc| BookMetadata::from(doc).normalized()))
    }
}

#[async_trait]
impl MetadataProvider for OpenLibraryProvider {
    fn name(&self) -> &'static str {
        "openlibrary"
    }

    async fn lookup(&self, criteria: &LookupCriteria) -> Result<Option<BookMetadata>> {
        if let Some(isbn) = criteria.isbn.as_deref()
            && let Some(meta) = self.by_isbn(isbn).await?
        {
            return Ok(Some(meta));
        }

        match criteria.title.as_deref() {
            Some(title) => self.by_search(title, criteria.author.as_deref()).await,
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn books_api_payload_maps_to_metadata() {
        let body = r#"{"ISBN:9780316246620": {
            "title": "Ancillary Justice",
            "authors": [{"name": "Ann Leckie", "url": "x"}],
            "publishers": [{"name": "Orbit"}],
            "publish_date": "2013",
            "cover": {"small": "s.jpg", "medium": "m.jpg", "large": "l.jpg"}
        }}"#;
        let mut parsed: HashMap<String, BookData> = serde_json::from_str(body).unwrap();
        let meta = BookMetadata::from(parsed.remove("ISBN:9780316246620").unwrap());
        assert_eq!(meta.title.as_deref(), Some("Ancillary Justice"));
        assert_eq!(meta.author.as_deref(), Some("Ann Leckie"));
        assert_eq!(meta.publisher.as_deref(), Some("Orbit"));
        assert_eq!(meta.cover_ref.as_deref(), Some("l.jpg"));
    }

    #[test]
    fn search_doc_prefers_isbn13_and_builds_cover_url() {
        let body = r#"{"numFound": 1, "docs": [{
            "title": "Dune",
            "author_name": ["Frank Herbert"],
            "isbn": ["0441013597", "9780441013593"],
            "first_publish_year": 1965,
            "cover_i": 11481354
        }]}"#;
        let parsed: SearchResponse = serde_json::from_str(body).unwrap();
        let meta = BookMetadata::from(parsed.docs.into_iter().next().unwrap());
        assert_eq!(meta.isbn.as_deref(), Some("9780441013593"));
        assert_eq!(meta.published.as_deref(), Some("1965"));
        assert_eq!(
            meta.cover_ref.as_deref(),
            Some("https://covers.openlibrary.org/b/id/11481354-L.jpg")
        );
    }
}
