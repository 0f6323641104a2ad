use super::{BookMetadata, LookupCriteria, MetadataProvider, RemoteClient, normalize_isbn};
use crate::config::MetadataConfig;
use crate::error::Result;
use async_trait::async_trait;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct VolumesResponse {
    #[serde(default)]
    items: Vec<Volume>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Volume {
    volume_info: VolumeInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VolumeInfo {
    title: Option<String>,
    #[serde(default)]
    authors: Vec<String>,
    publisher: Option<String>,
    published_date: Option<String>,
    description: Option<String>,
    language: Option<String>,
    #[serde(default)]
    industry_identifiers: Vec<IndustryIdentifier>,
    image_links: Option<ImageLinks>,
}

#[derive(Debug, Deserialize)]
struct IndustryIdentifier {
    #[serde(rename = "type")]
    kind: String,
    identifier: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageLinks {
    thumbnail: Option<String>,
    small_thumbnail: Option<String>,
}

impl From<VolumeInfo> for BookMetadata {
    fn from(info: VolumeInfo) -> Self {
        let isbn = ["ISBN_13", "ISBN_10"].iter().find_map(|kind| {
            info.industry_identifiers
                .iter()
                .find(|id| id.kind == *kind)
                .map(|id| id.identifier.clone())
        });
        let cover_ref = info
            .image_links
            .and_then(|links| links.thumbnail.or(links.small_thumbnail))
            .map(|url| url.replacen("http://", "https://", 1));

        BookMetadata {
            title: info.title,
            author: info.authors.into_iter().next(),
            isbn,
            cover_ref,
            description: info.description,
            publisher: info.publisher,
            language: info.language,
            published: info.published_date,
            ..Default::default()
        }
    }
}

/// Provider B: Google Books volumes search.
pub struct GoogleBooksProvider {
    client: RemoteClient,
    base_url: String,
    api_key: Option<String>,
}

impl GoogleBooksProvider {
    /// Create a provider from the metadata settings.
    pub fn new(config: &MetadataConfig) -> Result<Self> {
        Ok(Self {
            client: RemoteClient::new(config.timeout(), config.min_request_interval())?,
            base_url: config.google_books_url.trim_end_matches('/').to_string(),
            api_key: config
                .google_books_api_key
                .clone()
                .filter(|k| !k.trim().is_empty()),
        })
    }

    fn query_for(criteria: &LookupCriteria) -> Option<String> {
        if let Some(isbn) = criteria.isbn.as_deref() {
            return Some(format!("isbn:{}", normalize_isbn(isbn)));
        }
        let title = criteria.title.as_deref()?;
        Some(match criteria.author.as_deref() {
            Some(author) => format!("intitle:{} inauthor:{}", title, author),
            None => format!("intitle:{}", title),
        })
    }
}

#[async_trait]
impl MetadataProvider for GoogleBooksProvider {
    fn name(&self) -> &'static str {
        "googlebooks"
    }

    async fn lookup(&self, criteria: &LookupCriteria) -> Result<Option<BookMetadata>> {
        let Some(q) = Self::query_for(criteria) else {
            return Ok(None);
        };
        let url = format!("{}/volumes", self.base_url);
        let mut query = vec![("q", q.as_str()), ("maxResults", "1"), ("printType", "books")];
        if let Some(key) = self.api_key.as_deref() {
            query.push(("key", key));
        }

        let response: Option<VolumesResponse> = self.client.get_json(&url, &query).await?;
        Ok(response
            .and_then(|r| r.items.into_iter().next())
            .map(|v| BookMetadata::from(v.volume_info).normalized())
            .filter(|m| !m.is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BookFormat;
    use std::path::PathBuf;

    #[test]
    fn volume_maps_to_metadata() {
        let body = r#"{"totalItems": 1, "items": [{"volumeInfo": {
            "title": "Leviathan Wakes",
            "authors": ["James S. A. Corey"],
            "publishedDate": "2011-06-15",
            "industryIdentifiers": [
                {"type": "ISBN_10", "identifier": "0316129089"},
                {"type": "ISBN_13", "identifier": "9780316129084"}
            ],
            "imageLinks": {"thumbnail": "http://books.google.com/cover?id=1"}
        }}]}"#;
        let parsed: VolumesResponse = serde_json::from_str(body).unwrap();
        let meta = BookMetadata::from(parsed.items.into_iter().next().unwrap().volume_info);
        assert_eq!(meta.author.as_deref(), Some("James S. A. Corey"));
        assert_eq!(meta.isbn.as_deref(), Some("9780316129084"));
        assert_eq!(
            meta.cover_ref.as_deref(),
            Some("https://books.google.com/cover?id=1")
        );
    }

    #[test]
    fn query_prefers_isbn() {
        let mut criteria = LookupCriteria {
            isbn: Some("978-0-316-12908-4".into()),
            title: Some("Leviathan Wakes".into()),
            author: None,
            path: PathBuf::from("/books/a.epub"),
            format: BookFormat::Epub,
        };
        assert_eq!(
            GoogleBooksProvider::query_for(&criteria).as_deref(),
            Some("isbn:9780316129084")
        );
        criteria.isbn = None;
        assert_eq!(
            GoogleBooksProvider::query_for(&criteria).as_deref(),
            Some("intitle:Leviathan Wakes")
        );
    }
}
