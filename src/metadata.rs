//! Metadata enrichment.
//!
//! Providers share one capability, [`MetadataProvider::lookup`], and are chained by
//! [`Waterfall`] in fixed priority order: embedded document metadata, Open Library,
//! Google Books, then the filename.

mod embedded;
mod filename;
mod googlebooks;
mod openlibrary;
mod waterfall;

pub use embedded::EmbeddedProvider;
pub use filename::FilenameProvider;
pub use googlebooks::GoogleBooksProvider;
pub use openlibrary::OpenLibraryProvider;
pub use waterfall::{Waterfall, WaterfallOutcome};

use crate::config::BookFormat;
use crate::db::Book;
use crate::error::Result;
use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Descriptive fields a provider may supply. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BookMetadata {
    /// Title.
    pub title: Option<String>,
    /// Primary author.
    pub author: Option<String>,
    /// Series name.
    pub series: Option<String>,
    /// Position in series.
    pub series_index: Option<f64>,
    /// ISBN (10 or 13 digits).
    pub isbn: Option<String>,
    /// Cover location: remote URL or `embedded:<href>`.
    pub cover_ref: Option<String>,
    /// Description.
    pub description: Option<String>,
    /// Publisher.
    pub publisher: Option<String>,
    /// Language code.
    pub language: Option<String>,
    /// Publication date.
    pub published: Option<String>,
}

fn fill<T: Clone>(slot: &mut Option<T>, value: &Option<T>) -> bool {
    if slot.is_none() && value.is_some() {
        *slot = value.clone();
        true
    } else {
        false
    }
}

impl BookMetadata {
    /// Whether no field is set.
    pub fn is_empty(&self) -> bool {
        *self == BookMetadata::default()
    }

    /// Whether the fields a device shows most prominently are all known.
    pub fn is_complete(&self) -> bool {
        self.title.is_some() && self.author.is_some() && self.cover_ref.is_some()
    }

    /// Copy fields from a lower-priority result into slots that are still empty.
    ///
    /// Returns the names of the fields that were filled.
    pub fn fill_from(&mut self, other: &BookMetadata) -> Vec<&'static str> {
        let mut filled = Vec::new();
        if fill(&mut self.title, &other.title) {
            filled.push("title");
        }
        if fill(&mut self.author, &other.author) {
            filled.push("author");
        }
        if fill(&mut self.series, &other.series) {
            filled.push("series");
        }
        if fill(&mut self.series_index, &other.series_index) {
            filled.push("series_index");
        }
        if fill(&mut self.isbn, &other.isbn) {
            filled.push("isbn");
        }
        if fill(&mut self.cover_ref, &other.cover_ref) {
            filled.push("cover");
        }
        if fill(&mut self.description, &other.description) {
            filled.push("description");
        }
        if fill(&mut self.publisher, &other.publisher) {
            filled.push("publisher");
        }
        if fill(&mut self.language, &other.language) {
            filled.push("language");
        }
        if fill(&mut self.published, &other.published) {
            filled.push("published");
        }
        filled
    }

    /// Write every known field onto a book, leaving the book's value where this is empty.
    pub fn apply_to(&self, book: &mut Book) {
        fn set<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
            if let Some(v) = value {
                *slot = Some(v.clone());
            }
        }
        set(&mut book.title, &self.title);
        set(&mut book.author, &self.author);
        set(&mut book.series, &self.series);
        set(&mut book.series_index, &self.series_index);
        set(&mut book.isbn, &self.isbn);
        set(&mut book.cover_ref, &self.cover_ref);
        set(&mut book.description, &self.description);
        set(&mut book.publisher, &self.publisher);
        set(&mut book.language, &self.language);
        set(&mut book.published, &self.published);
    }

    /// Drop blank strings so they never count as a value.
    pub fn normalized(mut self) -> Self {
        fn clean(slot: &mut Option<String>) {
            if let Some(s) = slot {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    *slot = None;
                } else if trimmed.len() != s.len() {
                    *slot = Some(trimmed.to_string());
                }
            }
        }
        clean(&mut self.title);
        clean(&mut self.author);
        clean(&mut self.series);
        clean(&mut self.isbn);
        clean(&mut self.cover_ref);
        clean(&mut self.description);
        clean(&mut self.publisher);
        clean(&mut self.language);
        clean(&mut self.published);
        self
    }
}

/// What a provider may search by.
#[derive(Debug, Clone)]
pub struct LookupCriteria {
    /// Known ISBN.
    pub isbn: Option<String>,
    /// Known title.
    pub title: Option<String>,
    /// Known author.
    pub author: Option<String>,
    /// File holding the embedded document metadata.
    pub path: PathBuf,
    /// Format of that file.
    pub format: BookFormat,
}

impl LookupCriteria {
    /// Criteria for a stored book.
    pub fn for_book(book: &Book) -> Self {
        Self {
            isbn: book.isbn.clone(),
            title: book.title.clone(),
            author: book.author.clone(),
            path: book.primary_path.clone(),
            format: book.format,
        }
    }

    /// Take search keys from an earlier result where none are known yet.
    pub fn refine(&mut self, found: &BookMetadata) {
        fill(&mut self.isbn, &found.isbn);
        fill(&mut self.title, &found.title);
        fill(&mut self.author, &found.author);
    }
}

/// A source of book metadata.
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Whether the provider makes network requests.
    fn is_remote(&self) -> bool {
        true
    }

    /// Look up metadata; `Ok(None)` when nothing usable was found.
    async fn lookup(&self, criteria: &LookupCriteria) -> Result<Option<BookMetadata>>;
}

/// Shared HTTP plumbing for remote providers: one client and one rate limiter each.
pub(crate) struct RemoteClient {
    pub(crate) http: reqwest::Client,
    limiter: DefaultDirectRateLimiter,
}

impl RemoteClient {
    pub(crate) fn new(timeout: Duration, min_interval: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("kobold-rs/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let quota = Quota::with_period(min_interval.max(Duration::from_millis(1)))
            .ok_or_else(|| crate::error::AppError::Config("invalid rate limit".into()))?;
        Ok(Self {
            http,
            limiter: RateLimiter::direct(quota),
        })
    }

    /// GET a JSON document after waiting for the rate limiter.
    pub(crate) async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<Option<T>> {
        self.limiter.until_ready().await;
        let response = self.http.get(url).query(query).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = response.error_for_status()?.json::<T>().await?;
        Ok(Some(body))
    }
}

/// Whether a string looks like an ISBN-10 or ISBN-13.
pub fn looks_like_isbn(s: &str) -> bool {
    let digits = normalize_isbn(s);
    let chars: Vec<char> = digits.chars().collect();
    match chars.as_slice() {
        [body @ .., check] if chars.len() == 10 => {
            body.iter().all(char::is_ascii_digit)
                && (check.is_ascii_digit() || matches!(check, 'X' | 'x'))
        }
        all if all.len() == 13 => all.iter().all(char::is_ascii_digit),
        _ => false,
    }
}

/// Strip separators and any `urn:isbn:` prefix.
pub fn normalize_isbn(s: &str) -> String {
    s.trim()
        .trim_start_matches("urn:isbn:")
        .chars()
        .filter(|c| !matches!(c, '-' | ' '))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_from_keeps_existing_values() {
        let mut merged = BookMetadata {
            title: Some("From A".into()),
            ..Default::default()
        };
        let filled = merged.fill_from(&BookMetadata {
            title: Some("From B".into()),
            cover_ref: Some("http://covers/b.jpg".into()),
            ..Default::default()
        });
        assert_eq!(merged.title.as_deref(), Some("From A"));
        assert_eq!(merged.cover_ref.as_deref(), Some("http://covers/b.jpg"));
        assert_eq!(filled, vec!["cover"]);
    }

    #[test]
    fn normalized_drops_blank_strings() {
        let meta = BookMetadata {
            title: Some("  ".into()),
            author: Some(" Ann Leckie ".into()),
            ..Default::default()
        }
        .normalized();
        assert!(meta.title.is_none());
        assert_eq!(meta.author.as_deref(), Some("Ann Leckie"));
    }

    #[test]
    fn isbn_detection() {
        assert!(looks_like_isbn("978-0-316-24662-0"));
        assert!(looks_like_isbn("031624662X"));
        assert!(looks_like_isbn("urn:isbn:9780316246620"));
        assert!(!looks_like_isbn("a1b2c3"));
        assert!(!looks_like_isbn("urn:uuid:1234"));
        assert_eq!(normalize_isbn("urn:isbn:978-0-316-24662-0"), "9780316246620");
    }

    #[test]
    fn isbn_detection_handles_multibyte_identifiers() {
        // Ten bytes but nine chars, and ten chars spanning more bytes.
        assert!(!looks_like_isbn("12345678é"));
        assert!(!looks_like_isbn("12345678éé"));
        assert!(!looks_like_isbn("１２３４５６７８９０"));
        assert!(!looks_like_isbn("978031624662é"));
    }
}
