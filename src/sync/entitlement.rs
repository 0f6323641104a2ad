//! Kobo entitlement payloads.

use super::reconciler::{DeltaEntry, SyncDelta};
use crate::db::Book;
use serde::Serialize;

/// Entitlement body shared by new and changed entries.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Entitlement {
    /// Book id.
    pub id: String,
    /// Title.
    pub title: String,
    /// Author.
    pub author: String,
    /// Description.
    pub description: String,
    /// Download URL.
    #[serde(rename = "URL")]
    pub url: String,
    /// `EPUB`, `KEPUB` or `PDF`.
    pub format: String,
    /// Download URL.
    pub download_url: String,
    /// Product URL (the download URL).
    pub product_url: String,
    /// Cover image id, present only when a cover is known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    /// Always false.
    pub is_preorder: bool,
    /// Always false.
    pub is_locked: bool,
    /// Language code.
    pub language: String,
    /// Year parsed from the publication date.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publication_year: Option<i32>,
    /// Series name.
    pub series: Option<String>,
    /// Series index as text.
    pub series_number: Option<String>,
    /// Series index.
    pub series_number_float: Option<f64>,
    /// Always 0.
    pub average_rating: f64,
    /// Always 0.
    pub review_count: i64,
    /// Minimum firmware version.
    pub min_kobo_version: String,
    /// Entitlement id (the book id).
    pub entitlement_id: String,
    /// Content source label.
    pub content_source: String,
}

/// Body of a removal entry.
#[derive(Debug, Clone, Serialize)]
pub struct RemovedEntitlement {
    /// Entitlement id (the book id).
    #[serde(rename = "EntitlementId")]
    pub entitlement_id: String,
}

/// One element of the sync response array.
#[derive(Debug, Clone, Serialize)]
pub enum SyncItem {
    /// Book the device has not seen.
    NewEntitlement(Entitlement),
    /// Book the device should refresh.
    ChangedEntitlement(Entitlement),
    /// Book the device should drop.
    RemoveEntitlement(RemovedEntitlement),
}

fn series_number(index: f64) -> String {
    if index.fract() == 0.0 {
        format!("{}", index as i64)
    } else {
        index.to_string()
    }
}

fn publication_year(published: Option<&str>) -> Option<i32> {
    let published = published?;
    let year = published.get(..4)?;
    if year.chars().all(|c| c.is_ascii_digit()) {
        year.parse().ok()
    } else {
        None
    }
}

impl Entitlement {
    /// Describe a book, linking downloads under `base_url`.
    pub fn for_book(book: &Book, base_url: &str) -> Self {
        let download_url = format!("{}/download/{}", base_url.trim_end_matches('/'), book.id);
        Self {
            id: book.id.clone(),
            title: book.display_title(),
            author: book.author.clone().unwrap_or_else(|| "Unknown".to_string()),
            description: book.description.clone().unwrap_or_default(),
            url: download_url.clone(),
            format: book.delivery_format().kobo_name().to_string(),
            download_url: download_url.clone(),
            product_url: download_url,
            image_id: book.cover_ref.as_ref().map(|_| book.id.clone()),
            is_preorder: false,
            is_locked: false,
            language: book.language.clone().unwrap_or_else(|| "en".to_string()),
            publication_year: publication_year(book.published.as_deref()),
            series: book.series.clone(),
            series_number: book.series_index.map(series_number),
            series_number_float: book.series_index,
            average_rating: 0.0,
            review_count: 0,
            min_kobo_version: "0.0.0".to_string(),
            entitlement_id: book.id.clone(),
            content_source: "Kobold".to_string(),
        }
    }
}

/// Render a delta as the response array, in delta order.
pub fn render_delta(delta: &SyncDelta, base_url: &str) -> Vec<SyncItem> {
    delta
        .entries
        .iter()
        .map(|entry| match entry {
            DeltaEntry::New(book) => SyncItem::NewEntitlement(Entitlement::for_book(book, base_url)),
            DeltaEntry::Changed(book) => {
                SyncItem::ChangedEntitlement(Entitlement::for_book(book, base_url))
            }
            DeltaEntry::Revoked(book) => SyncItem::RemoveEntitlement(RemovedEntitlement {
                entitlement_id: book.id.clone(),
            }),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publication_year_parsing() {
        assert_eq!(publication_year(Some("2013-10-01")), Some(2013));
        assert_eq!(publication_year(Some("1965")), Some(1965));
        assert_eq!(publication_year(Some("June 2001")), None);
        assert_eq!(publication_year(None), None);
    }

    #[test]
    fn series_number_formatting() {
        assert_eq!(series_number(2.0), "2");
        assert_eq!(series_number(2.5), "2.5");
    }

    #[test]
    fn removal_wire_shape() {
        let item = SyncItem::RemoveEntitlement(RemovedEntitlement {
            entitlement_id: "abc".into(),
        });
        assert_eq!(
            serde_json::to_string(&item).unwrap(),
            r#"{"RemoveEntitlement":{"EntitlementId":"abc"}}"#
        );
    }
}
