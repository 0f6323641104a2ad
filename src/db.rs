mod books;
mod jobs;
mod reading;
mod schema;

pub use books::{IngestOutcome, NewFile};
pub use jobs::JobStats;
pub use schema::Database;

use crate::config::BookFormat;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Pipeline status of a book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookStatus {
    /// Seen on disk, not yet recorded.
    Discovered,
    /// Hashed and recorded.
    Ingested,
    /// Metadata lookup in progress.
    Enriching,
    /// Enrichment finished.
    Ready,
    /// File gone; kept so devices can observe the revocation.
    Removed,
}

impl BookStatus {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            BookStatus::Discovered => "discovered",
            BookStatus::Ingested => "ingested",
            BookStatus::Enriching => "enriching",
            BookStatus::Ready => "ready",
            BookStatus::Removed => "removed",
        }
    }

    /// Parse the database representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "discovered" => Some(BookStatus::Discovered),
            "ingested" => Some(BookStatus::Ingested),
            "enriching" => Some(BookStatus::Enriching),
            "ready" => Some(BookStatus::Ready),
            "removed" => Some(BookStatus::Removed),
            _ => None,
        }
    }
}

/// Canonical library record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Book {
    /// Stable identity (UUID).
    pub id: String,
    /// Content hash of the original file bytes.
    pub content_hash: String,
    /// Size of the original file in bytes.
    pub file_size: i64,
    /// Path of the file served to devices when no conversion exists.
    pub primary_path: PathBuf,
    /// Path of the converted kepub, if any.
    pub converted_path: Option<PathBuf>,
    /// Format of the primary file.
    pub format: BookFormat,
    /// Book title.
    pub title: Option<String>,
    /// Primary author.
    pub author: Option<String>,
    /// Series name.
    pub series: Option<String>,
    /// Position in series.
    pub series_index: Option<f64>,
    /// ISBN.
    pub isbn: Option<String>,
    /// Cover location: remote URL or `embedded:<href>`.
    pub cover_ref: Option<String>,
    /// Book description.
    pub description: Option<String>,
    /// Publisher.
    pub publisher: Option<String>,
    /// Language code.
    pub language: Option<String>,
    /// Publication date as reported by the source.
    pub published: Option<String>,
    /// Library revision of the last device-visible change.
    pub revision: i64,
    /// Library revision at which the record was created.
    pub created_revision: i64,
    /// Pipeline status.
    pub status: BookStatus,
    /// Creation timestamp.
    pub created_at: i64,
    /// Last update timestamp.
    pub updated_at: i64,
}

impl Book {
    /// File that should be delivered to a device.
    pub fn delivery_path(&self) -> &PathBuf {
        self.converted_path.as_ref().unwrap_or(&self.primary_path)
    }

    /// Format of the delivered file.
    pub fn delivery_format(&self) -> BookFormat {
        if self.converted_path.is_some() {
            BookFormat::Kepub
        } else {
            self.format
        }
    }

    /// Title for display, falling back to the file stem.
    pub fn display_title(&self) -> String {
        self.title.clone().unwrap_or_else(|| {
            self.primary_path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("Unknown")
                .to_string()
        })
    }

    /// Whether the record has been soft-deleted.
    pub fn is_removed(&self) -> bool {
        self.status == BookStatus::Removed
    }

    /// Whether two versions differ in anything a device can observe.
    pub(crate) fn visible_differs(&self, other: &Book) -> bool {
        self.content_hash != other.content_hash
            || self.file_size != other.file_size
            || self.primary_path != other.primary_path
            || self.converted_path != other.converted_path
            || self.title != other.title
            || self.author != other.author
            || self.series != other.series
            || self.series_index != other.series_index
            || self.isbn != other.isbn
            || self.cover_ref != other.cover_ref
            || self.description != other.description
            || self.publisher != other.publisher
            || self.language != other.language
            || self.published != other.published
            || self.is_removed() != other.is_removed()
    }
}

/// Kind of deferred work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobType {
    /// Hash and record a file path (target: path).
    Ingest,
    /// Run the metadata waterfall (target: book id).
    Metadata,
    /// Convert to kepub (target: book id).
    Convert,
}

impl JobType {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Ingest => "INGEST",
            JobType::Metadata => "METADATA",
            JobType::Convert => "CONVERT",
        }
    }

    /// Parse the database representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INGEST" => Some(JobType::Ingest),
            "METADATA" => Some(JobType::Metadata),
            "CONVERT" => Some(JobType::Convert),
            _ => None,
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting to be claimed (possibly after a backoff delay).
    Pending,
    /// Claimed by a worker until `lease_expires_at`.
    Leased,
    /// Finished successfully.
    Done,
    /// Terminally failed after exhausting attempts.
    Failed,
}

impl JobState {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Leased => "leased",
            JobState::Done => "done",
            JobState::Failed => "failed",
        }
    }

    /// Parse the database representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobState::Pending),
            "leased" => Some(JobState::Leased),
            "done" => Some(JobState::Done),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }
}

/// Unit of deferred work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Job ID.
    pub id: String,
    /// Job type.
    pub job_type: JobType,
    /// File path for ingest, book id otherwise.
    pub target_key: String,
    /// Current state.
    pub state: JobState,
    /// Number of times the job has been claimed.
    pub attempts: u32,
    /// Attempts allowed before terminal failure.
    pub max_attempts: u32,
    /// Error recorded by the last failed attempt.
    pub last_error: Option<String>,
    /// Lease deadline while leased.
    pub lease_expires_at: Option<i64>,
    /// Earliest time the job may be claimed.
    pub run_after: i64,
    /// Creation timestamp.
    pub created_at: i64,
    /// Last update timestamp.
    pub updated_at: i64,
}

/// Reading state reported by a device for one book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadingState {
    /// Book ID.
    pub book_id: String,
    /// Reading status ("Unread", "Reading", "Finished").
    pub status: String,
    /// Progress percentage (0 - 100).
    pub progress_percent: f64,
    /// Location value (Kobo format).
    pub location_value: Option<String>,
    /// Location type.
    pub location_type: Option<String>,
    /// Location source.
    pub location_source: Option<String>,
    /// Minutes spent reading.
    pub spent_reading_minutes: i64,
    /// Estimated remaining minutes.
    pub remaining_time_minutes: i64,
    /// Last update timestamp.
    pub updated_at: i64,
}

/// Timestamp helper.
pub fn now_timestamp() -> i64 {
    Utc::now().timestamp()
}

/// Convert timestamp to DateTime.
pub fn timestamp_to_datetime(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_else(Utc::now)
}
