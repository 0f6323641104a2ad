//! HTTP request handlers.

use crate::config::BookFormat;
use crate::db::{Book, Job, JobStats};
use crate::error::{AppError, Result};
use crate::scheduler::{self, ScanReport};
use crate::server::AppState;
use crate::server::state::CoverSource;
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Redirect, Response},
};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;

// ============================================================================
// HEALTH
// ============================================================================

/// Liveness check.
pub async fn health() -> &'static str {
    "OK"
}

/// Readiness response.
#[derive(Serialize)]
pub struct ReadyResponse {
    status: &'static str,
    books: i64,
    revision: i64,
}

/// Readiness check: the database answers.
pub async fn ready(State(state): State<AppState>) -> Result<Json<ReadyResponse>> {
    state.db.ping()?;
    Ok(Json(ReadyResponse {
        status: "ready",
        books: state.db.count_live_books()?,
        revision: state.db.current_revision()?,
    }))
}

// ============================================================================
// BOOK FILES
// ============================================================================

/// Download filename as advertised to the device.
fn download_filename(book: &Book) -> String {
    let title: String = book
        .display_title()
        .chars()
        .map(|c| match c {
            '"' | '/' | '\\' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let ext = match book.delivery_format() {
        BookFormat::Kepub => "kepub.epub",
        format => format.as_str(),
    };
    format!("{}.{}", title, ext)
}

/// Book download: the converted artifact when present, else the original.
pub async fn download(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response<Body>> {
    let book = state.live_book(&id)?;
    let path = book.delivery_path();

    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(AppError::NotFound(format!(
                "File missing for book {}",
                book.id
            )));
        }
        Err(e) => return Err(e.into()),
    };
    let size = file.metadata().await?.len();
    let body = Body::from_stream(ReaderStream::new(file));

    let filename = download_filename(&book);
    let content_disposition = format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        filename,
        urlencoding::encode(&filename)
    );

    tracing::debug!(book_id = %book.id, path = %path.display(), "Serving download");

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, book.delivery_format().mime_type())
        .header(header::CONTENT_DISPOSITION, content_disposition)
        .header(header::CONTENT_LENGTH, size)
        .body(body)
        .unwrap_or_else(|_| Response::default()))
}

/// Book cover image. Size and greyscale hints are ignored.
pub async fn cover(
    State(state): State<AppState>,
    Path((id, _width, _height, _grey)): Path<(String, String, String, String)>,
) -> Result<Response> {
    let book = state.live_book(&id)?;

    match state.cover(&book).await? {
        Some(CoverSource::Remote(url)) => Ok(Redirect::temporary(&url).into_response()),
        Some(CoverSource::Image(image)) => Ok((
            [
                (header::CONTENT_TYPE, image.mime_type),
                (header::CACHE_CONTROL, "public, max-age=86400"),
            ],
            image.data,
        )
            .into_response()),
        None => Err(AppError::NotFound(format!("No cover for book {}", id))),
    }
}

// ============================================================================
// OPERATOR API
// ============================================================================

/// API: job counts per state.
pub async fn api_job_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<JobStats>> {
    state.authorize_operator(&headers)?;
    Ok(Json(state.queue.stats()?))
}

/// Failed jobs query parameters.
#[derive(Debug, Deserialize)]
pub struct FailedParams {
    limit: Option<usize>,
}

/// API: terminally failed jobs.
pub async fn api_jobs_failed(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<FailedParams>,
) -> Result<Json<Vec<Job>>> {
    state.authorize_operator(&headers)?;
    let limit = params.limit.unwrap_or(50).min(1000);
    Ok(Json(state.queue.failed(limit)?))
}

/// Retry response.
#[derive(Serialize)]
pub struct RetryResponse {
    id: String,
    retried: bool,
}

/// API: re-arm a failed job.
pub async fn api_job_retry(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<RetryResponse>> {
    state.authorize_operator(&headers)?;
    if state.db.get_job(&id)?.is_none() {
        return Err(AppError::NotFound(format!("Job not found: {}", id)));
    }
    let retried = state.queue.retry(&id)?;
    Ok(Json(RetryResponse { id, retried }))
}

/// API: run a reconciliation scan now.
pub async fn api_scan(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ScanReport>> {
    state.authorize_operator(&headers)?;
    let report = scheduler::reconcile_async(state.queue.clone(), state.roots().to_vec()).await?;
    tracing::info!(
        files = report.files_seen,
        enqueued = report.enqueued,
        removed = report.removed,
        "Manual scan complete"
    );
    Ok(Json(report))
}

/// API: every book record, removed ones included.
pub async fn api_books(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Book>>> {
    state.authorize_operator(&headers)?;
    Ok(Json(state.db.list_books()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::BookStatus;
    use std::path::PathBuf;

    fn book(title: Option<&str>, converted: bool) -> Book {
        Book {
            id: "b1".into(),
            content_hash: "h".into(),
            file_size: 1,
            primary_path: PathBuf::from("/books/Some File.epub"),
            converted_path: converted.then(|| PathBuf::from("/data/kepub/b1.kepub.epub")),
            format: BookFormat::Epub,
            title: title.map(str::to_string),
            author: None,
            series: None,
            series_index: None,
            isbn: None,
            cover_ref: None,
            description: None,
            publisher: None,
            language: None,
            published: None,
            revision: 1,
            created_revision: 1,
            status: BookStatus::Ready,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn filename_follows_delivered_format() {
        assert_eq!(download_filename(&book(Some("Dune"), true)), "Dune.kepub.epub");
        assert_eq!(download_filename(&book(Some("Dune"), false)), "Dune.epub");
        assert_eq!(download_filename(&book(None, false)), "Some File.epub");
        assert_eq!(
            download_filename(&book(Some("A \"B\"/C"), false)),
            "A _B__C.epub"
        );
    }
}
