//! Periodic reconciliation scan.
//!
//! Re-derives the library from disk to catch events the change source missed: unknown
//! files and files whose size drifted from the catalog are queued for ingest, and
//! vanished files are marked removed.

use crate::config::BookFormat;
use crate::db::{JobType, now_timestamp};
use crate::error::{AppError, Result};
use crate::jobs::JobQueue;
use crate::watcher::is_under_roots;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use walkdir::WalkDir;

/// Finished jobs older than this are deleted during a scan.
const DONE_JOB_RETENTION_SECS: i64 = 7 * 24 * 60 * 60;

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    /// Book files found on disk.
    pub files_seen: usize,
    /// INGEST jobs enqueued for unknown files or files whose size no longer matches.
    pub enqueued: usize,
    /// Books marked removed because their file is gone.
    pub removed: usize,
    /// Roots that could not be read (their books are left untouched).
    pub unavailable_roots: Vec<PathBuf>,
}

/// Run one reconciliation pass over `roots`. Blocking.
///
/// Relative roots are resolved against the working directory so every path handed to
/// the queue is absolute, matching what the change source reports.
pub fn reconcile(queue: &JobQueue, roots: &[PathBuf]) -> Result<ScanReport> {
    let mut report = ScanReport::default();
    let mut on_disk: HashMap<PathBuf, u64> = HashMap::new();
    let mut scanned_roots = Vec::new();

    for root in roots {
        let root = std::path::absolute(root)?;
        if !root.is_dir() {
            tracing::warn!(path = %root.display(), "Library root unavailable, skipping");
            report.unavailable_roots.push(root);
            continue;
        }

        for entry in WalkDir::new(&root)
            .follow_links(true)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            if BookFormat::from_path(entry.path()).is_none() {
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            on_disk.insert(entry.into_path(), meta.len());
        }
        scanned_roots.push(root);
    }
    report.files_seen = on_disk.len();

    let db = queue.db();
    let known: HashMap<PathBuf, i64> = db.live_files()?.into_iter().collect();

    for (path, size) in &on_disk {
        // Unknown paths, and known ones whose bytes changed behind a missed event
        let stale = match known.get(path) {
            None => true,
            Some(stored) => u64::try_from(*stored).ok() != Some(*size),
        };
        if stale
            && queue
                .enqueue(JobType::Ingest, &path.to_string_lossy())?
                .is_some()
        {
            report.enqueued += 1;
        }
    }

    for path in known.keys().filter(|p| !on_disk.contains_key(*p)) {
        // Only judge paths inside roots that were actually walked
        if !is_under_roots(path, &scanned_roots) || path.exists() {
            continue;
        }
        if let Some(book) = db.mark_removed_at_path(path)? {
            tracing::info!(
                book_id = %book.id,
                path = %path.display(),
                revision = book.revision,
                "Book removed (missing on rescan)"
            );
            report.removed += 1;
        }
    }

    let purged = db.purge_done_jobs(now_timestamp() - DONE_JOB_RETENTION_SECS)?;
    if purged > 0 {
        tracing::debug!(purged, "Old finished jobs deleted");
    }

    Ok(report)
}

/// Run [`reconcile`] on the blocking pool.
pub async fn reconcile_async(queue: JobQueue, roots: Vec<PathBuf>) -> Result<ScanReport> {
    tokio::task::spawn_blocking(move || reconcile(&queue, &roots))
        .await
        .map_err(|e| AppError::Internal(format!("scan task failed: {}", e)))?
}

/// Reconcile every `interval` forever. The first pass runs after one interval.
pub async fn run(queue: JobQueue, roots: Vec<PathBuf>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        match reconcile_async(queue.clone(), roots.clone()).await {
            Ok(report) => tracing::info!(
                files = report.files_seen,
                enqueued = report.enqueued,
                removed = report.removed,
                "Reconciliation scan complete"
            ),
            Err(e) => tracing::error!(error = %e, "Reconciliation scan failed"),
        }
    }
}
