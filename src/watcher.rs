//! Change source: filesystem notifications turned into INGEST jobs.
//!
//! Native and polling watchers both feed the same bounded channel of [`ChangeEvent`]s,
//! which a single task coalesces per path and drains into the job queue once the path
//! has been quiet for the debounce window.

use crate::config::{BookFormat, WatchConfig};
use crate::db::JobType;
use crate::error::{AppError, Result};
use crate::jobs::JobQueue;
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use walkdir::WalkDir;

/// What happened to a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Path appeared (created or moved in).
    Added,
    /// Contents changed.
    Modified,
    /// Path disappeared (deleted or moved out).
    Removed,
}

/// One change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Affected path.
    pub path: PathBuf,
    /// Kind of change.
    pub kind: ChangeKind,
}

/// Map a raw notify event to change events. Access and metadata-only events are dropped.
fn classify(event: &notify::Event) -> Vec<ChangeEvent> {
    let kinds: Vec<ChangeKind> = match event.kind {
        EventKind::Create(_) => vec![ChangeKind::Added; event.paths.len()],
        EventKind::Remove(_) => vec![ChangeKind::Removed; event.paths.len()],
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            vec![ChangeKind::Removed; event.paths.len()]
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            vec![ChangeKind::Added; event.paths.len()]
        }
        // Paths are [from, to]
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
            vec![ChangeKind::Removed, ChangeKind::Added]
        }
        EventKind::Modify(_) => vec![ChangeKind::Modified; event.paths.len()],
        _ => Vec::new(),
    };

    event
        .paths
        .iter()
        .zip(kinds)
        .map(|(path, kind)| ChangeEvent {
            path: path.clone(),
            kind,
        })
        .collect()
}

/// Keeps the OS watcher alive; dropping it stops notifications.
pub struct ChangeSource {
    _watcher: Box<dyn Watcher + Send>,
}

impl ChangeSource {
    /// Watch `roots` recursively, returning the receiving end of the event channel.
    ///
    /// Roots that cannot be watched are logged and skipped; the reconciliation scan still
    /// covers them.
    pub fn start(
        roots: &[PathBuf],
        config: &WatchConfig,
    ) -> Result<(Self, mpsc::Receiver<ChangeEvent>)> {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));

        let handler = move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                for change in classify(&event) {
                    // Runs on the watcher's own thread
                    if tx.blocking_send(change).is_err() {
                        return;
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "File watcher error"),
        };

        let mut watcher: Box<dyn Watcher + Send> = if config.force_polling {
            let notify_config = notify::Config::default()
                .with_poll_interval(Duration::from_millis(config.poll_delay_ms.max(1)));
            Box::new(
                PollWatcher::new(handler, notify_config)
                    .map_err(|e| AppError::Internal(format!("Failed to create poll watcher: {}", e)))?,
            )
        } else {
            Box::new(
                RecommendedWatcher::new(handler, notify::Config::default())
                    .map_err(|e| AppError::Internal(format!("Failed to create file watcher: {}", e)))?,
            )
        };

        for root in roots {
            match watcher.watch(root, RecursiveMode::Recursive) {
                Ok(()) => tracing::info!(
                    path = %root.display(),
                    polling = config.force_polling,
                    "Watching directory"
                ),
                Err(e) => tracing::warn!(path = %root.display(), error = %e, "Cannot watch directory"),
            }
        }

        Ok((Self { _watcher: watcher }, rx))
    }
}

/// Turn one change event into INGEST jobs.
///
/// Book files map to one job for their own path. A directory that appeared is walked;
/// a directory that vanished expands to the live books stored beneath it.
pub fn enqueue_change(queue: &JobQueue, event: &ChangeEvent) -> Result<usize> {
    let path = &std::path::absolute(&event.path)?;

    if BookFormat::from_path(path).is_some() {
        let queued = queue.enqueue(JobType::Ingest, &path.to_string_lossy())?;
        return Ok(usize::from(queued.is_some()));
    }

    let mut count = 0;
    match event.kind {
        ChangeKind::Added if path.is_dir() => {
            for entry in WalkDir::new(path)
                .follow_links(true)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
            {
                if BookFormat::from_path(entry.path()).is_some()
                    && queue
                        .enqueue(JobType::Ingest, &entry.path().to_string_lossy())?
                        .is_some()
                {
                    count += 1;
                }
            }
        }
        ChangeKind::Removed => {
            for known in queue.db().live_paths()? {
                if known.starts_with(path)
                    && queue
                        .enqueue(JobType::Ingest, &known.to_string_lossy())?
                        .is_some()
                {
                    count += 1;
                }
            }
        }
        _ => {}
    }
    Ok(count)
}

/// Per-path event buffer that releases a path once it has been quiet long enough.
struct Coalescer {
    quiet: Duration,
    pending: HashMap<PathBuf, (ChangeKind, Instant)>,
}

impl Coalescer {
    fn new(quiet: Duration) -> Self {
        Self {
            quiet,
            pending: HashMap::new(),
        }
    }

    fn push(&mut self, event: ChangeEvent, now: Instant) {
        let kind = match self.pending.get(&event.path) {
            // A directory that appeared still needs its walk after later writes inside it
            Some((ChangeKind::Added, _)) if event.kind == ChangeKind::Modified => ChangeKind::Added,
            _ => event.kind,
        };
        self.pending.insert(event.path, (kind, now));
    }

    /// When the earliest buffered path becomes quiet.
    fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|(_, seen)| *seen + self.quiet).min()
    }

    /// Remove and return every path quiet since `now - quiet`.
    fn take_quiet(&mut self, now: Instant) -> Vec<ChangeEvent> {
        let quiet = self.quiet;
        let ready: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, (_, seen))| *seen + quiet <= now)
            .map(|(path, _)| path.clone())
            .collect();
        ready
            .into_iter()
            .filter_map(|path| {
                self.pending
                    .remove(&path)
                    .map(|(kind, _)| ChangeEvent { path, kind })
            })
            .collect()
    }

    fn take_all(&mut self) -> Vec<ChangeEvent> {
        self.pending
            .drain()
            .map(|(path, (kind, _))| ChangeEvent { path, kind })
            .collect()
    }
}

fn enqueue_all(queue: &JobQueue, events: Vec<ChangeEvent>) {
    for event in events {
        tracing::debug!(path = %event.path.display(), kind = ?event.kind, "Change settled");
        if let Err(e) = enqueue_change(queue, &event) {
            tracing::error!(path = %event.path.display(), error = %e, "Failed to enqueue change");
        }
    }
}

/// Drain change events into the job queue until the channel closes.
///
/// Events for a path are held until no new event arrived for `quiet`, so a file still
/// being copied is ingested once, after the copy finished.
pub async fn consume(mut rx: mpsc::Receiver<ChangeEvent>, queue: JobQueue, quiet: Duration) {
    let mut buffer = Coalescer::new(quiet);

    loop {
        let received = match buffer.next_deadline() {
            Some(deadline) => match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(received) => received,
                Err(_) => {
                    enqueue_all(&queue, buffer.take_quiet(Instant::now()));
                    continue;
                }
            },
            None => rx.recv().await,
        };

        match received {
            Some(event) => buffer.push(event, Instant::now()),
            None => break,
        }
    }

    enqueue_all(&queue, buffer.take_all());
    tracing::info!("Change source closed");
}

/// Whether `path` lies under any of `roots`.
pub fn is_under_roots(path: &Path, roots: &[PathBuf]) -> bool {
    roots.iter().any(|root| path.starts_with(root))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use crate::db::Database;
    use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind};

    fn event(kind: EventKind, paths: &[&str]) -> notify::Event {
        let mut event = notify::Event::new(kind);
        for path in paths {
            event = event.add_path(PathBuf::from(path));
        }
        event
    }

    #[test]
    fn classifies_events() {
        assert_eq!(
            classify(&event(EventKind::Create(CreateKind::File), &["/b/a.epub"])),
            vec![ChangeEvent {
                path: PathBuf::from("/b/a.epub"),
                kind: ChangeKind::Added
            }]
        );
        assert_eq!(
            classify(&event(EventKind::Remove(RemoveKind::File), &["/b/a.epub"]))[0].kind,
            ChangeKind::Removed
        );
        assert_eq!(
            classify(&event(
                EventKind::Modify(ModifyKind::Data(DataChange::Content)),
                &["/b/a.epub"]
            ))[0]
                .kind,
            ChangeKind::Modified
        );
        assert!(
            classify(&event(
                EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions)),
                &["/b/a.epub"]
            ))
            .is_empty()
        );
    }

    #[test]
    fn rename_both_yields_remove_then_add() {
        let changes = classify(&event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/b/old.epub", "/b/new.epub"],
        ));
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].kind, ChangeKind::Removed);
        assert_eq!(changes[0].path, PathBuf::from("/b/old.epub"));
        assert_eq!(changes[1].kind, ChangeKind::Added);
        assert_eq!(changes[1].path, PathBuf::from("/b/new.epub"));
    }

    #[test]
    fn repeated_events_collapse_into_one_job() {
        let db = Database::open_memory().unwrap();
        let queue = JobQueue::new(db, WorkerConfig::default());
        let change = ChangeEvent {
            path: PathBuf::from("/books/a.epub"),
            kind: ChangeKind::Modified,
        };

        assert_eq!(enqueue_change(&queue, &change).unwrap(), 1);
        assert_eq!(enqueue_change(&queue, &change).unwrap(), 0);
        assert_eq!(queue.stats().unwrap().pending, 1);
    }

    #[test]
    fn unsupported_files_are_ignored() {
        let db = Database::open_memory().unwrap();
        let queue = JobQueue::new(db, WorkerConfig::default());
        let change = ChangeEvent {
            path: PathBuf::from("/books/notes.txt"),
            kind: ChangeKind::Added,
        };
        assert_eq!(enqueue_change(&queue, &change).unwrap(), 0);
    }

    fn change(path: &str, kind: ChangeKind) -> ChangeEvent {
        ChangeEvent {
            path: PathBuf::from(path),
            kind,
        }
    }

    #[test]
    fn coalescer_waits_for_quiet_path() {
        let quiet = Duration::from_millis(1600);
        let start = Instant::now();
        let mut buffer = Coalescer::new(quiet);

        // A copy in progress keeps producing events
        buffer.push(change("/b/a.epub", ChangeKind::Added), start);
        buffer.push(change("/b/a.epub", ChangeKind::Modified), start + Duration::from_millis(1000));
        buffer.push(change("/b/c.pdf", ChangeKind::Added), start + Duration::from_millis(200));

        assert_eq!(buffer.next_deadline(), Some(start + Duration::from_millis(1800)));
        assert!(buffer.take_quiet(start + Duration::from_millis(1700)).is_empty());

        let ready = buffer.take_quiet(start + Duration::from_millis(1800));
        assert_eq!(ready, vec![change("/b/c.pdf", ChangeKind::Added)]);

        let ready = buffer.take_quiet(start + Duration::from_millis(2600));
        assert_eq!(ready, vec![change("/b/a.epub", ChangeKind::Added)]);
        assert!(buffer.next_deadline().is_none());
    }

    #[test]
    fn coalescer_keeps_latest_removal() {
        let start = Instant::now();
        let mut buffer = Coalescer::new(Duration::from_millis(10));
        buffer.push(change("/b/a.epub", ChangeKind::Added), start);
        buffer.push(change("/b/a.epub", ChangeKind::Removed), start);
        assert_eq!(buffer.take_all(), vec![change("/b/a.epub", ChangeKind::Removed)]);
    }

    #[tokio::test]
    async fn burst_of_events_becomes_one_job() {
        let queue = JobQueue::new(Database::open_memory().unwrap(), WorkerConfig::default());
        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(consume(rx, queue.clone(), Duration::from_millis(20)));

        for kind in [ChangeKind::Added, ChangeKind::Modified, ChangeKind::Modified] {
            tx.send(change("/books/a.epub", kind)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(queue.stats().unwrap().pending, 1);

        drop(tx);
        task.await.unwrap();
        assert_eq!(queue.stats().unwrap().pending, 1);
    }

    #[test]
    fn relative_event_paths_become_absolute() {
        let queue = JobQueue::new(Database::open_memory().unwrap(), WorkerConfig::default());
        enqueue_change(&queue, &change("books/a.epub", ChangeKind::Modified)).unwrap();

        let expected = std::env::current_dir().unwrap().join("books/a.epub");
        let jobs = queue
            .db()
            .active_jobs_for(JobType::Ingest, &expected.to_string_lossy())
            .unwrap();
        assert_eq!(jobs.len(), 1);
    }

    #[test]
    fn new_directory_is_walked() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("series");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(sub.join("one.epub"), b"1").unwrap();
        std::fs::write(sub.join("two.pdf"), b"2").unwrap();
        std::fs::write(sub.join("cover.jpg"), b"3").unwrap();

        let queue = JobQueue::new(Database::open_memory().unwrap(), WorkerConfig::default());
        let change = ChangeEvent {
            path: sub,
            kind: ChangeKind::Added,
        };
        assert_eq!(enqueue_change(&queue, &change).unwrap(), 2);
    }
}
