use super::token::SyncToken;
use crate::db::{Book, Database};
use crate::error::{AppError, Result};

/// One entry of a sync delta.
#[derive(Debug, Clone, PartialEq)]
pub enum DeltaEntry {
    /// First revision the device can see for this book.
    New(Book),
    /// A book the device may already have, changed since the baseline.
    Changed(Book),
    /// A removed book to withdraw from the device.
    Revoked(Book),
}

impl DeltaEntry {
    fn classify(book: Book, baseline: i64) -> Self {
        if book.is_removed() {
            DeltaEntry::Revoked(book)
        } else if book.created_revision > baseline {
            DeltaEntry::New(book)
        } else {
            DeltaEntry::Changed(book)
        }
    }

    /// The book this entry describes.
    pub fn book(&self) -> &Book {
        match self {
            DeltaEntry::New(b) | DeltaEntry::Changed(b) | DeltaEntry::Revoked(b) => b,
        }
    }
}

/// Entitlement delta for one exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncDelta {
    /// Revision the delta was computed from.
    pub baseline: i64,
    /// Entries ordered by revision, then id.
    pub entries: Vec<DeltaEntry>,
    /// Highest revision described, or `baseline` when empty.
    pub next_checkpoint: i64,
    /// More changes remain past `next_checkpoint`.
    pub has_more: bool,
}

impl SyncDelta {
    /// Number of entries of each kind: (new, changed, revoked).
    pub fn counts(&self) -> (usize, usize, usize) {
        self.entries.iter().fold((0, 0, 0), |(n, c, r), e| match e {
            DeltaEntry::New(_) => (n + 1, c, r),
            DeltaEntry::Changed(_) => (n, c + 1, r),
            DeltaEntry::Revoked(_) => (n, c, r + 1),
        })
    }
}

/// Compute the delta after `baseline`, at most `limit` entries.
///
/// Reads one snapshot and never writes, so the same input always yields the same delta.
pub fn compute_delta(db: &Database, baseline: i64, limit: usize) -> Result<SyncDelta> {
    let limit = limit.max(1);
    let mut books = db.changes_since(baseline, limit.saturating_add(1))?;
    let has_more = books.len() > limit;
    books.truncate(limit);

    let next_checkpoint = books
        .last()
        .map(|b| b.revision)
        .unwrap_or(baseline)
        .max(baseline);
    let entries = books
        .into_iter()
        .map(|b| DeltaEntry::classify(b, baseline))
        .collect();

    Ok(SyncDelta {
        baseline,
        entries,
        next_checkpoint,
        has_more,
    })
}

/// Result of a successful exchange, ready to be rendered.
#[derive(Debug, Clone)]
pub struct SyncExchange {
    /// Entries to describe.
    pub delta: SyncDelta,
    /// Token to hand back to the device.
    pub token: SyncToken,
}

/// Serves sync exchanges against the library store.
#[derive(Clone)]
pub struct SyncReconciler {
    db: Database,
    /// Digest of the configured secret; `None` rejects every credential.
    secret: Option<blake3::Hash>,
    page_size: usize,
}

impl SyncReconciler {
    /// Create a reconciler checking credentials against `secret`.
    pub fn new(db: Database, secret: String, page_size: usize) -> Self {
        Self {
            db,
            secret: (!secret.is_empty()).then(|| blake3::hash(secret.as_bytes())),
            page_size: page_size.max(1),
        }
    }

    /// Constant-time check of a presented credential.
    ///
    /// Compares BLAKE3 digests; `blake3::Hash` equality is constant-time.
    pub fn authenticate(&self, presented: &str) -> Result<()> {
        match self.secret {
            Some(expected) if blake3::hash(presented.as_bytes()) == expected => Ok(()),
            _ => Err(AppError::Unauthorized),
        }
    }

    /// Run one exchange: authenticate, parse the checkpoint, compute the delta, issue
    /// the next checkpoint.
    pub fn exchange(&self, presented: &str, token_header: Option<&str>) -> Result<SyncExchange> {
        self.authenticate(presented)?;

        let incoming = SyncToken::decode(token_header);
        let baseline = incoming.baseline_revision();
        let delta = compute_delta(&self.db, baseline, self.page_size)?;
        let token = incoming.advanced_to(delta.next_checkpoint);

        let (new, changed, revoked) = delta.counts();
        tracing::info!(
            baseline,
            checkpoint = delta.next_checkpoint,
            new,
            changed,
            revoked,
            has_more = delta.has_more,
            "Sync served"
        );

        Ok(SyncExchange { delta, token })
    }
}
