//! kobold-rs: a Kobo eReader sync server for a watched ebook library.
//!
//! Files dropped into watched directories are identified by content, enriched with
//! metadata, optionally converted to kepub, and offered to Kobo devices through the
//! store sync protocol.
//!
//! # Features
//!
//! - Content-hash deduplication (moves and renames keep the book identity)
//! - Persistent job queue with leases, retries and backoff
//! - Metadata waterfall: embedded, Open Library, Google Books, filename
//! - kepub conversion through `kepubify`
//! - Checkpoint-based delta sync with paging
//! - Filesystem watching plus periodic reconciliation scans
//! - Kobo store passthrough for everything the local library does not serve

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Configuration and CLI.
pub mod config;
/// External format conversion.
pub mod convert;
/// Database operations.
pub mod db;
/// Error types.
pub mod error;
/// Book format handlers.
pub mod formats;
/// Content identification.
pub mod hashing;
/// Job queue, worker and handlers.
pub mod jobs;
/// Metadata providers and waterfall.
pub mod metadata;
/// Periodic reconciliation.
pub mod scheduler;
/// HTTP server.
pub mod server;
/// Device sync protocol.
pub mod sync;
/// Filesystem change source.
pub mod watcher;


pub use config::{Cli, Command, Config};
pub use db::Database;
pub use error::{AppError, Result};
pub use server::AppState;
