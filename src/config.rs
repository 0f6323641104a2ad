use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Kobo sync server for a watched ebook library.
#[derive(Parser, Debug, Clone)]
#[command(name = "kobold-rs")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file.
    #[arg(short, long, env = "KOBOLD_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the server (default if no command given).
    Serve {
        /// Address to bind the server to.
        #[arg(short, long)]
        bind: Option<SocketAddr>,

        /// Directory to watch (overrides `library.watch_dirs`).
        #[arg(short, long)]
        watch: Vec<PathBuf>,
    },

    /// Run one reconciliation scan of the watched directories and exit.
    Scan,

    /// Job queue inspection commands.
    Jobs {
        /// Jobs subcommand action.
        #[command(subcommand)]
        action: JobsCommand,
    },

    /// Initialize database and create default config.
    Init {
        /// Force overwrite existing config.
        #[arg(short, long)]
        force: bool,
    },
}

/// Job queue subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum JobsCommand {
    /// Show job counts per state.
    Stats,

    /// List terminally failed jobs with their last error.
    Failed {
        /// Maximum number of jobs to list.
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Re-arm a failed job.
    Retry {
        /// Job ID.
        id: String,
    },

    /// Re-arm every failed job.
    RetryAll,
}

/// Main configuration from TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Authentication configuration.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Library locations.
    #[serde(default)]
    pub library: LibraryConfig,

    /// File watcher configuration.
    #[serde(default)]
    pub watch: WatchConfig,

    /// Job worker configuration.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Kepub conversion configuration.
    #[serde(default)]
    pub conversion: ConversionConfig,

    /// Metadata enrichment configuration.
    #[serde(default)]
    pub metadata: MetadataConfig,

    /// Reconciliation scan configuration.
    #[serde(default)]
    pub scan: ScanConfig,

    /// Device sync configuration.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Kobo store passthrough configuration.
    #[serde(default)]
    pub store: StoreConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to.
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// Externally reachable base URL used in download links.
    /// Derived from the request `Host` header when unset.
    #[serde(default)]
    pub public_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            public_url: None,
        }
    }
}

fn default_bind() -> SocketAddr {
    SocketAddr::new(
        std::net::IpAddr::V4(std::net::Ipv4Addr::new(0, 0, 0, 0)),
        8000,
    )
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/kobold.db")
}

/// Authentication configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Shared secret embedded in device URLs and used as the operator bearer token.
    #[serde(default)]
    pub token: Option<String>,
}

/// Library locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryConfig {
    /// Directories to watch for books.
    #[serde(default = "default_watch_dirs")]
    pub watch_dirs: Vec<PathBuf>,

    /// Writable directory for converted files and cached covers.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            watch_dirs: default_watch_dirs(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_watch_dirs() -> Vec<PathBuf> {
    vec![PathBuf::from("/books")]
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

impl LibraryConfig {
    /// Directory holding converted kepub files.
    pub fn kepub_dir(&self) -> PathBuf {
        self.data_dir.join("kepub")
    }

    /// Directory holding extracted cover images.
    pub fn covers_dir(&self) -> PathBuf {
        self.data_dir.join("covers")
    }
}

/// File watcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Whether to subscribe to filesystem events at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Use polling instead of native notifications (NFS/SMB shares).
    #[serde(default)]
    pub force_polling: bool,

    /// Polling interval in milliseconds (only used with `force_polling`).
    #[serde(default = "default_poll_delay_ms")]
    pub poll_delay_ms: u64,

    /// Capacity of the change event channel.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Quiet period a path must reach before its events are acted on.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            force_polling: false,
            poll_delay_ms: default_poll_delay_ms(),
            channel_capacity: default_channel_capacity(),
            debounce_ms: default_debounce_ms(),
        }
    }
}

impl WatchConfig {
    /// Debounce window.
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

fn default_true() -> bool {
    true
}

fn default_poll_delay_ms() -> u64 {
    300
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_debounce_ms() -> u64 {
    1600
}

/// Job worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Idle poll interval in seconds when no job wakes the worker.
    #[serde(default = "default_worker_poll")]
    pub poll_interval_seconds: u64,

    /// Maximum jobs claimed per iteration.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Lease duration in seconds; an unfinished job becomes claimable again after it.
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: i64,

    /// Attempts before a job is terminally failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First retry delay in seconds, doubled on each attempt.
    #[serde(default = "default_backoff_base")]
    pub backoff_base_seconds: i64,

    /// Upper bound for the retry delay in seconds.
    #[serde(default = "default_backoff_max")]
    pub backoff_max_seconds: i64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_worker_poll(),
            batch_size: default_batch_size(),
            lease_seconds: default_lease_seconds(),
            max_attempts: default_max_attempts(),
            backoff_base_seconds: default_backoff_base(),
            backoff_max_seconds: default_backoff_max(),
        }
    }
}

fn default_worker_poll() -> u64 {
    30
}

fn default_batch_size() -> usize {
    8
}

fn default_lease_seconds() -> i64 {
    30 * 60
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base() -> i64 {
    10
}

fn default_backoff_max() -> i64 {
    60 * 60
}

impl WorkerConfig {
    /// Delay before a job that failed its `attempts`-th try is retried.
    pub fn backoff(&self, attempts: u32) -> i64 {
        let exponent = attempts.saturating_sub(1).min(30);
        self.backoff_base_seconds
            .saturating_mul(1i64 << exponent)
            .min(self.backoff_max_seconds)
    }
}

/// Kepub conversion configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionConfig {
    /// Convert EPUB files to kepub.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Path or name of the kepubify binary.
    #[serde(default = "default_kepubify")]
    pub kepubify_path: PathBuf,

    /// Delete the original file after a successful conversion.
    #[serde(default)]
    pub delete_original: bool,

    /// Conversion timeout in seconds.
    #[serde(default = "default_conversion_timeout")]
    pub timeout_seconds: u64,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            kepubify_path: default_kepubify(),
            delete_original: false,
            timeout_seconds: default_conversion_timeout(),
        }
    }
}

fn default_kepubify() -> PathBuf {
    PathBuf::from("kepubify")
}

fn default_conversion_timeout() -> u64 {
    300
}

/// Metadata enrichment configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    /// Query external providers (Open Library, Google Books).
    #[serde(default = "default_true")]
    pub fetch_external: bool,

    /// Per-lookup timeout in seconds.
    #[serde(default = "default_metadata_timeout")]
    pub timeout_seconds: u64,

    /// Minimum delay between two requests to the same provider, in milliseconds.
    #[serde(default = "default_min_interval")]
    pub min_request_interval_ms: u64,

    /// Open Library base URL.
    #[serde(default = "default_open_library_url")]
    pub open_library_url: String,

    /// Google Books API base URL.
    #[serde(default = "default_google_books_url")]
    pub google_books_url: String,

    /// Optional Google Books API key.
    #[serde(default)]
    pub google_books_api_key: Option<String>,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            fetch_external: true,
            timeout_seconds: default_metadata_timeout(),
            min_request_interval_ms: default_min_interval(),
            open_library_url: default_open_library_url(),
            google_books_url: default_google_books_url(),
            google_books_api_key: None,
        }
    }
}

fn default_metadata_timeout() -> u64 {
    30
}

fn default_min_interval() -> u64 {
    2000
}

fn default_open_library_url() -> String {
    "https://openlibrary.org".to_string()
}

fn default_google_books_url() -> String {
    "https://www.googleapis.com/books/v1".to_string()
}

impl MetadataConfig {
    /// Lookup timeout as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1))
    }

    /// Minimum spacing between requests to one provider.
    pub fn min_request_interval(&self) -> Duration {
        Duration::from_millis(self.min_request_interval_ms)
    }
}

/// Reconciliation scan configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Rescan interval in seconds (0 to disable).
    #[serde(default = "default_scan_interval")]
    pub interval_seconds: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_scan_interval(),
        }
    }
}

fn default_scan_interval() -> u64 {
    3600
}

/// Device sync configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Maximum entitlements per sync response; larger deltas continue on the next request.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
        }
    }
}

fn default_page_size() -> usize {
    100
}

/// Kobo store passthrough.
///
/// Requests the server does not answer itself are forwarded to the store, and library
/// syncs merge the store's entitlements with local ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Forward to the store at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Store API base URL.
    #[serde(default = "default_store_url")]
    pub api_url: String,

    /// Upstream request timeout in seconds.
    #[serde(default = "default_store_timeout")]
    pub timeout_seconds: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_url: default_store_url(),
            timeout_seconds: default_store_timeout(),
        }
    }
}

fn default_store_url() -> String {
    "https://storeapi.kobo.com".to_string()
}

fn default_store_timeout() -> u64 {
    60
}

impl Config {
    /// Load configuration from file.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::error::AppError::Config(format!("Failed to read config file: {}", e))
        })?;

        toml::from_str(&content).map_err(|e| {
            crate::error::AppError::Config(format!("Failed to parse config file: {}", e))
        })
    }

    /// Apply environment overrides.
    pub fn with_env(mut self) -> Self {
        if let Ok(token) = std::env::var("KOBOLD_TOKEN")
            && !token.trim().is_empty()
        {
            self.auth.token = Some(token.trim().to_string());
        }
        self
    }

    /// Make library and database paths absolute against the working directory.
    ///
    /// Book paths are catalog keys, so the scan and the change source must agree on them.
    pub fn resolve_paths(&mut self) -> crate::error::Result<()> {
        for dir in &mut self.library.watch_dirs {
            *dir = std::path::absolute(&*dir)?;
        }
        self.library.data_dir = std::path::absolute(&self.library.data_dir)?;
        self.database.path = std::path::absolute(&self.database.path)?;
        Ok(())
    }

    /// Find config file in default locations.
    pub fn find_config_file() -> Option<PathBuf> {
        let candidates = [
            PathBuf::from("config.toml"),
            PathBuf::from("kobold-rs.toml"),
            dirs::config_dir()
                .map(|p| p.join("kobold-rs").join("config.toml"))
                .unwrap_or_default(),
            PathBuf::from("/etc/kobold-rs/config.toml"),
        ];

        candidates.into_iter().find(|p| p.exists())
    }

    /// Generate default config file content.
    pub fn generate_default() -> String {
        r#"# kobold-rs configuration

[server]
bind = "0.0.0.0:8000"
# public_url = "http://192.168.1.10:8000"

[database]
# path = "/var/lib/kobold-rs/kobold.db"

[auth]
# Shared secret used in the device URL: http://host:8000/api/kobo/<token>
# Can also be set with KOBOLD_TOKEN.
# token = "change-me"

[library]
watch_dirs = ["/books"]
data_dir = "data"

[watch]
enabled = true
# Use polling for network shares
force_polling = false
poll_delay_ms = 300
# Wait for a path to stay quiet this long before ingesting it
debounce_ms = 1600

[worker]
poll_interval_seconds = 30
max_attempts = 3
lease_seconds = 1800

[conversion]
enabled = true
kepubify_path = "kepubify"
delete_original = false
timeout_seconds = 300

[metadata]
fetch_external = true
timeout_seconds = 30
# google_books_api_key = ""

[scan]
# Reconciliation interval in seconds (0 to disable)
interval_seconds = 3600

[sync]
page_size = 100

[store]
# Forward unknown device requests to the Kobo store and merge its library
enabled = true
api_url = "https://storeapi.kobo.com"
timeout_seconds = 60
"#
        .to_string()
    }
}

/// Supported book formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookFormat {
    /// EPUB format (Electronic Publication).
    Epub,
    /// Kobo EPUB (already converted).
    Kepub,
    /// PDF format (Portable Document Format).
    Pdf,
    /// CBZ format (Comic Book ZIP archive).
    Cbz,
    /// CBR format (Comic Book RAR archive).
    Cbr,
}

impl BookFormat {
    /// Get the MIME type for this format.
    pub fn mime_type(&self) -> &'static str {
        match self {
            BookFormat::Epub | BookFormat::Kepub => "application/epub+zip",
            BookFormat::Pdf => "application/pdf",
            BookFormat::Cbz => "application/vnd.comicbook+zip",
            BookFormat::Cbr => "application/vnd.comicbook-rar",
        }
    }

    /// Format name as advertised to Kobo devices.
    pub fn kobo_name(&self) -> &'static str {
        match self {
            BookFormat::Epub => "EPUB",
            BookFormat::Kepub => "KEPUB",
            BookFormat::Pdf => "PDF",
            BookFormat::Cbz => "CBZ",
            BookFormat::Cbr => "CBR",
        }
    }

    /// Lowercase identifier stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            BookFormat::Epub => "epub",
            BookFormat::Kepub => "kepub",
            BookFormat::Pdf => "pdf",
            BookFormat::Cbz => "cbz",
            BookFormat::Cbr => "cbr",
        }
    }

    /// Parse the stored identifier.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "kepub" => Some(BookFormat::Kepub),
            other => Self::from_extension(other),
        }
    }

    /// Try to detect format from file extension.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "epub" => Some(BookFormat::Epub),
            "pdf" => Some(BookFormat::Pdf),
            "cbz" => Some(BookFormat::Cbz),
            "cbr" => Some(BookFormat::Cbr),
            _ => None,
        }
    }

    /// Detect format from a full path; `name.kepub.epub` is a kepub.
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        if name.starts_with('.') {
            return None;
        }
        if name.to_lowercase().ends_with(".kepub.epub") {
            return Some(BookFormat::Kepub);
        }
        Self::from_extension(path.extension()?.to_str()?)
    }

    /// Whether this format should be converted to kepub.
    pub fn is_convertible(&self) -> bool {
        matches!(self, BookFormat::Epub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_from_path() {
        assert_eq!(
            BookFormat::from_path(Path::new("/books/a.epub")),
            Some(BookFormat::Epub)
        );
        assert_eq!(
            BookFormat::from_path(Path::new("/books/a.KEPUB.EPUB")),
            Some(BookFormat::Kepub)
        );
        assert_eq!(
            BookFormat::from_path(Path::new("/books/a.pdf")),
            Some(BookFormat::Pdf)
        );
        assert_eq!(BookFormat::from_path(Path::new("/books/.a.epub")), None);
        assert_eq!(BookFormat::from_path(Path::new("/books/a.txt")), None);
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let worker = WorkerConfig {
            backoff_base_seconds: 10,
            backoff_max_seconds: 100,
            ..Default::default()
        };
        assert_eq!(worker.backoff(1), 10);
        assert_eq!(worker.backoff(2), 20);
        assert_eq!(worker.backoff(3), 40);
        assert_eq!(worker.backoff(5), 100);
        assert_eq!(worker.backoff(60), 100);
    }

    #[test]
    fn default_config_parses() {
        let config: Config = toml::from_str(&Config::generate_default()).unwrap();
        assert_eq!(config.worker.max_attempts, 3);
        assert_eq!(config.library.watch_dirs, vec![PathBuf::from("/books")]);
        assert!(config.auth.token.is_none());
        assert_eq!(config.watch.debounce(), Duration::from_millis(1600));
        assert_eq!(config.store.api_url, "https://storeapi.kobo.com");
    }

    #[test]
    fn relative_paths_resolve_against_working_dir() {
        let mut config = Config::default();
        config.library.watch_dirs = vec![PathBuf::from("books"), PathBuf::from("/srv/books")];
        config.library.data_dir = PathBuf::from("data");
        config.resolve_paths().unwrap();

        let cwd = std::env::current_dir().unwrap();
        assert_eq!(
            config.library.watch_dirs,
            vec![cwd.join("books"), PathBuf::from("/srv/books")]
        );
        assert_eq!(config.library.data_dir, cwd.join("data"));
        assert!(config.database.path.is_absolute());
    }
}
