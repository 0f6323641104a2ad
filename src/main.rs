//! kobold-rs server entry point.

use clap::Parser;
use kobold_rs::{
    config::{Cli, Command, Config, JobsCommand},
    convert::{KepubConverter, resolve_binary},
    db::Database,
    jobs::{JobQueue, Pipeline, Worker},
    metadata::Waterfall,
    scheduler, server, watcher,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kobold_rs=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Find or load config
    let config_path = cli.config.clone().or_else(Config::find_config_file);

    let mut config = if let Some(ref path) = config_path {
        Config::load(path)?
    } else {
        Config::default()
    }
    .with_env();
    config.resolve_paths()?;

    match cli.command {
        Some(Command::Init { force }) => cmd_init(force),
        Some(Command::Scan) => cmd_scan(&config).await,
        Some(Command::Jobs { action }) => cmd_jobs(action, &config),
        Some(Command::Serve { bind, watch }) => cmd_serve(config, bind, watch).await,
        None => cmd_serve(config, None, Vec::new()).await,
    }
}

/// Open the configured database, creating its directory first.
fn open_database(config: &Config) -> anyhow::Result<Database> {
    if let Some(parent) = config.database.path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    Ok(Database::open(&config.database.path)?)
}

/// Initialize config and database.
fn cmd_init(force: bool) -> anyhow::Result<()> {
    let config_path = PathBuf::from("config.toml");

    if config_path.exists() && !force {
        anyhow::bail!(
            "Config file already exists: {}. Use --force to overwrite.",
            config_path.display()
        );
    }

    std::fs::write(&config_path, Config::generate_default())?;
    println!("Created config file: {}", config_path.display());

    let config = Config::default();
    open_database(&config)?;
    println!("Initialized database: {}", config.database.path.display());

    println!("\nEdit config.toml: set [auth] token and [library] watch_dirs.");
    println!("Then run: kobold-rs serve");
    println!("Device URL: http://<host>:8000/api/kobo/<token>");

    Ok(())
}

/// One reconciliation pass; discovered files are processed by the next `serve`.
async fn cmd_scan(config: &Config) -> anyhow::Result<()> {
    let db = open_database(config)?;
    let queue = JobQueue::new(db, config.worker.clone());

    let report = scheduler::reconcile_async(queue, config.library.watch_dirs.clone()).await?;

    println!("Files seen:  {}", report.files_seen);
    println!("Enqueued:    {}", report.enqueued);
    println!("Removed:     {}", report.removed);
    for root in &report.unavailable_roots {
        println!("Unavailable: {}", root.display());
    }

    Ok(())
}

/// Job queue inspection commands.
fn cmd_jobs(action: JobsCommand, config: &Config) -> anyhow::Result<()> {
    let db = open_database(config)?;
    let queue = JobQueue::new(db, config.worker.clone());

    match action {
        JobsCommand::Stats => {
            let stats = queue.stats()?;
            println!("pending: {}", stats.pending);
            println!("leased:  {}", stats.leased);
            println!("done:    {}", stats.done);
            println!("failed:  {}", stats.failed);
        }

        JobsCommand::Failed { limit } => {
            let jobs = queue.failed(limit)?;
            if jobs.is_empty() {
                println!("No failed jobs.");
            } else {
                println!("{:<36} {:<9} {:<8} ERROR", "ID", "TYPE", "ATTEMPTS");
                println!("{}", "-".repeat(80));
                for job in jobs {
                    println!(
                        "{:<36} {:<9} {:<8} {}",
                        job.id,
                        job.job_type.as_str(),
                        job.attempts,
                        job.last_error.as_deref().unwrap_or("-")
                    );
                    println!("    target: {}", job.target_key);
                }
            }
        }

        JobsCommand::Retry { id } => {
            if queue.retry(&id)? {
                println!("Re-armed job: {}", id);
            } else {
                println!("Job not failed, already re-queued, or not found: {}", id);
            }
        }

        JobsCommand::RetryAll => {
            let count = queue.retry_all_failed()?;
            println!("Re-armed {} job(s)", count);
        }
    }

    Ok(())
}

/// Start the server and background tasks.
async fn cmd_serve(
    mut config: Config,
    bind: Option<std::net::SocketAddr>,
    watch: Vec<PathBuf>,
) -> anyhow::Result<()> {
    if let Some(addr) = bind {
        config.server.bind = addr;
    }
    if !watch.is_empty() {
        config.library.watch_dirs = watch;
        config.resolve_paths()?;
    }

    if config
        .auth
        .token
        .as_deref()
        .is_none_or(|t| t.trim().is_empty())
    {
        anyhow::bail!("No auth token configured. Set [auth] token or KOBOLD_TOKEN.");
    }

    std::fs::create_dir_all(config.library.kepub_dir())?;
    std::fs::create_dir_all(config.library.covers_dir())?;
    let db = open_database(&config)?;

    tracing::info!(
        bind = %config.server.bind,
        database = %config.database.path.display(),
        "Starting kobold-rs server"
    );

    let roots = config.library.watch_dirs.clone();
    let queue = JobQueue::new(db, config.worker.clone());

    // Job worker
    let waterfall = Waterfall::from_config(&config.metadata)?;
    tracing::info!(providers = ?waterfall.provider_names(), "Metadata providers");
    let converter = KepubConverter::new(&config.conversion);
    if config.conversion.enabled {
        if resolve_binary(&config.conversion.kepubify_path).is_some() {
            tracing::info!(binary = %converter.binary().display(), "Using kepubify");
        } else {
            tracing::warn!(
                binary = %config.conversion.kepubify_path.display(),
                "kepubify not found; CONVERT jobs will fail until it is installed"
            );
        }
    }
    let pipeline = Arc::new(Pipeline::new(
        queue.clone(),
        Arc::new(waterfall),
        Arc::new(converter),
        config.conversion.clone(),
        config.library.clone(),
    ));
    tokio::spawn(Worker::new(pipeline).run());

    // Change source; the handle must outlive the server
    let _change_source = if config.watch.enabled {
        let (source, rx) = watcher::ChangeSource::start(&roots, &config.watch)?;
        tokio::spawn(watcher::consume(rx, queue.clone(), config.watch.debounce()));
        Some(source)
    } else {
        tracing::info!("File watching disabled, relying on periodic scans");
        None
    };

    // Initial reconciliation catches changes made while the server was down
    {
        let queue = queue.clone();
        let roots = roots.clone();
        tokio::spawn(async move {
            match scheduler::reconcile_async(queue, roots).await {
                Ok(report) => tracing::info!(
                    files = report.files_seen,
                    enqueued = report.enqueued,
                    removed = report.removed,
                    "Startup scan complete"
                ),
                Err(e) => tracing::error!(error = %e, "Startup scan failed"),
            }
        });
    }

    if config.scan.interval_seconds > 0 {
        tokio::spawn(scheduler::run(
            queue.clone(),
            roots.clone(),
            Duration::from_secs(config.scan.interval_seconds),
        ));
    }

    let bind_addr = config.server.bind;
    let state = server::AppState::new(config, queue, roots)?;
    let app = server::create_router(state);

    let listener = TcpListener::bind(bind_addr).await?;
    tracing::info!(
        address = %bind_addr,
        "Server listening; point the device at /api/kobo/<token>"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutting down");
        })
        .await?;

    Ok(())
}
